use poem::{error::InternalServerError, Error};

/// A possible error value when operating on session values.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// The given key could not be found in the session.
    #[error("key not found in session")]
    KeyNotFound,

    /// The value exists but could not be converted to the requested type.
    #[error("session value has a different type")]
    TypeMismatch,

    /// The session has already been written to the response, so the mutation
    /// would be lost.
    #[error("session already written to the response")]
    AlreadyWritten,
}

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        InternalServerError(err)
    }
}

/// A possible error value when extracting [`Session`](crate::Session) from a
/// request that did not pass through the
/// [`SessionManager`](crate::SessionManager) middleware.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("session is not attached to the request, the `SessionManager` middleware is required")]
pub struct NoSessionError;

impl From<NoSessionError> for Error {
    fn from(err: NoSessionError) -> Self {
        InternalServerError(err)
    }
}
