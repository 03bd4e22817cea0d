//! Managed server-side sessions for Poem.
//!
//! The [`SessionManager`] middleware associates a per-visitor key-value store
//! with an opaque token carried in a cookie. Handlers read and mutate the
//! store through the [`Session`] extractor; after the handler returns, the
//! middleware persists changes to a [`SessionStorage`] engine and emits the
//! `Set-Cookie` header. Once that header is flushed, every further mutation
//! fails with [`SessionError::AlreadyWritten`] instead of being lost
//! silently.
//!
//! Session tokens are rotated whenever an anonymous session is first
//! populated and whenever [`Session::renew`] is called, so a token handed out
//! before login never survives past it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use poem::{handler, EndpointExt, Route};
//! use poem_sessions::{MemoryStorage, Session, SessionConfig, SessionManager};
//!
//! #[handler]
//! fn index(session: &Session) -> String {
//!     match session.get_int("visits") {
//!         Ok(visits) => {
//!             let _ = session.put_int("visits", visits + 1);
//!             format!("visit #{}", visits + 1)
//!         }
//!         Err(_) => {
//!             let _ = session.put_int("visits", 1);
//!             "first visit".to_string()
//!         }
//!     }
//! }
//!
//! let app = Route::new()
//!     .at("/", index)
//!     .with(SessionManager::new(SessionConfig::new(), MemoryStorage::new()));
//! ```

#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![warn(missing_docs)]

mod error;
mod memory_storage;
mod session;
mod session_config;
mod session_manager;
mod session_storage;
#[cfg(test)]
pub(crate) mod test_harness;

pub use error::{NoSessionError, SessionError};
pub use memory_storage::MemoryStorage;
pub use session::{Session, SessionStatus};
pub use session_config::SessionConfig;
pub use session_manager::{SessionManager, SessionManagerEndpoint};
pub use session_storage::{SessionRecord, SessionStorage};
