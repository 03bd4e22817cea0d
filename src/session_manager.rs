use std::{collections::BTreeMap, sync::Arc};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use poem::{
    http::{header, HeaderValue},
    web::cookie::Cookie,
    Endpoint, IntoResponse, Middleware, Request, Response, Result,
};
use rand::{thread_rng, Rng};
use serde_json::Value;

use crate::{
    session::Sealed, Session, SessionConfig, SessionRecord, SessionStatus, SessionStorage,
};

/// Middleware that manages one server-side session per request.
///
/// On the way in it loads the session identified by the request's session
/// cookie, attaches it to the request and invokes the wrapped endpoint. On
/// the way out it persists changes to the storage engine, rotates the token
/// where the renewal policy requires it and emits the `Set-Cookie` header.
pub struct SessionManager<T> {
    config: Arc<SessionConfig>,
    storage: Arc<T>,
}

impl<T> SessionManager<T> {
    /// Create a `SessionManager` middleware.
    pub fn new(config: SessionConfig, storage: T) -> Self {
        Self {
            config: Arc::new(config),
            storage: Arc::new(storage),
        }
    }
}

impl<T: SessionStorage, E: Endpoint> Middleware<E> for SessionManager<T> {
    type Output = SessionManagerEndpoint<T, E>;

    fn transform(&self, ep: E) -> Self::Output {
        SessionManagerEndpoint {
            inner: ep,
            config: self.config.clone(),
            storage: self.storage.clone(),
        }
    }
}

/// Session token generation routine that follows [OWASP recommendations].
///
/// [OWASP recommendations]: https://cheatsheetseries.owasp.org/cheatsheets/Session_Management_Cheat_Sheet.html#session-id-entropy
fn generate_token() -> String {
    let random_bytes = thread_rng().gen::<[u8; 32]>();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Endpoint for the `SessionManager` middleware.
pub struct SessionManagerEndpoint<T, E> {
    inner: E,
    config: Arc<SessionConfig>,
    storage: Arc<T>,
}

impl<T: SessionStorage, E> SessionManagerEndpoint<T, E> {
    /// Persists the sealed session state and returns the cookie to emit, if
    /// any.
    async fn persist(
        &self,
        status: SessionStatus,
        entries: BTreeMap<String, Value>,
        token: Option<&str>,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<Cookie>> {
        match status {
            SessionStatus::Destroyed => match token {
                Some(token) => {
                    self.storage.delete(token).await?;
                    Ok(Some(self.config.build_removal_cookie()))
                }
                None => Ok(None),
            },
            SessionStatus::Renewed => {
                if let Some(token) = token {
                    self.storage.delete(token).await?;
                }
                // a rotated token is a new session identity with a fresh
                // lifetime window
                let new_token = generate_token();
                let deadline = self.config.fresh_deadline(now);
                let record = SessionRecord { deadline, entries };
                self.storage
                    .save(&new_token, &record, self.config.storage_expiry(deadline, now))
                    .await?;
                Ok(Some(self.config.build_cookie(&new_token, deadline, now)))
            }
            SessionStatus::Changed => {
                let deadline = deadline.or_else(|| self.config.fresh_deadline(now));
                let record = SessionRecord { deadline, entries };
                // an anonymous session gets a fresh token on its first save
                let token = match token {
                    Some(token) => token.to_string(),
                    None => generate_token(),
                };
                self.storage
                    .save(&token, &record, self.config.storage_expiry(deadline, now))
                    .await?;
                Ok(Some(self.config.build_cookie(&token, deadline, now)))
            }
            SessionStatus::Unchanged => match token {
                // slide the idle window even when the handler only read
                Some(token) if self.config.has_idle_timeout() => {
                    let record = SessionRecord { deadline, entries };
                    self.storage
                        .save(token, &record, self.config.storage_expiry(deadline, now))
                        .await?;
                    Ok(Some(self.config.build_cookie(token, deadline, now)))
                }
                _ => Ok(None),
            },
        }
    }
}

#[poem::async_trait]
impl<T, E> Endpoint for SessionManagerEndpoint<T, E>
where
    T: SessionStorage,
    E: Endpoint,
{
    type Output = Response;

    async fn call(&self, mut req: Request) -> Result<Self::Output> {
        let now = Utc::now();
        let mut token = self.config.token_from_headers(req.headers());
        let mut deadline = None;

        let session = match &token {
            Some(id) => match self.storage.find(id).await {
                // a record whose lifetime deadline already passed is treated
                // as absent, the engine's sweep may lag
                Ok(Some(record)) if record.deadline.map_or(true, |deadline| deadline > now) => {
                    deadline = record.deadline;
                    Session::new(record.entries)
                }
                Ok(_) => {
                    token = None;
                    Session::default()
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to load session");
                    return Ok(self.config.handle_error(err));
                }
            },
            None => Session::default(),
        };

        req.extensions_mut().insert(session.clone());
        let resp = self.inner.call(req).await?;
        let mut resp = resp.into_response();

        let Sealed { status, entries } = session.seal();
        let now = Utc::now();
        match self
            .persist(status, entries, token.as_deref(), deadline, now)
            .await
        {
            Ok(Some(cookie)) => {
                if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
                    resp.headers_mut().append(header::SET_COOKIE, value);
                }
                Ok(resp)
            }
            Ok(None) => Ok(resp),
            Err(err) => {
                tracing::error!(error = %err, "failed to save session");
                Ok(self.config.handle_error(err))
            }
        }
    }
}
