use std::time::Duration;

use chrono::{DateTime, Utc};
use poem::{
    http::{header, HeaderMap, StatusCode},
    web::cookie::Cookie,
    Error, Response,
};

type ErrorHandler = Box<dyn Fn(Error) -> Response + Send + Sync>;

/// Configuration for the [`SessionManager`](crate::SessionManager)
/// middleware.
pub struct SessionConfig {
    name: String,
    path: String,
    domain: Option<String>,
    secure: bool,
    http_only: bool,
    lifetime: Option<Duration>,
    idle_timeout: Option<Duration>,
    persist: bool,
    error_handler: ErrorHandler,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "poem-session".to_string(),
            path: "/".to_string(),
            domain: None,
            secure: false,
            http_only: true,
            lifetime: None,
            idle_timeout: None,
            persist: false,
            error_handler: Box::new(|err| {
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(format!("{err}\n"))
            }),
        }
    }
}

impl SessionConfig {
    /// Create a `SessionConfig` with the default options.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the name of the session cookie. Default is `poem-session`.
    #[must_use]
    pub fn name(self, value: impl Into<String>) -> Self {
        Self {
            name: value.into(),
            ..self
        }
    }

    /// Sets the `Path` of the session cookie. Default is `/`.
    #[must_use]
    pub fn path(self, value: impl Into<String>) -> Self {
        Self {
            path: value.into(),
            ..self
        }
    }

    /// Sets the `Domain` of the session cookie. Omitted by default.
    #[must_use]
    pub fn domain(self, value: impl Into<String>) -> Self {
        Self {
            domain: Some(value.into()),
            ..self
        }
    }

    /// Sets the `Secure` flag of the session cookie. Default is `false`.
    #[must_use]
    pub fn secure(self, value: bool) -> Self {
        Self {
            secure: value,
            ..self
        }
    }

    /// Sets the `HttpOnly` flag of the session cookie. Default is `true`.
    #[must_use]
    pub fn http_only(self, value: bool) -> Self {
        Self {
            http_only: value,
            ..self
        }
    }

    /// Sets the absolute maximum duration of a session, measured from the
    /// moment its record is created. Unset by default.
    #[must_use]
    pub fn lifetime(self, value: Duration) -> Self {
        Self {
            lifetime: Some(value),
            ..self
        }
    }

    /// Sets the maximum gap between two requests before the session expires,
    /// independent of the absolute lifetime. Unset by default.
    #[must_use]
    pub fn idle_timeout(self, value: Duration) -> Self {
        Self {
            idle_timeout: Some(value),
            ..self
        }
    }

    /// When `true`, the cookie carries `Max-Age`/`Expires` matching the
    /// effective timeout even when only an idle timeout is configured.
    /// Governs browser-side retention, not server-side validity. Default is
    /// `false`.
    #[must_use]
    pub fn persist(self, value: bool) -> Self {
        Self {
            persist: value,
            ..self
        }
    }

    /// Sets the handler invoked when the storage engine fails to load or
    /// save a session. The response it returns is sent instead of invoking
    /// (or instead of the output of) the wrapped endpoint.
    ///
    /// The default handler responds with HTTP 500 and the error message as
    /// plain text.
    #[must_use]
    pub fn error_handler(
        self,
        handler: impl Fn(Error) -> Response + Send + Sync + 'static,
    ) -> Self {
        Self {
            error_handler: Box::new(handler),
            ..self
        }
    }

    pub(crate) fn handle_error(&self, err: Error) -> Response {
        (self.error_handler)(err)
    }

    pub(crate) fn has_idle_timeout(&self) -> bool {
        self.idle_timeout.is_some()
    }

    /// Scans the `Cookie` request headers for the configured cookie.
    pub(crate) fn token_from_headers(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| Cookie::parse(pair.trim()).ok())
            .find(|cookie| cookie.name() == self.name)
            .map(|cookie| cookie.value_str().to_string())
            .filter(|token| !token.is_empty())
    }

    /// The lifetime deadline for a record created now.
    pub(crate) fn fresh_deadline(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.lifetime
            .and_then(|lifetime| chrono::Duration::from_std(lifetime).ok())
            .map(|lifetime| now + lifetime)
    }

    fn idle_deadline(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.idle_timeout
            .and_then(|idle| chrono::Duration::from_std(idle).ok())
            .map(|idle| now + idle)
    }

    /// The instant the record becomes invalid, whichever of the lifetime
    /// deadline and the idle window is the binding constraint.
    pub(crate) fn effective_expiry(
        &self,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match (deadline, self.idle_deadline(now)) {
            (Some(deadline), Some(idle)) => Some(deadline.min(idle)),
            (deadline, idle) => deadline.or(idle),
        }
    }

    /// The advisory time-to-live handed to the storage engine on save.
    pub(crate) fn storage_expiry(
        &self,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        self.effective_expiry(deadline, now)
            .map(|expiry| (expiry - now).to_std().unwrap_or_default())
    }

    /// Builds the session cookie for a token.
    ///
    /// `Max-Age` and `Expires` are emitted when a lifetime is configured, or
    /// when `persist` is set and a nonzero effective timeout exists;
    /// otherwise the cookie is a pure session cookie.
    pub(crate) fn build_cookie(
        &self,
        token: &str,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Cookie {
        let mut cookie = self.base_cookie(token);
        if self.lifetime.is_some() || self.persist {
            if let Some(expiry) = self.effective_expiry(deadline, now) {
                cookie.set_max_age((expiry - now).to_std().unwrap_or_default());
                cookie.set_expires(expiry);
            }
        }
        cookie
    }

    /// Builds the cookie instructing the client to drop the session.
    pub(crate) fn build_removal_cookie(&self) -> Cookie {
        let mut cookie = self.base_cookie("");
        cookie.set_max_age(Duration::ZERO);
        cookie
    }

    fn base_cookie(&self, value: &str) -> Cookie {
        let mut cookie = Cookie::new_with_str(&self.name, value);
        cookie.set_path(&self.path);
        if let Some(domain) = &self.domain {
            cookie.set_domain(domain);
        }
        cookie.set_secure(self.secure);
        cookie.set_http_only(self.http_only);
        cookie
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(values: &[&str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(header::COOKIE, value.parse().unwrap());
        }
        headers
    }

    #[test]
    fn token_from_single_header() {
        let config = SessionConfig::new();
        let headers = headers(&["other=1; poem-session=abc123; more=2"]);
        assert_eq!(config.token_from_headers(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn token_from_second_header() {
        let config = SessionConfig::new();
        let headers = headers(&["other=1", "poem-session=abc123"]);
        assert_eq!(config.token_from_headers(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn empty_or_missing_token() {
        let config = SessionConfig::new();
        assert_eq!(config.token_from_headers(&headers(&["other=1"])), None);
        assert_eq!(config.token_from_headers(&headers(&["poem-session="])), None);
        assert_eq!(config.token_from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn custom_cookie_name() {
        let config = SessionConfig::new().name("sid");
        let headers = headers(&["poem-session=ignored; sid=abc123"]);
        assert_eq!(config.token_from_headers(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn idle_timeout_binds_before_lifetime_deadline() {
        let config = SessionConfig::new()
            .lifetime(Duration::from_secs(3600))
            .idle_timeout(Duration::from_secs(300));
        let now = Utc::now();
        let deadline = config.fresh_deadline(now);

        assert_eq!(
            config.storage_expiry(deadline, now),
            Some(Duration::from_secs(300))
        );
        // near the end of the lifetime the deadline binds instead
        let later = now + chrono::Duration::seconds(3500);
        assert_eq!(
            config.storage_expiry(deadline, later),
            Some(Duration::from_secs(100))
        );
    }

    #[test]
    fn session_cookie_without_lifetime_or_persist() {
        let config = SessionConfig::new().idle_timeout(Duration::from_secs(300));
        let now = Utc::now();
        let cookie = config.build_cookie("abc123", None, now).to_string();
        assert!(!cookie.contains("Max-Age="));
        assert!(!cookie.contains("Expires="));
    }
}
