use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

use parking_lot::RwLock;
use poem::{FromRequest, Request, RequestBody, Result};
use serde_json::Value;

use crate::{NoSessionError, SessionError};

/// Status of the session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// The values match what was loaded from the storage engine, or the
    /// session is fresh and still empty.
    Unchanged,

    /// At least one value was added, replaced or removed.
    Changed,

    /// The token should be rotated while keeping the values.
    Renewed,

    /// The session was explicitly invalidated and its record must be deleted.
    Destroyed,
}

struct SessionInner {
    status: SessionStatus,
    written: bool,
    entries: BTreeMap<String, Value>,
}

impl SessionInner {
    /// Guard shared by all mutating operations. `written` is a caller error,
    /// a destroyed session just swallows further changes.
    fn check_mutable(&self) -> Result<bool, SessionError> {
        if self.written {
            return Err(SessionError::AlreadyWritten);
        }
        Ok(self.status != SessionStatus::Destroyed)
    }

    fn mark_changed(&mut self) {
        if self.status == SessionStatus::Unchanged {
            self.status = SessionStatus::Changed;
        }
    }
}

/// The per-request session state.
///
/// One instance exists per in-flight request; clones share the same inner
/// state behind a reader-writer lock, so a handler may fan out concurrent
/// work against it.
#[derive(Clone)]
pub struct Session {
    inner: Arc<RwLock<SessionInner>>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Session")
            .field("status", &inner.status)
            .field("written", &inner.written)
            .field("entries", &inner.entries)
            .finish()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

/// Snapshot taken by the manager when the session is flushed to the response.
pub(crate) struct Sealed {
    pub(crate) status: SessionStatus,
    pub(crate) entries: BTreeMap<String, Value>,
}

impl Session {
    /// Creates a new session instance with the given entries.
    pub(crate) fn new(entries: BTreeMap<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SessionInner {
                status: SessionStatus::Unchanged,
                written: false,
                entries,
            })),
        }
    }

    fn get_with<T>(
        &self,
        key: &str,
        convert: impl FnOnce(&Value) -> Option<T>,
    ) -> Result<T, SessionError> {
        let inner = self.inner.read();
        let value = inner.entries.get(key).ok_or(SessionError::KeyNotFound)?;
        convert(value).ok_or(SessionError::TypeMismatch)
    }

    fn put_value(&self, key: &str, value: Value) -> Result<(), SessionError> {
        let mut inner = self.inner.write();
        if inner.check_mutable()? {
            inner.entries.insert(key.to_string(), value);
            inner.mark_changed();
        }
        Ok(())
    }

    fn pop_with<T>(
        &self,
        key: &str,
        convert: impl FnOnce(&Value) -> Option<T>,
    ) -> Result<T, SessionError> {
        let mut inner = self.inner.write();
        if !inner.check_mutable()? {
            return Err(SessionError::KeyNotFound);
        }
        let value = inner.entries.get(key).ok_or(SessionError::KeyNotFound)?;
        // on a type mismatch the entry is left in place
        let value = convert(value).ok_or(SessionError::TypeMismatch)?;
        inner.entries.remove(key);
        inner.mark_changed();
        Ok(value)
    }

    /// Returns the string value for the given key.
    ///
    /// Fails with [`SessionError::KeyNotFound`] if the key is absent, and
    /// with [`SessionError::TypeMismatch`] if the value is not a string.
    pub fn get_string(&self, key: &str) -> Result<String, SessionError> {
        self.get_with(key, |value| value.as_str().map(ToString::to_string))
    }

    /// Returns the bool value for the given key.
    pub fn get_bool(&self, key: &str) -> Result<bool, SessionError> {
        self.get_with(key, Value::as_bool)
    }

    /// Returns the integer value for the given key.
    ///
    /// Any number token representable as `i64` is accepted, so values that
    /// round-tripped through the storage engine's serialization convert back;
    /// every other shape fails with [`SessionError::TypeMismatch`].
    pub fn get_int(&self, key: &str) -> Result<i64, SessionError> {
        self.get_with(key, Value::as_i64)
    }

    /// Returns the float value for the given key. Integer tokens convert.
    pub fn get_float(&self, key: &str) -> Result<f64, SessionError> {
        self.get_with(key, Value::as_f64)
    }

    /// Stores a string value under the given key, replacing any existing
    /// value.
    ///
    /// Fails with [`SessionError::AlreadyWritten`] once the session has been
    /// flushed to the response.
    pub fn put_string(&self, key: &str, value: impl Into<String>) -> Result<(), SessionError> {
        self.put_value(key, Value::String(value.into()))
    }

    /// Stores a bool value under the given key.
    pub fn put_bool(&self, key: &str, value: bool) -> Result<(), SessionError> {
        self.put_value(key, Value::Bool(value))
    }

    /// Stores an integer value under the given key.
    pub fn put_int(&self, key: &str, value: i64) -> Result<(), SessionError> {
        self.put_value(key, Value::from(value))
    }

    /// Stores a float value under the given key.
    pub fn put_float(&self, key: &str, value: f64) -> Result<(), SessionError> {
        self.put_value(key, Value::from(value))
    }

    /// Returns the string value for the given key and removes the entry.
    ///
    /// On [`SessionError::TypeMismatch`] the entry is left untouched.
    pub fn pop_string(&self, key: &str) -> Result<String, SessionError> {
        self.pop_with(key, |value| value.as_str().map(ToString::to_string))
    }

    /// Returns the bool value for the given key and removes the entry.
    pub fn pop_bool(&self, key: &str) -> Result<bool, SessionError> {
        self.pop_with(key, Value::as_bool)
    }

    /// Returns the integer value for the given key and removes the entry.
    pub fn pop_int(&self, key: &str) -> Result<i64, SessionError> {
        self.pop_with(key, Value::as_i64)
    }

    /// Returns the float value for the given key and removes the entry.
    pub fn pop_float(&self, key: &str) -> Result<f64, SessionError> {
        self.pop_with(key, Value::as_f64)
    }

    /// Removes the given key. Absent keys are not an error.
    pub fn remove(&self, key: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.write();
        if inner.check_mutable()? {
            inner.entries.remove(key);
            inner.mark_changed();
        }
        Ok(())
    }

    /// Removes all keys from the session.
    pub fn clear(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.write();
        if inner.check_mutable()? {
            inner.entries.clear();
            inner.mark_changed();
        }
        Ok(())
    }

    /// Requests a new token for this session, keeping the values.
    ///
    /// The old storage record is deleted and the state is saved under a
    /// freshly generated token when the response is written.
    pub fn renew(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.write();
        if inner.check_mutable()? {
            inner.status = SessionStatus::Renewed;
        }
        Ok(())
    }

    /// Invalidates the session on both the client and the server.
    pub fn destroy(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.write();
        if inner.check_mutable()? {
            inner.entries.clear();
            inner.status = SessionStatus::Destroyed;
        }
        Ok(())
    }

    /// Returns `true` if this session does not contain any values.
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.read();
        inner.entries.is_empty()
    }

    /// Returns the status of this session.
    pub fn status(&self) -> SessionStatus {
        let inner = self.inner.read();
        inner.status
    }

    /// Marks the session as written and snapshots its state.
    ///
    /// Performed under the exclusive lock, so any accessor still running
    /// concurrently either completes before the snapshot or observes
    /// [`SessionError::AlreadyWritten`].
    pub(crate) fn seal(&self) -> Sealed {
        let mut inner = self.inner.write();
        inner.written = true;
        Sealed {
            status: inner.status,
            entries: inner.entries.clone(),
        }
    }
}

#[poem::async_trait]
impl<'a> FromRequest<'a> for &'a Session {
    async fn from_request(req: &'a Request, _body: &mut RequestBody) -> Result<Self> {
        req.extensions()
            .get::<Session>()
            .ok_or_else(|| NoSessionError.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with(json: &str) -> Session {
        Session::new(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn roundtrip() {
        let session = Session::default();
        session.put_string("s", "lorem ipsum").unwrap();
        session.put_bool("b", true).unwrap();
        session.put_int("i", 42).unwrap();
        session.put_float("f", 1.5).unwrap();

        assert_eq!(session.get_string("s").unwrap(), "lorem ipsum");
        assert!(session.get_bool("b").unwrap());
        assert_eq!(session.get_int("i").unwrap(), 42);
        assert_eq!(session.get_float("f").unwrap(), 1.5);
        assert_eq!(session.status(), SessionStatus::Changed);
    }

    #[test]
    fn missing_key() {
        let session = Session::default();
        assert_eq!(session.get_string("nope"), Err(SessionError::KeyNotFound));
        assert_eq!(session.pop_int("nope"), Err(SessionError::KeyNotFound));
    }

    #[test]
    fn type_mismatch() {
        let session = Session::default();
        session.put_string("s", "abc").unwrap();
        assert_eq!(session.get_int("s"), Err(SessionError::TypeMismatch));
        assert_eq!(session.get_bool("s"), Err(SessionError::TypeMismatch));
    }

    #[test]
    fn pop_removes_entry() {
        let session = Session::default();
        session.put_string("s", "abc").unwrap();
        assert_eq!(session.pop_string("s").unwrap(), "abc");
        assert_eq!(session.get_string("s"), Err(SessionError::KeyNotFound));
    }

    #[test]
    fn failed_pop_keeps_entry() {
        let session = Session::default();
        session.put_string("s", "abc").unwrap();
        assert_eq!(session.pop_int("s"), Err(SessionError::TypeMismatch));
        assert_eq!(session.get_string("s").unwrap(), "abc");
    }

    #[test]
    fn int_from_serialized_number_token() {
        // entries as they come back from an engine's JSON round-trip
        let session = session_with(r#"{"n":42,"s":"not a number"}"#);
        assert_eq!(session.get_int("n").unwrap(), 42);
        assert_eq!(session.get_int("s"), Err(SessionError::TypeMismatch));
        assert_eq!(session.pop_int("s"), Err(SessionError::TypeMismatch));
        assert_eq!(session.pop_int("n").unwrap(), 42);
    }

    #[test]
    fn float_accepts_integer_token() {
        let session = session_with(r#"{"n":3}"#);
        assert_eq!(session.get_float("n").unwrap(), 3.0);
    }

    #[test]
    fn clear_removes_all_keys() {
        let session = Session::default();
        session.put_string("a", "1").unwrap();
        session.put_int("b", 2).unwrap();
        session.clear().unwrap();
        assert_eq!(session.get_string("a"), Err(SessionError::KeyNotFound));
        assert_eq!(session.get_int("b"), Err(SessionError::KeyNotFound));
        assert!(session.is_empty());
    }

    #[test]
    fn remove_absent_key_is_noop() {
        let session = Session::default();
        session.remove("nope").unwrap();
        assert_eq!(session.status(), SessionStatus::Changed);
    }

    #[test]
    fn mutations_fail_after_seal() {
        let session = Session::default();
        session.put_string("s", "abc").unwrap();
        session.seal();

        assert_eq!(
            session.put_string("s", "x"),
            Err(SessionError::AlreadyWritten)
        );
        assert_eq!(session.pop_string("s"), Err(SessionError::AlreadyWritten));
        assert_eq!(session.remove("s"), Err(SessionError::AlreadyWritten));
        assert_eq!(session.clear(), Err(SessionError::AlreadyWritten));
        assert_eq!(session.renew(), Err(SessionError::AlreadyWritten));
        assert_eq!(session.destroy(), Err(SessionError::AlreadyWritten));

        // reads still work
        assert_eq!(session.get_string("s").unwrap(), "abc");
    }

    #[test]
    fn destroy_clears_and_swallows_later_mutations() {
        let session = Session::default();
        session.put_string("s", "abc").unwrap();
        session.destroy().unwrap();

        assert!(session.is_empty());
        assert_eq!(session.status(), SessionStatus::Destroyed);

        session.put_string("s", "x").unwrap();
        assert!(session.is_empty());
        assert_eq!(session.status(), SessionStatus::Destroyed);
    }

    #[test]
    fn renew_keeps_values() {
        let session = Session::default();
        session.put_string("s", "abc").unwrap();
        session.renew().unwrap();
        assert_eq!(session.status(), SessionStatus::Renewed);
        assert_eq!(session.get_string("s").unwrap(), "abc");
    }

    #[test]
    fn concurrent_access() {
        let session = Session::default();
        session.put_int("n", 0).unwrap();

        let handles = (0..8)
            .map(|_| {
                let session = session.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let n = session.get_int("n").unwrap();
                        session.put_int("n", n + 1).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(session.get_int("n").unwrap() > 0);
    }
}
