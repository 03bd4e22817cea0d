use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use poem::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The state persisted for one session token.
///
/// The record is serializable as a whole so engines can store it as an opaque
/// document. `deadline` is the absolute end of the session's lifetime, fixed
/// when the record is first created; re-saving a record must carry it over
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Absolute lifetime deadline, `None` when no lifetime is configured.
    pub deadline: Option<DateTime<Utc>>,

    /// The key-value entries of the session.
    pub entries: BTreeMap<String, Value>,
}

/// Represents a back-end session storage.
#[poem::async_trait]
pub trait SessionStorage: Send + Sync {
    /// Load the record for a token.
    ///
    /// Absent and engine-side expired tokens both yield `Ok(None)`; an error
    /// means the engine itself failed.
    async fn find(&self, token: &str) -> Result<Option<SessionRecord>>;

    /// Insert or update the record for a token.
    ///
    /// `expiry` is the advisory time-to-live after which the engine may
    /// garbage-collect the record.
    async fn save(
        &self,
        token: &str,
        record: &SessionRecord,
        expiry: Option<Duration>,
    ) -> Result<()>;

    /// Remove the record for a token. Deleting an absent token is not an
    /// error.
    async fn delete(&self, token: &str) -> Result<()>;
}
