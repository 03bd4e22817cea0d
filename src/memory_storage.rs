use std::{
    cmp::Reverse,
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use poem::Result;
use priority_queue::PriorityQueue;

use crate::{SessionRecord, SessionStorage};

struct InnerStorage {
    sessions: HashMap<String, (Option<Instant>, SessionRecord)>,
    timeout_queue: PriorityQueue<String, Reverse<Instant>>,
}

impl InnerStorage {
    fn cleanup(&mut self) {
        loop {
            let now = Instant::now();
            if let Some((_, expire_at)) = self.timeout_queue.peek() {
                if expire_at.0 > now {
                    break;
                }
                if let Some((token, _)) = self.timeout_queue.pop() {
                    self.sessions.remove(&token);
                }
            } else {
                break;
            }
        }
    }
}

/// A session storage using memory.
pub struct MemoryStorage {
    inner: Arc<Mutex<InnerStorage>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        let inner = Arc::new(Mutex::new(InnerStorage {
            sessions: HashMap::new(),
            timeout_queue: PriorityQueue::new(),
        }));
        tokio::spawn({
            let inner = Arc::downgrade(&inner);
            async move {
                loop {
                    match inner.upgrade() {
                        Some(inner) => inner.lock().cleanup(),
                        None => return,
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });
        Self { inner }
    }
}

impl MemoryStorage {
    /// Create a `MemoryStorage`.
    pub fn new() -> Self {
        Default::default()
    }
}

#[poem::async_trait]
impl SessionStorage for MemoryStorage {
    async fn find(&self, token: &str) -> Result<Option<SessionRecord>> {
        let inner = self.inner.lock();
        // expired records must read as absent even before the sweeper runs
        Ok(inner
            .sessions
            .get(token)
            .filter(|(expire_at, _)| expire_at.map_or(true, |expire_at| expire_at > Instant::now()))
            .map(|(_, record)| record.clone()))
    }

    async fn save(
        &self,
        token: &str,
        record: &SessionRecord,
        expiry: Option<Duration>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.timeout_queue.remove(token);
        let expire_at = expiry.map(|expiry| Instant::now() + expiry);
        inner
            .sessions
            .insert(token.to_string(), (expire_at, record.clone()));
        if let Some(expire_at) = expire_at {
            inner
                .timeout_queue
                .push(token.to_string(), Reverse(expire_at));
        }
        Ok(())
    }

    async fn delete(&self, token: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.sessions.remove(token);
        inner.timeout_queue.remove(token);
        Ok(())
    }
}
