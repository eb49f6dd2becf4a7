use super::types::StatusSnapshot;
use std::sync::Arc;
use tokio::sync::watch;

/// Atomically replaced latest snapshot
///
/// Readers clone the `Arc` out of the channel and never observe a partially
/// built snapshot.
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    tx: watch::Sender<Arc<StatusSnapshot>>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(StatusSnapshot::initial()));
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StatusSnapshot>> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Arc<StatusSnapshot> {
        self.tx.borrow().clone()
    }

    /// Replace the snapshot wholesale
    pub fn publish(&self, snapshot: StatusSnapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    /// Copy the latest snapshot, apply `f`, stamp it and publish
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut StatusSnapshot),
    {
        let mut next = (*self.latest()).clone();
        f(&mut next);
        next.last_update = chrono::Utc::now().to_rfc3339();
        self.publish(next);
    }
}
