//! Cross-download control: the in-process id -> running-download registry.
//!
//! The RPC adapter and the single-download CLI path both need to signal
//! `stop` into a running coordinator without going through a database. Each
//! running download registers its stop sender here; a control client
//! (`pause`, `pause-all`, `remove`) looks the id up and sends on it.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::RwLock;

/// Registry of job id -> stop sender for all downloads currently running in
/// this process.
#[derive(Default)]
pub struct JobTable {
    jobs: RwLock<HashMap<i64, Sender<()>>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running download's stop sender. Call when the coordinator
    /// starts; overwrites any previous entry for the same id.
    pub fn register(&self, id: i64, stop: Sender<()>) {
        self.jobs.write().unwrap().insert(id, stop);
    }

    /// Unregister a download (call when its coordinator exits, success or not).
    pub fn unregister(&self, id: i64) {
        self.jobs.write().unwrap().remove(&id);
    }

    /// Request stop for one download. No-op if the id isn't running.
    pub fn request_stop(&self, id: i64) {
        if let Some(tx) = self.jobs.read().unwrap().get(&id) {
            let _ = tx.send(());
        }
    }

    /// Request stop for every running download.
    pub fn request_stop_all(&self) {
        for tx in self.jobs.read().unwrap().values() {
            let _ = tx.send(());
        }
    }

    /// True if `id` currently has a running coordinator.
    pub fn is_running(&self, id: i64) -> bool {
        self.jobs.read().unwrap().contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn register_and_stop() {
        let table = JobTable::new();
        let (tx, rx) = channel();
        table.register(1, tx);
        assert!(table.is_running(1));
        table.request_stop(1);
        assert!(rx.try_recv().is_ok());
        table.unregister(1);
        assert!(!table.is_running(1));
    }

    #[test]
    fn stop_all_reaches_every_job() {
        let table = JobTable::new();
        let (tx1, rx1) = channel();
        let (tx2, rx2) = channel();
        table.register(1, tx1);
        table.register(2, tx2);
        table.request_stop_all();
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }
}
