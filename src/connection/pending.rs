// src/connection/pending.rs
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use super::ConnectionError;

pub(crate) type Outcome = Result<Value, ConnectionError>;

/// Outer calls waiting for a `response`/`error`, keyed by correlation id.
#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    entries: DashMap<String, oneshot::Sender<Outcome>>,
}

impl PendingCalls {
    pub fn register(&self, id: &str) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id.to_string(), tx);
        rx
    }

    /// Completes the call `id`. `false` when nobody is waiting for it any more.
    pub fn settle(&self, id: &str, outcome: Outcome) -> bool {
        match self.entries.remove(id) {
            Some((_, tx)) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn discard(&self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Fails every waiting call with a fresh error from `make`.
    pub fn reject_all(&self, make: impl Fn() -> ConnectionError) -> usize {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.settle(id, Err(make()))).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Ties the entry `id` to the caller's future: dropping the guard drops the
    /// entry if nothing settled it first.
    pub fn guard<'a>(&'a self, id: &'a str) -> PendingGuard<'a> {
        PendingGuard { calls: self, id }
    }
}

pub(crate) struct PendingGuard<'a> {
    calls: &'a PendingCalls,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.calls.discard(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn settle_resolves_once() {
        let pending = PendingCalls::default();
        let rx = pending.register("msg-1");
        assert_eq!(pending.len(), 1);

        assert!(pending.settle("msg-1", Ok(json!(1))));
        assert!(!pending.settle("msg-1", Ok(json!(2))));
        assert_eq!(rx.await.unwrap().unwrap(), json!(1));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn reject_all_drains_the_table() {
        let pending = PendingCalls::default();
        let a = pending.register("a");
        let b = pending.register("b");

        assert_eq!(pending.reject_all(|| ConnectionError::ConnectionClosed), 2);
        assert!(matches!(a.await.unwrap(), Err(ConnectionError::ConnectionClosed)));
        assert!(matches!(b.await.unwrap(), Err(ConnectionError::ConnectionClosed)));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn discard_forgets_the_entry() {
        let pending = PendingCalls::default();
        let _rx = pending.register("gone");
        assert!(pending.discard("gone"));
        assert!(!pending.settle("gone", Ok(Value::Null)));
    }

    #[test]
    fn dropped_guard_removes_unsettled_entry() {
        let pending = PendingCalls::default();
        let _rx = pending.register("cancelled");
        drop(pending.guard("cancelled"));
        assert_eq!(pending.len(), 0);

        // settling first leaves nothing for the guard to do
        let rx = pending.register("answered");
        let entry = pending.guard("answered");
        assert!(pending.settle("answered", Ok(json!(7))));
        drop(entry);
        assert_eq!(pending.len(), 0);
        drop(rx);
    }
}
