//! Table of requests that are waiting for a reply.
//!
//! Entries leave the table when they are taken for resolution; the agent only
//! counts as idle once the taken future has actually been resolved, so
//! `wait_idle` never returns while a caller could still see `Pending`.

use crate::error::Fault;
use crate::future::FutureMessage;
use crate::message::Message;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::error;

pub(crate) struct Pending {
    pub(crate) destination: usize,
    pub(crate) future: FutureMessage,
    sent_at: Instant,
}

#[derive(Default)]
struct Entries {
    pending: HashMap<u64, Pending>,
    /// Inserted but not yet resolved, including entries already taken.
    unsettled: usize,
}

#[derive(Default)]
pub(crate) struct InFlightTable {
    entries: Mutex<Entries>,
    idle: Notify,
}

impl InFlightTable {
    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn insert(&self, id: u64, destination: usize, future: FutureMessage) {
        let mut entries = self.lock();
        let previous = entries.pending.insert(
            id,
            Pending {
                destination,
                future,
                sent_at: Instant::now(),
            },
        );
        if previous.is_some() {
            error!("Request id {} was reused while still in flight", id);
        } else {
            entries.unsettled += 1;
        }
    }

    /// Take the entry for a reply with `id` that came from `src`. A reply
    /// from any other rank leaves the entry in place.
    pub(crate) fn take_reply(&self, id: u64, src: usize) -> Option<Pending> {
        let mut entries = self.lock();
        match entries.pending.get(&id) {
            Some(pending) if pending.destination == src => entries.pending.remove(&id),
            _ => None,
        }
    }

    pub(crate) fn take(&self, id: u64) -> Option<Pending> {
        self.lock().pending.remove(&id)
    }

    pub(crate) fn take_to(&self, destination: usize) -> Vec<Pending> {
        let mut entries = self.lock();
        let ids: Vec<u64> = entries
            .pending
            .iter()
            .filter(|(_, pending)| pending.destination == destination)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| entries.pending.remove(&id))
            .collect()
    }

    pub(crate) fn take_expired(&self, timeout: Duration) -> Vec<Pending> {
        let mut entries = self.lock();
        let ids: Vec<u64> = entries
            .pending
            .iter()
            .filter(|(_, pending)| pending.sent_at.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| entries.pending.remove(&id))
            .collect()
    }

    pub(crate) fn take_all(&self) -> Vec<Pending> {
        self.lock().pending.drain().map(|(_, pending)| pending).collect()
    }

    /// Drop a just-inserted entry whose request never left this process.
    pub(crate) fn forget(&self, id: u64) {
        if self.take(id).is_some() {
            self.mark_settled();
        }
    }

    /// Resolve a taken entry and count it as settled.
    pub(crate) fn settle(&self, pending: Pending, outcome: std::result::Result<Message, Fault>) {
        let resolved = match outcome {
            Ok(message) => pending.future.set_result(message),
            Err(fault) => pending.future.set_error(fault),
        };
        if let Err(e) = resolved {
            error!("In-flight future resolved twice: {}", e);
        }
        self.mark_settled();
    }

    fn mark_settled(&self) {
        let now_idle = {
            let mut entries = self.lock();
            entries.unsettled = entries.unsettled.saturating_sub(1);
            entries.unsettled == 0
        };
        if now_idle {
            self.idle.notify_waiters();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().unsettled
    }

    /// Wait until every inserted request has been resolved.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.len() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn reply(id: u64) -> Message {
        Message::response(id, "op", "ok")
    }

    #[test]
    fn test_take_reply_checks_source_rank() {
        let table = InFlightTable::default();
        let future = FutureMessage::new();
        table.insert(1, 2, future.clone());

        assert!(table.take_reply(1, 0).is_none());
        assert!(table.take_reply(9, 2).is_none());

        let pending = table.take_reply(1, 2).unwrap();
        assert_eq!(pending.destination, 2);
        assert!(table.take_reply(1, 2).is_none());
    }

    #[test]
    fn test_settle_counts_down() {
        let table = InFlightTable::default();
        let future = FutureMessage::new();
        table.insert(1, 0, future.clone());
        table.insert(2, 0, FutureMessage::new());
        assert_eq!(table.len(), 2);

        let pending = table.take(1).unwrap();
        assert_eq!(table.len(), 2);
        table.settle(pending, Ok(reply(1)));
        assert_eq!(table.len(), 1);
        assert!(future.is_completed());

        table.forget(2);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_take_to_only_matches_destination() {
        let table = InFlightTable::default();
        table.insert(1, 0, FutureMessage::new());
        table.insert(2, 1, FutureMessage::new());
        table.insert(3, 1, FutureMessage::new());

        let taken = table.take_to(1);
        assert_eq!(taken.len(), 2);
        assert!(taken.iter().all(|p| p.destination == 1));
        assert_eq!(table.take_all().len(), 1);
    }

    #[test]
    fn test_take_expired() {
        let table = InFlightTable::default();
        table.insert(1, 0, FutureMessage::new());
        assert!(table.take_expired(Duration::from_secs(60)).is_empty());
        assert_eq!(table.take_expired(Duration::ZERO).len(), 1);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_after_settle() {
        let table = Arc::new(InFlightTable::default());
        table.wait_idle().await;

        table.insert(7, 0, FutureMessage::new());
        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let pending = table.take(7).unwrap();
        table.settle(
            pending,
            Err(Fault::Transport {
                peer: "w1".to_string(),
                message: "gone".to_string(),
            }),
        );
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
