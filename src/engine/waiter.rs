//! Wake-ups for leaves still in flight from the remote.
//!
//! A metadata document can replicate ahead of the leaves it references;
//! readers park here until the live changes feed announces the arrival.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded};

use crate::model::DocId;

/// Hard ceiling on one leaf wait.
pub const LEAF_WAIT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Default)]
pub struct LeafWaiter {
    waiting: Mutex<HashMap<String, Vec<Sender<()>>>>,
}

impl LeafWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `id` before re-checking the store, so an
    /// arrival between the check and the wait cannot be missed.
    pub fn register(&self, id: &DocId) -> Receiver<()> {
        let (sender, receiver) = bounded(1);
        let mut waiting = self.waiting.lock().unwrap_or_else(|err| err.into_inner());
        waiting.entry(id.to_string()).or_default().push(sender);
        receiver
    }

    /// Block until the leaf is announced or `timeout` elapses. A timed-out
    /// wait stays registered; a later arrival for it is a no-op wake.
    pub fn wait_for(&self, id: &DocId, timeout: Duration) -> bool {
        self.register(id).recv_timeout(timeout).is_ok()
    }

    /// Announce an arrival: wake every waiter registered for `id` and
    /// drop the registration.
    pub fn arrived(&self, id: &DocId) {
        let senders = {
            let mut waiting = self.waiting.lock().unwrap_or_else(|err| err.into_inner());
            waiting.remove(id.as_str())
        };
        if let Some(senders) = senders {
            for sender in senders {
                let _ = sender.try_send(());
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.waiting
            .lock()
            .map(|waiting| waiting.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn arrival_wakes_the_waiter() {
        let waiter = Arc::new(LeafWaiter::new());
        let id = DocId::from("h:aa0");

        let background = Arc::clone(&waiter);
        let announced = id.clone();
        let join = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            background.arrived(&announced);
        });

        assert!(waiter.wait_for(&id, Duration::from_secs(2)));
        join.join().unwrap();
        assert_eq!(waiter.pending(), 0);
    }

    #[test]
    fn timeout_rejects_but_keeps_registration() {
        let waiter = LeafWaiter::new();
        let id = DocId::from("h:bb0");
        assert!(!waiter.wait_for(&id, Duration::from_millis(20)));
        assert_eq!(waiter.pending(), 1);
        // Late arrival is a no-op wake and clears the entry.
        waiter.arrived(&id);
        assert_eq!(waiter.pending(), 0);
    }

    #[test]
    fn arrival_wakes_every_waiter_for_the_id() {
        let waiter = Arc::new(LeafWaiter::new());
        let id = DocId::from("h:cc0");

        let mut joins = Vec::new();
        for _ in 0..3 {
            let waiter = Arc::clone(&waiter);
            let id = id.clone();
            joins.push(thread::spawn(move || {
                waiter.wait_for(&id, Duration::from_secs(2))
            }));
        }
        thread::sleep(Duration::from_millis(30));
        waiter.arrived(&id);
        for join in joins {
            assert!(join.join().unwrap());
        }
    }
}
