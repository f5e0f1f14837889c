use std::collections::HashMap;

use log::debug;
use tokio::sync::{mpsc, Mutex};

use crate::round_trip::RoundTrip;

/// Rendezvous between the task awaiting a request's outcome and the receive
/// path that observes it, keyed by sequence number.
///
/// Each slot is a buffered, single-item channel: [`reserve`] hands the
/// receiving half to the per-request waiter, [`lookup`] hands a sender to
/// the delivery path, and [`erase`] retires the slot once the outcome is
/// resolved. A delivery into an erased slot fails and the reply is treated
/// as stale by the caller.
///
/// [`reserve`]: CorrelationTable::reserve
/// [`lookup`]: CorrelationTable::lookup
/// [`erase`]: CorrelationTable::erase
pub(crate) struct CorrelationTable {
    slots: Mutex<HashMap<u16, mpsc::Sender<RoundTrip>>>,
}

impl CorrelationTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn reserve(&self, sequence: u16) -> mpsc::Receiver<RoundTrip> {
        let (tx, rx) = mpsc::channel(1);
        if self.slots.lock().await.insert(sequence, tx).is_some() {
            debug!("replacing stale delivery slot for sequence {sequence}");
        }
        rx
    }

    pub(crate) async fn lookup(&self, sequence: u16) -> Option<mpsc::Sender<RoundTrip>> {
        self.slots.lock().await.get(&sequence).cloned()
    }

    pub(crate) async fn erase(&self, sequence: u16) {
        self.slots.lock().await.remove(&sequence);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn outcome(sequence: u16) -> RoundTrip {
        RoundTrip::timed_out(sequence, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn delivers_into_a_reserved_slot() {
        let table = CorrelationTable::new();
        let mut slot = table.reserve(3).await;

        let sender = table.lookup(3).await.expect("slot must exist");
        sender.try_send(outcome(3)).unwrap();

        assert_eq!(slot.recv().await, Some(outcome(3)));
    }

    #[tokio::test]
    async fn erased_slots_are_not_found() {
        let table = CorrelationTable::new();
        let _slot = table.reserve(9).await;
        table.erase(9).await;
        assert!(table.lookup(9).await.is_none());
        // A second erase of the same sequence is harmless.
        table.erase(9).await;
    }

    #[tokio::test]
    async fn slot_accepts_exactly_one_outcome() {
        let table = CorrelationTable::new();
        let _slot = table.reserve(5).await;

        let sender = table.lookup(5).await.unwrap();
        sender.try_send(outcome(5)).unwrap();
        assert!(sender.try_send(outcome(5)).is_err());
    }

    #[tokio::test]
    async fn distinct_sequences_do_not_interfere() {
        let table = Arc::new(CorrelationTable::new());
        let mut slots = Vec::new();
        for sequence in 0..16u16 {
            slots.push((sequence, table.reserve(sequence).await));
        }

        let writers: Vec<_> = (0..16u16)
            .map(|sequence| {
                let table = Arc::clone(&table);
                tokio::spawn(async move {
                    let sender = table.lookup(sequence).await.unwrap();
                    sender.try_send(outcome(sequence)).unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        for (sequence, mut slot) in slots {
            assert_eq!(slot.recv().await, Some(outcome(sequence)));
        }
    }
}
