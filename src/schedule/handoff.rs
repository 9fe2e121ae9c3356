//! Bounded producer/consumer handoff between execution contexts.
//!
//! Models a pair of counting semaphores ("slots free to produce into" and
//! "slots ready to consume") as two bounded channels. Free slots circulate
//! as tokens, so the slot number doubles as the buffer index of the
//! in-flight result.
//!
//! ```text
//!            free (tokens)
//!   ┌─────────────────────────────────┐
//!   ▼                                 │
//! Producer ──produce_end(slot, item)──► ready ──► Consumer
//!   produce_begin()                        consume_begin() .. consume_end(slot)
//! ```
//!
//! Invariant: `producible + consumable + in_flight == capacity`. A slot is
//! in flight between `produce_begin` and `produce_end`, and between
//! `consume_begin` and `consume_end`.
//!
//! Each end owns its channel halves. When one side stops (done or failed)
//! and drops its end, the other side's blocking calls return
//! [`HandoffError::Disconnected`] once nothing is left to receive.

use crossbeam_channel::{bounded, Receiver, Sender};
use thiserror::Error;

/// Handoff failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandoffError {
    #[error("handoff capacity must be at least 1")]
    ZeroCapacity,

    #[error("handoff peer disconnected")]
    Disconnected,

    #[error("slot {slot} out of range for capacity {capacity}")]
    BadSlot { slot: usize, capacity: usize },
}

/// Slot counts seen from one end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    pub producible: usize,
    pub consumable: usize,
    pub in_flight: usize,
}

impl Occupancy {
    pub fn total(&self) -> usize {
        self.producible + self.consumable + self.in_flight
    }
}

/// Constructor for a connected producer/consumer pair.
pub struct StageHandoff;

impl StageHandoff {
    /// Create a handoff of `capacity` slots, all initially producible.
    #[allow(clippy::new_ret_no_self)]
    pub fn new<T>(capacity: usize) -> Result<(HandoffProducer<T>, HandoffConsumer<T>), HandoffError> {
        if capacity == 0 {
            return Err(HandoffError::ZeroCapacity);
        }

        let (free_tx, free_rx) = bounded(capacity);
        let (ready_tx, ready_rx) = bounded(capacity);

        for slot in 0..capacity {
            free_tx.send(slot).map_err(|_| HandoffError::Disconnected)?;
        }

        Ok((
            HandoffProducer {
                capacity,
                free: free_rx,
                ready: ready_tx,
            },
            HandoffConsumer {
                capacity,
                free: free_tx,
                ready: ready_rx,
            },
        ))
    }
}

fn occupancy(capacity: usize, producible: usize, consumable: usize) -> Occupancy {
    Occupancy {
        producible,
        consumable,
        in_flight: capacity.saturating_sub(producible + consumable),
    }
}

/// Producing end.
pub struct HandoffProducer<T> {
    capacity: usize,
    free: Receiver<usize>,
    ready: Sender<(usize, T)>,
}

impl<T> HandoffProducer<T> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take a free slot, blocking while every slot is in use.
    pub fn produce_begin(&self) -> Result<usize, HandoffError> {
        self.free.recv().map_err(|_| HandoffError::Disconnected)
    }

    /// Publish `item` in `slot` to the consumer.
    pub fn produce_end(&self, slot: usize, item: T) -> Result<(), HandoffError> {
        if slot >= self.capacity {
            return Err(HandoffError::BadSlot {
                slot,
                capacity: self.capacity,
            });
        }
        self.ready.send((slot, item)).map_err(|_| HandoffError::Disconnected)
    }

    pub fn occupancy(&self) -> Occupancy {
        occupancy(self.capacity, self.free.len(), self.ready.len())
    }
}

/// Consuming end.
pub struct HandoffConsumer<T> {
    capacity: usize,
    free: Sender<usize>,
    ready: Receiver<(usize, T)>,
}

impl<T> HandoffConsumer<T> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take the oldest ready item, blocking while none is ready.
    pub fn consume_begin(&self) -> Result<(usize, T), HandoffError> {
        self.ready.recv().map_err(|_| HandoffError::Disconnected)
    }

    /// Return `slot` to the producer.
    pub fn consume_end(&self, slot: usize) -> Result<(), HandoffError> {
        if slot >= self.capacity {
            return Err(HandoffError::BadSlot {
                slot,
                capacity: self.capacity,
            });
        }
        self.free.send(slot).map_err(|_| HandoffError::Disconnected)
    }

    pub fn occupancy(&self) -> Occupancy {
        occupancy(self.capacity, self.free.len(), self.ready.len())
    }
}
