//! Call-order event log of the simulated device.

use std::sync::Mutex;

use crate::schedule::compute::JobHandle;
use crate::schedule::index::TileIndex;
use crate::schedule::role::Stage;
use crate::schedule::transfer::{TransferDescriptor, TransferHandle};

/// One collaborator call, recorded when it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    TransferStart {
        handle: TransferHandle,
        desc: TransferDescriptor,
    },
    TransferWait {
        handle: TransferHandle,
    },
    ComputeStart {
        handle: JobHandle,
        stage: Stage,
        index: TileIndex,
    },
    ComputeWait {
        handle: JobHandle,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::TransferStart { handle, desc } => write!(
                f,
                "{} start {} {} bulk=0x{:08x} scratch=0x{:06x} {}B",
                handle,
                desc.role,
                desc.direction,
                desc.bulk,
                desc.scratch,
                desc.bytes()
            ),
            Event::TransferWait { handle } => write!(f, "{} wait", handle),
            Event::ComputeStart { handle, stage, index } => {
                write!(f, "{} start {} {}", handle, stage, index)
            }
            Event::ComputeWait { handle } => write!(f, "{} wait", handle),
        }
    }
}

/// Append-only, shared between execution contexts.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push(event);
    }

    /// Copy of every event so far, in order.
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
