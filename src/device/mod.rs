//! Simulated accelerator backend.
//!
//! [`SimDevice`] owns a bulk memory, a scratchpad and an event log. Its
//! [`SimDma`] and [`SimCompute`] views implement the transfer and compute
//! collaborator traits, so the schedulers can run end to end without
//! hardware:
//!
//! ```text
//!            ┌──────────── SimDevice ─────────────┐
//!            │  BulkMemory     Scratchpad  Events │
//!            └─────▲──────────────▲─────────▲─────┘
//!                  │              │         │
//!        SimDma ───┴──────────────┤         │ every start / wait
//!        SimCompute ──────────────┴─────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use tile_sched::device::SimDevice;
//! use tile_sched::schedule::transfer::{Direction, TransferDescriptor, TransferEngine};
//! use tile_sched::schedule::role::Role;
//!
//! let device = SimDevice::new(0x1000, 256);
//! device.lock_bulk().write_bytes(0x8000, &[1, 2, 3, 4]);
//!
//! let dma = device.dma();
//! let load = TransferDescriptor::linear(Role::Weights, Direction::Load, 0x8000, 0x1000, 4);
//! let handle = dma.start(&load).unwrap();
//! dma.wait(handle).unwrap();
//!
//! let mut buf = [0u8; 4];
//! device.lock_scratch().read(0x1000, &mut buf).unwrap();
//! assert_eq!(buf, [1, 2, 3, 4]);
//! assert_eq!(device.events().len(), 2);
//! ```

pub mod compute;
pub mod dma;
pub mod memory;
pub mod trace;

use std::sync::{Mutex, MutexGuard};

pub use compute::{tile_marker, SimCompute};
pub use dma::{bulk_runs, DmaFault, SimDma};
pub use memory::{BulkMemory, MemoryError, MemoryRegion, Scratchpad};
pub use trace::{Event, EventLog};

/// Bulk memory, scratchpad and call log shared by the simulated engines.
///
/// Lock order is bulk before scratchpad.
#[derive(Debug)]
pub struct SimDevice {
    bulk: Mutex<BulkMemory>,
    scratch: Mutex<Scratchpad>,
    events: EventLog,
}

impl SimDevice {
    pub fn new(scratch_base: u64, scratch_size: usize) -> Self {
        Self {
            bulk: Mutex::new(BulkMemory::new()),
            scratch: Mutex::new(Scratchpad::new(scratch_base, scratch_size)),
            events: EventLog::new(),
        }
    }

    /// A DMA engine operating on this device.
    pub fn dma(&self) -> SimDma<'_> {
        SimDma::new(self)
    }

    /// A compute engine operating on this device.
    pub fn compute(&self) -> SimCompute<'_> {
        SimCompute::new(self)
    }

    pub fn lock_bulk(&self) -> MutexGuard<'_, BulkMemory> {
        self.bulk.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn lock_scratch(&self) -> MutexGuard<'_, Scratchpad> {
        self.scratch.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }
}
