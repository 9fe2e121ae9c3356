//! Simulated DMA engine.
//!
//! Copies happen when a transfer is started; `wait` only checks the handle
//! and records the call. Every start and wait goes to the device event log,
//! so tests can assert on the exact order the scheduler issued them.
//!
//! A [`DmaFault`] makes the n-th transfer of one direction fail at start,
//! for exercising error propagation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::addressing::bulk_runs;
use crate::device::trace::Event;
use crate::device::SimDevice;
use crate::schedule::transfer::{Direction, TransferDescriptor, TransferEngine, TransferError, TransferHandle};

/// Injected failure: the `nth` (0-based) transfer in `direction` is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaFault {
    pub direction: Direction,
    pub nth: u64,
}

/// DMA engine backed by a [`SimDevice`].
pub struct SimDma<'d> {
    device: &'d SimDevice,
    next_handle: AtomicU64,
    loads: AtomicU64,
    stores: AtomicU64,
    issued: Mutex<HashSet<TransferHandle>>,
    fault: Option<DmaFault>,
}

impl<'d> SimDma<'d> {
    pub fn new(device: &'d SimDevice) -> Self {
        Self {
            device,
            next_handle: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            issued: Mutex::new(HashSet::new()),
            fault: None,
        }
    }

    pub fn with_fault(mut self, fault: DmaFault) -> Self {
        self.fault = Some(fault);
        self
    }

    fn reject(desc: &TransferDescriptor, reason: impl Into<String>) -> TransferError {
        TransferError::Rejected {
            role: desc.role,
            direction: desc.direction,
            reason: reason.into(),
        }
    }

    fn copy(&self, desc: &TransferDescriptor) -> Result<(), TransferError> {
        let runs = bulk_runs(desc);
        let mut bulk = self.device.lock_bulk();
        let mut scratch = self.device.lock_scratch();
        let mut local = desc.scratch;

        for (addr, len) in runs {
            let mut buf = vec![0u8; len as usize];
            match desc.direction {
                Direction::Load => {
                    bulk.read_bytes(addr, &mut buf);
                    scratch
                        .write(local, &buf)
                        .map_err(|e| Self::reject(desc, e.to_string()))?;
                }
                Direction::Store => {
                    scratch
                        .read(local, &mut buf)
                        .map_err(|e| Self::reject(desc, e.to_string()))?;
                    bulk.write_bytes(addr, &buf);
                }
            }
            local += len;
        }

        match desc.direction {
            Direction::Load => bulk.record_dma_read(desc.bulk, desc.bytes() as usize),
            Direction::Store => bulk.record_dma_write(desc.bulk, desc.bytes() as usize),
        }
        Ok(())
    }
}

impl TransferEngine for SimDma<'_> {
    fn start(&self, desc: &TransferDescriptor) -> Result<TransferHandle, TransferError> {
        let counter = match desc.direction {
            Direction::Load => &self.loads,
            Direction::Store => &self.stores,
        };
        let nth = counter.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = self.fault {
            if fault.direction == desc.direction && fault.nth == nth {
                log::warn!("Injected DMA fault on {} {} #{}", desc.role, desc.direction, nth);
                return Err(Self::reject(desc, "injected fault"));
            }
        }

        self.copy(desc)?;

        let handle = TransferHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.issued
            .lock()
            .map_err(|_| TransferError::LockPoisoned)?
            .insert(handle);
        self.device.events().push(Event::TransferStart { handle, desc: *desc });
        Ok(handle)
    }

    fn wait(&self, handle: TransferHandle) -> Result<(), TransferError> {
        let known = self
            .issued
            .lock()
            .map_err(|_| TransferError::LockPoisoned)?
            .contains(&handle);
        if !known {
            return Err(TransferError::UnknownHandle(handle));
        }
        self.device.events().push(Event::TransferWait { handle });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::geometry::Dims;
    use crate::schedule::role::Role;

    #[test]
    fn test_load_packs_tile_into_scratchpad() {
        let device = SimDevice::new(0x100, 256);
        device.lock_bulk().fill_pattern(0x1000, 8 * 8 * 2, 0);
        let dma = SimDma::new(&device);

        // 2x2 pixels x 2 channels starting at pixel (1, 1) of an 8x8x2 tensor
        let bulk = 0x1000 + (8 + 1) * 2;
        let desc = TransferDescriptor::tile(Role::Input, Direction::Load, bulk, 0x100, Dims::new(2, 2, 2), Dims::new(8, 8, 2), 1);
        let handle = dma.start(&desc).unwrap();
        dma.wait(handle).unwrap();

        let mut expected = Vec::new();
        for (addr, len) in bulk_runs(&desc) {
            let mut buf = vec![0u8; len as usize];
            device.lock_bulk().peek_bytes(addr, &mut buf);
            expected.extend(buf);
        }
        let mut packed = vec![0u8; 8];
        device.lock_scratch().read(0x100, &mut packed).unwrap();
        assert_eq!(packed, expected);
    }

    #[test]
    fn test_store_writes_back() {
        let device = SimDevice::new(0, 64);
        device.lock_scratch().fill(0, 4, 0x5a).unwrap();
        let dma = SimDma::new(&device);

        let desc = TransferDescriptor::linear(Role::Output, Direction::Store, 0x2000, 0, 4);
        dma.start(&desc).unwrap();

        let mut buf = [0u8; 4];
        device.lock_bulk().peek_bytes(0x2000, &mut buf);
        assert_eq!(buf, [0x5a; 4]);
    }

    #[test]
    fn test_out_of_range_scratch_rejected() {
        let device = SimDevice::new(0, 16);
        let dma = SimDma::new(&device);
        let desc = TransferDescriptor::linear(Role::Weights, Direction::Load, 0, 8, 16);
        assert!(matches!(dma.start(&desc), Err(TransferError::Rejected { .. })));
    }

    #[test]
    fn test_unknown_handle() {
        let device = SimDevice::new(0, 16);
        let dma = SimDma::new(&device);
        assert_eq!(
            dma.wait(TransferHandle(3)),
            Err(TransferError::UnknownHandle(TransferHandle(3)))
        );
    }

    #[test]
    fn test_injected_fault_hits_nth_transfer() {
        let device = SimDevice::new(0, 64);
        let dma = SimDma::new(&device).with_fault(DmaFault {
            direction: Direction::Store,
            nth: 1,
        });
        let store = TransferDescriptor::linear(Role::Output, Direction::Store, 0x100, 0, 4);
        let load = TransferDescriptor::linear(Role::Input, Direction::Load, 0x100, 0, 4);

        dma.start(&store).unwrap();
        dma.start(&load).unwrap();
        assert!(dma.start(&store).is_err());
        assert!(dma.start(&store).is_ok());
        assert_eq!(device.events().len(), 3);
    }
}
