//! Checks over a simulated device's event log.
//!
//! The schedulers are judged by the order in which they call their
//! collaborators. These helpers answer the usual questions about a recorded
//! run: did the stores cover the output exactly once, was every wait
//! preceded by its start, how many results were in flight at once.
//!
//! Used by the unit tests and by `tile-sched --verify`.

use std::collections::HashSet;

use thiserror::Error;

use crate::device::{bulk_runs, Event};
use crate::schedule::role::{Role, Stage};
use crate::schedule::transfer::{Direction, TransferHandle};

/// Store coverage problems, reported at the first offending byte.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoverageError {
    #[error("output byte 0x{address:08x} never stored")]
    Gap { address: u64 },

    #[error("output byte 0x{address:08x} stored {count} times")]
    Repeated { address: u64, count: u32 },

    #[error("store touches 0x{address:08x} outside the output tensor")]
    OutOfRange { address: u64 },
}

fn is_store(event: &Event) -> bool {
    matches!(event, Event::TransferStart { desc, .. } if desc.direction == Direction::Store)
}

/// Number of stores covering each byte of `[base, base + len)`.
pub fn store_coverage(events: &[Event], base: u64, len: u64) -> Result<Vec<u32>, CoverageError> {
    let mut counts = vec![0u32; len as usize];
    for event in events {
        let Event::TransferStart { desc, .. } = event else {
            continue;
        };
        if desc.direction != Direction::Store {
            continue;
        }
        for (addr, run) in bulk_runs(desc) {
            if addr < base || addr + run > base + len {
                return Err(CoverageError::OutOfRange { address: addr });
            }
            let start = (addr - base) as usize;
            for count in &mut counts[start..start + run as usize] {
                *count += 1;
            }
        }
    }
    Ok(counts)
}

/// Check that the stores write every output byte exactly once.
pub fn check_coverage(events: &[Event], base: u64, len: u64) -> Result<(), CoverageError> {
    let counts = store_coverage(events, base, len)?;
    for (offset, &count) in counts.iter().enumerate() {
        let address = base + offset as u64;
        match count {
            1 => {}
            0 => return Err(CoverageError::Gap { address }),
            count => return Err(CoverageError::Repeated { address, count }),
        }
    }
    Ok(())
}

/// For each compute start, how many loads of `role` had been issued before it.
pub fn loads_before_compute(events: &[Event], role: Role) -> Vec<usize> {
    let mut loads = 0;
    let mut result = Vec::new();
    for event in events {
        match event {
            Event::TransferStart { desc, .. } if desc.role == role && desc.direction == Direction::Load => loads += 1,
            Event::ComputeStart { .. } => result.push(loads),
            _ => {}
        }
    }
    result
}

/// Whether the last store issued was also waited on.
pub fn last_store_waited(events: &[Event]) -> bool {
    let last = events.iter().rposition(is_store);
    let Some(pos) = last else {
        return false;
    };
    let Event::TransferStart { handle, .. } = events[pos] else {
        return false;
    };
    events[pos + 1..]
        .iter()
        .any(|e| matches!(e, Event::TransferWait { handle: h } if *h == handle))
}

/// Waits whose handle had not been started when the wait was recorded.
pub fn unmatched_waits(events: &[Event]) -> Vec<Event> {
    let mut transfers = HashSet::new();
    let mut jobs = HashSet::new();
    let mut unmatched = Vec::new();
    for event in events {
        match *event {
            Event::TransferStart { handle, .. } => {
                transfers.insert(handle);
            }
            Event::ComputeStart { handle, .. } => {
                jobs.insert(handle);
            }
            Event::TransferWait { handle } if !transfers.contains(&handle) => unmatched.push(*event),
            Event::ComputeWait { handle } if !jobs.contains(&handle) => unmatched.push(*event),
            _ => {}
        }
    }
    unmatched
}

/// Largest number of `stage` results started but not yet stored.
///
/// A result is retired when the store that follows it is waited.
pub fn max_in_flight(events: &[Event], stage: Stage) -> usize {
    let mut stores = HashSet::new();
    let mut in_flight = 0usize;
    let mut max = 0;
    for event in events {
        match *event {
            Event::ComputeStart { stage: s, .. } if s == stage => {
                in_flight += 1;
                max = max.max(in_flight);
            }
            Event::TransferStart { handle, desc } if desc.direction == Direction::Store => {
                stores.insert(handle);
            }
            Event::TransferWait { handle } if stores.remove(&handle) => {
                in_flight = in_flight.saturating_sub(1);
            }
            _ => {}
        }
    }
    max
}

/// Compute starts of `stage` that write an output slot whose previous store
/// was not yet waited.
///
/// Result `k` lands in slot `k % slots` and stores are issued in result
/// order, so result `k` may only start after store `k - slots` is waited.
/// Returns the result numbers that started too early.
pub fn slot_reuse_violations(events: &[Event], stage: Stage, slots: usize) -> Vec<usize> {
    let mut stores: Vec<TransferHandle> = Vec::new();
    let mut waited = HashSet::new();
    let mut results = 0usize;
    let mut violations = Vec::new();
    for event in events {
        match *event {
            Event::TransferStart { handle, desc } if desc.direction == Direction::Store => stores.push(handle),
            Event::TransferWait { handle } => {
                waited.insert(handle);
            }
            Event::ComputeStart { stage: s, .. } if s == stage => {
                if results >= slots {
                    let previous = stores.get(results - slots);
                    if !previous.is_some_and(|handle| waited.contains(handle)) {
                        violations.push(results);
                    }
                }
                results += 1;
            }
            _ => {}
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::compute::JobHandle;
    use crate::schedule::index::TileIndex;
    use crate::schedule::transfer::TransferDescriptor;

    fn store(handle: u64, bulk: u64, len: u64) -> Event {
        Event::TransferStart {
            handle: TransferHandle(handle),
            desc: TransferDescriptor::linear(Role::Output, Direction::Store, bulk, 0, len),
        }
    }

    fn wait(handle: u64) -> Event {
        Event::TransferWait {
            handle: TransferHandle(handle),
        }
    }

    fn job(handle: u64) -> Event {
        Event::ComputeStart {
            handle: JobHandle(handle),
            stage: Stage::Project,
            index: TileIndex::ZERO,
        }
    }

    #[test]
    fn test_coverage_detects_gap_and_repeat() {
        let events = [store(0, 0x100, 4), store(1, 0x104, 4)];
        check_coverage(&events, 0x100, 8).unwrap();
        assert_eq!(
            check_coverage(&events, 0x100, 12),
            Err(CoverageError::Gap { address: 0x108 })
        );

        let repeated = [store(0, 0x100, 4), store(1, 0x102, 4)];
        assert_eq!(
            check_coverage(&repeated, 0x100, 6),
            Err(CoverageError::Repeated {
                address: 0x102,
                count: 2
            })
        );
        assert!(matches!(
            check_coverage(&repeated, 0x100, 4),
            Err(CoverageError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_last_store_waited() {
        assert!(!last_store_waited(&[store(0, 0, 1)]));
        assert!(last_store_waited(&[store(0, 0, 1), store(1, 1, 1), wait(1)]));
        assert!(!last_store_waited(&[store(0, 0, 1), store(1, 1, 1), wait(0)]));
    }

    #[test]
    fn test_unmatched_waits() {
        let events = [
            wait(3),
            job(0),
            Event::ComputeWait { handle: JobHandle(0) },
            Event::ComputeWait { handle: JobHandle(1) },
        ];
        assert_eq!(
            unmatched_waits(&events),
            vec![wait(3), Event::ComputeWait { handle: JobHandle(1) }]
        );
    }

    #[test]
    fn test_max_in_flight() {
        let events = [job(0), job(1), store(0, 0, 1), wait(0), job(2), store(1, 1, 1), wait(1)];
        assert_eq!(max_in_flight(&events, Stage::Project), 2);
        assert_eq!(max_in_flight(&events, Stage::Spatial), 0);
    }

    #[test]
    fn test_slot_reuse_needs_wait_on_previous_store() {
        let early = [job(0), store(0, 0, 1), job(1), store(1, 1, 1), job(2)];
        assert_eq!(slot_reuse_violations(&early, Stage::Project, 2), vec![2]);
        assert!(slot_reuse_violations(&early, Stage::Project, 3).is_empty());

        let waited = [job(0), store(0, 0, 1), job(1), store(1, 1, 1), wait(0), job(2)];
        assert!(slot_reuse_violations(&waited, Stage::Project, 2).is_empty());

        // A result whose predecessor in the slot was never stored
        assert_eq!(slot_reuse_violations(&[job(0), job(1)], Stage::Project, 1), vec![1]);
    }
}
