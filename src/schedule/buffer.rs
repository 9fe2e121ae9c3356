//! Scratchpad buffer allocation.
//!
//! Every (stage, role) pair that keeps data in the scratchpad gets one region
//! made of `slots` equally sized slots. Each slot is as large as the largest
//! tile the role will ever hold (max over body and border tiles), so slot
//! offsets are fixed for the whole run.
//!
//! ```text
//! base
//!  │
//!  ▼
//!  ┌─────────┬─────────┬─────────┬─────────┬───┬─────────┬─────────┐
//!  │ input 0 │ input 1 │ weights0│ weights1│...│ output 0│ output 1│
//!  └─────────┴─────────┴─────────┴─────────┴───┴─────────┴─────────┘
//!  ◄──────────────────────── capacity ─────────────────────────────►
//! ```

use thiserror::Error;

use super::role::{Role, RoleTable, Stage};
use super::status::TileStatus;

/// Key of a scratchpad region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub stage: Stage,
    pub role: Role,
}

impl BufferKey {
    pub const fn new(stage: Stage, role: Role) -> Self {
        Self { stage, role }
    }
}

impl From<Role> for BufferKey {
    fn from(role: Role) -> Self {
        Self::new(Stage::Single, role)
    }
}

impl From<(Stage, Role)> for BufferKey {
    fn from((stage, role): (Stage, Role)) -> Self {
        Self::new(stage, role)
    }
}

impl std::fmt::Display for BufferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.stage, self.role)
    }
}

/// Request for a region: `bytes` per slot, `slots` slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionRequest {
    pub key: BufferKey,
    pub bytes: u64,
    pub slots: u8,
}

impl RegionRequest {
    pub fn new(key: impl Into<BufferKey>, bytes: u64, slots: u8) -> Self {
        Self {
            key: key.into(),
            bytes,
            slots,
        }
    }
}

/// A placed region, relative to the scratchpad base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub key: BufferKey,
    pub start: u64,
    pub slot_bytes: u64,
    pub slots: u8,
}

impl Region {
    /// End offset (exclusive).
    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.slot_bytes * self.slots as u64
    }

    #[inline]
    fn overlaps(&self, other: &Region) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// Allocation errors. All of them are reported before any tile executes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("scratchpad layout needs {required} bytes but capacity is {capacity}")]
    CapacityExceeded { required: u64, capacity: u64 },

    #[error("regions {first} and {second} overlap")]
    Overlap { first: BufferKey, second: BufferKey },

    #[error("region {0} requested twice")]
    Duplicate(BufferKey),

    #[error("region {0} has zero slots")]
    ZeroSlots(BufferKey),

    #[error("no scratchpad region for {0}")]
    UnknownRegion(BufferKey),
}

#[inline]
fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Fixed map from `(key, slot)` to scratchpad address.
#[derive(Debug, Clone)]
pub struct BufferAllocator {
    base: u64,
    capacity: u64,
    regions: Vec<Region>,
}

impl BufferAllocator {
    /// Lay the requested regions out back to back from `base`.
    ///
    /// Slot sizes are rounded up to `alignment`. Zero-byte requests are
    /// skipped and get no region.
    pub fn new(
        base: u64,
        capacity: u64,
        alignment: u64,
        requests: &[RegionRequest],
    ) -> Result<Self, AllocError> {
        let mut regions: Vec<Region> = Vec::with_capacity(requests.len());
        let mut next = 0u64;

        for req in requests {
            if req.bytes == 0 {
                continue;
            }
            if req.slots == 0 {
                return Err(AllocError::ZeroSlots(req.key));
            }
            if regions.iter().any(|r| r.key == req.key) {
                return Err(AllocError::Duplicate(req.key));
            }
            let region = Region {
                key: req.key,
                start: next,
                slot_bytes: align_up(req.bytes, alignment),
                slots: req.slots,
            };
            next = region.end();
            regions.push(region);
        }

        if next > capacity {
            return Err(AllocError::CapacityExceeded {
                required: next,
                capacity,
            });
        }

        log::debug!(
            "Scratchpad layout: {} regions, {} of {} bytes used",
            regions.len(),
            next,
            capacity
        );

        Ok(Self {
            base,
            capacity,
            regions,
        })
    }

    /// Use planner-provided region placement, checking it for overlap and
    /// capacity.
    pub fn with_offsets(base: u64, capacity: u64, regions: Vec<Region>) -> Result<Self, AllocError> {
        for (i, a) in regions.iter().enumerate() {
            if a.slots == 0 {
                return Err(AllocError::ZeroSlots(a.key));
            }
            if a.end() > capacity {
                return Err(AllocError::CapacityExceeded {
                    required: a.end(),
                    capacity,
                });
            }
            for b in &regions[i + 1..] {
                if a.key == b.key {
                    return Err(AllocError::Duplicate(a.key));
                }
                if a.overlaps(b) {
                    return Err(AllocError::Overlap {
                        first: a.key,
                        second: b.key,
                    });
                }
            }
        }

        log::debug!("Scratchpad layout: {} placed regions, capacity {} bytes", regions.len(), capacity);

        Ok(Self {
            base,
            capacity,
            regions,
        })
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Bytes covered by all regions.
    pub fn used(&self) -> u64 {
        self.regions.iter().map(|r| r.end()).max().unwrap_or(0)
    }

    pub fn region(&self, key: impl Into<BufferKey>) -> Option<&Region> {
        let key = key.into();
        self.regions.iter().find(|r| r.key == key)
    }

    /// Scratchpad address of `slot` in the region for `key`.
    ///
    /// Slots wrap modulo the region's slot count, so a single-slot region
    /// answers every slot with the same address.
    pub fn offset(&self, key: impl Into<BufferKey>, slot: u8) -> Result<u64, AllocError> {
        let key = key.into();
        let region = self.region(key).ok_or(AllocError::UnknownRegion(key))?;
        let slot = (slot % region.slots) as u64;
        Ok(self.base + region.start + slot * region.slot_bytes)
    }

    /// Addresses of every role of `stage` for the slots in `status`.
    ///
    /// Roles without a region have no address.
    pub fn addresses(&self, stage: Stage, status: &TileStatus) -> RoleTable<Option<u64>> {
        RoleTable::from_fn(|role| self.offset((stage, role), status.slot(role)).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requests() -> Vec<RegionRequest> {
        vec![
            RegionRequest::new(Role::Input, 1000, 2),
            RegionRequest::new(Role::Weights, 301, 2),
            RegionRequest::new(Role::Scale, 64, 2),
            RegionRequest::new(Role::Bias, 64, 2),
            RegionRequest::new(Role::Output, 500, 2),
        ]
    }

    #[test]
    fn test_slots_never_overlap() {
        let alloc = BufferAllocator::new(0x1000, 8192, 4, &requests()).unwrap();

        let mut spans = Vec::new();
        for region in alloc.regions() {
            for slot in 0..region.slots {
                let start = alloc.offset(region.key, slot).unwrap();
                spans.push((start, start + region.slot_bytes));
            }
        }
        spans.sort();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
        assert!(spans.last().unwrap().1 <= 0x1000 + alloc.capacity());
    }

    #[test]
    fn test_alignment_rounds_slot_size() {
        let alloc = BufferAllocator::new(0, 8192, 4, &requests()).unwrap();
        let weights = alloc.region(Role::Weights).unwrap();
        assert_eq!(weights.slot_bytes, 304);
        assert_eq!(alloc.offset(Role::Weights, 1).unwrap(), 2000 + 304);
    }

    #[test]
    fn test_capacity_exceeded() {
        let err = BufferAllocator::new(0, 2048, 4, &requests()).unwrap_err();
        assert!(matches!(err, AllocError::CapacityExceeded { capacity: 2048, .. }));
    }

    #[test]
    fn test_used_never_exceeds_capacity() {
        let alloc = BufferAllocator::new(0, 4096, 4, &requests()).unwrap();
        assert!(alloc.used() <= alloc.capacity());
        assert_eq!(alloc.used(), 2000 + 608 + 128 + 128 + 1000);
    }

    #[test]
    fn test_zero_byte_request_skipped() {
        let reqs = [
            RegionRequest::new(Role::Input, 16, 2),
            RegionRequest::new(Role::Input2, 0, 2),
        ];
        let alloc = BufferAllocator::new(0, 64, 4, &reqs).unwrap();
        assert!(alloc.region(Role::Input2).is_none());
        assert_eq!(
            alloc.offset(Role::Input2, 0),
            Err(AllocError::UnknownRegion(Role::Input2.into()))
        );
    }

    #[test]
    fn test_single_slot_region_wraps() {
        let reqs = [RegionRequest::new((Stage::Expand, Role::Output), 128, 1)];
        let alloc = BufferAllocator::new(0x100, 256, 4, &reqs).unwrap();
        let key = BufferKey::new(Stage::Expand, Role::Output);
        assert_eq!(alloc.offset(key, 0).unwrap(), alloc.offset(key, 1).unwrap());
    }

    #[test]
    fn test_duplicate_request() {
        let reqs = [
            RegionRequest::new(Role::Input, 16, 2),
            RegionRequest::new(Role::Input, 16, 2),
        ];
        assert_eq!(
            BufferAllocator::new(0, 1024, 4, &reqs).unwrap_err(),
            AllocError::Duplicate(Role::Input.into())
        );
    }

    #[test]
    fn test_with_offsets_detects_overlap() {
        let regions = vec![
            Region {
                key: Role::Input.into(),
                start: 0,
                slot_bytes: 100,
                slots: 2,
            },
            Region {
                key: Role::Output.into(),
                start: 150,
                slot_bytes: 50,
                slots: 2,
            },
        ];
        let err = BufferAllocator::with_offsets(0, 1024, regions).unwrap_err();
        assert!(matches!(err, AllocError::Overlap { .. }));
    }

    #[test]
    fn test_addresses_leave_absent_roles_unset() {
        use crate::plan::tests::conv3x3;
        use crate::schedule::status::StatusRules;

        let plan = conv3x3();
        let sizes = plan.tile_bytes(16);
        let geometry = plan.geometry();
        let alloc = BufferAllocator::new(0x40, 4096, 4, &plan.region_requests(&sizes, 2)).unwrap();
        let rules = StatusRules::new(
            plan.sequencer(),
            RoleTable::splat(0),
            sizes.present(&geometry),
            geometry.channels_follow_output(),
            2,
        );

        let addr = alloc.addresses(Stage::Single, &rules.first());
        assert_eq!(addr[Role::Input2], None);
        assert_eq!(addr[Role::Input], Some(0x40));
        assert_eq!(addr[Role::Output], Some(alloc.offset(Role::Output, 0).unwrap()));
    }

    #[test]
    fn test_with_offsets_accepts_disjoint_layout() {
        let regions = vec![
            Region {
                key: Role::Output.into(),
                start: 0,
                slot_bytes: 64,
                slots: 2,
            },
            Region {
                key: Role::Input.into(),
                start: 128,
                slot_bytes: 100,
                slots: 2,
            },
        ];
        let alloc = BufferAllocator::with_offsets(0x2000, 512, regions).unwrap();
        assert_eq!(alloc.offset(Role::Input, 1).unwrap(), 0x2000 + 228);
    }
}
