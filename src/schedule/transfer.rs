//! Transfer descriptors and the issue-serialized transfer scheduler.
//!
//! The transfer engine (a DMA controller) is an external collaborator behind
//! the [`TransferEngine`] trait. [`TransferScheduler`] wraps it so that
//! several execution contexts can issue transfers: acquiring the engine's
//! command slot, enqueueing and releasing happen under one lock, while
//! waiting on an outstanding transfer never takes that lock.
//!
//! # Copy Shapes
//!
//! ```text
//! Linear   : one contiguous run of `len` bytes (weights, scale, bias)
//! Strided  : copies_2d rows x copies_1d pixels x length_1d bytes
//!            bulk side strides by stride_2d / stride_1d,
//!            scratchpad side is densely packed
//! ```

use std::sync::Mutex;

use smallvec::SmallVec;
use thiserror::Error;

use super::geometry::Dims;
use super::role::Role;

/// Direction of a transfer relative to the scratchpad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Bulk memory -> scratchpad
    Load,
    /// Scratchpad -> bulk memory
    Store,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Load => f.write_str("load"),
            Direction::Store => f.write_str("store"),
        }
    }
}

/// Shape of the copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyShape {
    /// Flat byte range
    Linear { len: u64 },
    /// 3-D tile copy
    Strided {
        copies_2d: u32,
        copies_1d: u32,
        length_1d: u32,
        stride_2d: u32,
        stride_1d: u32,
    },
}

impl CopyShape {
    /// Total bytes moved.
    pub fn bytes(&self) -> u64 {
        match *self {
            CopyShape::Linear { len } => len,
            CopyShape::Strided {
                copies_2d,
                copies_1d,
                length_1d,
                ..
            } => copies_2d as u64 * copies_1d as u64 * length_1d as u64,
        }
    }
}

/// One transfer between bulk memory and scratchpad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub role: Role,
    pub direction: Direction,
    /// Bulk-memory address of the first byte
    pub bulk: u64,
    /// Scratchpad address of the first byte
    pub scratch: u64,
    pub shape: CopyShape,
}

impl TransferDescriptor {
    /// Flat byte-range transfer.
    pub fn linear(role: Role, direction: Direction, bulk: u64, scratch: u64, len: u64) -> Self {
        Self {
            role,
            direction,
            bulk,
            scratch,
            shape: CopyShape::Linear { len },
        }
    }

    /// Tile transfer of `tile` out of (or into) an HWC `tensor`.
    pub fn tile(
        role: Role,
        direction: Direction,
        bulk: u64,
        scratch: u64,
        tile: Dims,
        tensor: Dims,
        element_bytes: u32,
    ) -> Self {
        Self {
            role,
            direction,
            bulk,
            scratch,
            shape: CopyShape::Strided {
                copies_2d: tile.height,
                copies_1d: tile.width,
                length_1d: tile.channel * element_bytes,
                stride_2d: tensor.width * tensor.channel * element_bytes,
                stride_1d: tensor.channel * element_bytes,
            },
        }
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        self.shape.bytes()
    }

    #[inline]
    pub fn is_linear(&self) -> bool {
        matches!(self.shape, CopyShape::Linear { .. })
    }
}

/// Handle of an issued transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferHandle(pub u64);

impl std::fmt::Display for TransferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dma#{}", self.0)
    }
}

/// Transfer failures. All are fatal for the layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("transfer engine rejected {role} {direction}: {reason}")]
    Rejected {
        role: Role,
        direction: Direction,
        reason: String,
    },

    #[error("transfer {handle} failed: {reason}")]
    Failed { handle: TransferHandle, reason: String },

    #[error("wait on unknown transfer {0}")]
    UnknownHandle(TransferHandle),

    #[error("{role} descriptor has direction {actual}, expected {expected}")]
    WrongDirection {
        role: Role,
        expected: Direction,
        actual: Direction,
    },

    #[error("transfer issue lock poisoned")]
    LockPoisoned,
}

/// Transfer-engine collaborator.
///
/// Methods take `&self`: an engine shared between execution contexts keeps
/// its own interior state.
pub trait TransferEngine: Sync {
    /// Start a transfer. Returns once it is enqueued.
    fn start(&self, desc: &TransferDescriptor) -> Result<TransferHandle, TransferError>;

    /// Start a flat byte-range transfer.
    fn start_1d(&self, desc: &TransferDescriptor) -> Result<TransferHandle, TransferError> {
        self.start(desc)
    }

    /// Block until the transfer completes.
    fn wait(&self, handle: TransferHandle) -> Result<(), TransferError>;
}

/// Running transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub loads: u64,
    pub stores: u64,
    pub bytes_loaded: u64,
    pub bytes_stored: u64,
}

impl TransferStats {
    /// Counters accumulated since `earlier`.
    pub fn since(&self, earlier: &TransferStats) -> TransferStats {
        TransferStats {
            loads: self.loads - earlier.loads,
            stores: self.stores - earlier.stores,
            bytes_loaded: self.bytes_loaded - earlier.bytes_loaded,
            bytes_stored: self.bytes_stored - earlier.bytes_stored,
        }
    }

    fn record(&mut self, desc: &TransferDescriptor) {
        match desc.direction {
            Direction::Load => {
                self.loads += 1;
                self.bytes_loaded += desc.bytes();
            }
            Direction::Store => {
                self.stores += 1;
                self.bytes_stored += desc.bytes();
            }
        }
    }
}

/// Handles of one batch of parameter loads.
pub type ParamHandles = SmallVec<[TransferHandle; 3]>;

/// Serializes transfer issue across execution contexts.
pub struct TransferScheduler<E> {
    engine: E,
    /// Guards the engine's command slot; holds the counters updated at issue.
    issue: Mutex<TransferStats>,
}

impl<E: TransferEngine> TransferScheduler<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            issue: Mutex::new(TransferStats::default()),
        }
    }

    #[inline]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn into_inner(self) -> E {
        self.engine
    }

    /// Snapshot of the issue counters.
    pub fn stats(&self) -> TransferStats {
        match self.issue.lock() {
            Ok(stats) => *stats,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn issue<'a>(
        &self,
        descs: impl IntoIterator<Item = &'a TransferDescriptor>,
    ) -> Result<SmallVec<[TransferHandle; 3]>, TransferError> {
        let mut stats = self.issue.lock().map_err(|_| TransferError::LockPoisoned)?;
        let mut handles = SmallVec::new();
        for desc in descs {
            let handle = if desc.is_linear() {
                self.engine.start_1d(desc)?
            } else {
                self.engine.start(desc)?
            };
            stats.record(desc);
            log::debug!(
                "{} {} {}: bulk=0x{:08X} scratch=0x{:08X} bytes={}",
                handle,
                desc.role,
                desc.direction,
                desc.bulk,
                desc.scratch,
                desc.bytes()
            );
            handles.push(handle);
        }
        Ok(handles)
    }

    fn check_direction(desc: &TransferDescriptor, expected: Direction) -> Result<(), TransferError> {
        if desc.direction != expected {
            return Err(TransferError::WrongDirection {
                role: desc.role,
                expected,
                actual: desc.direction,
            });
        }
        Ok(())
    }

    /// Start a bulk -> scratchpad transfer.
    pub fn start_load(&self, desc: &TransferDescriptor) -> Result<TransferHandle, TransferError> {
        Self::check_direction(desc, Direction::Load)?;
        let handles = self.issue([desc])?;
        Ok(handles[0])
    }

    /// Start a scratchpad -> bulk transfer.
    pub fn start_store(&self, desc: &TransferDescriptor) -> Result<TransferHandle, TransferError> {
        Self::check_direction(desc, Direction::Store)?;
        let handles = self.issue([desc])?;
        Ok(handles[0])
    }

    /// Start a batch of flat loads (weights, scale, bias of one tile) as one
    /// atomic issue sequence.
    pub fn start_params(&self, descs: &[TransferDescriptor]) -> Result<ParamHandles, TransferError> {
        for desc in descs {
            Self::check_direction(desc, Direction::Load)?;
        }
        self.issue(descs)
    }

    /// Block until `handle` completes. Never holds the issue lock.
    pub fn wait(&self, handle: TransferHandle) -> Result<(), TransferError> {
        self.engine.wait(handle)
    }

    /// Wait for every handle, in order.
    pub fn wait_all(&self, handles: impl IntoIterator<Item = TransferHandle>) -> Result<(), TransferError> {
        for handle in handles {
            self.wait(handle)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Engine that completes everything instantly and counts calls.
    #[derive(Default)]
    struct CountingEngine {
        next: AtomicU64,
        linear: AtomicU64,
        waits: AtomicU64,
    }

    impl TransferEngine for CountingEngine {
        fn start(&self, _desc: &TransferDescriptor) -> Result<TransferHandle, TransferError> {
            Ok(TransferHandle(self.next.fetch_add(1, Ordering::SeqCst)))
        }

        fn start_1d(&self, desc: &TransferDescriptor) -> Result<TransferHandle, TransferError> {
            self.linear.fetch_add(1, Ordering::SeqCst);
            self.start(desc)
        }

        fn wait(&self, _handle: TransferHandle) -> Result<(), TransferError> {
            self.waits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_tile_descriptor_strides() {
        let desc = TransferDescriptor::tile(
            Role::Input,
            Direction::Load,
            0x1000,
            0x10,
            Dims::new(3, 4, 8),
            Dims::new(16, 16, 32),
            2,
        );
        match desc.shape {
            CopyShape::Strided {
                copies_2d,
                copies_1d,
                length_1d,
                stride_2d,
                stride_1d,
            } => {
                assert_eq!(copies_2d, 3);
                assert_eq!(copies_1d, 4);
                assert_eq!(length_1d, 16);
                assert_eq!(stride_2d, 16 * 32 * 2);
                assert_eq!(stride_1d, 64);
            }
            CopyShape::Linear { .. } => panic!("expected strided copy"),
        }
        assert_eq!(desc.bytes(), 3 * 4 * 16);
    }

    #[test]
    fn test_params_use_1d_path() {
        let sched = TransferScheduler::new(CountingEngine::default());
        let descs = [
            TransferDescriptor::linear(Role::Weights, Direction::Load, 0, 0, 64),
            TransferDescriptor::linear(Role::Scale, Direction::Load, 64, 64, 8),
            TransferDescriptor::linear(Role::Bias, Direction::Load, 72, 72, 8),
        ];
        let handles = sched.start_params(&descs).unwrap();

        assert_eq!(handles.len(), 3);
        assert_eq!(sched.engine().linear.load(Ordering::SeqCst), 3);
        assert_eq!(sched.stats().bytes_loaded, 80);

        sched.wait_all(handles).unwrap();
        assert_eq!(sched.engine().waits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_direction_checked() {
        let sched = TransferScheduler::new(CountingEngine::default());
        let store = TransferDescriptor::linear(Role::Output, Direction::Store, 0, 0, 4);

        let err = sched.start_load(&store).unwrap_err();
        assert!(matches!(err, TransferError::WrongDirection { .. }));
        assert_eq!(sched.stats(), TransferStats::default());

        sched.start_store(&store).unwrap();
        assert_eq!(sched.stats().stores, 1);
    }

    #[test]
    fn test_concurrent_issue_gets_unique_handles() {
        let sched = TransferScheduler::new(CountingEngine::default());
        let desc = TransferDescriptor::linear(Role::Input, Direction::Load, 0, 0, 1);

        let mut all: Vec<TransferHandle> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|_| s.spawn(|| (0..50).map(|_| sched.start_load(&desc).unwrap()).collect::<Vec<_>>()))
                .collect();
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });

        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200);
        assert_eq!(sched.stats().loads, 200);
    }
}
