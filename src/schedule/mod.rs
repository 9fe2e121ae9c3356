//! Tile scheduling core.
//!
//! - [`index`], [`geometry`]: the tile grid, tile shapes and addresses
//! - [`role`], [`status`]: per-role transfer bookkeeping, tile to tile
//! - [`buffer`]: fixed scratchpad layout of every (stage, role) region
//! - [`transfer`], [`compute`]: the two collaborator seams
//! - [`handoff`]: bounded producer/consumer slots between contexts
//! - [`pipeline`]: the single-stage and fused tile loops
//!
//! # Example
//!
//! ```
//! use tile_sched::schedule::index::{LoopOrder, TileCounts, TileIndex, TileIndexSequencer};
//!
//! let seq = TileIndexSequencer::new(TileCounts::new(2, 2, 1), LoopOrder::Forward);
//! let order: Vec<TileIndex> = seq.iter().collect();
//! assert_eq!(order[1], TileIndex::new(0, 1, 0));
//! assert_eq!(order.len(), 4);
//! ```

pub mod buffer;
pub mod compute;
pub mod geometry;
pub mod handoff;
pub mod index;
pub mod pipeline;
pub mod role;
pub mod status;
pub mod transfer;

pub use buffer::{AllocError, BufferAllocator, BufferKey, RegionRequest};
pub use compute::{ComputeEngine, ComputeError, ComputeJob, JobHandle};
pub use geometry::{Dims, Kernel, LayerShape, Padding, PaddingMask, TileGeometry, TileShape};
pub use handoff::{HandoffConsumer, HandoffError, HandoffProducer, StageHandoff};
pub use index::{LoopOrder, TileCounts, TileIndex, TileIndexSequencer};
pub use pipeline::{FusedPipeline, LayerArgs, PipelineOptions, RunSummary, SingleStagePipeline};
pub use role::{Role, RoleTable, Stage};
pub use status::{StatusRules, Tile, TileStatus};
pub use transfer::{TransferDescriptor, TransferEngine, TransferError, TransferHandle, TransferScheduler};
