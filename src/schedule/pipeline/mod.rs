//! Tile-loop drivers.
//!
//! - [`single`]: one compute stage per tile, loads of tile `i+1` overlapped
//!   with compute of tile `i`
//! - [`fused`]: expand -> spatial -> project on a producer context, stores
//!   on a consumer context, joined by a bounded handoff
//!
//! Both drivers share [`StageSchedule`], which turns a tile and its status
//! into transfer descriptors by iterating roles uniformly.

pub mod fused;
pub mod single;

use smallvec::SmallVec;

use crate::config::Config;
use crate::error::ScheduleError;
use crate::plan::{param_offset, ParamOffsets, TileBytes};

use super::buffer::{AllocError, BufferAllocator, BufferKey};
use super::geometry::{tile_address, Dims, Extent, Kernel, Padding, PaddingMask, TileGeometry, TileWindow};
use super::index::TileIndex;
use super::role::{Role, RoleTable, Stage};
use super::status::{StatusRules, Tile, TileStatus};
use super::transfer::{Direction, TransferDescriptor, TransferEngine, TransferHandle, TransferScheduler, TransferStats};

pub use fused::FusedPipeline;
pub use single::SingleStagePipeline;

/// Run-time arguments of one layer invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerArgs {
    /// Bulk address of the input tensor
    pub input: u64,
    /// Bulk address of the second addend (add layers only)
    pub input2: u64,
    /// Bulk address of the parameter block (weights, scale, bias)
    pub weights: u64,
    /// Bulk address of the output tensor
    pub output: u64,
    /// Scratchpad base address
    pub scratchpad: u64,
    /// Scratchpad bytes available to this layer
    pub capacity: u64,
    /// Which conditionally padded edges are real image borders
    pub padding: PaddingMask,
}

/// Scheduler tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub buffer_slots: u8,
    pub handoff_capacity: usize,
    pub dma_alignment: u64,
    pub group_width: u32,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            buffer_slots: config.buffer_slots(),
            handoff_capacity: config.handoff_capacity(),
            dma_alignment: config.dma_alignment(),
            group_width: config.group_width(),
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Output tiles stored
    pub tiles: u64,
    pub loads: u64,
    pub stores: u64,
    pub bytes_loaded: u64,
    pub bytes_stored: u64,
    /// Scratchpad bytes used by the buffer layout
    pub scratchpad_used: u64,
}

impl RunSummary {
    fn new(tiles: u64, stats: TransferStats, scratchpad_used: u64) -> Self {
        Self {
            tiles,
            loads: stats.loads,
            stores: stats.stores,
            bytes_loaded: stats.bytes_loaded,
            bytes_stored: stats.bytes_stored,
            scratchpad_used,
        }
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} tiles, {} loads ({} bytes), {} stores ({} bytes), {} scratchpad bytes",
            self.tiles, self.loads, self.bytes_loaded, self.stores, self.bytes_stored, self.scratchpad_used
        )
    }
}

/// Handles of the loads issued for one tile.
pub type LoadHandles = SmallVec<[TransferHandle; 5]>;

/// Everything needed to move one stage's tiles between bulk memory and
/// scratchpad.
#[derive(Debug, Clone)]
pub struct StageSchedule {
    pub stage: Stage,
    pub kernel: Kernel,
    pub geometry: TileGeometry,
    pub rules: StatusRules,
    pub sizes: TileBytes,
    pub input_tensor: Dims,
    pub output_tensor: Dims,
    /// Bulk base per role; parameter entries are the cursor start
    pub bulk: RoleTable<u64>,
    /// Overlap between neighbouring input tiles
    pub overlap: Extent,
    /// Padding after masking
    pub padding: Padding,
}

impl StageSchedule {
    /// Bulk bases for the roles of a stage whose parameters start at
    /// `weights + offsets`.
    pub fn bulk_bases(args: &LayerArgs, offsets: &ParamOffsets) -> RoleTable<u64> {
        RoleTable::from_fn(|role| match role {
            Role::Input => args.input,
            Role::Input2 => args.input2,
            Role::Weights | Role::Scale | Role::Bias => args.weights + param_offset(offsets, role),
            Role::Output => args.output,
        })
    }

    /// Tile for `status`, addressed in this stage's scratchpad regions.
    pub fn tile(&self, status: &TileStatus, allocator: &BufferAllocator) -> Tile {
        Tile::create(status, &self.geometry, allocator.addresses(self.stage, status))
    }

    /// Scratchpad address of `role` in `tile`; a transfer for a role without
    /// a region is a layout error.
    fn scratch(&self, tile: &Tile, role: Role) -> Result<u64, AllocError> {
        tile.addr[role].ok_or(AllocError::UnknownRegion(BufferKey::new(self.stage, role)))
    }

    fn input_address(&self, role: Role, index: TileIndex) -> u64 {
        let halo = self.geometry.halo(index, &self.padding);
        let window = TileWindow {
            index: Dims::new(index.height, index.width, self.geometry.input_channel_index(index)),
            body: self.geometry.body.input,
            overlap: Dims::new(self.overlap.height, self.overlap.width, 0),
            offset: Dims::new(halo.height, halo.width, 0),
        };
        tile_address(self.bulk[role], &window, self.input_tensor, self.sizes.elements.input)
    }

    fn output_address(&self, index: TileIndex) -> u64 {
        let window = TileWindow {
            index: Dims::new(index.height, index.width, index.output_channel),
            body: self.geometry.body.output,
            ..Default::default()
        };
        tile_address(self.bulk[Role::Output], &window, self.output_tensor, self.sizes.elements.output)
    }

    /// Tiled input loads `tile` needs.
    pub fn activation_loads(
        &self,
        tile: &Tile,
        status: &TileStatus,
    ) -> Result<SmallVec<[TransferDescriptor; 2]>, AllocError> {
        Role::ACTIVATIONS
            .iter()
            .filter(|&&role| status.needs(role))
            .map(|&role| {
                Ok(TransferDescriptor::tile(
                    role,
                    Direction::Load,
                    self.input_address(role, tile.index),
                    self.scratch(tile, role)?,
                    tile.shape.input,
                    self.input_tensor,
                    self.sizes.elements.input,
                ))
            })
            .collect()
    }

    /// Flat parameter loads `tile` needs; advances the bulk cursors.
    pub fn param_loads(
        &self,
        tile: &Tile,
        status: &mut TileStatus,
    ) -> Result<SmallVec<[TransferDescriptor; 3]>, AllocError> {
        let mut descs = SmallVec::new();
        for role in Role::PARAMS {
            let bytes = self.sizes.bytes(role, &tile.shape);
            if !status.needs(role) || bytes == 0 {
                continue;
            }
            descs.push(TransferDescriptor::linear(
                role,
                Direction::Load,
                status.cursor(role),
                self.scratch(tile, role)?,
                bytes,
            ));
            status.consume(role, bytes);
        }
        Ok(descs)
    }

    /// Store of `tile`'s output to its place in the output tensor.
    pub fn store(&self, tile: &Tile) -> Result<TransferDescriptor, AllocError> {
        Ok(TransferDescriptor::tile(
            Role::Output,
            Direction::Store,
            self.output_address(tile.index),
            self.scratch(tile, Role::Output)?,
            tile.shape.output,
            self.output_tensor,
            self.sizes.elements.output,
        ))
    }

    /// Issue every load `tile` needs: tiled activations one by one, then the
    /// parameters as one batch.
    pub fn issue_loads<E: TransferEngine>(
        &self,
        transfers: &TransferScheduler<E>,
        tile: &Tile,
        status: &mut TileStatus,
    ) -> Result<LoadHandles, ScheduleError> {
        let mut handles = self.issue_activations(transfers, tile, status)?;
        handles.extend(self.issue_params(transfers, tile, status)?);
        Ok(handles)
    }

    /// Issue only the tiled input loads of `tile`.
    pub fn issue_activations<E: TransferEngine>(
        &self,
        transfers: &TransferScheduler<E>,
        tile: &Tile,
        status: &TileStatus,
    ) -> Result<LoadHandles, ScheduleError> {
        let mut handles = LoadHandles::new();
        for desc in self.activation_loads(tile, status)? {
            handles.push(transfers.start_load(&desc)?);
        }
        Ok(handles)
    }

    /// Issue only the parameter loads of `tile`.
    pub fn issue_params<E: TransferEngine>(
        &self,
        transfers: &TransferScheduler<E>,
        tile: &Tile,
        status: &mut TileStatus,
    ) -> Result<LoadHandles, ScheduleError> {
        let params = self.param_loads(tile, status)?;
        if params.is_empty() {
            return Ok(LoadHandles::new());
        }
        Ok(transfers.start_params(&params)?.into_iter().collect())
    }
}
