//! Compute-engine collaborator.
//!
//! The accelerator kernels themselves are out of scope; the scheduler only
//! prepares a [`ComputeJob`] per tile, issues it and waits for it.
//!
//! Jobs issued by one context execute in issue order. A context may issue a
//! job and keep preparing the next tile's transfers before waiting on it.

use thiserror::Error;

use super::geometry::{Dims, Kernel};
use super::index::TileIndex;
use super::role::{Role, RoleTable, Stage};
use super::status::Tile;

/// Everything a kernel needs to run on one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeJob {
    pub stage: Stage,
    pub index: TileIndex,
    pub kernel: Kernel,
    pub input: Dims,
    pub output: Dims,
    /// Scratchpad address per role, `None` where the stage has no buffer
    pub addr: RoleTable<Option<u64>>,
    /// Channel pitch of the output buffer, in elements. Equals
    /// `output.channel` unless the output is a channel slice of a wider buffer.
    pub output_pitch: u32,
}

impl ComputeJob {
    pub fn from_tile(tile: &Tile, stage: Stage, kernel: &Kernel) -> Self {
        Self {
            stage,
            index: tile.index,
            kernel: *kernel,
            input: tile.shape.input,
            output: tile.shape.output,
            addr: tile.addr,
            output_pitch: tile.shape.output.channel,
        }
    }

    /// Place the output as a channel slice of a buffer `pitch` channels wide.
    pub fn with_output_pitch(mut self, pitch: u32) -> Self {
        self.output_pitch = pitch;
        self
    }

    #[inline]
    pub fn output_addr(&self) -> Option<u64> {
        self.addr[Role::Output]
    }
}

/// Handle of an issued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle(pub u64);

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// Compute failures. All are fatal for the layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError {
    #[error("{stage} job at {index} rejected: {reason}")]
    Rejected {
        stage: Stage,
        index: TileIndex,
        reason: String,
    },

    #[error("{handle} failed: {reason}")]
    Failed { handle: JobHandle, reason: String },

    #[error("wait on unknown {0}")]
    UnknownHandle(JobHandle),
}

/// Compute-engine collaborator.
pub trait ComputeEngine: Sync {
    /// Build the job for `tile`. The default just captures the tile.
    fn prepare(&self, tile: &Tile, stage: Stage, kernel: &Kernel) -> Result<ComputeJob, ComputeError> {
        Ok(ComputeJob::from_tile(tile, stage, kernel))
    }

    /// Issue `job` and return without waiting.
    fn run_async(&self, job: &ComputeJob) -> Result<JobHandle, ComputeError>;

    /// Block until the job behind `handle` is complete.
    fn wait(&self, handle: JobHandle) -> Result<(), ComputeError>;

    /// Issue and wait.
    fn run_blocking(&self, job: &ComputeJob) -> Result<(), ComputeError> {
        let handle = self.run_async(job)?;
        self.wait(handle)
    }
}
