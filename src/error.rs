//! Top-level scheduler error.

use thiserror::Error;

use crate::plan::PlanError;
use crate::schedule::buffer::AllocError;
use crate::schedule::compute::ComputeError;
use crate::schedule::handoff::HandoffError;
use crate::schedule::transfer::TransferError;

/// Why a layer run failed.
///
/// `Plan`, `Alloc` and `Handoff` are resource-initialization failures and
/// are reported before anything is issued. `Transfer` and `Compute` abort a
/// run in progress.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid plan: {0}")]
    Plan(#[from] PlanError),

    #[error("scratchpad layout: {0}")]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error("stage handoff: {0}")]
    Handoff(#[from] HandoffError),

    #[error("{0} context panicked")]
    ContextPanicked(&'static str),
}

impl ScheduleError {
    /// Whether the error only reports that the other side of a handoff went
    /// away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ScheduleError::Handoff(HandoffError::Disconnected))
    }
}
