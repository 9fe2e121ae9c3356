//! tile-sched library
//!
//! Tile pipeline scheduling for NPU layers whose tensors do not fit the
//! accelerator's scratchpad: tiling geometry, double-buffered transfers and
//! a fused multi-stage pipeline, plus a simulated device to run them on.

pub mod config;
pub mod device;
pub mod error;
pub mod plan;
pub mod schedule;
pub mod testing;

pub use error::ScheduleError;
pub use plan::{FusedPlan, LayerPlan, PlanError, PlanFile};
