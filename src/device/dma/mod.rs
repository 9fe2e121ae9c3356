//! Simulated DMA controller.
//!
//! - [`addressing`]: expands a tile descriptor into the contiguous runs it
//!   touches in bulk memory
//! - [`engine`]: [`SimDma`], a [`TransferEngine`] that performs each copy
//!   as soon as it is started
//!
//! ```text
//!   bulk (HWC tensor)                    scratchpad (packed)
//!   ┌──────────────────────┐
//!   │ ....[run][run].....  │  stride_1d   ┌──────────────┐
//!   │ ....[run][run].....  │ ───────────> │ run run run  │
//!   │                      │  stride_2d   │ run          │
//!   └──────────────────────┘              └──────────────┘
//! ```
//!
//! [`TransferEngine`]: crate::schedule::transfer::TransferEngine

pub mod addressing;
pub mod engine;

pub use addressing::{bulk_runs, AddressGenerator, DimensionConfig};
pub use engine::{DmaFault, SimDma};
