//! Multi-dimensional tile index and its sequencer.
//!
//! A layer is split into `height x width x output_channel x input_channel`
//! tiles. The sequencer walks that grid in a fixed loop order, wrapping each
//! axis back to zero when it reaches its count and carrying into the next
//! slower axis.
//!
//! # Loop Orders
//!
//! ```text
//! Forward:  width (fastest) -> height -> output_channel -> input_channel
//! Reverse:  output_channel (fastest) -> width -> height -> input_channel
//! ```
//!
//! The same order must be used for the load, compute and store of a tile,
//! since the driver derives the *next* tile's index while the current one is
//! still executing.

use serde::{Deserialize, Serialize};

/// Tiling axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Height,
    Width,
    OutputChannel,
    InputChannel,
}

impl Axis {
    /// All axes, in declaration order.
    pub const ALL: [Axis; 4] = [
        Axis::Height,
        Axis::Width,
        Axis::OutputChannel,
        Axis::InputChannel,
    ];
}

fn one() -> u32 {
    1
}

/// Number of tiles along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileCounts {
    pub height: u32,
    pub width: u32,
    pub output_channel: u32,
    /// Input-channel tiling; 1 unless the planner splits input channels.
    #[serde(default = "one")]
    pub input_channel: u32,
}

impl Default for TileCounts {
    fn default() -> Self {
        Self::new(1, 1, 1)
    }
}

impl TileCounts {
    /// Counts with a single input-channel tile.
    pub fn new(height: u32, width: u32, output_channel: u32) -> Self {
        Self {
            height,
            width,
            output_channel,
            input_channel: 1,
        }
    }

    /// Count along one axis.
    #[inline]
    pub fn get(&self, axis: Axis) -> u32 {
        match axis {
            Axis::Height => self.height,
            Axis::Width => self.width,
            Axis::OutputChannel => self.output_channel,
            Axis::InputChannel => self.input_channel,
        }
    }

    /// Total number of tiles (product over all axes).
    #[inline]
    pub fn total(&self) -> u64 {
        Axis::ALL.iter().map(|&a| self.get(a) as u64).product()
    }

    /// Number of spatial tiles (height x width).
    #[inline]
    pub fn spatial(&self) -> u64 {
        self.height as u64 * self.width as u64
    }

    /// True if every axis has at least one tile.
    pub fn is_valid(&self) -> bool {
        Axis::ALL.iter().all(|&a| self.get(a) > 0)
    }
}

/// Position of a tile in the tiling grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TileIndex {
    pub height: u32,
    pub width: u32,
    pub output_channel: u32,
    pub input_channel: u32,
}

impl TileIndex {
    /// Index of the first tile.
    pub const ZERO: TileIndex = TileIndex {
        height: 0,
        width: 0,
        output_channel: 0,
        input_channel: 0,
    };

    pub fn new(height: u32, width: u32, output_channel: u32) -> Self {
        Self {
            height,
            width,
            output_channel,
            input_channel: 0,
        }
    }

    #[inline]
    pub fn get(&self, axis: Axis) -> u32 {
        match axis {
            Axis::Height => self.height,
            Axis::Width => self.width,
            Axis::OutputChannel => self.output_channel,
            Axis::InputChannel => self.input_channel,
        }
    }

    #[inline]
    fn set(&mut self, axis: Axis, value: u32) {
        match axis {
            Axis::Height => self.height = value,
            Axis::Width => self.width = value,
            Axis::OutputChannel => self.output_channel = value,
            Axis::InputChannel => self.input_channel = value,
        }
    }

    /// True if the index lies inside `counts` on every axis.
    pub fn is_within(&self, counts: &TileCounts) -> bool {
        Axis::ALL.iter().all(|&a| self.get(a) < counts.get(a))
    }

    /// True if `axis` differs between `self` and `other`.
    #[inline]
    pub fn changed(&self, other: &TileIndex, axis: Axis) -> bool {
        self.get(axis) != other.get(axis)
    }
}

impl std::fmt::Display for TileIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(h{}, w{}, oc{}, ic{})",
            self.height, self.width, self.output_channel, self.input_channel
        )
    }
}

/// Order in which the sequencer advances the tiling axes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopOrder {
    /// Spatial tiles first: width, height, output channel, input channel.
    #[default]
    Forward,
    /// Channel tiles first: output channel, width, height, input channel.
    Reverse,
}

impl LoopOrder {
    /// Axes from fastest- to slowest-varying.
    pub fn axes(self) -> [Axis; 4] {
        match self {
            LoopOrder::Forward => [
                Axis::Width,
                Axis::Height,
                Axis::OutputChannel,
                Axis::InputChannel,
            ],
            LoopOrder::Reverse => [
                Axis::OutputChannel,
                Axis::Width,
                Axis::Height,
                Axis::InputChannel,
            ],
        }
    }
}

/// Per-axis "is this the border tile" flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AxisFlags {
    pub height: bool,
    pub width: bool,
    pub output_channel: bool,
    pub input_channel: bool,
}

impl AxisFlags {
    #[inline]
    pub fn get(&self, axis: Axis) -> bool {
        match axis {
            Axis::Height => self.height,
            Axis::Width => self.width,
            Axis::OutputChannel => self.output_channel,
            Axis::InputChannel => self.input_channel,
        }
    }
}

/// Stateless walker over the tile grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileIndexSequencer {
    counts: TileCounts,
    order: LoopOrder,
}

impl TileIndexSequencer {
    pub fn new(counts: TileCounts, order: LoopOrder) -> Self {
        Self { counts, order }
    }

    #[inline]
    pub fn counts(&self) -> &TileCounts {
        &self.counts
    }

    #[inline]
    pub fn order(&self) -> LoopOrder {
        self.order
    }

    /// Number of tiles the driver must iterate.
    #[inline]
    pub fn total(&self) -> u64 {
        self.counts.total()
    }

    /// Index following `index`. Wraps to [`TileIndex::ZERO`] after the last tile.
    pub fn next(&self, index: TileIndex) -> TileIndex {
        let mut next = index;
        for axis in self.order.axes() {
            let value = next.get(axis) + 1;
            if value < self.counts.get(axis) {
                next.set(axis, value);
                return next;
            }
            next.set(axis, 0);
        }
        next
    }

    /// Whether `index` sits on the border tile of each axis.
    pub fn boundary(&self, index: TileIndex) -> AxisFlags {
        let last = |axis: Axis| index.get(axis) + 1 == self.counts.get(axis);
        AxisFlags {
            height: last(Axis::Height),
            width: last(Axis::Width),
            output_channel: last(Axis::OutputChannel),
            input_channel: last(Axis::InputChannel),
        }
    }

    /// Iterate every index once, in loop order, starting at zero.
    pub fn iter(&self) -> TileIter {
        TileIter {
            sequencer: *self,
            current: TileIndex::ZERO,
            remaining: self.total(),
        }
    }
}

/// Iterator over all indices of a [`TileIndexSequencer`].
pub struct TileIter {
    sequencer: TileIndexSequencer,
    current: TileIndex,
    remaining: u64,
}

impl Iterator for TileIter {
    type Item = TileIndex;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let index = self.current;
        self.current = self.sequencer.next(index);
        self.remaining -= 1;
        Some(index)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TileIter {}
