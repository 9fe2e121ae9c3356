//! Tile geometry: body/border sizes, halo offsets and tile addressing.
//!
//! Every tiling axis has a regular ("body") tile size used for all tiles but
//! the last, and a ("border") size for the last tile, which is smaller when
//! the dimension does not divide evenly.
//!
//! ```text
//!   dim = 10, body = 4
//!   ┌──────┬──────┬────┐
//!   │ body │ body │bord│   count = 3, border = 10 mod 4 = 2
//!   └──────┴──────┴────┘
//! ```
//!
//! Tensors live in bulk memory in HWC order. Input tiles of a convolution
//! overlap their neighbours by `kernel - stride` pixels (the halo), and the
//! first tile after a padded edge starts `padding` pixels earlier since the
//! first tile took those pixels from padding instead of memory.

use serde::{Deserialize, Serialize};

use super::index::{Axis, TileCounts, TileIndex, TileIndexSequencer};

/// Height, width, channel triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dims {
    pub height: u32,
    pub width: u32,
    pub channel: u32,
}

impl Dims {
    pub const fn new(height: u32, width: u32, channel: u32) -> Self {
        Self {
            height,
            width,
            channel,
        }
    }

    /// Number of elements.
    #[inline]
    pub fn elements(&self) -> u64 {
        self.height as u64 * self.width as u64 * self.channel as u64
    }

    /// Byte size for elements of `element_bytes` each.
    #[inline]
    pub fn bytes(&self, element_bytes: u32) -> u64 {
        self.elements() * element_bytes as u64
    }

    /// Element-wise maximum.
    pub fn max(self, other: Dims) -> Dims {
        Dims {
            height: self.height.max(other.height),
            width: self.width.max(other.width),
            channel: self.channel.max(other.channel),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.elements() == 0
    }
}

impl std::fmt::Display for Dims {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channel)
    }
}

/// Two-dimensional extent (kernel shape, stride).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub height: u32,
    pub width: u32,
}

impl Extent {
    pub const ONE: Extent = Extent {
        height: 1,
        width: 1,
    };

    pub const fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }
}

impl Default for Extent {
    fn default() -> Self {
        Self::ONE
    }
}

fn one() -> u32 {
    1
}

/// Convolution kernel parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kernel {
    #[serde(default)]
    pub shape: Extent,
    #[serde(default)]
    pub stride: Extent,
    #[serde(default = "one")]
    pub groups: u32,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::pointwise()
    }
}

impl Kernel {
    /// 1x1 kernel, stride 1, no grouping.
    pub const fn pointwise() -> Self {
        Self {
            shape: Extent::ONE,
            stride: Extent::ONE,
            groups: 1,
        }
    }

    /// Depthwise-style kernel: input channels follow output channels.
    pub const fn grouped(shape: Extent, stride: Extent, groups: u32) -> Self {
        Self {
            shape,
            stride,
            groups,
        }
    }

    /// Grouped execution (input channel tile follows output channel tile).
    #[inline]
    pub fn is_grouped(&self) -> bool {
        self.groups > 1
    }

    /// Overlap between neighbouring input tiles (receptive field halo).
    pub fn overlap(&self) -> Extent {
        Extent {
            height: self.shape.height.saturating_sub(self.stride.height),
            width: self.shape.width.saturating_sub(self.stride.width),
        }
    }
}

/// Zero padding around the input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Padding {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl Padding {
    pub const NONE: Padding = Padding {
        top: 0,
        right: 0,
        bottom: 0,
        left: 0,
    };

    /// Apply a run-time mask; masked-out edges get no padding.
    pub fn masked(self, mask: PaddingMask) -> Padding {
        Padding {
            top: if mask.top { self.top } else { 0 },
            bottom: if mask.bottom { self.bottom } else { 0 },
            ..self
        }
    }
}

/// Run-time selection of the conditionally padded edges.
///
/// A layer cut out of a taller image only pads on the edges that are real
/// image borders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaddingMask {
    pub top: bool,
    pub bottom: bool,
}

impl Default for PaddingMask {
    fn default() -> Self {
        Self {
            top: true,
            bottom: true,
        }
    }
}

/// Global shape of one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerShape {
    pub input: Dims,
    pub output: Dims,
    #[serde(default)]
    pub kernel: Kernel,
    #[serde(default)]
    pub padding: Padding,
}

/// Input and output size of one tile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileShape {
    pub input: Dims,
    pub output: Dims,
}

/// Split of one dimension into body tiles and a border tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisSplit {
    pub count: u32,
    pub body: u32,
    pub border: u32,
}

impl AxisSplit {
    /// Split `dim` into tiles of `body`; `None` if either is zero.
    pub fn new(dim: u32, body: u32) -> Option<Self> {
        if dim == 0 || body == 0 {
            return None;
        }
        let body = body.min(dim);
        let count = dim.div_ceil(body);
        let border = match dim % body {
            0 => body,
            rem => rem,
        };
        Some(Self {
            count,
            body,
            border,
        })
    }

    /// Split `dim` into exactly `count` tiles of `ceil(dim / count)`.
    ///
    /// `None` when no body size yields `count` tiles with a non-empty border
    /// (e.g. 9 into 4: a body of 3 gives only 3 tiles).
    pub fn from_count(dim: u32, count: u32) -> Option<Self> {
        if count == 0 {
            return None;
        }
        Self::new(dim, dim.div_ceil(count)).filter(|split| split.count == count)
    }

    /// Tile size at position `i`.
    #[inline]
    pub fn size_at(&self, i: u32) -> u32 {
        if i + 1 == self.count {
            self.border
        } else {
            self.body
        }
    }

    /// Sum over all tile sizes.
    pub fn covered(&self) -> u64 {
        (self.count as u64 - 1) * self.body as u64 + self.border as u64
    }
}

/// Leading halo offset of a tile, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Halo {
    pub height: u32,
    pub width: u32,
}

/// Body/border tile sizes of a layer and the rule that picks between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGeometry {
    pub body: TileShape,
    pub border: TileShape,
    pub counts: TileCounts,
    channels_follow_output: bool,
}

impl TileGeometry {
    /// `channels_follow_output` tiles input channels along the output-channel
    /// axis: grouped kernels and element-wise layers.
    pub fn new(body: TileShape, border: TileShape, counts: TileCounts, channels_follow_output: bool) -> Self {
        Self {
            body,
            border,
            counts,
            channels_follow_output,
        }
    }

    /// True if input channels are tiled along the output-channel axis.
    #[inline]
    pub fn channels_follow_output(&self) -> bool {
        self.channels_follow_output
    }

    /// Tile shape at `index`.
    pub fn tile(&self, index: TileIndex) -> TileShape {
        let seq = TileIndexSequencer::new(self.counts, Default::default());
        let last = seq.boundary(index);
        let pick = |is_last: bool, body: u32, border: u32| if is_last { border } else { body };

        let input_channel_axis = if self.channels_follow_output {
            Axis::OutputChannel
        } else {
            Axis::InputChannel
        };

        TileShape {
            input: Dims {
                height: pick(last.height, self.body.input.height, self.border.input.height),
                width: pick(last.width, self.body.input.width, self.border.input.width),
                channel: pick(
                    last.get(input_channel_axis),
                    self.body.input.channel,
                    self.border.input.channel,
                ),
            },
            output: Dims {
                height: pick(last.height, self.body.output.height, self.border.output.height),
                width: pick(last.width, self.body.output.width, self.border.output.width),
                channel: pick(
                    last.output_channel,
                    self.body.output.channel,
                    self.border.output.channel,
                ),
            },
        }
    }

    /// Largest input tile that will ever be resident.
    pub fn max_input(&self) -> Dims {
        self.body.input.max(self.border.input)
    }

    /// Largest output tile that will ever be resident.
    pub fn max_output(&self) -> Dims {
        self.body.output.max(self.border.output)
    }

    /// Leading offset of the input tile at `index`.
    ///
    /// The first tile along an axis reads no extra pixels; later tiles start
    /// earlier by the padding on that side.
    pub fn halo(&self, index: TileIndex, padding: &Padding) -> Halo {
        Halo {
            height: if index.height > 0 { padding.top } else { 0 },
            width: if index.width > 0 { padding.left } else { 0 },
        }
    }

    /// Channel index used to address the input tensor.
    #[inline]
    pub fn input_channel_index(&self, index: TileIndex) -> u32 {
        if self.channels_follow_output {
            index.output_channel
        } else {
            index.input_channel
        }
    }
}

/// Position of a tile inside a tensor, for [`tile_address`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileWindow {
    /// Tile index along (height, width, channel)
    pub index: Dims,
    /// Body tile size
    pub body: Dims,
    /// Overlap with the previous tile
    pub overlap: Dims,
    /// Extra leading offset
    pub offset: Dims,
}

/// Bulk-memory address of a tile's first element in an HWC tensor.
///
/// Per axis the start is `index * (body - overlap) - offset`. Validated plans
/// never place a tile before the start of the tensor.
pub fn tile_address(base: u64, window: &TileWindow, tensor: Dims, element_bytes: u32) -> u64 {
    let start = |index: u32, body: u32, overlap: u32, offset: u32| -> u64 {
        let advance = index as u64 * body.saturating_sub(overlap) as u64;
        debug_assert!(
            advance >= offset as u64,
            "tile {} starts {} elements before the tensor",
            index,
            offset as u64 - advance
        );
        advance.saturating_sub(offset as u64)
    };

    let row = start(window.index.height, window.body.height, window.overlap.height, window.offset.height);
    let col = start(window.index.width, window.body.width, window.overlap.width, window.offset.width);
    let ch = start(window.index.channel, window.body.channel, window.overlap.channel, window.offset.channel);

    let element = (row * tensor.width as u64 + col) * tensor.channel as u64 + ch;
    base + element * element_bytes as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry_10x7() -> TileGeometry {
        // 10x7x16 output split into 4x3x8 body tiles
        let body = TileShape {
            input: Dims::new(6, 5, 8),
            output: Dims::new(4, 3, 8),
        };
        let border = TileShape {
            input: Dims::new(4, 3, 8),
            output: Dims::new(2, 1, 8),
        };
        TileGeometry::new(body, border, TileCounts::new(3, 3, 2), false)
    }

    #[test]
    fn test_axis_split_non_divisible() {
        let split = AxisSplit::new(10, 4).unwrap();
        assert_eq!(split.count, 3);
        assert_eq!(split.border, 2);
        assert_eq!(split.size_at(0), 4);
        assert_eq!(split.size_at(2), 2);
    }

    #[test]
    fn test_axis_split_divisible() {
        let split = AxisSplit::new(12, 4).unwrap();
        assert_eq!(split.count, 3);
        assert_eq!(split.border, 4);
    }

    #[test]
    fn test_axis_split_sums_to_dimension() {
        for dim in 1..40 {
            for body in 1..=dim {
                let split = AxisSplit::new(dim, body).unwrap();
                assert_eq!(split.covered(), dim as u64, "dim={} body={}", dim, body);
                assert!(split.border > 0 && split.border <= split.body);
            }
        }
    }

    #[test]
    fn test_axis_split_from_count() {
        let split = AxisSplit::from_count(10, 3).unwrap();
        assert_eq!(split.body, 4);
        assert_eq!(split.border, 2);
        assert!(AxisSplit::from_count(10, 0).is_none());
        // A body of 3 splits 9 into 3 tiles, not 4
        assert!(AxisSplit::from_count(9, 4).is_none());
        assert_eq!(AxisSplit::from_count(9, 3).unwrap().count, 3);
        assert!(AxisSplit::new(0, 4).is_none());
    }

    #[test]
    fn test_border_selected_only_on_last_index() {
        let geo = geometry_10x7();

        let first = geo.tile(TileIndex::new(0, 0, 0));
        assert_eq!(first.output, Dims::new(4, 3, 8));

        let mid = geo.tile(TileIndex::new(1, 1, 1));
        assert_eq!(mid.output, Dims::new(4, 3, 8));

        let last_h = geo.tile(TileIndex::new(2, 0, 0));
        assert_eq!(last_h.output, Dims::new(2, 3, 8));
        assert_eq!(last_h.input, Dims::new(4, 5, 8));

        let last_w = geo.tile(TileIndex::new(0, 2, 0));
        assert_eq!(last_w.output, Dims::new(4, 1, 8));
    }

    #[test]
    fn test_grouped_input_channel_follows_output_channel() {
        let body = TileShape {
            input: Dims::new(4, 4, 16),
            output: Dims::new(4, 4, 16),
        };
        let border = TileShape {
            input: Dims::new(4, 4, 8),
            output: Dims::new(4, 4, 8),
        };
        let kernel = Kernel::grouped(Extent::new(3, 3), Extent::ONE, 24);
        let geo = TileGeometry::new(body, border, TileCounts::new(1, 1, 2), kernel.is_grouped());

        assert_eq!(geo.tile(TileIndex::new(0, 0, 0)).input.channel, 16);
        assert_eq!(geo.tile(TileIndex::new(0, 0, 1)).input.channel, 8);
        assert_eq!(geo.input_channel_index(TileIndex::new(0, 0, 1)), 1);
    }

    #[test]
    fn test_halo_only_after_first_tile() {
        let geo = geometry_10x7();
        let padding = Padding {
            top: 1,
            right: 1,
            bottom: 1,
            left: 1,
        };

        assert_eq!(geo.halo(TileIndex::new(0, 0, 0), &padding), Halo::default());
        assert_eq!(
            geo.halo(TileIndex::new(1, 0, 0), &padding),
            Halo { height: 1, width: 0 }
        );
        assert_eq!(
            geo.halo(TileIndex::new(1, 2, 0), &padding),
            Halo { height: 1, width: 1 }
        );
    }

    #[test]
    fn test_padding_mask() {
        let padding = Padding {
            top: 1,
            right: 2,
            bottom: 3,
            left: 4,
        };
        let masked = padding.masked(PaddingMask {
            top: false,
            bottom: true,
        });
        assert_eq!(masked.top, 0);
        assert_eq!(masked.bottom, 3);
        assert_eq!(masked.left, 4);
    }

    #[test]
    fn test_kernel_overlap() {
        let k = Kernel::grouped(Extent::new(3, 3), Extent::new(2, 2), 8);
        assert_eq!(k.overlap(), Extent::new(1, 1));
        assert_eq!(Kernel::pointwise().overlap(), Extent::new(0, 0));
    }

    #[test]
    fn test_tile_address_hwc() {
        // 8x8x4 tensor, 1 byte elements, body 4x4x4
        let tensor = Dims::new(8, 8, 4);
        let window = TileWindow {
            index: Dims::new(1, 1, 0),
            body: Dims::new(4, 4, 4),
            ..Default::default()
        };
        // row 4, col 4 -> (4*8 + 4) * 4
        assert_eq!(tile_address(0x1000, &window, tensor, 1), 0x1000 + 144);
    }

    #[test]
    fn test_tile_address_with_overlap_and_offset() {
        // 3x3 kernel, stride 1, padding 1: tile 1 starts at 1*(6-2) - 1 = 3
        let tensor = Dims::new(16, 16, 2);
        let window = TileWindow {
            index: Dims::new(1, 0, 0),
            body: Dims::new(6, 16, 2),
            overlap: Dims::new(2, 2, 0),
            offset: Dims::new(1, 0, 0),
        };
        assert_eq!(tile_address(0, &window, tensor, 2), 3 * 16 * 2 * 2);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "before the tensor")]
    fn test_tile_address_before_tensor_panics() {
        // Step 6 - 2 = 4 cannot absorb a 5-row leading pad
        let window = TileWindow {
            index: Dims::new(1, 0, 0),
            body: Dims::new(6, 16, 2),
            overlap: Dims::new(2, 2, 0),
            offset: Dims::new(5, 0, 0),
        };
        tile_address(0, &window, Dims::new(16, 16, 2), 1);
    }

    #[test]
    fn test_tile_address_channel_tile() {
        let tensor = Dims::new(4, 4, 32);
        let window = TileWindow {
            index: Dims::new(0, 0, 2),
            body: Dims::new(4, 4, 8),
            ..Default::default()
        };
        assert_eq!(tile_address(0, &window, tensor, 1), 16);
    }
}
