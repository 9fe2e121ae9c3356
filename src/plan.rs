//! Layer plans: the tiling parameters handed to the scheduler.
//!
//! A plan is produced ahead of time by the sizing step and is read-only for
//! the whole run. Two kinds exist:
//!
//! - [`LayerPlan`]: one compute stage (convolution or element-wise add)
//! - [`FusedPlan`]: expand (1x1) -> spatial (kxk) -> project (1x1), with
//!   intermediates kept in the scratchpad
//!
//! # Plan File Format
//!
//! ```toml
//! type = "layer"
//! name = "conv3x3"
//!
//! [shape]
//! input  = { height = 8, width = 8, channel = 4 }
//! output = { height = 8, width = 8, channel = 8 }
//! kernel = { shape = { height = 3, width = 3 }, stride = { height = 1, width = 1 } }
//! padding = { top = 1, right = 1, bottom = 1, left = 1 }
//!
//! [counts]
//! height = 2
//! width = 2
//! output_channel = 1
//!
//! [body]
//! input  = { height = 6, width = 6, channel = 4 }
//! output = { height = 4, width = 4, channel = 8 }
//!
//! [border]
//! input  = { height = 6, width = 6, channel = 4 }
//! output = { height = 4, width = 4, channel = 8 }
//!
//! [weights]
//! bytes_per_channel = 36
//! ```
//!
//! A plan may also fix the scratchpad layout instead of letting the
//! scheduler pack it. Every role with a buffer then needs one entry:
//!
//! ```toml
//! [[scratch]]
//! role = "input"
//! start = 0
//! slot_bytes = 144
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schedule::buffer::{BufferAllocator, BufferKey, Region, RegionRequest};
use crate::schedule::geometry::{AxisSplit, Dims, Extent, Kernel, LayerShape, Padding, TileGeometry, TileShape};
use crate::schedule::index::{Axis, LoopOrder, TileCounts, TileIndexSequencer};
use crate::schedule::role::{Role, RoleTable, Stage};

/// Plan consistency errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("tile counts must be at least 1 on every axis")]
    EmptyCounts,

    #[error("{0} tile has a zero-sized dimension")]
    EmptyTile(&'static str),

    #[error("{0} border tile is larger than the body tile")]
    BorderExceedsBody(&'static str),

    #[error("{axis:?} tiles cover {covered} but the dimension is {dim}")]
    Coverage { axis: Axis, covered: u64, dim: u32 },

    #[error("add layer needs identical input and output shapes ({input} vs {output})")]
    AddShape { input: Dims, output: Dims },

    #[error("input-channel tiling is not supported ({0} tiles); tile output channels instead")]
    InputChannelTiling(u32),

    #[error("{axis:?} input tiles advance {step} elements but the leading halo needs {needed}")]
    HaloExceedsStep { axis: Axis, step: u32, needed: u32 },

    #[error("{stage} stage must use a 1x1 kernel")]
    NotPointwise { stage: Stage },

    #[error("fused stages disagree: {0}")]
    StageMismatch(String),

    #[error("parameter offsets overlap: {0}")]
    ParamOffsets(String),

    #[error("scratchpad layout: {0}")]
    ScratchLayout(String),

    #[error("at least 2 buffer slots are needed to prefetch, got {0}")]
    TooFewSlots(u8),

    #[error("handoff capacity {capacity} exceeds {slots} buffer slots")]
    HandoffExceedsSlots { capacity: usize, slots: u8 },

    #[error("{stage} stage: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<PlanError>,
    },
}

impl PlanError {
    fn in_stage(self, stage: Stage) -> Self {
        PlanError::Stage {
            stage,
            source: Box::new(self),
        }
    }
}

/// Kind of single-stage layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    /// Convolution (any kernel, optionally grouped) with weights, scale, bias
    #[default]
    Conv,
    /// Element-wise add of two identically tiled inputs
    Add,
}

fn one_byte() -> u32 {
    1
}

fn four_bytes() -> u32 {
    4
}

/// Element widths in bytes. A zero scale or bias width means the layer has
/// no such parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementWidths {
    #[serde(default = "one_byte")]
    pub input: u32,
    /// Also used for intermediates of a fused block
    #[serde(default = "one_byte")]
    pub output: u32,
    #[serde(default = "four_bytes")]
    pub scale: u32,
    #[serde(default = "four_bytes")]
    pub bias: u32,
}

impl Default for ElementWidths {
    fn default() -> Self {
        Self {
            input: 1,
            output: 1,
            scale: 4,
            bias: 4,
        }
    }
}

/// Accelerator weight layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightLayout {
    /// Bytes of weights per output channel (per channel group when grouped)
    #[serde(default)]
    pub bytes_per_channel: u32,
    /// Channels packed per weight group for grouped kernels
    #[serde(default)]
    pub group_width: Option<u32>,
}

impl WeightLayout {
    /// Weight bytes of a tile with `output_channels` channels.
    ///
    /// Grouped kernels pack `group_width` channels per weight group, so the
    /// channel count is rounded up to whole groups. Logical shapes are not
    /// affected.
    pub fn bytes(&self, output_channels: u32, grouped: bool, default_group_width: u32) -> u64 {
        let channels = if grouped {
            let width = self.group_width.unwrap_or(default_group_width).max(1);
            output_channels.div_ceil(width)
        } else {
            output_channels
        };
        channels as u64 * self.bytes_per_channel as u64
    }
}

/// Parameter placement relative to the weights base address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamOffsets {
    pub weights: u64,
    pub scale: u64,
    pub bias: u64,
}

/// Per-role byte sizes of a stage's tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileBytes {
    pub kind: LayerKind,
    pub elements: ElementWidths,
    pub weights: WeightLayout,
    pub grouped: bool,
    pub group_width: u32,
}

impl TileBytes {
    /// Bytes `role` occupies for a tile of `shape`; 0 if the stage has no
    /// such role.
    pub fn bytes(&self, role: Role, shape: &TileShape) -> u64 {
        let oc = shape.output.channel as u64;
        let conv = self.kind == LayerKind::Conv;
        match role {
            Role::Input => shape.input.bytes(self.elements.input),
            Role::Input2 if self.kind == LayerKind::Add => shape.input.bytes(self.elements.input),
            Role::Input2 => 0,
            Role::Weights if conv => {
                self.weights
                    .bytes(shape.output.channel, self.grouped, self.group_width)
            }
            Role::Scale if conv => oc * self.elements.scale as u64,
            Role::Bias if conv => oc * self.elements.bias as u64,
            Role::Weights | Role::Scale | Role::Bias => 0,
            Role::Output => shape.output.bytes(self.elements.output),
        }
    }

    /// Largest size over body and border tiles.
    pub fn max(&self, role: Role, geometry: &TileGeometry) -> u64 {
        self.bytes(role, &geometry.body)
            .max(self.bytes(role, &geometry.border))
    }

    /// Bytes of a parameter role summed over every output-channel tile.
    pub fn param_total(&self, role: Role, geometry: &TileGeometry) -> u64 {
        let count = geometry.counts.output_channel.max(1) as u64;
        (count - 1) * self.bytes(role, &geometry.body) + self.bytes(role, &geometry.border)
    }

    /// Roles with a non-empty buffer.
    pub fn present(&self, geometry: &TileGeometry) -> RoleTable<bool> {
        RoleTable::from_fn(|role| self.max(role, geometry) > 0)
    }

    /// Parameters packed back to back from `start`: weights, scale, bias.
    pub fn packed_offsets(&self, geometry: &TileGeometry, start: u64) -> ParamOffsets {
        let weights = start;
        let scale = weights + self.param_total(Role::Weights, geometry);
        let bias = scale + self.param_total(Role::Scale, geometry);
        ParamOffsets {
            weights,
            scale,
            bias,
        }
    }

    /// End of the parameter block placed at `offsets`.
    pub fn params_end(&self, geometry: &TileGeometry, offsets: &ParamOffsets) -> u64 {
        Role::PARAMS
            .iter()
            .map(|&role| param_offset(offsets, role) + self.param_total(role, geometry))
            .max()
            .unwrap_or(offsets.weights)
    }

    /// Check that explicit offsets leave room for every parameter.
    fn check_offsets(&self, geometry: &TileGeometry, offsets: &ParamOffsets) -> Result<(), PlanError> {
        let mut spans: Vec<(u64, u64, Role)> = Role::PARAMS
            .iter()
            .map(|&role| {
                let start = param_offset(offsets, role);
                (start, start + self.param_total(role, geometry), role)
            })
            .filter(|(start, end, _)| end > start)
            .collect();
        spans.sort();
        for pair in spans.windows(2) {
            if pair[0].1 > pair[1].0 {
                return Err(PlanError::ParamOffsets(format!(
                    "{} [{}, {}) runs into {} at {}",
                    pair[0].2, pair[0].0, pair[0].1, pair[1].2, pair[1].0
                )));
            }
        }
        Ok(())
    }
}

/// Planner-provided placement of one role's scratchpad region, relative to
/// the scratchpad base. The slot count comes from the run options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionPlacement {
    pub role: Role,
    pub start: u64,
    pub slot_bytes: u64,
}

/// Turn placements into regions: each non-empty request gets exactly one
/// placement with slots large enough for its tiles.
fn place_regions(requests: &[RegionRequest], placements: &[(Stage, RegionPlacement)]) -> Result<Vec<Region>, PlanError> {
    let key = |(stage, placement): &(Stage, RegionPlacement)| BufferKey::new(*stage, placement.role);

    if let Some(unused) = placements
        .iter()
        .map(key)
        .find(|k| !requests.iter().any(|r| r.key == *k && r.bytes > 0))
    {
        return Err(PlanError::ScratchLayout(format!("{} has no buffer to place", unused)));
    }

    let regions = requests
        .iter()
        .filter(|req| req.bytes > 0)
        .map(|req| {
            let mut matching = placements.iter().filter(|p| key(*p) == req.key);
            let placement = match (matching.next(), matching.next()) {
                (Some((_, placement)), None) => placement,
                (None, _) => return Err(PlanError::ScratchLayout(format!("{} is not placed", req.key))),
                (Some(_), Some(_)) => return Err(PlanError::ScratchLayout(format!("{} is placed twice", req.key))),
            };
            if placement.slot_bytes < req.bytes {
                return Err(PlanError::ScratchLayout(format!(
                    "{} slots hold {} bytes but its tiles need {}",
                    req.key, placement.slot_bytes, req.bytes
                )));
            }
            Ok(Region {
                key: req.key,
                start: placement.start,
                slot_bytes: placement.slot_bytes,
                slots: req.slots,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    // Overlap only; capacity depends on the run
    BufferAllocator::with_offsets(0, u64::MAX, regions.clone())
        .map_err(|e| PlanError::ScratchLayout(e.to_string()))?;
    Ok(regions)
}

/// Offset of a parameter role inside `offsets`.
pub fn param_offset(offsets: &ParamOffsets, role: Role) -> u64 {
    match role {
        Role::Scale => offsets.scale,
        Role::Bias => offsets.bias,
        _ => offsets.weights,
    }
}

fn check_tiles(counts: &TileCounts, body: &TileShape, border: &TileShape) -> Result<(), PlanError> {
    if !counts.is_valid() {
        return Err(PlanError::EmptyCounts);
    }
    for (what, b, r) in [
        ("input", body.input, border.input),
        ("output", body.output, border.output),
    ] {
        if b.is_empty() || r.is_empty() {
            return Err(PlanError::EmptyTile(what));
        }
        if r.height > b.height || r.width > b.width || r.channel > b.channel {
            return Err(PlanError::BorderExceedsBody(what));
        }
    }
    Ok(())
}

fn check_coverage(axis: Axis, count: u32, body: u32, border: u32, dim: u32) -> Result<(), PlanError> {
    let covered = (count as u64 - 1) * body as u64 + border as u64;
    if covered != dim as u64 {
        return Err(PlanError::Coverage { axis, covered, dim });
    }
    Ok(())
}

fn check_output_coverage(counts: &TileCounts, body: &Dims, border: &Dims, output: &Dims) -> Result<(), PlanError> {
    check_coverage(Axis::Height, counts.height, body.height, border.height, output.height)?;
    check_coverage(Axis::Width, counts.width, body.width, border.width, output.width)?;
    check_coverage(
        Axis::OutputChannel,
        counts.output_channel,
        body.channel,
        border.channel,
        output.channel,
    )
}

/// Check that every input tile after the first starts inside the tensor:
/// the step between tiles must cover the leading padding.
fn check_halo(counts: &TileCounts, body_input: &Dims, overlap: Extent, padding: &Padding) -> Result<(), PlanError> {
    for (axis, count, body, overlap, lead) in [
        (Axis::Height, counts.height, body_input.height, overlap.height, padding.top),
        (Axis::Width, counts.width, body_input.width, overlap.width, padding.left),
    ] {
        if count < 2 {
            continue;
        }
        let step = body.saturating_sub(overlap);
        let needed = lead.max(1);
        if step < needed {
            return Err(PlanError::HaloExceedsStep { axis, step, needed });
        }
    }
    Ok(())
}

/// Input tile height/width for an output tile of `out` rows/columns.
fn receptive(out: u32, kernel: u32, stride: u32, dim: u32) -> u32 {
    ((out.saturating_sub(1)) * stride + kernel).min(dim)
}

/// Tiling plan of one single-stage layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerPlan {
    pub name: String,
    #[serde(default)]
    pub kind: LayerKind,
    pub shape: LayerShape,
    pub counts: TileCounts,
    pub body: TileShape,
    pub border: TileShape,
    #[serde(default)]
    pub elements: ElementWidths,
    #[serde(default)]
    pub weights: WeightLayout,
    #[serde(default)]
    pub loop_order: LoopOrder,
    /// Planner-provided parameter placement; packed when absent
    #[serde(default)]
    pub offsets: Option<ParamOffsets>,
    /// Planner-provided scratchpad layout; packed when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch: Option<Vec<RegionPlacement>>,
}

impl LayerPlan {
    /// Regular split of `shape` into output tiles of at most `tile`.
    ///
    /// Input tiles get the receptive field of their output tile; grouped
    /// kernels tile input channels with the output channels. No capacity
    /// sizing is done.
    pub fn split(name: impl Into<String>, kind: LayerKind, shape: LayerShape, tile: Dims) -> Result<Self, PlanError> {
        let h = AxisSplit::new(shape.output.height, tile.height).ok_or(PlanError::EmptyTile("output"))?;
        let w = AxisSplit::new(shape.output.width, tile.width).ok_or(PlanError::EmptyTile("output"))?;
        let c = AxisSplit::new(shape.output.channel, tile.channel).ok_or(PlanError::EmptyTile("output"))?;
        let k = &shape.kernel;
        let grouped = k.is_grouped() || kind == LayerKind::Add;

        let input = |out_h: u32, out_w: u32, out_c: u32| Dims {
            height: receptive(out_h, k.shape.height, k.stride.height, shape.input.height),
            width: receptive(out_w, k.shape.width, k.stride.width, shape.input.width),
            channel: if grouped { out_c } else { shape.input.channel },
        };

        Ok(Self {
            name: name.into(),
            kind,
            shape,
            counts: TileCounts::new(h.count, w.count, c.count),
            body: TileShape {
                input: input(h.body, w.body, c.body),
                output: Dims::new(h.body, w.body, c.body),
            },
            border: TileShape {
                input: input(h.border, w.border, c.border),
                output: Dims::new(h.border, w.border, c.border),
            },
            elements: ElementWidths::default(),
            weights: WeightLayout::default(),
            loop_order: LoopOrder::default(),
            offsets: None,
            scratch: None,
        })
    }

    pub fn geometry(&self) -> TileGeometry {
        TileGeometry::new(self.body, self.border, self.counts, self.channels_follow_output())
    }

    pub fn sequencer(&self) -> TileIndexSequencer {
        TileIndexSequencer::new(self.counts, self.loop_order)
    }

    #[inline]
    pub fn kernel(&self) -> Kernel {
        self.shape.kernel
    }

    /// Input channels are tiled with the output channels: grouped
    /// convolutions and element-wise adds.
    pub fn channels_follow_output(&self) -> bool {
        self.kind == LayerKind::Add || self.shape.kernel.is_grouped()
    }

    pub fn tile_bytes(&self, group_width: u32) -> TileBytes {
        TileBytes {
            kind: self.kind,
            elements: self.elements,
            weights: self.weights,
            grouped: self.shape.kernel.is_grouped(),
            group_width,
        }
    }

    /// One request per present role, each `slots` deep.
    pub fn region_requests(&self, sizes: &TileBytes, slots: u8) -> Vec<RegionRequest> {
        let geometry = self.geometry();
        Role::ALL
            .iter()
            .map(|&role| RegionRequest::new(role, sizes.max(role, &geometry), slots))
            .collect()
    }

    /// Regions of the planner-provided layout, if the plan has one.
    pub fn scratch_regions(&self, sizes: &TileBytes, slots: u8) -> Result<Option<Vec<Region>>, PlanError> {
        self.scratch
            .as_ref()
            .map(|placements| {
                let placements: Vec<_> = placements.iter().map(|&p| (Stage::Single, p)).collect();
                place_regions(&self.region_requests(sizes, slots), &placements)
            })
            .transpose()
    }

    /// Parameter offsets from the weights base.
    pub fn param_offsets(&self, sizes: &TileBytes) -> ParamOffsets {
        self.offsets
            .unwrap_or_else(|| sizes.packed_offsets(&self.geometry(), 0))
    }

    pub fn total_tiles(&self) -> u64 {
        self.counts.total()
    }

    /// Check that the plan describes a consistent tiling.
    pub fn validate(&self, group_width: u32) -> Result<(), PlanError> {
        check_tiles(&self.counts, &self.body, &self.border)?;
        if self.counts.input_channel != 1 {
            return Err(PlanError::InputChannelTiling(self.counts.input_channel));
        }
        check_output_coverage(&self.counts, &self.body.output, &self.border.output, &self.shape.output)?;

        let ic_count = if self.channels_follow_output() {
            self.counts.output_channel
        } else {
            self.counts.input_channel
        };
        check_coverage(
            Axis::InputChannel,
            ic_count,
            self.body.input.channel,
            self.border.input.channel,
            self.shape.input.channel,
        )?;

        check_halo(&self.counts, &self.body.input, self.shape.kernel.overlap(), &self.shape.padding)?;

        if self.kind == LayerKind::Add && self.shape.input != self.shape.output {
            return Err(PlanError::AddShape {
                input: self.shape.input,
                output: self.shape.output,
            });
        }

        let sizes = self.tile_bytes(group_width);
        if let Some(offsets) = &self.offsets {
            sizes.check_offsets(&self.geometry(), offsets)?;
        }
        self.scratch_regions(&sizes, 2)?;
        Ok(())
    }
}

/// Tiling of one stage of a fused block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    #[serde(default)]
    pub kernel: Kernel,
    pub counts: TileCounts,
    pub body: TileShape,
    pub border: TileShape,
    #[serde(default)]
    pub weights: WeightLayout,
    #[serde(default)]
    pub offsets: Option<ParamOffsets>,
    /// Scratchpad placement of this stage's regions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch: Option<Vec<RegionPlacement>>,
}

impl StagePlan {
    pub fn geometry(&self) -> TileGeometry {
        TileGeometry::new(self.body, self.border, self.counts, self.kernel.is_grouped())
    }

    pub fn tile_bytes(&self, elements: ElementWidths, group_width: u32) -> TileBytes {
        TileBytes {
            kind: LayerKind::Conv,
            elements,
            weights: self.weights,
            grouped: self.kernel.is_grouped(),
            group_width,
        }
    }
}

/// Tiling plan of an expand -> spatial -> project block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusedPlan {
    pub name: String,
    /// Block input (expand input)
    pub input: Dims,
    /// Block output (project output)
    pub output: Dims,
    /// Padding of the spatial stage
    #[serde(default)]
    pub padding: Padding,
    pub expand: StagePlan,
    pub spatial: StagePlan,
    pub project: StagePlan,
    #[serde(default)]
    pub elements: ElementWidths,
}

impl FusedPlan {
    pub fn stage(&self, stage: Stage) -> &StagePlan {
        match stage {
            Stage::Expand | Stage::Single => &self.expand,
            Stage::Spatial => &self.spatial,
            Stage::Project => &self.project,
        }
    }

    /// Spatial tiles walked by the producer.
    pub fn spatial_tiles(&self) -> u64 {
        self.spatial.counts.spatial()
    }

    /// Output sub-tiles handed to the consumer.
    pub fn total_items(&self) -> u64 {
        self.project.counts.spatial() * self.project.counts.output_channel as u64
    }

    /// Full-depth spatial output buffer: one spatial tile, all channels.
    pub fn spatial_output_bytes(&self) -> u64 {
        let g = self.spatial.geometry();
        let out = g.max_output();
        Dims::new(out.height, out.width, self.project.body.input.channel)
            .bytes(self.elements.output)
    }

    /// Scratchpad regions of the block.
    ///
    /// Inputs, parameters and project outputs are `slots` deep. The expand
    /// output and the full-depth spatial output are single buffers.
    pub fn region_requests(&self, group_width: u32, slots: u8) -> Vec<RegionRequest> {
        let mut requests = Vec::new();
        for stage in Stage::FUSED {
            let plan = self.stage(stage);
            let sizes = plan.tile_bytes(self.elements, group_width);
            let geometry = plan.geometry();
            if stage == Stage::Expand {
                requests.push(RegionRequest::new((stage, Role::Input), sizes.max(Role::Input, &geometry), slots));
            }
            for role in Role::PARAMS {
                requests.push(RegionRequest::new((stage, role), sizes.max(role, &geometry), slots));
            }
            let output = match stage {
                Stage::Spatial => RegionRequest::new((stage, Role::Output), self.spatial_output_bytes(), 1),
                Stage::Project => RegionRequest::new((stage, Role::Output), sizes.max(Role::Output, &geometry), slots),
                _ => RegionRequest::new((stage, Role::Output), sizes.max(Role::Output, &geometry), 1),
            };
            requests.push(output);
        }
        requests
    }

    /// Regions of the planner-provided layout. Once any stage places its
    /// regions, every region of the block must be placed.
    pub fn scratch_regions(&self, group_width: u32, slots: u8) -> Result<Option<Vec<Region>>, PlanError> {
        if Stage::FUSED.iter().all(|&stage| self.stage(stage).scratch.is_none()) {
            return Ok(None);
        }
        let placements: Vec<_> = Stage::FUSED
            .iter()
            .flat_map(|&stage| {
                self.stage(stage)
                    .scratch
                    .iter()
                    .flatten()
                    .map(move |&p| (stage, p))
            })
            .collect();
        place_regions(&self.region_requests(group_width, slots), &placements).map(Some)
    }

    /// Parameter offsets for every stage; stages without explicit offsets
    /// are packed after the previous stage's parameters.
    pub fn param_offsets(&self, group_width: u32) -> [ParamOffsets; 3] {
        let mut next = 0u64;
        Stage::FUSED.map(|stage| {
            let plan = self.stage(stage);
            let sizes = plan.tile_bytes(self.elements, group_width);
            let geometry = plan.geometry();
            let offsets = plan
                .offsets
                .unwrap_or_else(|| sizes.packed_offsets(&geometry, next));
            next = next.max(sizes.params_end(&geometry, &offsets));
            offsets
        })
    }

    pub fn validate(&self, group_width: u32) -> Result<(), PlanError> {
        for stage in Stage::FUSED {
            let plan = self.stage(stage);
            check_tiles(&plan.counts, &plan.body, &plan.border).map_err(|e| e.in_stage(stage))?;
            if plan.counts.input_channel != 1 {
                return Err(PlanError::InputChannelTiling(plan.counts.input_channel).in_stage(stage));
            }
            if stage != Stage::Spatial && plan.kernel.shape != Kernel::pointwise().shape {
                return Err(PlanError::NotPointwise { stage });
            }
            if let Some(offsets) = &plan.offsets {
                plan.tile_bytes(self.elements, group_width)
                    .check_offsets(&plan.geometry(), offsets)
                    .map_err(|e| e.in_stage(stage))?;
            }
        }

        let (e, s, p) = (&self.expand.counts, &self.spatial.counts, &self.project.counts);
        if (e.height, e.width) != (s.height, s.width) || (s.height, s.width) != (p.height, p.width) {
            return Err(PlanError::StageMismatch(format!(
                "spatial tiling {}x{} / {}x{} / {}x{}",
                e.height, e.width, s.height, s.width, p.height, p.width
            )));
        }
        if e.output_channel != s.output_channel {
            return Err(PlanError::StageMismatch(format!(
                "expand has {} channel tiles, spatial has {}",
                e.output_channel, s.output_channel
            )));
        }
        for (what, reads, produced) in [
            ("body", self.spatial.body.input.channel, self.expand.body.output.channel),
            ("border", self.spatial.border.input.channel, self.expand.border.output.channel),
        ] {
            if reads != produced {
                return Err(PlanError::StageMismatch(format!(
                    "spatial {} tile reads {} channels, expand produces {}",
                    what, reads, produced
                )));
            }
        }
        if self.expand.body.input.channel != self.input.channel {
            return Err(PlanError::StageMismatch(format!(
                "expand reads {} channels, block input has {}",
                self.expand.body.input.channel, self.input.channel
            )));
        }

        let depth = (s.output_channel as u64 - 1) * self.spatial.body.output.channel as u64
            + self.spatial.border.output.channel as u64;
        if depth != self.project.body.input.channel as u64 {
            return Err(PlanError::StageMismatch(format!(
                "spatial produces {} channels, project reads {}",
                depth, self.project.body.input.channel
            )));
        }

        check_output_coverage(p, &self.project.body.output, &self.project.border.output, &self.output)
            .map_err(|e| e.in_stage(Stage::Project))?;

        // Expand input tiles carry the spatial kernel's halo
        check_halo(e, &self.expand.body.input, self.spatial.kernel.overlap(), &self.padding)
            .map_err(|e| e.in_stage(Stage::Expand))?;

        self.scratch_regions(group_width, 2)?;
        Ok(())
    }
}

/// Contents of a plan file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PlanFile {
    Layer(LayerPlan),
    Fused(FusedPlan),
}

impl PlanFile {
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse plan {}", path.display()))
    }

    pub fn name(&self) -> &str {
        match self {
            PlanFile::Layer(plan) => &plan.name,
            PlanFile::Fused(plan) => &plan.name,
        }
    }

    pub fn validate(&self, group_width: u32) -> Result<(), PlanError> {
        match self {
            PlanFile::Layer(plan) => plan.validate(group_width),
            PlanFile::Fused(plan) => plan.validate(group_width),
        }
    }
}
