//! Fused expand -> spatial -> project pipeline.
//!
//! Two execution contexts share one transfer scheduler and one compute
//! engine:
//!
//! ```text
//!  producer                                           consumer
//!  ────────                                           ────────
//!  for each spatial tile (h, w):
//!    load input
//!    for each expand channel tile j:
//!      expand j  ──► expand out (single buffer)
//!      spatial j ──► spatial out[:, :, j]   (full depth)
//!    for each project channel tile k:
//!      produce_begin ─┐                   ┌─► consume_begin
//!      project k      │  bounded handoff  │   wait job
//!      produce_end ───┴──(job, store)─────┘   store + wait
//!                                             consume_end
//! ```
//!
//! The handoff capacity bounds the project results in flight, and the
//! handoff slot picks the project output buffer. Jobs run in issue order on
//! the compute engine, so the next spatial tile's jobs never overtake the
//! project jobs still reading the spatial output.

use crate::error::ScheduleError;
use crate::plan::{FusedPlan, ParamOffsets, PlanError};
use crate::schedule::buffer::{AllocError, BufferAllocator};
use crate::schedule::compute::{ComputeEngine, JobHandle};
use crate::schedule::geometry::Padding;
use crate::schedule::handoff::{HandoffConsumer, HandoffProducer, StageHandoff};
use crate::schedule::index::{LoopOrder, TileIndex, TileIndexSequencer};
use crate::schedule::role::{Role, Stage};
use crate::schedule::status::{StatusRules, Tile, TileStatus};
use crate::schedule::transfer::{TransferDescriptor, TransferEngine, TransferScheduler};

use super::{LayerArgs, PipelineOptions, RunSummary, StageSchedule};

/// One project result passed from producer to consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffItem {
    /// Project job writing the result
    pub job: JobHandle,
    /// Store of the result, from the handoff slot's output buffer
    pub store: TransferDescriptor,
    pub index: TileIndex,
}

/// Per-run state shared by both contexts.
struct FusedSchedule {
    expand: StageSchedule,
    spatial: StageSchedule,
    project: StageSchedule,
    allocator: BufferAllocator,
    expand_output: u64,
    spatial_output: u64,
    /// Bytes per spatial channel tile inside the spatial output
    spatial_slice: u64,
    /// Channels per pixel of the spatial output
    spatial_pitch: u32,
}

impl FusedSchedule {
    fn expand_tile(&self, status: &TileStatus) -> Tile {
        self.expand.tile(status, &self.allocator)
    }

    fn spatial_tile(&self, status: &TileStatus) -> Tile {
        let mut tile = self.spatial.tile(status, &self.allocator);
        tile.addr[Role::Input] = Some(self.expand_output);
        tile.addr[Role::Output] = Some(self.spatial_output + status.index.output_channel as u64 * self.spatial_slice);
        tile
    }

    fn project_tile(&self, status: &TileStatus, slot: usize) -> Result<Tile, AllocError> {
        let mut tile = self.project.tile(status, &self.allocator);
        tile.addr[Role::Input] = Some(self.spatial_output);
        tile.addr[Role::Output] = Some(self.allocator.offset((Stage::Project, Role::Output), slot as u8)?);
        Ok(tile)
    }
}

/// Runs one [`FusedPlan`] on a producer and a consumer context.
pub struct FusedPipeline<'a, E, C> {
    plan: &'a FusedPlan,
    transfers: &'a TransferScheduler<E>,
    compute: &'a C,
    options: PipelineOptions,
}

impl<'a, E: TransferEngine, C: ComputeEngine> FusedPipeline<'a, E, C> {
    pub fn new(
        plan: &'a FusedPlan,
        transfers: &'a TransferScheduler<E>,
        compute: &'a C,
        options: PipelineOptions,
    ) -> Self {
        Self {
            plan,
            transfers,
            compute,
            options,
        }
    }

    fn stage_schedule(&self, stage: Stage, args: &LayerArgs, offsets: &ParamOffsets) -> StageSchedule {
        let plan = self.plan.stage(stage);
        let sizes = plan.tile_bytes(self.plan.elements, self.options.group_width);
        let geometry = plan.geometry();
        let bulk = StageSchedule::bulk_bases(args, offsets);

        // Only the expand stage reads its input from bulk memory
        let mut active = sizes.present(&geometry);
        active[Role::Input] = stage == Stage::Expand;
        let rules = StatusRules::new(
            TileIndexSequencer::new(plan.counts, LoopOrder::Reverse),
            bulk,
            active,
            geometry.channels_follow_output(),
            self.options.buffer_slots,
        );

        // Expand input tiles carry the spatial kernel's halo
        let (input_tensor, overlap, padding) = match stage {
            Stage::Expand => (
                self.plan.input,
                self.plan.spatial.kernel.overlap(),
                self.plan.padding.masked(args.padding),
            ),
            _ => (geometry.max_input(), plan.kernel.overlap(), Padding::NONE),
        };
        let output_tensor = match stage {
            Stage::Project => self.plan.output,
            _ => geometry.max_output(),
        };

        StageSchedule {
            stage,
            kernel: plan.kernel,
            geometry,
            rules,
            sizes,
            input_tensor,
            output_tensor,
            bulk,
            overlap,
            padding,
        }
    }

    fn setup(&self, args: &LayerArgs) -> Result<(FusedSchedule, HandoffProducer<HandoffItem>, HandoffConsumer<HandoffItem>), ScheduleError> {
        let slots = self.options.buffer_slots;
        if slots < 2 {
            return Err(PlanError::TooFewSlots(slots).into());
        }
        self.plan.validate(self.options.group_width)?;

        let (producer, consumer) = StageHandoff::new(self.options.handoff_capacity)?;
        if producer.capacity() > slots as usize {
            return Err(PlanError::HandoffExceedsSlots {
                capacity: producer.capacity(),
                slots,
            }
            .into());
        }

        let group_width = self.options.group_width;
        let allocator = match self.plan.scratch_regions(group_width, slots)? {
            Some(regions) => BufferAllocator::with_offsets(args.scratchpad, args.capacity, regions)?,
            None => BufferAllocator::new(
                args.scratchpad,
                args.capacity,
                self.options.dma_alignment,
                &self.plan.region_requests(group_width, slots),
            )?,
        };
        let expand_output = allocator.offset((Stage::Expand, Role::Output), 0)?;
        let spatial_output = allocator.offset((Stage::Spatial, Role::Output), 0)?;

        let [expand, spatial, project] = self.plan.param_offsets(self.options.group_width);
        let schedule = FusedSchedule {
            expand: self.stage_schedule(Stage::Expand, args, &expand),
            spatial: self.stage_schedule(Stage::Spatial, args, &spatial),
            project: self.stage_schedule(Stage::Project, args, &project),
            allocator,
            expand_output,
            spatial_output,
            spatial_slice: self.plan.spatial.body.output.channel as u64 * self.plan.elements.output as u64,
            spatial_pitch: self.plan.project.body.input.channel,
        };
        Ok((schedule, producer, consumer))
    }

    /// Execute the block. Returns once every project result is stored.
    pub fn run(&self, args: &LayerArgs) -> Result<RunSummary, ScheduleError> {
        let (schedule, producer, consumer) = self.setup(args)?;
        let items = self.plan.total_items();
        let start = self.transfers.stats();

        log::info!(
            "Block '{}': {} spatial tiles, {} results, handoff capacity {}, {} scratchpad bytes",
            self.plan.name,
            self.plan.spatial_tiles(),
            items,
            producer.capacity(),
            schedule.allocator.used()
        );

        let schedule = &schedule;
        let (produced, consumed) = std::thread::scope(|s| {
            let producing = s.spawn(move || self.produce(schedule, producer));
            let consuming = s.spawn(move || self.consume(consumer, items));
            (producing.join(), consuming.join())
        });

        let produced = produced.unwrap_or(Err(ScheduleError::ContextPanicked("producer")));
        let consumed = consumed.unwrap_or(Err(ScheduleError::ContextPanicked("consumer")));
        match (produced, consumed) {
            (Ok(_), Ok(())) => {}
            (Err(e), Ok(())) | (Ok(_), Err(e)) => return Err(e),
            (Err(p), Err(c)) => return Err(if p.is_disconnect() { c } else { p }),
        }

        let stats = self.transfers.stats().since(&start);
        log::debug!("Block '{}' transfers: {:?}", self.plan.name, stats);
        let summary = RunSummary::new(items, stats, schedule.allocator.used());
        log::info!("Block '{}' done: {}", self.plan.name, summary);
        Ok(summary)
    }

    /// Producer context: every compute job, every load.
    fn produce(&self, schedule: &FusedSchedule, handoff: HandoffProducer<HandoffItem>) -> Result<u64, ScheduleError> {
        let (expand, spatial, project) = (&schedule.expand, &schedule.spatial, &schedule.project);
        let expand_tiles = self.plan.expand.counts.output_channel;
        let project_tiles = self.plan.project.counts.output_channel;

        let mut es = expand.rules.first();
        let mut ss = spatial.rules.first();
        let mut ps = project.rules.first();
        let mut produced = 0u64;

        for _ in 0..self.plan.spatial_tiles() {
            let mut input = expand.issue_activations(self.transfers, &schedule.expand_tile(&es), &es)?;
            let mut last_spatial: Option<JobHandle> = None;

            for _ in 0..expand_tiles {
                let tile = schedule.expand_tile(&es);
                let params = expand.issue_params(self.transfers, &tile, &mut es)?;
                let job = self.compute.prepare(&tile, Stage::Expand, &expand.kernel)?;
                self.transfers.wait_all(std::mem::take(&mut input))?;
                self.transfers.wait_all(params)?;
                // The expand output is a single buffer still read by the last spatial job
                if let Some(handle) = last_spatial.take() {
                    self.compute.wait(handle)?;
                }
                let expanded = self.compute.run_async(&job)?;
                es = expand.rules.next(&es);

                let tile = schedule.spatial_tile(&ss);
                let params = spatial.issue_params(self.transfers, &tile, &mut ss)?;
                let job = self
                    .compute
                    .prepare(&tile, Stage::Spatial, &spatial.kernel)?
                    .with_output_pitch(schedule.spatial_pitch);
                self.transfers.wait_all(params)?;
                self.compute.wait(expanded)?;
                last_spatial = Some(self.compute.run_async(&job)?);
                ss = spatial.rules.next(&ss);
            }

            if let Some(handle) = last_spatial {
                self.compute.wait(handle)?;
            }

            for _ in 0..project_tiles {
                let slot = handoff.produce_begin()?;
                let tile = schedule.project_tile(&ps, slot)?;
                let params = project.issue_params(self.transfers, &tile, &mut ps)?;
                let job = self.compute.prepare(&tile, Stage::Project, &project.kernel)?;
                self.transfers.wait_all(params)?;
                let handle = self.compute.run_async(&job)?;
                let item = HandoffItem {
                    job: handle,
                    store: project.store(&tile)?,
                    index: tile.index,
                };
                handoff.produce_end(slot, item)?;
                log::debug!("Result {} handed off in slot {}", tile.index, slot);
                ps = project.rules.next(&ps);
                produced += 1;
            }
        }
        Ok(produced)
    }

    /// Consumer context: waits each result and stores it.
    fn consume(&self, handoff: HandoffConsumer<HandoffItem>, items: u64) -> Result<(), ScheduleError> {
        for _ in 0..items {
            let (slot, item) = handoff.consume_begin()?;
            self.compute.wait(item.job)?;
            let handle = self.transfers.start_store(&item.store)?;
            self.transfers.wait(handle)?;
            handoff.consume_end(slot)?;
            log::debug!("Result {} stored from slot {}", item.index, slot);
        }
        Ok(())
    }
}
