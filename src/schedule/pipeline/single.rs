//! Single-stage tile loop with double-buffered prefetch.
//!
//! ```text
//!   loads   │ L0 │ L1 │    │ L2 │    │ L3 │
//!   compute │    │ C0 ───│ C1 ───│ C2 ───│ C3 ───│
//!   stores  │    │       │ S0    │ S1    │ S2    │ S3 (waited)
//! ```
//!
//! While tile `i` computes, tile `i+1`'s loads are already in flight into the
//! other buffer slot. The store of tile `i` is issued once its job is done
//! and is only waited when tile `i + slots` needs the same output slot, or
//! at the end of the run.

use crate::error::ScheduleError;
use crate::plan::{LayerPlan, PlanError};
use crate::schedule::buffer::BufferAllocator;
use crate::schedule::compute::ComputeEngine;
use crate::schedule::role::{Role, Stage};
use crate::schedule::status::StatusRules;
use crate::schedule::transfer::{TransferEngine, TransferHandle, TransferScheduler};

use super::{LayerArgs, PipelineOptions, RunSummary, StageSchedule};

/// Runs one [`LayerPlan`] tile by tile.
pub struct SingleStagePipeline<'a, E, C> {
    plan: &'a LayerPlan,
    transfers: &'a TransferScheduler<E>,
    compute: &'a C,
    options: PipelineOptions,
}

impl<'a, E: TransferEngine, C: ComputeEngine> SingleStagePipeline<'a, E, C> {
    pub fn new(
        plan: &'a LayerPlan,
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

    /// Validate the plan, lay out the scratchpad and build the schedule.
    fn setup(&self, args: &LayerArgs) -> Result<(StageSchedule, BufferAllocator), ScheduleError> {
        let slots = self.options.buffer_slots;
        if slots < 2 {
            return Err(PlanError::TooFewSlots(slots).into());
        }
        self.plan.validate(self.options.group_width)?;

        let sizes = self.plan.tile_bytes(self.options.group_width);
        let geometry = self.plan.geometry();
        let allocator = match self.plan.scratch_regions(&sizes, slots)? {
            Some(regions) => BufferAllocator::with_offsets(args.scratchpad, args.capacity, regions)?,
            None => BufferAllocator::new(
                args.scratchpad,
                args.capacity,
                self.options.dma_alignment,
                &self.plan.region_requests(&sizes, slots),
            )?,
        };

        let kernel = self.plan.kernel();
        let bulk = StageSchedule::bulk_bases(args, &self.plan.param_offsets(&sizes));
        let schedule = StageSchedule {
            stage: Stage::Single,
            kernel,
            geometry,
            rules: StatusRules::new(
                self.plan.sequencer(),
                bulk,
                sizes.present(&geometry),
                geometry.channels_follow_output(),
                slots,
            ),
            sizes,
            input_tensor: self.plan.shape.input,
            output_tensor: self.plan.shape.output,
            bulk,
            overlap: kernel.overlap(),
            padding: self.plan.shape.padding.masked(args.padding),
        };
        Ok((schedule, allocator))
    }

    /// Execute every tile. Returns once the last store has completed.
    pub fn run(&self, args: &LayerArgs) -> Result<RunSummary, ScheduleError> {
        let (schedule, allocator) = self.setup(args)?;
        let total = schedule.rules.sequencer().total();
        let start = self.transfers.stats();

        log::info!(
            "Layer '{}': {} tiles ({}x{}x{}) of {}, {} scratchpad bytes",
            self.plan.name,
            total,
            self.plan.counts.height,
            self.plan.counts.width,
            self.plan.counts.output_channel,
            self.plan.body.output,
            allocator.used()
        );

        let mut status = schedule.rules.first();
        let mut tile = schedule.tile(&status, &allocator);
        let mut loads = schedule.issue_loads(self.transfers, &tile, &mut status)?;
        let mut pending: Vec<Option<TransferHandle>> = vec![None; self.options.buffer_slots as usize];
        let mut last_slot = 0usize;

        for i in 0..total {
            let next = if i + 1 < total {
                let mut next_status = schedule.rules.next(&status);
                let next_tile = schedule.tile(&next_status, &allocator);
                let next_loads = schedule.issue_loads(self.transfers, &next_tile, &mut next_status)?;
                Some((next_status, next_tile, next_loads))
            } else {
                None
            };

            let job = self.compute.prepare(&tile, Stage::Single, &schedule.kernel)?;
            self.transfers.wait_all(std::mem::take(&mut loads))?;

            let slot = status.slot(Role::Output) as usize;
            if let Some(handle) = pending[slot].take() {
                self.transfers.wait(handle)?;
            }

            let handle = self.compute.run_async(&job)?;
            let store = schedule.store(&tile)?;
            self.compute.wait(handle)?;
            pending[slot] = Some(self.transfers.start_store(&store)?);
            last_slot = slot;
            log::debug!("Tile {} ({}) stored from slot {}", tile.index, tile.shape.output, slot);

            if let Some((next_status, next_tile, next_loads)) = next {
                status = next_status;
                tile = next_tile;
                loads = next_loads;
            }
        }

        // Oldest first, so the last store issued is the last one waited
        let slots = pending.len();
        for k in 1..=slots {
            if let Some(handle) = pending[(last_slot + k) % slots].take() {
                self.transfers.wait(handle)?;
            }
        }

        let stats = self.transfers.stats().since(&start);
        log::debug!("Layer '{}' transfers: {:?}", self.plan.name, stats);
        let summary = RunSummary::new(total, stats, allocator.used());
        log::info!("Layer '{}' done: {}", self.plan.name, summary);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{tile_marker, DmaFault, Event, SimDevice};
    use crate::plan::tests::conv3x3;
    use crate::plan::LayerKind;
    use crate::schedule::buffer::AllocError;
    use crate::schedule::compute::ComputeError;
    use crate::schedule::geometry::{Dims, Kernel, LayerShape, Padding, PaddingMask};
    use crate::schedule::index::{LoopOrder, TileIndex};
    use crate::schedule::transfer::{Direction, TransferError};
    use crate::testing;

    const INPUT: u64 = 0x10_0000;
    const INPUT2: u64 = 0x20_0000;
    const WEIGHTS: u64 = 0x30_0000;
    const OUTPUT: u64 = 0x40_0000;

    fn args(capacity: u64) -> LayerArgs {
        LayerArgs {
            input: INPUT,
            input2: INPUT2,
            weights: WEIGHTS,
            output: OUTPUT,
            scratchpad: 0,
            capacity,
            padding: PaddingMask::default(),
        }
    }

    fn run_on(device: &SimDevice, plan: &LayerPlan, capacity: u64) -> Result<RunSummary, ScheduleError> {
        let transfers = TransferScheduler::new(device.dma());
        let compute = device.compute();
        SingleStagePipeline::new(plan, &transfers, &compute, PipelineOptions::default()).run(&args(capacity))
    }

    fn pointwise(output: Dims, tile: Dims) -> LayerPlan {
        let shape = LayerShape {
            input: Dims::new(output.height, output.width, 3),
            output,
            kernel: Kernel::pointwise(),
            padding: Padding::NONE,
        };
        let mut plan = LayerPlan::split("pw", LayerKind::Conv, shape, tile).unwrap();
        plan.weights.bytes_per_channel = 3;
        plan
    }

    #[test]
    fn test_stores_cover_output_once_with_border_tiles() {
        let device = SimDevice::new(0, 4096);
        let plan = pointwise(Dims::new(10, 7, 16), Dims::new(4, 3, 8));
        let summary = run_on(&device, &plan, 4096).unwrap();

        assert_eq!(summary.tiles, 18);
        assert_eq!(summary.stores, 18);
        assert_eq!(summary.bytes_stored, 10 * 7 * 16);

        let events = device.events().snapshot();
        testing::check_coverage(&events, OUTPUT, 10 * 7 * 16).unwrap();
        assert!(testing::unmatched_waits(&events).is_empty());
    }

    #[test]
    fn test_single_tile_layer() {
        let device = SimDevice::new(0, 1024);
        let plan = pointwise(Dims::new(2, 2, 4), Dims::new(4, 4, 8));
        assert_eq!(plan.total_tiles(), 1);

        let summary = run_on(&device, &plan, 1024).unwrap();
        assert_eq!(summary.stores, 1);

        let events = device.events().snapshot();
        testing::check_coverage(&events, OUTPUT, 2 * 2 * 4).unwrap();
        assert!(testing::last_store_waited(&events));
    }

    #[test]
    fn test_prefetch_order_2x2() {
        let device = SimDevice::new(0, 4096);
        let plan = conv3x3();
        run_on(&device, &plan, 4096).unwrap();

        let events = device.events().snapshot();
        // Tile i+1's input is issued before tile i computes
        assert_eq!(testing::loads_before_compute(&events, Role::Input), vec![2, 3, 4, 4]);
        // Weights stay resident: one load for the whole layer
        assert_eq!(testing::loads_before_compute(&events, Role::Weights), vec![1, 1, 1, 1]);

        let stores = events
            .iter()
            .filter(|e| matches!(e, Event::TransferStart { desc, .. } if desc.direction == Direction::Store))
            .count();
        assert_eq!(stores, 4);
        assert!(testing::last_store_waited(&events));
        testing::check_coverage(&events, OUTPUT, 8 * 8 * 8).unwrap();
    }

    #[test]
    fn test_output_carries_tile_markers() {
        let device = SimDevice::new(0, 4096);
        let plan = conv3x3();
        run_on(&device, &plan, 4096).unwrap();

        let bulk = device.lock_bulk();
        for h in 0..8u64 {
            for w in 0..8u64 {
                let mut pixel = [0u8; 8];
                bulk.peek_bytes(OUTPUT + (h * 8 + w) * 8, &mut pixel);
                let marker = tile_marker(Stage::Single, TileIndex::new(h as u32 / 4, w as u32 / 4, 0));
                assert_eq!(pixel, [marker; 8], "pixel ({}, {})", h, w);
            }
        }
    }

    #[test]
    fn test_input_halo_addresses() {
        let device = SimDevice::new(0, 4096);
        run_on(&device, &conv3x3(), 4096).unwrap();

        let inputs: Vec<u64> = device
            .events()
            .snapshot()
            .iter()
            .filter_map(|e| match e {
                Event::TransferStart { desc, .. } if desc.role == Role::Input => Some(desc.bulk),
                _ => None,
            })
            .collect();
        // Tiles start at pixel 0 or at 4 - 1 (overlap 2, padding 1) along each axis
        let row = 8 * 4;
        assert_eq!(inputs, vec![INPUT, INPUT + 3 * 4, INPUT + 3 * row, INPUT + 3 * row + 3 * 4]);
    }

    #[test]
    fn test_reverse_order_reloads_weights_per_spatial_tile() {
        let device = SimDevice::new(0, 4096);
        let mut plan = pointwise(Dims::new(4, 4, 16), Dims::new(2, 4, 8));
        plan.loop_order = LoopOrder::Reverse;
        run_on(&device, &plan, 4096).unwrap();

        let events = device.events().snapshot();
        let weights: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                Event::TransferStart { desc, .. } if desc.role == Role::Weights => Some(desc.bulk),
                _ => None,
            })
            .collect();
        let tile = 8 * 3;
        assert_eq!(weights, vec![WEIGHTS, WEIGHTS + tile, WEIGHTS, WEIGHTS + tile]);
        assert_eq!(testing::loads_before_compute(&events, Role::Input), vec![1, 2, 2, 2]);
        testing::check_coverage(&events, OUTPUT, 4 * 4 * 16).unwrap();
    }

    #[test]
    fn test_add_layer_loads_both_inputs() {
        let device = SimDevice::new(0, 1024);
        let shape = LayerShape {
            input: Dims::new(4, 4, 8),
            output: Dims::new(4, 4, 8),
            kernel: Kernel::pointwise(),
            padding: Padding::NONE,
        };
        let plan = LayerPlan::split("add", LayerKind::Add, shape, Dims::new(2, 4, 8)).unwrap();
        let summary = run_on(&device, &plan, 1024).unwrap();

        let events = device.events().snapshot();
        let roles: Vec<Role> = events
            .iter()
            .filter_map(|e| match e {
                Event::TransferStart { desc, .. } if desc.direction == Direction::Load => Some(desc.role),
                _ => None,
            })
            .collect();
        assert_eq!(roles, vec![Role::Input, Role::Input2, Role::Input, Role::Input2]);
        assert_eq!(summary.loads, 4);
        testing::check_coverage(&events, OUTPUT, 4 * 4 * 8).unwrap();
    }

    #[test]
    fn test_output_slot_waited_before_reuse() {
        for slots in [2u8, 3] {
            let device = SimDevice::new(0, 8192);
            let transfers = TransferScheduler::new(device.dma());
            let compute = device.compute();
            let plan = pointwise(Dims::new(10, 7, 16), Dims::new(4, 3, 8));
            let options = PipelineOptions {
                buffer_slots: slots,
                ..PipelineOptions::default()
            };
            SingleStagePipeline::new(&plan, &transfers, &compute, options)
                .run(&args(8192))
                .unwrap();

            let events = device.events().snapshot();
            let early = testing::slot_reuse_violations(&events, Stage::Single, slots as usize);
            assert!(early.is_empty(), "{} slots: tiles {:?} reused an unwaited slot", slots, early);
            let in_flight = testing::max_in_flight(&events, Stage::Single);
            assert!(in_flight >= 2 && in_flight <= slots as usize, "{} slots: {} in flight", slots, in_flight);
            testing::check_coverage(&events, OUTPUT, 10 * 7 * 16).unwrap();
        }
    }

    #[test]
    fn test_input_channel_tiling_rejected_before_execution() {
        let device = SimDevice::new(0, 4096);
        let shape = LayerShape {
            input: Dims::new(4, 4, 8),
            output: Dims::new(4, 4, 4),
            kernel: Kernel::pointwise(),
            padding: Padding::NONE,
        };
        let mut plan = LayerPlan::split("ic", LayerKind::Conv, shape, Dims::new(4, 4, 4)).unwrap();
        plan.counts.input_channel = 2;
        plan.body.input.channel = 4;
        plan.border.input.channel = 4;

        let err = run_on(&device, &plan, 4096).unwrap_err();
        assert!(matches!(err, ScheduleError::Plan(PlanError::InputChannelTiling(2))));
        assert!(device.events().is_empty());
    }

    #[test]
    fn test_planner_scratch_layout_used() {
        let device = SimDevice::new(0, 4096);
        let mut plan = conv3x3();
        plan.scratch = Some(crate::plan::tests::conv3x3_layout());
        run_on(&device, &plan, 4096).unwrap();

        let events = device.events().snapshot();
        let first = |role: Role| {
            events.iter().find_map(|e| match e {
                Event::TransferStart { desc, .. } if desc.role == role => Some(desc.scratch),
                _ => None,
            })
        };
        assert_eq!(first(Role::Input), Some(960));
        assert_eq!(first(Role::Weights), Some(384));
        assert_eq!(first(Role::Output), Some(0));
        testing::check_coverage(&events, OUTPUT, 8 * 8 * 8).unwrap();
    }

    #[test]
    fn test_planner_scratch_layout_checked_against_capacity() {
        let device = SimDevice::new(0, 4096);
        let mut plan = conv3x3();
        plan.scratch = Some(crate::plan::tests::conv3x3_layout());
        let err = run_on(&device, &plan, 1024).unwrap_err();
        assert!(matches!(err, ScheduleError::Alloc(AllocError::CapacityExceeded { .. })));
        assert!(device.events().is_empty());
    }

    #[test]
    fn test_store_failure_aborts_run() {
        let device = SimDevice::new(0, 4096);
        let transfers = TransferScheduler::new(device.dma().with_fault(DmaFault {
            direction: Direction::Store,
            nth: 1,
        }));
        let compute = device.compute();
        let plan = conv3x3();
        let err = SingleStagePipeline::new(&plan, &transfers, &compute, PipelineOptions::default())
            .run(&args(4096))
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Transfer(TransferError::Rejected { .. })));
    }

    #[test]
    fn test_compute_failure_aborts_run() {
        let device = SimDevice::new(0, 4096);
        let transfers = TransferScheduler::new(device.dma());
        let compute = device.compute().with_failing_job(2);
        let plan = conv3x3();
        let err = SingleStagePipeline::new(&plan, &transfers, &compute, PipelineOptions::default())
            .run(&args(4096))
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Compute(ComputeError::Failed { .. })));
        // Tiles 0 and 1 were stored before the failure
        assert_eq!(transfers.stats().stores, 2);
    }

    #[test]
    fn test_capacity_error_before_any_transfer() {
        let device = SimDevice::new(0, 4096);
        let err = run_on(&device, &conv3x3(), 256).unwrap_err();
        assert!(matches!(err, ScheduleError::Alloc(AllocError::CapacityExceeded { .. })));
        assert!(device.events().is_empty());
    }

    #[test]
    fn test_single_slot_rejected() {
        let device = SimDevice::new(0, 4096);
        let transfers = TransferScheduler::new(device.dma());
        let compute = device.compute();
        let plan = conv3x3();
        let options = PipelineOptions {
            buffer_slots: 1,
            ..PipelineOptions::default()
        };
        let err = SingleStagePipeline::new(&plan, &transfers, &compute, options)
            .run(&args(4096))
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Plan(PlanError::TooFewSlots(1))));
        assert!(device.events().is_empty());
    }
}
