//! tile-sched: run a tiling plan on the simulated accelerator

use std::env;

use anyhow::{bail, Context};
use tile_sched::config::Config;
use tile_sched::device::SimDevice;
use tile_sched::plan::{FusedPlan, LayerKind, LayerPlan, PlanFile};
use tile_sched::schedule::{
    FusedPipeline, LayerArgs, PaddingMask, PipelineOptions, RunSummary, SingleStagePipeline, Stage,
    TransferScheduler,
};
use tile_sched::testing;

/// Bulk memory layout of the simulated run.
const INPUT_BASE: u64 = 0x0100_0000;
const INPUT2_BASE: u64 = 0x0200_0000;
const WEIGHTS_BASE: u64 = 0x0300_0000;
const OUTPUT_BASE: u64 = 0x0400_0000;
const SCRATCHPAD_BASE: u64 = 0x0001_0000;
const DEFAULT_CAPACITY: u64 = 64 * 1024;

/// Bytes shown by `--dump`.
const DUMP_LIMIT: u64 = 256;

/// Bulk tensor sizes a plan needs.
struct Tensors {
    input: u64,
    input2: u64,
    params: u64,
    output: u64,
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--sample-config") {
        print!("{}", Config::sample_config());
        return Ok(());
    }
    if args.iter().any(|a| a == "--help" || a == "-h") || args.len() < 2 {
        print_usage();
        return Ok(());
    }

    // Parse options
    let mut show_events = false;
    let mut dump = false;
    let mut verify = false;
    let mut capacity = DEFAULT_CAPACITY;
    let mut padding = PaddingMask::default();
    let mut path = None;

    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--events" => show_events = true,
            "--dump" => dump = true,
            "--verify" => verify = true,
            "--no-top-pad" => padding.top = false,
            "--no-bottom-pad" => padding.bottom = false,
            "--capacity" => {
                let value = iter.next().context("--capacity needs a byte count")?;
                capacity = parse_size(value)?;
            }
            other if other.starts_with('-') => bail!("Unknown option: {}", other),
            other => path = Some(other),
        }
    }

    let Some(path) = path else {
        print_usage();
        return Ok(());
    };

    let plan = PlanFile::from_file(path)?;
    let options = PipelineOptions::from_config(Config::get());
    println!("Plan: {} ({})", plan.name(), path);
    println!(
        "Options: {} slots, handoff {}, alignment {}, group width {}",
        options.buffer_slots, options.handoff_capacity, options.dma_alignment, options.group_width
    );
    println!();

    let tensors = match &plan {
        PlanFile::Layer(layer) => layer_tensors(layer, options.group_width),
        PlanFile::Fused(fused) => fused_tensors(fused, options.group_width),
    };

    let device = SimDevice::new(SCRATCHPAD_BASE, capacity as usize);
    prepare_bulk(&device, &tensors)?;

    let layer_args = LayerArgs {
        input: INPUT_BASE,
        input2: INPUT2_BASE,
        weights: WEIGHTS_BASE,
        output: OUTPUT_BASE,
        scratchpad: SCRATCHPAD_BASE,
        capacity,
        padding,
    };

    let summary = run(&device, &plan, &layer_args, options)
        .with_context(|| format!("Plan '{}' failed", plan.name()))?;
    println!("Completed: {}", summary);

    let events = device.events().snapshot();
    if show_events {
        println!();
        println!("Events ({})", events.len());
        println!("==========");
        for (i, event) in events.iter().enumerate() {
            println!("{:5}  {}", i, event);
        }
    }

    if dump {
        println!();
        println!("Output (first {} bytes)", tensors.output.min(DUMP_LIMIT));
        print!(
            "{}",
            device
                .lock_bulk()
                .hexdump(OUTPUT_BASE, tensors.output.min(DUMP_LIMIT) as usize)
        );
    }

    if verify {
        println!();
        testing::check_coverage(&events, OUTPUT_BASE, tensors.output).context("Store coverage check failed")?;
        let unmatched = testing::unmatched_waits(&events);
        if !unmatched.is_empty() {
            bail!("{} waits without a matching start, first: {}", unmatched.len(), unmatched[0]);
        }
        if !testing::last_store_waited(&events) {
            bail!("Run returned before its last store was waited");
        }
        println!("Verified: every output byte stored exactly once, all waits matched");
    }

    Ok(())
}

fn run(device: &SimDevice, plan: &PlanFile, args: &LayerArgs, options: PipelineOptions) -> anyhow::Result<RunSummary> {
    let transfers = TransferScheduler::new(device.dma());
    let summary = match plan {
        PlanFile::Layer(layer) => {
            let compute = device.compute().with_element_bytes(layer.elements.output);
            SingleStagePipeline::new(layer, &transfers, &compute, options).run(args)?
        }
        PlanFile::Fused(fused) => {
            let compute = device.compute().with_element_bytes(fused.elements.output);
            FusedPipeline::new(fused, &transfers, &compute, options).run(args)?
        }
    };
    Ok(summary)
}

fn layer_tensors(plan: &LayerPlan, group_width: u32) -> Tensors {
    let sizes = plan.tile_bytes(group_width);
    let input = plan.shape.input.bytes(plan.elements.input);
    Tensors {
        input,
        input2: if plan.kind == LayerKind::Add { input } else { 0 },
        params: sizes.params_end(&plan.geometry(), &plan.param_offsets(&sizes)),
        output: plan.shape.output.bytes(plan.elements.output),
    }
}

fn fused_tensors(plan: &FusedPlan, group_width: u32) -> Tensors {
    let offsets = plan.param_offsets(group_width);
    let params = Stage::FUSED
        .iter()
        .zip(offsets.iter())
        .map(|(&stage, offsets)| {
            let stage_plan = plan.stage(stage);
            stage_plan
                .tile_bytes(plan.elements, group_width)
                .params_end(&stage_plan.geometry(), offsets)
        })
        .max()
        .unwrap_or(0);
    Tensors {
        input: plan.input.bytes(plan.elements.input),
        input2: 0,
        params,
        output: plan.output.bytes(plan.elements.output),
    }
}

/// Name the bulk regions and fill inputs and parameters with a pattern.
fn prepare_bulk(device: &SimDevice, tensors: &Tensors) -> anyhow::Result<()> {
    let mut bulk = device.lock_bulk();
    for (name, base, len, seed) in [
        ("input", INPUT_BASE, tensors.input, Some(0x11)),
        ("input2", INPUT2_BASE, tensors.input2, Some(0x22)),
        ("params", WEIGHTS_BASE, tensors.params, Some(0x33)),
        ("output", OUTPUT_BASE, tensors.output, None),
    ] {
        if len == 0 {
            continue;
        }
        bulk.allocate_region(name, base, len as usize)?;
        if let Some(seed) = seed {
            bulk.fill_pattern(base, len as usize, seed);
        }
    }
    Ok(())
}

/// Parse a byte count, decimal or 0x-prefixed hex, with an optional K suffix.
fn parse_size(value: &str) -> anyhow::Result<u64> {
    let (digits, scale) = match value.strip_suffix(['k', 'K']) {
        Some(digits) => (digits, 1024),
        None => (value, 1),
    };
    let parsed = match digits.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse(),
    }
    .with_context(|| format!("Invalid byte count: {}", value))?;
    Ok(parsed * scale)
}

fn print_usage() {
    println!("tile-sched: tile pipeline scheduler on a simulated NPU");
    println!();
    println!("Usage: tile-sched <plan.toml> [options]");
    println!();
    println!("Options:");
    println!("  --capacity <bytes>  Scratchpad bytes for the layer (default {})", DEFAULT_CAPACITY);
    println!("  --no-top-pad        Tile is not at the image top: skip top padding");
    println!("  --no-bottom-pad     Tile is not at the image bottom: skip bottom padding");
    println!("  --events            Print every transfer and compute call");
    println!("  --dump              Hexdump the start of the output tensor");
    println!("  --verify            Check store coverage and wait ordering");
    println!("  --sample-config     Print a sample configuration file");
    println!();
    if let Some(path) = Config::user_config_path() {
        println!("User config: {}", path.display());
    }
}
