//! `dla`: diagnostics for the FPGA deep-learning accelerator.
//!
//! ```text
//! USAGE:
//!   dla enumerate                    List accelerator and stream-controller UIO nodes
//!   dla info                         Instances, license, clocks, identity ROM
//!   dla counters [-i N]              Telemetry counters since open
//!   dla debug-network [-i N]         Walk the debug network
//!   dla memtest                      External-memory pattern test (destructive)
//!   dla scheduler                    Initialize the stream controller, print its status
//!
//! Global: --sim [--sim-instances N] for the simulated board,
//!         --board-index N --board agx7|agx5|generic for UIO hardware
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dla_driver::backends::uio::{list_uio_devices, COREDLA_PREFIX, STREAM_CONTROLLER_PREFIX};
use dla_driver::backends::{SimConfig, UioConfig};
use dla_driver::chip::board::HpsBoard;
use dla_driver::{open_transport, Device, DeviceConfig, TransportSelection};
use std::path::Path;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dla", about = "FPGA deep-learning accelerator diagnostics", version)]
struct Cli {
    /// Use the simulated board instead of UIO hardware.
    #[arg(long, global = true)]
    sim: bool,

    /// Instances present on the simulated board.
    #[arg(long, global = true, default_value_t = 1)]
    sim_instances: usize,

    /// Board number (the N in /dev/msgdma_coredlaN).
    #[arg(long, global = true, default_value_t = 0)]
    board_index: u32,

    /// Board variant, for memory size and clocks.
    #[arg(long, global = true, value_enum, default_value_t = BoardArg::Generic)]
    board: BoardArg,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Clone, Copy, ValueEnum)]
enum BoardArg {
    Agx7,
    Agx5,
    Generic,
}

impl From<BoardArg> for HpsBoard {
    fn from(arg: BoardArg) -> Self {
        match arg {
            BoardArg::Agx7 => Self::Agx7,
            BoardArg::Agx5 => Self::Agx5,
            BoardArg::Generic => Self::Generic,
        }
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// List accelerator and stream-controller UIO nodes.
    Enumerate,
    /// Print instances, license, clocks and identity ROM.
    Info,
    /// Print telemetry counters accumulated since open.
    Counters {
        /// Instance to query.
        #[arg(short, long, default_value_t = 0)]
        instance: usize,
        /// Jobs run since open, for the per-job average.
        #[arg(long, default_value_t = 0)]
        jobs: u64,
    },
    /// Walk the debug network and print every counter.
    DebugNetwork {
        /// Instance to query.
        #[arg(short, long, default_value_t = 0)]
        instance: usize,
    },
    /// Write a pattern over external memory and verify it (destroys its contents).
    Memtest,
    /// Initialize the stream controller and print its status.
    Scheduler {
        /// Bytes per source buffer.
        #[arg(long, default_value_t = 0x10000)]
        source_buffer_size: u32,
        /// Drop source buffers instead of back-pressuring.
        #[arg(long)]
        drop_source_buffers: bool,
        /// Inference requests the controller keeps in flight.
        #[arg(long, default_value_t = 1)]
        requests: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Cmd::Enumerate => cmd_enumerate(&cli)?,
        Cmd::Info => cmd_info(&open_device(&cli)?)?,
        Cmd::Counters { instance, jobs } => cmd_counters(&open_device(&cli)?, *instance, *jobs)?,
        Cmd::DebugNetwork { instance } => cmd_debug_network(&open_device(&cli)?, *instance)?,
        Cmd::Memtest => cmd_memtest(&open_device(&cli)?)?,
        Cmd::Scheduler {
            source_buffer_size,
            drop_source_buffers,
            requests,
        } => cmd_scheduler(
            &open_device(&cli)?,
            *source_buffer_size,
            *drop_source_buffers,
            *requests,
        )?,
    }

    Ok(())
}

fn open_device(cli: &Cli) -> Result<Device> {
    let selection = if cli.sim {
        TransportSelection::Simulated(SimConfig::default().with_instances(cli.sim_instances))
    } else {
        TransportSelection::Uio(UioConfig {
            board_index: cli.board_index,
            board: cli.board.into(),
            ..UioConfig::default()
        })
    };
    let transport = open_transport(selection).context("opening transport")?;
    Device::open(transport, DeviceConfig::from_env()).context("opening device")
}

fn cmd_enumerate(cli: &Cli) -> Result<()> {
    if cli.sim {
        println!("Simulated board: {} instance(s)", cli.sim_instances);
        return Ok(());
    }

    let sysfs = Path::new("/sys/class/uio");
    let accelerators = list_uio_devices(sysfs, COREDLA_PREFIX);
    let controllers = list_uio_devices(sysfs, STREAM_CONTROLLER_PREFIX);

    println!("Accelerator UIO nodes: {}", accelerators.len());
    for node in &accelerators {
        let name = std::fs::read_to_string(sysfs.join(node).join("name")).unwrap_or_default();
        println!("  {node}  {}", name.trim());
    }
    println!("Stream controller UIO nodes: {}", controllers.len());
    for node in &controllers {
        let name = std::fs::read_to_string(sysfs.join(node).join("name")).unwrap_or_default();
        println!("  {node}  {}", name.trim());
    }

    Ok(())
}

fn cmd_info(device: &Device) -> Result<()> {
    let transport = device.transport();
    println!("Transport        : {}", transport.transport_type());
    println!("Instances        : {} of {}", device.num_instances(), transport.max_instances());
    println!("Completion       : {}", device.completion_mode());
    println!("Licensed         : {}", device.is_licensed());
    println!("Core clock       : {:.1} MHz", device.core_clock_mhz());
    println!("Counter clock    : {:.1} MHz", transport.ddr_clock_mhz());
    println!("DDR per instance : {} MB", transport.ddr_size_per_instance() >> 20);
    println!("Descriptor queue : {} jobs", device.descriptor_queue_size());

    for instance in 0..device.num_instances() {
        let id = device.identity(instance)?;
        println!();
        println!("[{instance}] {}", id.arch_name);
        println!("    build   {}", id.build_version);
        println!("    hash    {}", id.arch_hash);
    }

    Ok(())
}

fn cmd_counters(device: &Device, instance: usize, jobs: u64) -> Result<()> {
    println!("Inferences completed   : {}", device.num_inferences_completed(instance)?);
    println!("Active time            : {:.3} ms", device.active_hw_time_ms(instance)?);
    if jobs > 0 {
        println!(
            "Average per job        : {:.3} ms",
            device.avg_hw_time_per_job_ms(jobs, instance)?
        );
    }
    println!("Input feature reads    : {}", device.num_input_feature_memory_reads(instance)?);
    println!("Filter reads           : {}", device.num_filter_memory_reads(instance)?);
    println!("Output feature writes  : {}", device.num_output_feature_memory_writes(instance)?);
    Ok(())
}

fn cmd_debug_network(device: &Device, instance: usize) -> Result<()> {
    let data = device.read_debug_network(instance)?;
    if data.is_empty() {
        println!("No debug-network modules answered");
        return Ok(());
    }
    let width = data.keys().map(String::len).max().unwrap_or(0);
    for (name, value) in &data {
        println!("{name:<width$}  {value}");
    }
    Ok(())
}

fn cmd_memtest(device: &Device) -> Result<()> {
    let report = device.run_memory_test()?;
    println!(
        "Tested {} instance(s), {} MB each: {} mismatches",
        report.instances,
        report.bytes_per_instance >> 20,
        report.mismatches
    );
    if !report.passed() {
        bail!("memory test failed with {} mismatches", report.mismatches);
    }
    Ok(())
}

fn cmd_scheduler(
    device: &Device,
    source_buffer_size: u32,
    drop_source_buffers: bool,
    requests: u32,
) -> Result<()> {
    if !device.initialize_scheduler(source_buffer_size, drop_source_buffers, requests)? {
        bail!("stream controller not available");
    }
    match device.scheduler_status()? {
        Some(status) => println!("status,line,received,scheduled,executed\n{status}"),
        None => println!("Stream controller busy or not answering"),
    }
    Ok(())
}
