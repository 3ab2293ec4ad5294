//! Integration tests for the device lifecycle against the simulated board
//!
//! These drive the public API the way an inference server does: open the
//! device, place graphs, run jobs through batch jobs, and wait on completion
//! in both completion modes.

use dla_driver::backends::{SimConfig, SimIdentity, SimulatedTransport};
use dla_driver::chip::csr;
use dla_driver::{
    ArchIdentity, CompiledGraph, CompletionMode, Device, DeviceConfig, DlaError, Transport,
    WaitStatus,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const INPUT_SIZE: u64 = 1024;
const OUTPUT_SIZE: u64 = 256;

/// Route driver logs to the test harness; `RUST_LOG=dla_driver=debug` to see them
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn sim(config: SimConfig) -> Arc<SimulatedTransport> {
    init_logging();
    Arc::new(SimulatedTransport::new(config))
}

fn polling() -> DeviceConfig {
    DeviceConfig::default()
        .with_completion_mode(CompletionMode::Polling)
        .with_poll_interval(Duration::from_millis(1))
        .with_wait_timeout(Duration::from_millis(200))
}

fn interrupt() -> DeviceConfig {
    DeviceConfig::default().with_wait_timeout(Duration::from_millis(200))
}

fn graph_for(identity: &SimIdentity) -> CompiledGraph {
    CompiledGraph::new(
        ArchIdentity::new(
            identity.arch_hash,
            identity.build_version.clone(),
            identity.arch_name.clone(),
        ),
        vec![0xA5u8; 4096],
        1024,
    )
    .with_io_sizes(INPUT_SIZE, OUTPUT_SIZE)
    .with_intermediate_size(8192)
}

fn graph() -> CompiledGraph {
    graph_for(&SimIdentity::default())
}

#[test]
fn test_end_to_end_inference() {
    let sim = sim(SimConfig::default());
    let device = Device::open(sim.clone(), interrupt()).unwrap();
    assert_eq!(device.completion_mode(), CompletionMode::Interrupt);

    let job = device.create_graph_job(&graph(), 2, 0).unwrap();
    let batch = job.get_batch_job().unwrap();

    let input = vec![3u8; INPUT_SIZE as usize];
    batch.load_input_feature_to_ddr(&input).unwrap();
    assert_eq!(sim.jobs_started(0), 1);
    assert_eq!(
        sim.peek_ddr(0, batch.layout().input_addr, input.len()).unwrap(),
        input
    );

    // the hardware writes its result and raises the done interrupt
    sim.poke_ddr(0, batch.layout().output_addr, &[9u8; OUTPUT_SIZE as usize])
        .unwrap();
    sim.complete_jobs(0, 1);

    assert_eq!(device.wait_for_dla(0, None).unwrap(), WaitStatus::Completed);
    let mut output = vec![0u8; OUTPUT_SIZE as usize];
    batch.read_output_feature_from_ddr(&mut output).unwrap();
    assert!(output.iter().all(|&b| b == 9));
    assert_eq!(device.num_inferences_completed(0).unwrap(), 1);
}

#[test]
fn test_parameters_uploaded_once_at_top_of_memory() {
    let sim = sim(SimConfig::default());
    let device = Device::open(sim.clone(), interrupt()).unwrap();
    sim.reset_counters();

    let job = device.create_graph_job(&graph(), 3, 0).unwrap();
    let total = sim.ddr_size_per_instance();
    let io_size = 3 * (INPUT_SIZE + OUTPUT_SIZE);
    assert_eq!(job.io_base(), total - io_size);
    assert_eq!(job.config_addr(), total - io_size - 4096);
    assert_eq!(sim.ddr_write_count(), 1);
    assert_eq!(sim.peek_ddr(0, job.config_addr(), 4096).unwrap(), vec![0xA5u8; 4096]);
    assert!(sim
        .csr_writes()
        .contains(&(0, csr::INTERMEDIATE_BASE_ADDR, 0)));
}

#[test]
fn test_graphs_share_intermediate_region() {
    let sim = sim(SimConfig::default());
    let device = Device::open(sim.clone(), interrupt()).unwrap();
    sim.reset_counters();

    let first = device.create_graph_job(&graph(), 1, 0).unwrap();
    let smaller = graph().with_intermediate_size(4096);
    let second = device.create_graph_job(&smaller, 1, 0).unwrap();

    let intermediate_writes = sim
        .csr_writes()
        .iter()
        .filter(|(_, offset, _)| *offset == csr::INTERMEDIATE_BASE_ADDR)
        .count();
    assert_eq!(intermediate_writes, 1);
    assert!(second.io_base() < first.config_addr());
}

#[test]
fn test_identity_mismatch_writes_nothing() {
    let sim = sim(SimConfig::default());
    let device = Device::open(sim.clone(), interrupt()).unwrap();
    sim.reset_counters();

    let mut other = SimIdentity::default();
    other.arch_hash[2] ^= 1;
    let err = device.create_graph_job(&graph_for(&other), 2, 0).unwrap_err();
    assert!(matches!(err, DlaError::ArchitectureMismatch { .. }));
    assert!(err.is_identity_mismatch());
    assert_eq!(sim.write_count(), 0);

    let mut newer = SimIdentity::default();
    newer.build_version = "2025.1.0".to_string();
    let err = device.create_graph_job(&graph_for(&newer), 2, 0).unwrap_err();
    assert!(matches!(err, DlaError::BuildVersionMismatch { .. }));
    assert_eq!(sim.write_count(), 0);
}

#[test]
fn test_identity_checks_can_be_skipped() {
    let sim = sim(SimConfig::default());
    let config = interrupt()
        .with_skip_arch_check(true)
        .with_skip_version_check(true);
    let device = Device::open(sim.clone(), config).unwrap();

    let other = SimIdentity {
        arch_hash: [0; 4],
        build_version: "0.0.0".to_string(),
        arch_name: "AGX5_Small".to_string(),
    };
    assert!(device.create_graph_job(&graph_for(&other), 1, 0).is_ok());
}

#[test]
fn test_out_of_memory_is_reported() {
    let sim = sim(SimConfig::default().with_ddr_size(1 << 16));
    let device = Device::open(sim.clone(), interrupt()).unwrap();
    let huge = graph().with_io_sizes(1 << 15, 1 << 15);
    let err = device.create_graph_job(&huge, 2, 0).unwrap_err();
    assert!(matches!(err, DlaError::AllocationFailed { .. }));
    assert!(err.to_string().contains("batch size"));
}

#[test]
fn test_batch_jobs_dispensed_once_across_threads() {
    let sim = sim(SimConfig::default());
    let device = Device::open(sim, interrupt()).unwrap();
    let job = device.create_graph_job(&graph(), 3, 0).unwrap();

    // more callers than pipelines: each batch job goes to exactly one of them
    let results: Vec<Option<u64>> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| job.get_batch_job().map(|b| b.layout().input_addr)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results.iter().filter(|r| r.is_none()).count(), 5);
    let mut inputs: Vec<u64> = results.into_iter().flatten().collect();
    inputs.sort_unstable();
    inputs.dedup();
    assert_eq!(inputs.len(), 3);
    assert!(job.get_batch_job().is_none());
}

#[test]
fn test_polling_wait_claims_jobs_in_order() {
    let sim = sim(SimConfig::default());
    let device = Device::open(sim.clone(), polling()).unwrap();
    assert_eq!(device.completion_mode(), CompletionMode::Polling);
    let job = device.create_graph_job(&graph(), 2, 0).unwrap();

    let input = vec![0u8; INPUT_SIZE as usize];
    let a = job.get_batch_job().unwrap();
    let b = job.get_batch_job().unwrap();
    a.load_input_feature_to_ddr(&input).unwrap();
    b.load_input_feature_to_ddr(&input).unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            sim.complete_jobs(0, 2);
        });
        assert_eq!(device.wait_for_dla(0, None).unwrap(), WaitStatus::Completed);
        assert_eq!(device.wait_for_dla(0, None).unwrap(), WaitStatus::Completed);
    });

    let err = device.wait_for_dla(0, None).unwrap_err();
    assert!(matches!(
        err,
        DlaError::Timeout {
            mode: CompletionMode::Polling,
            jobs_finished: 2,
            jobs_waited: 2,
            ..
        }
    ));
}

#[test]
fn test_interrupt_wait_wakes_on_completion() {
    let sim = sim(SimConfig::default());
    let device = Device::open(sim.clone(), interrupt().with_wait_timeout(Duration::from_secs(5)))
        .unwrap();

    let started = Instant::now();
    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            sim.complete_jobs(0, 1);
        });
        assert_eq!(device.wait_for_dla(0, None).unwrap(), WaitStatus::Completed);
    });
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_interrupt_wait_times_out() {
    let sim = sim(SimConfig::default());
    let device = Device::open(sim, interrupt().with_wait_timeout(Duration::from_millis(30))).unwrap();
    let err = device.wait_for_dla(0, None).unwrap_err();
    assert!(matches!(
        err,
        DlaError::Timeout {
            mode: CompletionMode::Interrupt,
            instance: 0,
            timeout_ms: 30,
            ..
        }
    ));
}

#[test]
fn test_huge_env_timeout_still_completes() {
    let sim = sim(SimConfig::default());
    let config = polling().with_env_lookup(|key| {
        (key == dla_driver::ENV_WAIT_TIMEOUT_SECS).then(|| u64::MAX.to_string())
    });
    let device = Device::open(sim.clone(), config).unwrap();

    sim.complete_jobs(0, 1);
    assert_eq!(device.wait_for_dla(0, None).unwrap(), WaitStatus::Completed);
}

#[test]
fn test_unrepresentable_timeout_waits_for_interrupt() {
    let sim = sim(SimConfig::default());
    let device = Device::open(sim.clone(), interrupt().with_wait_timeout(Duration::MAX)).unwrap();

    let status = thread::scope(|s| {
        let waiter = s.spawn(|| device.wait_for_dla(0, None));
        thread::sleep(Duration::from_millis(20));
        sim.complete_jobs(0, 1);
        waiter.join().unwrap()
    });
    assert_eq!(status.unwrap(), WaitStatus::Completed);

    let polled = DeviceConfig::default()
        .with_completion_mode(CompletionMode::Polling)
        .with_poll_interval(Duration::from_millis(1))
        .with_wait_timeout(Duration::MAX);
    let board = self::sim(SimConfig::default());
    let device = Device::open(board.clone(), polled).unwrap();
    board.complete_jobs(0, 1);
    assert_eq!(device.wait_for_dla(0, None).unwrap(), WaitStatus::Completed);
}

#[test]
fn test_completion_survives_counter_wrap() {
    let sim = sim(SimConfig::default());
    sim.set_completion_count(0, 0xFFFF_FFFE);
    let device = Device::open(sim.clone(), polling()).unwrap();

    sim.complete_jobs(0, 3);
    assert_eq!(sim.read_csr(0, csr::COMPLETION_COUNT).unwrap(), 1);
    for _ in 0..3 {
        assert_eq!(device.wait_for_dla(0, None).unwrap(), WaitStatus::Completed);
    }
    // the wrap itself counts as one more finished job
    assert_eq!(device.num_inferences_completed(0).unwrap(), 4);
    assert_eq!(device.wait_for_dla(0, None).unwrap(), WaitStatus::Completed);
    assert!(device.wait_for_dla(0, None).is_err());
}

#[test]
fn test_jobs_finished_before_open_are_not_claimed() {
    let sim = sim(SimConfig::default());
    sim.set_completion_count(0, 41);
    let device = Device::open(sim, polling().with_wait_timeout(Duration::from_millis(20))).unwrap();
    assert_eq!(device.num_inferences_completed(0).unwrap(), 0);
    assert!(matches!(
        device.wait_for_dla(0, None),
        Err(DlaError::Timeout { jobs_finished: 41, jobs_waited: 41, .. })
    ));
}

#[test]
fn test_license_exhaustion_reported_before_timeout() {
    let sim = sim(SimConfig::default());
    let device = Device::open(sim.clone(), polling()).unwrap();
    sim.set_desc_diagnostics(0, csr::desc_diagnostics::OUT_OF_INFERENCES);

    let err = device.wait_for_dla(0, None).unwrap_err();
    assert!(matches!(err, DlaError::OutOfLicensedInferences { instance: 0, .. }));
    assert!(err.to_string().contains("license"));
}

#[test]
fn test_license_exhaustion_seen_by_interrupt() {
    let sim = sim(SimConfig::default());
    let device = Device::open(sim.clone(), interrupt().with_wait_timeout(Duration::from_millis(30)))
        .unwrap();
    sim.set_desc_diagnostics(0, csr::desc_diagnostics::OUT_OF_INFERENCES);
    sim.raise_interrupt();

    assert!(matches!(
        device.wait_for_dla(0, None),
        Err(DlaError::OutOfLicensedInferences { .. })
    ));
}

#[test]
fn test_polling_wait_can_be_cancelled() {
    let sim = sim(SimConfig::default());
    let device = Device::open(sim.clone(), polling().with_wait_timeout(Duration::from_secs(5)))
        .unwrap();

    let stop = AtomicBool::new(false);
    let cancelled = || stop.load(Ordering::SeqCst);
    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            stop.store(true, Ordering::SeqCst);
        });
        assert_eq!(
            device.wait_for_dla(0, Some(&cancelled)).unwrap(),
            WaitStatus::Cancelled
        );
    });

    // the cancelled wait claimed nothing
    sim.complete_jobs(0, 1);
    assert_eq!(device.wait_for_dla(0, None).unwrap(), WaitStatus::Completed);
}

#[test]
fn test_instances_tracked_independently() {
    let sim = sim(SimConfig::default().with_instances(2));
    let device = Device::open(sim.clone(), interrupt().with_wait_timeout(Duration::from_millis(30)))
        .unwrap();
    assert_eq!(device.num_instances(), 2);

    let job0 = device.create_graph_job(&graph(), 1, 0).unwrap();
    let job1 = device.create_graph_job(&graph(), 1, 1).unwrap();
    assert_eq!(job0.io_base(), job1.io_base());

    sim.complete_jobs(1, 1);
    assert_eq!(device.wait_for_dla(1, None).unwrap(), WaitStatus::Completed);
    assert!(matches!(
        device.wait_for_dla(0, None),
        Err(DlaError::Timeout { instance: 0, .. })
    ));
    assert!(matches!(
        device.create_graph_job(&graph(), 1, 2),
        Err(DlaError::InvalidInstance { instance: 2, count: 2 })
    ));
}

#[test]
fn test_interrupt_fallback_still_completes() {
    let sim = sim(SimConfig::default().with_interrupts(false));
    let device = Device::open(sim.clone(), interrupt()).unwrap();
    assert_eq!(device.completion_mode(), CompletionMode::Polling);

    sim.complete_jobs(0, 1);
    assert_eq!(device.wait_for_dla(0, None).unwrap(), WaitStatus::Completed);
}

#[test]
fn test_debug_network_through_device() {
    let sim = sim(SimConfig::default());
    sim.add_debug_module(
        3,
        &[
            (0x300, "_Freeze", 1),
            (0x304, "active cycles", 0xDEAD_BEEF),
            (0x308, "active cycles", 1),
        ],
    );
    let device = Device::open(sim, interrupt()).unwrap();
    let data = device.read_debug_network(0).unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data["active cycles"], 0x1_DEAD_BEEF);
}

#[test]
fn test_stream_controller_scheduling() {
    let sim = sim(SimConfig::default().with_stream_controller(true));
    let device = Device::open(sim.clone(), interrupt()).unwrap();
    assert_eq!(device.scheduler_status().unwrap(), None);

    assert!(device.initialize_scheduler(0x1_0000, false, 4).unwrap());
    let init = sim.peer().initialized.unwrap();
    assert_eq!(init.source_buffer_size, 0x1_0000);
    assert_eq!(init.num_inference_requests, 4);

    let job = device.create_graph_job(&graph(), 1, 0).unwrap();
    let batch = job.get_batch_job().unwrap();
    assert!(batch.schedule_input_feature().unwrap());
    let scheduled = sim.peer().scheduled;
    assert_eq!(scheduled.len(), 1);
    assert_eq!(u64::from(scheduled[0].input_addr), batch.layout().input_addr);

    assert_eq!(
        device.scheduler_status().unwrap().as_deref(),
        Some("1000,0,0,1,0")
    );
}

#[test]
fn test_scheduler_absent_or_silent() {
    let sim_without = sim(SimConfig::default());
    let device = Device::open(sim_without, interrupt()).unwrap();
    assert!(!device.initialize_scheduler(0x1000, true, 1).unwrap());
    assert!(device.stream_controller().is_none());

    let silent = sim(SimConfig::default().with_stream_controller(true));
    silent.set_peer_responsive(false);
    let device = Device::open(silent, interrupt()).unwrap();
    assert!(!device.initialize_scheduler(0x1000, true, 1).unwrap());
    assert!(device.stream_controller().is_none());
}

#[test]
fn test_open_on_unlicensed_ip() {
    let sim = sim(SimConfig::default().with_license_flag(csr::license::UNLICENSED));
    let device = Device::open(sim, interrupt()).unwrap();
    assert!(!device.is_licensed());
}

#[test]
#[ignore] // Requires hardware
fn test_hardware_open_and_identity() {
    let transport = dla_driver::open_transport(dla_driver::TransportSelection::Uio(
        dla_driver::backends::UioConfig::default(),
    ))
    .expect("Failed to open UIO transport");
    let device = Device::open(transport, DeviceConfig::from_env()).expect("Failed to open device");

    assert!(device.num_instances() >= 1);
    let identity = device.identity(0).expect("Failed to read identity ROM");
    assert!(!identity.arch_name.is_empty());
    println!("{identity}");
}
