//! Accelerator device
//!
//! [`Device`] is the top-level handle on one board. Opening it:
//!
//! 1. probes how many instances are present (interrupt-mask readback),
//! 2. checks the license flag,
//! 3. seeds completion tracking and the telemetry baselines,
//! 4. selects interrupt or polling completion for its whole lifetime,
//! 5. creates one memory allocator per instance.
//!
//! Graph jobs borrow the device, so it necessarily outlives them.
//!
//! # Example
//!
//! ```no_run
//! use dla_driver::backends::SimConfig;
//! use dla_driver::{open_transport, Device, DeviceConfig, TransportSelection};
//!
//! # fn main() -> dla_driver::Result<()> {
//! let transport = open_transport(TransportSelection::Simulated(SimConfig::default()))?;
//! let device = Device::open(transport, DeviceConfig::from_env())?;
//! println!("{} instance(s), {} completion", device.num_instances(), device.completion_mode());
//! # Ok(())
//! # }
//! ```

use crate::allocator::DeviceMemoryAllocator;
use crate::compiled::CompiledGraph;
use crate::completion::InstanceTracker;
use crate::config::{CompletionMode, DeviceConfig};
use crate::debug_network::{self, DebugNetworkData};
use crate::error::{DlaError, Result};
use crate::graph_job::GraphJob;
use crate::identity::ArchIdentity;
use crate::stream_controller::StreamController;
use crate::transport::{read_counter64, Transport};
use dla_chip::{csr, layout};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Bytes written and verified per memory-test transfer
const MEMORY_TEST_CHUNK: u64 = 1 << 20;

/// Mismatches logged individually by the memory test
const MEMORY_TEST_REPORTED: u64 = 10;

/// Condvar wait between re-checks when the timeout has no representable deadline
const UNBOUNDED_WAIT_SLICE: Duration = Duration::from_secs(60);

/// How a wait ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// One more job finished; the waited count was advanced
    Completed,
    /// The cancel predicate fired first (polling mode only)
    Cancelled,
}

/// Outcome of [`Device::run_memory_test`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTestReport {
    /// Instances tested
    pub instances: usize,
    /// Bytes written and read back per instance
    pub bytes_per_instance: u64,
    /// 64-bit words that read back wrong
    pub mismatches: u64,
}

impl MemoryTestReport {
    /// Whether every word read back as written
    pub const fn passed(&self) -> bool {
        self.mismatches == 0
    }
}

/// Counter readings taken at open; telemetry reports deltas from these
#[derive(Debug, Clone, Copy, Default)]
struct CounterBaseline {
    clocks_active: u64,
    clocks_all_jobs: u64,
    input_feature_reads: u64,
    filter_reads: u64,
    output_feature_writes: u64,
}

impl CounterBaseline {
    fn read(transport: &dyn Transport, instance: usize) -> Result<Self> {
        let pair = |lo, hi| read_counter64(transport, instance, lo, hi);
        Ok(Self {
            clocks_active: pair(csr::CLOCKS_ACTIVE_LO, csr::CLOCKS_ACTIVE_HI)?,
            clocks_all_jobs: pair(csr::CLOCKS_ALL_JOBS_LO, csr::CLOCKS_ALL_JOBS_HI)?,
            input_feature_reads: pair(
                csr::INPUT_FEATURE_READ_COUNT_LO,
                csr::INPUT_FEATURE_READ_COUNT_HI,
            )?,
            filter_reads: pair(csr::INPUT_FILTER_READ_COUNT_LO, csr::INPUT_FILTER_READ_COUNT_HI)?,
            output_feature_writes: pair(
                csr::OUTPUT_FEATURE_WRITE_COUNT_LO,
                csr::OUTPUT_FEATURE_WRITE_COUNT_HI,
            )?,
        })
    }
}

/// Open accelerator board
pub struct Device {
    transport: Arc<dyn Transport>,
    config: DeviceConfig,
    completion_mode: CompletionMode,
    num_instances: usize,
    licensed: bool,
    trackers: Arc<[InstanceTracker]>,
    baselines: Vec<CounterBaseline>,
    allocators: Vec<Mutex<DeviceMemoryAllocator>>,
    stream_controller: OnceLock<StreamController>,
    interrupt_registered: bool,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("transport", &self.transport.transport_type())
            .field("num_instances", &self.num_instances)
            .field("completion_mode", &self.completion_mode)
            .field("licensed", &self.licensed)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Open the board behind `transport`
    ///
    /// # Errors
    ///
    /// - [`DlaError::NoInstancesFound`] if no instance answers the probe
    /// - [`DlaError::UnrecognizedLicense`] if the license flag is neither code
    /// - transport failures, and interrupt-registration failures other than
    ///   [`DlaError::InterruptsUnsupported`] (which falls back to polling)
    pub fn open(transport: Arc<dyn Transport>, config: DeviceConfig) -> Result<Self> {
        info!(
            "Opening {} device ({} instance slots)",
            transport.transport_type(),
            transport.max_instances()
        );

        let num_instances = probe_instances(transport.as_ref())?;
        info!("Found {num_instances} accelerator instance(s)");

        let licensed = match transport.read_csr(0, csr::LICENSE_FLAG)? {
            csr::license::UNLICENSED => {
                info!("Using unlicensed IP");
                false
            }
            csr::license::LICENSED => {
                info!("Using licensed IP");
                true
            }
            value => return Err(DlaError::UnrecognizedLicense { value }),
        };

        let mut trackers = Vec::with_capacity(num_instances);
        let mut baselines = Vec::with_capacity(num_instances);
        for instance in 0..num_instances {
            let raw = transport.read_csr(instance, csr::COMPLETION_COUNT)?;
            trackers.push(InstanceTracker::new(raw));
            baselines.push(CounterBaseline::read(transport.as_ref(), instance)?);
        }
        let trackers: Arc<[InstanceTracker]> = trackers.into();

        let completion_mode = match config.completion_mode {
            CompletionMode::Polling => CompletionMode::Polling,
            CompletionMode::Interrupt => {
                let handler = interrupt_handler(Arc::downgrade(&transport), Arc::clone(&trackers));
                match transport.register_interrupt_handler(handler) {
                    Ok(()) => CompletionMode::Interrupt,
                    Err(DlaError::InterruptsUnsupported) => {
                        warn!(
                            "{} transport cannot deliver interrupts, falling back to polling",
                            transport.transport_type()
                        );
                        CompletionMode::Polling
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        if completion_mode == CompletionMode::Polling {
            // the probe left the masks enabled
            for instance in 0..transport.max_instances() {
                transport.write_csr(instance, csr::INTERRUPT_MASK, 0)?;
            }
        }
        info!("Completion mode: {completion_mode}");

        let ddr_size = transport.ddr_size_per_instance();
        let allocators = (0..num_instances)
            .map(|_| Mutex::new(DeviceMemoryAllocator::new(ddr_size)))
            .collect();

        let device = Self {
            interrupt_registered: completion_mode == CompletionMode::Interrupt,
            transport,
            config,
            completion_mode,
            num_instances,
            licensed,
            trackers,
            baselines,
            allocators,
            stream_controller: OnceLock::new(),
        };

        if device.config.memory_test {
            let report = device.run_memory_test()?;
            if !report.passed() {
                error!("Memory test found {} mismatches", report.mismatches);
            }
        }
        Ok(device)
    }

    /// Place `graph` on `instance` with `num_pipelines` batch jobs
    ///
    /// Graphs on the same instance share its intermediate region and stack
    /// their private buffers; placement is serialised per instance.
    ///
    /// # Errors
    ///
    /// Returns [`DlaError::InvalidInstance`] for an unknown instance, and any
    /// error of graph placement (identity mismatch, misaligned sizes,
    /// exhausted memory, transport failure).
    pub fn create_graph_job(
        &self,
        graph: &CompiledGraph,
        num_pipelines: usize,
        instance: usize,
    ) -> Result<GraphJob<'_>> {
        self.check_instance(instance)?;
        let mut allocator = self.allocators[instance]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        GraphJob::new(
            self.transport.as_ref(),
            self.stream_controller.get(),
            &mut allocator,
            graph,
            num_pipelines,
            instance,
            &self.config,
        )
    }

    /// Block until one more job has finished on `instance`
    ///
    /// Calls must match job starts one for one, in start order. In polling
    /// mode `is_cancelled` is checked before every counter read; interrupt
    /// mode ignores it and relies on the timeout.
    ///
    /// # Errors
    ///
    /// - [`DlaError::OutOfLicensedInferences`] if the hardware reports the
    ///   licensed budget exhausted (takes precedence over a timeout)
    /// - [`DlaError::Timeout`] if the configured timeout elapsed
    /// - [`DlaError::InvalidInstance`], or CSR read failures while polling
    pub fn wait_for_dla(
        &self,
        instance: usize,
        is_cancelled: Option<&dyn Fn() -> bool>,
    ) -> Result<WaitStatus> {
        self.check_instance(instance)?;
        let tracker = &self.trackers[instance];
        // None when the timeout is too large to represent: wait without bound
        let deadline = Instant::now().checked_add(self.config.wait_timeout);
        let mut timed_out = false;

        let mut state = tracker.lock();
        match self.completion_mode {
            CompletionMode::Polling => {
                while !state.has_unclaimed() {
                    if is_cancelled.is_some_and(|cancelled| cancelled()) {
                        debug!("instance {instance}: wait cancelled");
                        return Ok(WaitStatus::Cancelled);
                    }
                    let diag = self.transport.read_csr(instance, csr::DESC_DIAGNOSTICS)?;
                    let raw = self.transport.read_csr(instance, csr::COMPLETION_COUNT)?;
                    state.record(raw, diag);
                    if state.has_unclaimed() {
                        break;
                    }
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        timed_out = true;
                        break;
                    }
                    drop(state);
                    thread::sleep(self.config.poll_interval);
                    state = tracker.lock();
                }
            }
            CompletionMode::Interrupt => {
                while !state.has_unclaimed() {
                    let slice = match deadline {
                        Some(d) => {
                            let now = Instant::now();
                            if now >= d {
                                timed_out = true;
                                break;
                            }
                            d - now
                        }
                        None => UNBOUNDED_WAIT_SLICE,
                    };
                    state = tracker.wait_timeout(state, slice);
                }
            }
        }

        if state.desc_diagnostics & csr::desc_diagnostics::OUT_OF_INFERENCES != 0 {
            error!("instance {instance}: out of licensed inferences");
            return Err(DlaError::OutOfLicensedInferences {
                instance,
                jobs_finished: state.jobs_finished,
                jobs_waited: state.jobs_waited,
            });
        }
        if timed_out {
            warn!(
                "instance {instance}: {} wait timed out after {:?}",
                self.completion_mode, self.config.wait_timeout
            );
            return Err(DlaError::Timeout {
                mode: self.completion_mode,
                instance,
                jobs_finished: state.jobs_finished,
                jobs_waited: state.jobs_waited,
                timeout_ms: duration_ms(self.config.wait_timeout),
            });
        }

        state.jobs_waited += 1;
        Ok(WaitStatus::Completed)
    }

    /// Number of instances found at open
    pub const fn num_instances(&self) -> usize {
        self.num_instances
    }

    /// Completion mode in effect
    pub const fn completion_mode(&self) -> CompletionMode {
        self.completion_mode
    }

    /// Whether the IP reported a license
    pub const fn is_licensed(&self) -> bool {
        self.licensed
    }

    /// Configuration the device was opened with
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Underlying transport
    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Jobs finished on `instance` since open
    ///
    /// # Errors
    ///
    /// Returns [`DlaError::InvalidInstance`] for an unknown instance.
    pub fn num_inferences_completed(&self, instance: usize) -> Result<u64> {
        self.check_instance(instance)?;
        let state = self.trackers[instance].snapshot();
        Ok(state.jobs_finished - state.baseline)
    }

    /// Jobs the hardware descriptor queue holds
    pub const fn descriptor_queue_size(&self) -> u32 {
        layout::DESCRIPTOR_QUEUE_JOBS
    }

    /// Accelerator core clock (MHz)
    pub fn core_clock_mhz(&self) -> f64 {
        self.transport.core_clock_mhz()
    }

    /// Identity ROM of `instance`
    ///
    /// # Errors
    ///
    /// Returns [`DlaError::InvalidInstance`] or CSR read failures.
    pub fn identity(&self, instance: usize) -> Result<ArchIdentity> {
        self.check_instance(instance)?;
        ArchIdentity::read(self.transport.as_ref(), instance)
    }

    /// Milliseconds the instance was busy since open
    ///
    /// Meaningful only while no job is running.
    ///
    /// # Errors
    ///
    /// Returns [`DlaError::InvalidInstance`] or CSR read failures.
    #[allow(clippy::cast_precision_loss)]
    pub fn active_hw_time_ms(&self, instance: usize) -> Result<f64> {
        let clocks = self.counter_delta(
            instance,
            csr::CLOCKS_ACTIVE_LO,
            csr::CLOCKS_ACTIVE_HI,
            |b| b.clocks_active,
        )?;
        Ok(clocks as f64 / (1000.0 * self.transport.ddr_clock_mhz()))
    }

    /// Average milliseconds per job over `num_jobs` jobs since open
    ///
    /// Returns 0 for `num_jobs == 0`. Meaningful only while no job is running.
    ///
    /// # Errors
    ///
    /// Returns [`DlaError::InvalidInstance`] or CSR read failures.
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_hw_time_per_job_ms(&self, num_jobs: u64, instance: usize) -> Result<f64> {
        let clocks = self.counter_delta(
            instance,
            csr::CLOCKS_ALL_JOBS_LO,
            csr::CLOCKS_ALL_JOBS_HI,
            |b| b.clocks_all_jobs,
        )?;
        if num_jobs == 0 {
            return Ok(0.0);
        }
        Ok(clocks as f64 / (1000.0 * self.transport.ddr_clock_mhz() * num_jobs as f64))
    }

    /// Input-feature memory reads since open
    ///
    /// # Errors
    ///
    /// Returns [`DlaError::InvalidInstance`] or CSR read failures.
    pub fn num_input_feature_memory_reads(&self, instance: usize) -> Result<u64> {
        self.counter_delta(
            instance,
            csr::INPUT_FEATURE_READ_COUNT_LO,
            csr::INPUT_FEATURE_READ_COUNT_HI,
            |b| b.input_feature_reads,
        )
    }

    /// Filter memory reads since open
    ///
    /// # Errors
    ///
    /// Returns [`DlaError::InvalidInstance`] or CSR read failures.
    pub fn num_filter_memory_reads(&self, instance: usize) -> Result<u64> {
        self.counter_delta(
            instance,
            csr::INPUT_FILTER_READ_COUNT_LO,
            csr::INPUT_FILTER_READ_COUNT_HI,
            |b| b.filter_reads,
        )
    }

    /// Output-feature memory writes since open
    ///
    /// # Errors
    ///
    /// Returns [`DlaError::InvalidInstance`] or CSR read failures.
    pub fn num_output_feature_memory_writes(&self, instance: usize) -> Result<u64> {
        self.counter_delta(
            instance,
            csr::OUTPUT_FEATURE_WRITE_COUNT_LO,
            csr::OUTPUT_FEATURE_WRITE_COUNT_HI,
            |b| b.output_feature_writes,
        )
    }

    /// Collect the debug-network counters of `instance`
    ///
    /// # Errors
    ///
    /// Returns [`DlaError::InvalidInstance`], [`DlaError::DebugNetwork`] on
    /// an inconsistent counter list, or CSR access failures.
    pub fn read_debug_network(&self, instance: usize) -> Result<DebugNetworkData> {
        self.check_instance(instance)?;
        debug_network::read_debug_network(self.transport.as_ref(), instance)
    }

    /// Connect to the stream controller and configure it
    ///
    /// Returns `false` when no stream controller is attached, it does not
    /// answer a ping, or it rejects the configuration. Graph jobs created
    /// afterwards schedule through the controller.
    ///
    /// # Errors
    ///
    /// Propagates mailbox access failures.
    pub fn initialize_scheduler(
        &self,
        source_buffer_size: u32,
        drop_source_buffers: bool,
        num_inference_requests: u32,
    ) -> Result<bool> {
        if !self.transport.has_stream_controller() {
            info!("No stream controller attached");
            return Ok(false);
        }
        let controller = if let Some(controller) = self.stream_controller.get() {
            controller
        } else {
            let controller = StreamController::new(Arc::clone(&self.transport));
            if !controller.ping()? {
                warn!("Stream controller present but not answering");
                return Ok(false);
            }
            self.stream_controller.get_or_init(|| controller)
        };
        let accepted =
            controller.initialize(source_buffer_size, drop_source_buffers, num_inference_requests)?;
        info!("Stream controller initialized: {accepted}");
        Ok(accepted)
    }

    /// Stream controller status as `status,line,received,scheduled,executed`
    ///
    /// `None` when no controller is connected, or it is busy or silent.
    ///
    /// # Errors
    ///
    /// Propagates mailbox access failures.
    pub fn scheduler_status(&self) -> Result<Option<String>> {
        let Some(controller) = self.stream_controller.get() else {
            return Ok(None);
        };
        Ok(controller.status()?.map(|report| report.to_string()))
    }

    /// Connected stream controller, if any
    pub fn stream_controller(&self) -> Option<&StreamController> {
        self.stream_controller.get()
    }

    /// Write a pattern over every instance's memory and read it back
    ///
    /// Destroys anything placed in external memory; run it before creating
    /// graph jobs.
    ///
    /// # Errors
    ///
    /// Propagates transfer failures. Mismatches are reported, not errors.
    pub fn run_memory_test(&self) -> Result<MemoryTestReport> {
        let limit = self.transport.ddr_size_per_instance();
        info!("Starting memory test over {} instance(s), {limit:#x} bytes each", self.num_instances);

        let mut mismatches = 0u64;
        let mut buf = Vec::new();
        for instance in 0..self.num_instances {
            for addr in (0..limit).step_by(chunk_step()) {
                fill_pattern(&mut buf, addr, (limit - addr).min(MEMORY_TEST_CHUNK));
                self.transport.write_ddr(instance, addr, &buf)?;
            }
            for addr in (0..limit).step_by(chunk_step()) {
                fill_pattern(&mut buf, addr, (limit - addr).min(MEMORY_TEST_CHUNK));
                let mut readback = vec![0u8; buf.len()];
                self.transport.read_ddr(instance, addr, &mut readback)?;
                for (index, (got, expected)) in readback
                    .chunks_exact(8)
                    .zip(buf.chunks_exact(8))
                    .enumerate()
                {
                    if got != expected {
                        if mismatches < MEMORY_TEST_REPORTED {
                            warn!(
                                "memory test mismatch: instance {instance}, addr {addr:#x}, index {index}, \
                                 got {:#x}, expected {:#x}",
                                le_u64(got),
                                le_u64(expected)
                            );
                        }
                        mismatches += 1;
                    }
                }
            }
        }

        let report = MemoryTestReport {
            instances: self.num_instances,
            bytes_per_instance: limit,
            mismatches,
        };
        if report.passed() {
            info!("Memory test passed");
        } else {
            error!("Memory test failed ({mismatches} mismatches)");
        }
        Ok(report)
    }

    fn check_instance(&self, instance: usize) -> Result<()> {
        if instance >= self.num_instances {
            return Err(DlaError::InvalidInstance {
                instance,
                count: self.num_instances,
            });
        }
        Ok(())
    }

    fn counter_delta(
        &self,
        instance: usize,
        lo: u32,
        hi: u32,
        baseline: impl Fn(&CounterBaseline) -> u64,
    ) -> Result<u64> {
        self.check_instance(instance)?;
        let now = read_counter64(self.transport.as_ref(), instance, lo, hi)?;
        Ok(now.wrapping_sub(baseline(&self.baselines[instance])))
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // a job still in flight would otherwise interrupt a host that no longer listens
        for instance in 0..self.num_instances {
            if let Err(e) = self.transport.write_csr(instance, csr::INTERRUPT_MASK, 0) {
                error!("Failed to mask interrupts on instance {instance}: {e}");
            }
        }
        if self.interrupt_registered {
            self.transport.unregister_interrupt_handler();
        }
        for allocator in &self.allocators {
            allocator.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
        debug!("Device closed");
    }
}

/// Count present instances: the interrupt mask only reads back where an instance exists
fn probe_instances(transport: &dyn Transport) -> Result<usize> {
    let mut found = 0;
    for instance in 0..transport.max_instances() {
        // clear anything pending from a previous run first
        transport.write_csr(instance, csr::INTERRUPT_CONTROL, csr::interrupt::ALL)?;
        transport.write_csr(instance, csr::INTERRUPT_MASK, csr::interrupt::ALL)?;
        if transport.read_csr(instance, csr::INTERRUPT_MASK)? == csr::interrupt::ALL {
            found = instance + 1;
        }
    }
    if found == 0 {
        return Err(DlaError::NoInstancesFound);
    }
    Ok(found)
}

fn interrupt_handler(
    transport: Weak<dyn Transport>,
    trackers: Arc<[InstanceTracker]>,
) -> crate::transport::InterruptHandler {
    Box::new(move || {
        let Some(transport) = transport.upgrade() else {
            return;
        };
        if let Err(e) = service_interrupt(transport.as_ref(), &trackers) {
            error!("Interrupt service failed: {e}");
        }
    })
}

/// Acknowledge the interrupt and refresh every instance's tracker
fn service_interrupt(transport: &dyn Transport, trackers: &[InstanceTracker]) -> Result<()> {
    for instance in 0..trackers.len() {
        transport.write_csr(instance, csr::INTERRUPT_CONTROL, csr::interrupt::ALL)?;
    }
    for (instance, tracker) in trackers.iter().enumerate() {
        let diag = transport.read_csr(instance, csr::DESC_DIAGNOSTICS)?;
        let raw = transport.read_csr(instance, csr::COMPLETION_COUNT)?;
        tracker.record(raw, diag);
    }
    Ok(())
}

fn fill_pattern(buf: &mut Vec<u8>, addr: u64, len: u64) {
    buf.clear();
    for index in 0..len / 8 {
        let word = addr.wrapping_mul(12345).wrapping_add(index.wrapping_mul(6789));
        buf.extend_from_slice(&word.to_le_bytes());
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn chunk_step() -> usize {
    MEMORY_TEST_CHUNK as usize
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    u64::from_le_bytes(word)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{SimConfig, SimulatedTransport};

    fn open(config: SimConfig, device: DeviceConfig) -> (Arc<SimulatedTransport>, Result<Device>) {
        let sim = Arc::new(SimulatedTransport::new(config));
        let dev = Device::open(sim.clone(), device);
        (sim, dev)
    }

    #[test]
    fn test_probe_counts_present_instances() {
        let (_sim, dev) = open(SimConfig::default().with_instances(3), DeviceConfig::default());
        assert_eq!(dev.unwrap().num_instances(), 3);
    }

    #[test]
    fn test_no_instances() {
        let (_sim, dev) = open(SimConfig::default().with_instances(0), DeviceConfig::default());
        assert!(matches!(dev.unwrap_err(), DlaError::NoInstancesFound));
    }

    #[test]
    fn test_license_flag() {
        let (_sim, dev) = open(
            SimConfig::default().with_license_flag(csr::license::UNLICENSED),
            DeviceConfig::default(),
        );
        assert!(!dev.unwrap().is_licensed());

        let (_sim, dev) = open(SimConfig::default().with_license_flag(7), DeviceConfig::default());
        assert!(matches!(
            dev.unwrap_err(),
            DlaError::UnrecognizedLicense { value: 7 }
        ));
    }

    #[test]
    fn test_polling_masks_interrupts() {
        let (sim, dev) = open(
            SimConfig::default(),
            DeviceConfig::default().with_completion_mode(CompletionMode::Polling),
        );
        let dev = dev.unwrap();
        assert_eq!(dev.completion_mode(), CompletionMode::Polling);
        assert!(!sim.has_interrupt_handler());
        for instance in 0..4 {
            assert!(sim
                .csr_writes()
                .contains(&(instance, csr::INTERRUPT_MASK, 0)));
        }
    }

    #[test]
    fn test_interrupt_fallback_to_polling() {
        let (sim, dev) = open(
            SimConfig::default().with_interrupts(false),
            DeviceConfig::default(),
        );
        let dev = dev.unwrap();
        assert_eq!(dev.completion_mode(), CompletionMode::Polling);
        assert_eq!(sim.read_csr(0, csr::INTERRUPT_MASK).unwrap(), 0);
    }

    #[test]
    fn test_drop_masks_and_unregisters() {
        let (sim, dev) = open(SimConfig::default(), DeviceConfig::default());
        let dev = dev.unwrap();
        assert!(sim.has_interrupt_handler());
        assert_eq!(sim.read_csr(0, csr::INTERRUPT_MASK).unwrap(), csr::interrupt::ALL);
        drop(dev);
        assert!(!sim.has_interrupt_handler());
        assert_eq!(sim.read_csr(0, csr::INTERRUPT_MASK).unwrap(), 0);
    }

    #[test]
    fn test_counters_are_deltas() {
        let sim = Arc::new(SimulatedTransport::new(SimConfig::default()));
        sim.set_counter64(0, csr::CLOCKS_ACTIVE_LO, 1_000_000);
        sim.set_counter64(0, csr::INPUT_FEATURE_READ_COUNT_LO, 50);
        let dev = Device::open(sim.clone(), DeviceConfig::default()).unwrap();

        sim.set_counter64(0, csr::CLOCKS_ACTIVE_LO, 1_000_000 + 2_666_666);
        sim.set_counter64(0, csr::INPUT_FEATURE_READ_COUNT_LO, (1 << 32) + 60);
        sim.set_counter64(0, csr::CLOCKS_ALL_JOBS_LO, 5_333_332);

        let ms = dev.active_hw_time_ms(0).unwrap();
        assert!((ms - 10.0).abs() < 1e-3, "got {ms}");
        let avg = dev.avg_hw_time_per_job_ms(2, 0).unwrap();
        assert!((avg - 10.0).abs() < 1e-3, "got {avg}");
        assert_eq!(dev.avg_hw_time_per_job_ms(0, 0).unwrap(), 0.0);
        assert_eq!(dev.num_input_feature_memory_reads(0).unwrap(), (1 << 32) + 10);
        assert_eq!(dev.num_filter_memory_reads(0).unwrap(), 0);
        assert_eq!(dev.num_output_feature_memory_writes(0).unwrap(), 0);
    }

    #[test]
    fn test_invalid_instance() {
        let (_sim, dev) = open(SimConfig::default(), DeviceConfig::default());
        let dev = dev.unwrap();
        assert!(matches!(
            dev.wait_for_dla(1, None),
            Err(DlaError::InvalidInstance { instance: 1, count: 1 })
        ));
        assert!(dev.num_inferences_completed(5).is_err());
    }

    #[test]
    fn test_memory_test_passes_on_sim() {
        let (_sim, dev) = open(
            SimConfig::default().with_instances(2).with_ddr_size(3 << 19),
            DeviceConfig::default(),
        );
        let report = dev.unwrap().run_memory_test().unwrap();
        assert!(report.passed());
        assert_eq!(report.instances, 2);
        assert_eq!(report.bytes_per_instance, 3 << 19);
    }

    #[test]
    fn test_memory_test_at_open() {
        let (sim, dev) = open(
            SimConfig::default().with_ddr_size(1 << 16),
            DeviceConfig::default().with_memory_test(true),
        );
        dev.unwrap();
        assert_eq!(sim.ddr_write_count(), 1);
        let word = sim.peek_ddr(0, 8, 8).unwrap();
        assert_eq!(le_u64(&word), 6789);
    }

    #[test]
    fn test_device_queries() {
        let (_sim, dev) = open(SimConfig::default(), DeviceConfig::default());
        let dev = dev.unwrap();
        assert_eq!(dev.descriptor_queue_size(), 64);
        assert!((dev.core_clock_mhz() - 200.0).abs() < f64::EPSILON);
        assert_eq!(dev.num_inferences_completed(0).unwrap(), 0);
        assert_eq!(dev.identity(0).unwrap().arch_name, "AGX7_Performance");
    }
}
