//! Graph job: one compiled graph placed on one instance
//!
//! Construction validates the hardware identity, places every buffer the
//! graph needs, uploads the parameter image once, and builds one
//! [`BatchJob`] per pipeline. Placement for `P` pipelines:
//!
//! ```text
//! io_base + i*(in+out)       pipeline i input
//! io_base + i*(in+out) + in  pipeline i output
//! config_base                config | filter | bias | scale
//! 0                          shared intermediate scratch
//! ```
//!
//! Nothing is written to the device until the identity check has passed.

use crate::allocator::DeviceMemoryAllocator;
use crate::batch_job::{BatchJob, BatchLayout};
use crate::compiled::CompiledGraph;
use crate::config::{DeviceConfig, ENV_DISABLE_ARCH_CHECK, ENV_DISABLE_VERSION_CHECK};
use crate::error::{DlaError, Result};
use crate::identity::ArchIdentity;
use crate::stream_controller::StreamController;
use crate::transport::Transport;
use dla_chip::layout::{FEATURE_WORD_BYTES, FILTER_WORD_BYTES};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error, info};

/// One graph's buffers on one instance, and its batch jobs
#[derive(Debug)]
pub struct GraphJob<'d> {
    instance: usize,
    config_addr: u64,
    io_base: u64,
    batch_jobs: Vec<BatchJob<'d>>,
    dispensed: Mutex<usize>,
}

impl<'d> GraphJob<'d> {
    /// Validate, place and upload `graph` on `instance`
    ///
    /// `allocator` must be the instance's allocator; the caller holds it
    /// exclusively for the whole placement.
    ///
    /// # Errors
    ///
    /// - [`DlaError::ArchitectureMismatch`] / [`DlaError::BuildVersionMismatch`]
    ///   when the identity ROM disagrees with the graph and the check is not
    ///   skipped. No write has happened at that point.
    /// - [`DlaError::MisalignedBuffer`] when a buffer size is not whole words.
    /// - [`DlaError::InvalidState`] when the config is larger than the
    ///   uploaded parameter image.
    /// - [`DlaError::AllocationFailed`] when the instance's memory is exhausted.
    /// - Transport failures.
    pub(crate) fn new(
        transport: &'d dyn Transport,
        stream_controller: Option<&'d StreamController>,
        allocator: &mut DeviceMemoryAllocator,
        graph: &CompiledGraph,
        num_pipelines: usize,
        instance: usize,
        config: &DeviceConfig,
    ) -> Result<Self> {
        if num_pipelines == 0 {
            return Err(DlaError::invalid_state("graph job needs at least one pipeline"));
        }

        let hardware = ArchIdentity::read(transport, instance)?;
        check_identity(&graph.identity, &hardware, config)?;

        let config_size = graph.effective_config_size();
        let parameters: &[u8] = if graph.parameter_rom {
            &[]
        } else {
            &graph.parameters
        };
        let parameters_size = parameters.len() as u64;

        check_words("input", graph.input_size, FEATURE_WORD_BYTES)?;
        check_words("output", graph.output_size, FEATURE_WORD_BYTES)?;
        check_words("intermediate", graph.intermediate_size, FEATURE_WORD_BYTES)?;
        check_words("config", config_size, FILTER_WORD_BYTES)?;
        check_words("parameter", parameters_size, FILTER_WORD_BYTES)?;
        if config_size > parameters_size {
            return Err(DlaError::invalid_state(format!(
                "config of {config_size} bytes extends past the {parameters_size}-byte parameter image"
            )));
        }

        let slice = graph.input_size + graph.output_size;
        let io_size = u64::try_from(num_pipelines)
            .ok()
            .and_then(|p| p.checked_mul(slice))
            .ok_or_else(|| {
                DlaError::allocation_failed(format!(
                    "{num_pipelines} pipelines of {slice} bytes overflow the address space"
                ))
            })?;

        allocator.allocate_shared_buffer(graph.intermediate_size, transport, instance)?;
        let io_base = allocator.allocate_private_buffer(io_size, FEATURE_WORD_BYTES)?;
        let config_addr = allocator.allocate_private_buffer(parameters_size, FILTER_WORD_BYTES)?;

        if graph.parameter_rom {
            debug!("instance {instance}: parameters in on-chip ROM, nothing uploaded");
        } else {
            transport.write_ddr(instance, config_addr, parameters)?;
        }

        debug!(
            "instance {instance}: config at {config_addr:#x}, filter/bias/scale at {:#x}",
            config_addr + config_size
        );

        let streaming = graph.is_streaming();
        let batch_jobs = (0..num_pipelines as u64)
            .map(|i| {
                let input_addr = io_base + i * slice;
                let layout = BatchLayout {
                    input_addr,
                    input_size: graph.input_size,
                    output_addr: input_addr + graph.input_size,
                    output_size: graph.output_size,
                    config_addr,
                    config_size,
                };
                debug!(
                    "instance {instance}: pipeline {i} input {:#x} output {:#x}",
                    layout.input_addr, layout.output_addr
                );
                BatchJob::new(transport, stream_controller, instance, layout, streaming)
            })
            .collect();

        info!(
            "Graph placed on instance {instance}: {num_pipelines} pipelines, \
             {parameters_size} parameter bytes, {} bytes free",
            allocator.free()
        );

        Ok(Self {
            instance,
            config_addr,
            io_base,
            batch_jobs,
            dispensed: Mutex::new(0),
        })
    }

    /// Next batch job not yet handed out, or `None` once all have been
    ///
    /// Safe to call from several threads; each job is returned at most once.
    pub fn get_batch_job(&self) -> Option<&BatchJob<'d>> {
        let mut dispensed = self.dispensed.lock().unwrap_or_else(PoisonError::into_inner);
        let job = self.batch_jobs.get(*dispensed)?;
        *dispensed += 1;
        Some(job)
    }

    /// Instance the graph is placed on
    pub const fn instance(&self) -> usize {
        self.instance
    }

    /// Number of pipelines
    pub fn num_pipelines(&self) -> usize {
        self.batch_jobs.len()
    }

    /// Address of the uploaded parameter image
    pub const fn config_addr(&self) -> u64 {
        self.config_addr
    }

    /// Base of the input/output allocation
    pub const fn io_base(&self) -> u64 {
        self.io_base
    }
}

fn check_identity(
    expected: &ArchIdentity,
    found: &ArchIdentity,
    config: &DeviceConfig,
) -> Result<()> {
    if config.skip_arch_check {
        error!(
            "{ENV_DISABLE_ARCH_CHECK} is set; architecture check skipped. \
             Running a graph built for other hardware may hang the accelerator"
        );
    } else if expected.arch_hash != found.arch_hash {
        return Err(DlaError::ArchitectureMismatch {
            expected_hash: expected.arch_hash.to_string(),
            found_hash: found.arch_hash.to_string(),
            expected_name: expected.arch_name.clone(),
            found_name: found.arch_name.clone(),
        });
    }

    if config.skip_version_check {
        error!(
            "{ENV_DISABLE_VERSION_CHECK} is set; build version check skipped. \
             Running a graph built for another IP version may hang the accelerator"
        );
    } else if expected.build_version != found.build_version {
        return Err(DlaError::BuildVersionMismatch {
            expected: expected.build_version.clone(),
            found: found.build_version.clone(),
        });
    }
    Ok(())
}

fn check_words(what: &'static str, size: u64, word: u64) -> Result<()> {
    if size % word != 0 {
        return Err(DlaError::MisalignedBuffer { what, size, word });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{SimConfig, SimIdentity, SimulatedTransport};

    fn graph(input: u64, output: u64) -> CompiledGraph {
        let id = SimIdentity::default();
        CompiledGraph::new(
            ArchIdentity::new(id.arch_hash, id.build_version, id.arch_name),
            vec![0xA5u8; 256],
            64,
        )
        .with_io_sizes(input, output)
        .with_intermediate_size(2048)
    }

    fn setup() -> (SimulatedTransport, DeviceMemoryAllocator) {
        let sim = SimulatedTransport::new(SimConfig::default().with_ddr_size(1 << 20));
        (sim, DeviceMemoryAllocator::new(1 << 20))
    }

    #[test]
    fn test_pipeline_layout() {
        let (sim, mut alloc) = setup();
        let job = GraphJob::new(
            &sim,
            None,
            &mut alloc,
            &graph(1024, 256),
            3,
            0,
            &DeviceConfig::default(),
        )
        .unwrap();

        let base = job.io_base();
        assert_eq!(base % FEATURE_WORD_BYTES, 0);
        let layouts: Vec<BatchLayout> =
            std::iter::from_fn(|| job.get_batch_job().map(|b| *b.layout())).collect();
        assert_eq!(layouts.len(), 3);
        assert_eq!(layouts[1].input_addr, base + 1280);
        assert_eq!(layouts[1].output_addr, layouts[1].input_addr + 1024);
        for l in &layouts {
            assert_eq!(l.config_addr, job.config_addr());
            assert_eq!(l.config_size, 64);
        }
    }

    #[test]
    fn test_parameters_uploaded_once() {
        let (sim, mut alloc) = setup();
        let job = GraphJob::new(
            &sim,
            None,
            &mut alloc,
            &graph(64, 64),
            2,
            0,
            &DeviceConfig::default(),
        )
        .unwrap();
        assert_eq!(sim.ddr_write_count(), 1);
        assert_eq!(
            sim.peek_ddr(0, job.config_addr(), 256).unwrap(),
            vec![0xA5u8; 256]
        );
        assert_eq!(job.config_addr() % FILTER_WORD_BYTES, 0);
        assert!(job.config_addr() >= job.io_base() + 2 * 128 || job.config_addr() + 256 <= job.io_base());
    }

    #[test]
    fn test_parameter_rom_skips_upload() {
        let (sim, mut alloc) = setup();
        let g = graph(64, 64).with_parameter_rom(true);
        let job = GraphJob::new(&sim, None, &mut alloc, &g, 1, 0, &DeviceConfig::default()).unwrap();
        assert_eq!(sim.ddr_write_count(), 0);
        let batch = job.get_batch_job().unwrap();
        assert_eq!(batch.layout().config_size, 0);
    }

    #[test]
    fn test_dispensing_exhausts() {
        let (sim, mut alloc) = setup();
        let job = GraphJob::new(
            &sim,
            None,
            &mut alloc,
            &graph(64, 64),
            2,
            0,
            &DeviceConfig::default(),
        )
        .unwrap();
        let a = job.get_batch_job().unwrap();
        let b = job.get_batch_job().unwrap();
        assert!(!std::ptr::eq(a, b));
        assert!(job.get_batch_job().is_none());
        assert!(job.get_batch_job().is_none());
    }

    #[test]
    fn test_config_larger_than_parameters_rejected() {
        let (sim, mut alloc) = setup();
        let mut g = graph(64, 64);
        g.config_size = 512;
        let err = GraphJob::new(&sim, None, &mut alloc, &g, 1, 0, &DeviceConfig::default())
            .unwrap_err();
        assert!(matches!(err, DlaError::InvalidState { .. }));
        assert_eq!(sim.write_count(), 0);
        assert_eq!(alloc, DeviceMemoryAllocator::new(1 << 20));

        // the whole image may be config
        g.config_size = 256;
        assert!(GraphJob::new(&sim, None, &mut alloc, &g, 1, 0, &DeviceConfig::default()).is_ok());
    }

    #[test]
    fn test_arch_mismatch_writes_nothing() {
        let (sim, mut alloc) = setup();
        let mut g = graph(64, 64);
        g.identity.arch_hash.0[2] ^= 1;
        let err = GraphJob::new(&sim, None, &mut alloc, &g, 1, 0, &DeviceConfig::default())
            .unwrap_err();
        assert!(matches!(err, DlaError::ArchitectureMismatch { .. }));
        assert!(err.to_string().contains(ENV_DISABLE_ARCH_CHECK));
        assert_eq!(sim.write_count(), 0);
        assert_eq!(alloc, DeviceMemoryAllocator::new(1 << 20));
    }

    #[test]
    fn test_version_mismatch_and_override() {
        let (sim, mut alloc) = setup();
        let mut g = graph(64, 64);
        g.identity.build_version = "1999.1".to_string();
        let err = GraphJob::new(&sim, None, &mut alloc, &g, 1, 0, &DeviceConfig::default())
            .unwrap_err();
        assert!(matches!(err, DlaError::BuildVersionMismatch { .. }));
        assert_eq!(sim.write_count(), 0);

        let cfg = DeviceConfig::default().with_skip_version_check(true);
        assert!(GraphJob::new(&sim, None, &mut alloc, &g, 1, 0, &cfg).is_ok());
    }

    #[test]
    fn test_misaligned_sizes_rejected() {
        let (sim, mut alloc) = setup();
        let err = GraphJob::new(
            &sim,
            None,
            &mut alloc,
            &graph(100, 64),
            1,
            0,
            &DeviceConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DlaError::MisalignedBuffer {
                what: "input",
                size: 100,
                word: 32
            }
        ));
        assert_eq!(sim.write_count(), 0);
    }

    #[test]
    fn test_out_of_memory() {
        let sim = SimulatedTransport::new(SimConfig::default().with_ddr_size(8192));
        let mut alloc = DeviceMemoryAllocator::new(8192);
        let err = GraphJob::new(
            &sim,
            None,
            &mut alloc,
            &graph(1024, 1024),
            4,
            0,
            &DeviceConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DlaError::AllocationFailed { .. }));
    }
}
