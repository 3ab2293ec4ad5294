//! Batch job: one pipeline slot of a graph
//!
//! A batch job knows where its input and output live in external memory and
//! where the graph's config buffer is. It stages input, triggers the
//! hardware and copies output back; waiting for the hardware is the
//! [`crate::Device`]'s business.
//!
//! Each batch job is driven by one thread at a time. Different batch jobs of
//! the same graph may be driven concurrently.

use crate::error::{DlaError, Result};
use crate::stream_controller::{JobDescriptor, StreamController};
use crate::transport::Transport;
use dla_chip::{csr, layout};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// External-memory placement of one batch job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLayout {
    /// Input buffer address
    pub input_addr: u64,
    /// Input buffer bytes
    pub input_size: u64,
    /// Output buffer address (immediately after the input)
    pub output_addr: u64,
    /// Output buffer bytes
    pub output_size: u64,
    /// Shared config buffer address
    pub config_addr: u64,
    /// Config bytes the hardware reads
    pub config_size: u64,
}

/// One schedulable inference slot
#[derive(Debug)]
pub struct BatchJob<'d> {
    transport: &'d dyn Transport,
    stream_controller: Option<&'d StreamController>,
    instance: usize,
    layout: BatchLayout,
    streaming: bool,
    last_job_queue_number: AtomicU64,
}

impl<'d> BatchJob<'d> {
    pub(crate) fn new(
        transport: &'d dyn Transport,
        stream_controller: Option<&'d StreamController>,
        instance: usize,
        layout: BatchLayout,
        streaming: bool,
    ) -> Self {
        Self {
            transport,
            stream_controller,
            instance,
            layout,
            streaming,
            last_job_queue_number: AtomicU64::new(0),
        }
    }

    /// Copy the input feature to external memory, then trigger the hardware
    ///
    /// Only the first `input_size` bytes of `input` are used.
    ///
    /// # Errors
    ///
    /// Returns [`DlaError::BufferTooSmall`] if `input` is shorter than the
    /// input buffer. Transport failures propagate; nothing is retried.
    pub fn load_input_feature_to_ddr(&self, input: &[u8]) -> Result<()> {
        let size = to_usize(self.layout.input_size)?;
        if input.len() < size {
            return Err(DlaError::BufferTooSmall {
                what: "input",
                needed: size,
                actual: input.len(),
            });
        }
        self.transport
            .write_ddr(self.instance, self.layout.input_addr, &input[..size])?;
        self.start_dla()
    }

    /// Hand this job to the stream controller instead of the CSRs
    ///
    /// Returns `false` when no stream controller is attached or it did not
    /// accept the descriptor.
    ///
    /// # Errors
    ///
    /// Returns error if an address does not fit the 32-bit descriptor, or
    /// the mailbox access fails.
    pub fn schedule_input_feature(&self) -> Result<bool> {
        let Some(controller) = self.stream_controller else {
            return Ok(false);
        };
        let descriptor = JobDescriptor {
            config_base: csr_address(self.layout.config_addr)?,
            config_size: self.config_range(),
            input_addr: csr_address(self.layout.input_addr)?,
            output_addr: csr_address(self.layout.output_addr)?,
        };
        controller.schedule_items(&[descriptor])
    }

    /// Trigger one execution
    ///
    /// Writes the config base, then the config range, then either the
    /// input/output base (which starts the job) or, for fully streamed
    /// graphs, the streaming-ready flag.
    ///
    /// # Errors
    ///
    /// Returns error if an address does not fit a 32-bit CSR, or a write fails.
    pub fn start_dla(&self) -> Result<()> {
        let config_base = csr_address(self.layout.config_addr)?;
        let input_base = csr_address(self.layout.input_addr)?;

        self.transport
            .write_csr(self.instance, csr::CONFIG_BASE_ADDR, config_base)?;
        self.transport
            .write_csr(self.instance, csr::CONFIG_RANGE_MINUS_TWO, self.config_range())?;
        if self.streaming {
            self.transport
                .write_csr(self.instance, csr::READY_STREAMING_IFACE, 1)?;
        } else {
            self.transport
                .write_csr(self.instance, csr::INPUT_OUTPUT_BASE_ADDR, input_base)?;
        }

        let queued = self.last_job_queue_number.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("instance {}: job {queued} started at {input_base:#x}", self.instance);
        Ok(())
    }

    /// Copy the output feature out of external memory
    ///
    /// Fills the first `output_size` bytes of `output`.
    ///
    /// # Errors
    ///
    /// Returns [`DlaError::BufferTooSmall`] if `output` is shorter than the
    /// output buffer. Transport failures propagate.
    pub fn read_output_feature_from_ddr(&self, output: &mut [u8]) -> Result<()> {
        let size = to_usize(self.layout.output_size)?;
        if output.len() < size {
            return Err(DlaError::BufferTooSmall {
                what: "output",
                needed: size,
                actual: output.len(),
            });
        }
        self.transport
            .read_ddr(self.instance, self.layout.output_addr, &mut output[..size])
    }

    /// Instance this job runs on
    pub const fn instance(&self) -> usize {
        self.instance
    }

    /// Buffer placement
    pub const fn layout(&self) -> &BatchLayout {
        &self.layout
    }

    /// Whether the job self-triggers through the streaming interfaces
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Executions started through this job
    pub fn last_job_queue_number(&self) -> u64 {
        self.last_job_queue_number.load(Ordering::Relaxed)
    }

    fn config_range(&self) -> u32 {
        layout::config_range_minus_two(self.layout.config_size)
    }
}

fn csr_address(addr: u64) -> Result<u32> {
    u32::try_from(addr).map_err(|_| {
        DlaError::invalid_access(format!("address {addr:#x} does not fit a 32-bit CSR"))
    })
}

fn to_usize(size: u64) -> Result<usize> {
    usize::try_from(size)
        .map_err(|_| DlaError::invalid_access(format!("buffer size {size:#x} exceeds usize")))
}
