//! Compiled graph description
//!
//! The runtime only needs a handful of facts about a compiled graph: which
//! hardware it was built for, how large its buffers are, and the packed
//! config/filter/bias/scale image to upload. The compiler that produces
//! them lives elsewhere.

use crate::identity::ArchIdentity;
use bytes::Bytes;

/// Placement-relevant metadata and constants of one compiled graph
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    /// Hardware the graph was compiled for
    pub identity: ArchIdentity,

    /// Scratch bytes shared by every graph on the instance
    pub intermediate_size: u64,

    /// Input feature bytes per pipeline
    pub input_size: u64,

    /// Output feature bytes per pipeline
    pub output_size: u64,

    /// Config bytes at the head of `parameters`; drives the config range register
    pub config_size: u64,

    /// Config, filter, bias and scale data, concatenated
    ///
    /// `Bytes` so one image can be shared by every graph job built from it.
    pub parameters: Bytes,

    /// Parameters live in on-chip ROM; nothing is uploaded
    pub parameter_rom: bool,

    /// Input arrives through the streaming interface
    pub input_streaming: bool,

    /// Output leaves through the streaming interface
    pub output_streaming: bool,
}

impl CompiledGraph {
    /// Graph for `identity` with the given parameter image
    ///
    /// Buffer sizes start at zero; set them with the `with_*` methods.
    pub fn new(identity: ArchIdentity, parameters: impl Into<Bytes>, config_size: u64) -> Self {
        Self {
            identity,
            intermediate_size: 0,
            input_size: 0,
            output_size: 0,
            config_size,
            parameters: parameters.into(),
            parameter_rom: false,
            input_streaming: false,
            output_streaming: false,
        }
    }

    /// Set the per-pipeline input and output sizes
    #[must_use]
    pub const fn with_io_sizes(mut self, input_size: u64, output_size: u64) -> Self {
        self.input_size = input_size;
        self.output_size = output_size;
        self
    }

    /// Set the intermediate scratch size
    #[must_use]
    pub const fn with_intermediate_size(mut self, size: u64) -> Self {
        self.intermediate_size = size;
        self
    }

    /// Mark the parameters as held in on-chip ROM
    #[must_use]
    pub const fn with_parameter_rom(mut self, rom: bool) -> Self {
        self.parameter_rom = rom;
        self
    }

    /// Enable the input/output streaming interfaces
    #[must_use]
    pub const fn with_streaming(mut self, input: bool, output: bool) -> Self {
        self.input_streaming = input;
        self.output_streaming = output;
        self
    }

    /// Size of the parameter image in bytes
    pub fn parameters_size(&self) -> u64 {
        self.parameters.len() as u64
    }

    /// Config bytes the hardware reads from external memory
    pub const fn effective_config_size(&self) -> u64 {
        if self.parameter_rom {
            0
        } else {
            self.config_size
        }
    }

    /// Whether the graph runs fully streamed (self-triggering)
    pub const fn is_streaming(&self) -> bool {
        self.input_streaming && self.output_streaming
    }
}
