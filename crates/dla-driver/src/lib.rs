//! Host runtime for the FPGA deep-learning accelerator (DLA).
//!
//! This crate places compiled graphs in the accelerator's external memory,
//! starts jobs through the per-instance CSR window, and tracks completion
//! with a 64-bit count that survives the hardware's 32-bit counter wrapping.
//!
//! # Layering
//!
//! ```text
//! Device ─── owns ──► Transport (UIO + msgdma, or Simulated)
//!   │                    ▲
//!   │ create_graph_job   │ CSR / DDR / mailbox access
//!   ▼                    │
//! GraphJob ── owns ──► BatchJob × pipelines
//!   │
//!   └── DeviceMemoryAllocator (per instance: shared region low, private stack high)
//! ```
//!
//! Completion reaches the host either through the interrupt handler the
//! device registers on the transport, or by the waiting thread polling the
//! completion counter; the mode is fixed when the device opens.
//!
//! # Quick start
//!
//! ```no_run
//! use dla_driver::backends::{SimConfig, SimIdentity};
//! use dla_driver::{open_transport, ArchIdentity, CompiledGraph, Device, DeviceConfig, TransportSelection};
//!
//! # fn main() -> dla_driver::Result<()> {
//! let transport = open_transport(TransportSelection::Simulated(SimConfig::default()))?;
//! let device = Device::open(transport, DeviceConfig::from_env())?;
//!
//! let id = SimIdentity::default();
//! let graph = CompiledGraph::new(
//!     ArchIdentity::new(id.arch_hash, id.build_version, id.arch_name),
//!     vec![0u8; 4096],
//!     1024,
//! )
//! .with_io_sizes(1024, 256);
//!
//! let job = device.create_graph_job(&graph, 2, 0)?;
//! let batch = job.get_batch_job().expect("two pipelines");
//! batch.load_input_feature_to_ddr(&[0u8; 1024])?;
//! device.wait_for_dla(0, None)?;
//! let mut output = vec![0u8; 256];
//! batch.read_output_feature_from_ddr(&mut output)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod allocator;
pub mod backends;
mod batch_job;
mod compiled;
pub mod completion;
mod config;
pub mod debug_network;
mod device;
mod error;
mod graph_job;
mod identity;
pub mod stream_controller;
mod transport;

pub use allocator::DeviceMemoryAllocator;
pub use batch_job::{BatchJob, BatchLayout};
pub use compiled::CompiledGraph;
pub use config::{
    CompletionMode, DeviceConfig, ENV_DISABLE_ARCH_CHECK, ENV_DISABLE_VERSION_CHECK,
    ENV_MEMORY_TEST, ENV_POLLING, ENV_WAIT_TIMEOUT_SECS, MAX_WAIT_TIMEOUT_SECS,
};
pub use debug_network::DebugNetworkData;
pub use device::{Device, MemoryTestReport, WaitStatus};
pub use error::{DlaError, Result};
pub use graph_job::GraphJob;
pub use identity::{ArchHash, ArchIdentity};
pub use stream_controller::{JobDescriptor, StatusReport, StreamController};
pub use transport::{
    check_csr_access, check_ddr_range, open_transport, read_counter64, InterruptHandler,
    Transport, TransportSelection, TransportType,
};

/// Register-level constants (re-exported from dla-chip).
pub mod chip {
    pub use dla_chip::{board, csr, debug_net, layout, mailbox, rom};
}

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        open_transport, ArchIdentity, BatchJob, CompiledGraph, CompletionMode, Device,
        DeviceConfig, DlaError, GraphJob, Result, Transport, TransportSelection, WaitStatus,
    };
}
