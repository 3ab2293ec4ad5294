//! Transport backend implementations
//!
//! Two backends available:
//! - **UIO**: embedded SoC boards; CSRs and mailbox mapped through `/dev/uio*`,
//!   external memory through the msgdma character device, interrupts on the UIO fd
//! - **Simulated**: in-memory model of the hardware contract, for CI and
//!   bring-up without a board

pub mod mmap;
pub mod sim;
pub mod uio;

pub use sim::{PeerState, SimConfig, SimIdentity, SimulatedTransport};
pub use uio::{UioConfig, UioTransport};
