//! Register/memory transport abstraction
//!
//! A [`Transport`] is the only path from the runtime to the hardware. It
//! exposes instance-scoped 32-bit CSR access, byte-range access to the
//! accelerator's external memory, interrupt delivery, and the optional
//! stream-controller mailbox. The transport is constructed by the caller
//! and injected into [`crate::Device`]; nothing here is process-global.

use crate::error::{DlaError, Result};
use dla_chip::csr;
use std::fmt::Debug;
use std::sync::Arc;

/// Callback run by the transport on every hardware interrupt
pub type InterruptHandler = Box<dyn Fn() + Send + Sync>;

/// Register and external-memory access for one accelerator board
///
/// All methods take `&self`: implementations serialise internally where
/// the underlying channel needs it, so one transport can be shared by the
/// device, its jobs and the interrupt path.
pub trait Transport: Debug + Send + Sync {
    /// Backend identifier for logs
    fn transport_type(&self) -> TransportType;

    /// Instance slots the bitstream may contain (probing finds how many are present)
    fn max_instances(&self) -> usize;

    /// External memory available to each instance, in bytes
    fn ddr_size_per_instance(&self) -> u64;

    /// Clock (MHz) driving the CSR clock counters
    fn ddr_clock_mhz(&self) -> f64;

    /// Accelerator core clock (MHz)
    fn core_clock_mhz(&self) -> f64;

    /// Write one CSR word
    ///
    /// # Errors
    ///
    /// Returns error if the offset is misaligned or outside the window, or the write fails.
    fn write_csr(&self, instance: usize, offset: u32, value: u32) -> Result<()>;

    /// Read one CSR word
    ///
    /// # Errors
    ///
    /// Returns error if the offset is misaligned or outside the window, or the read fails.
    fn read_csr(&self, instance: usize, offset: u32) -> Result<u32>;

    /// Copy `data` into external memory at `addr`
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the instance's memory or the transfer fails.
    fn write_ddr(&self, instance: usize, addr: u64, data: &[u8]) -> Result<()>;

    /// Fill `buf` from external memory at `addr`
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the instance's memory or the transfer fails.
    fn read_ddr(&self, instance: usize, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Install the (single) interrupt callback, replacing any previous one
    ///
    /// # Errors
    ///
    /// Returns [`DlaError::InterruptsUnsupported`] if the transport has no interrupt path.
    fn register_interrupt_handler(&self, handler: InterruptHandler) -> Result<()> {
        drop(handler);
        Err(DlaError::InterruptsUnsupported)
    }

    /// Remove the interrupt callback, if any
    fn unregister_interrupt_handler(&self) {}

    /// Whether a stream-controller mailbox is attached
    fn has_stream_controller(&self) -> bool {
        false
    }

    /// Write into the stream-controller mailbox RAM
    ///
    /// # Errors
    ///
    /// Returns error if no stream controller is attached or the write fails.
    fn write_mailbox(&self, offset: u32, data: &[u8]) -> Result<()> {
        let _ = (offset, data);
        Err(DlaError::stream_controller("no stream controller attached"))
    }

    /// Read from the stream-controller mailbox RAM
    ///
    /// # Errors
    ///
    /// Returns error if no stream controller is attached or the read fails.
    fn read_mailbox(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let _ = (offset, buf);
        Err(DlaError::stream_controller("no stream controller attached"))
    }
}

/// Transport backend identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Embedded SoC: UIO register mapping + msgdma character device
    Uio,

    /// In-memory model of the hardware contract, no hardware required
    Simulated,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uio => write!(f, "UIO"),
            Self::Simulated => write!(f, "Simulated"),
        }
    }
}

/// Transport selection strategy
#[derive(Debug, Clone)]
pub enum TransportSelection {
    /// Real hardware through UIO
    Uio(crate::backends::UioConfig),

    /// Simulated hardware, for CI and bring-up without a board
    Simulated(crate::backends::SimConfig),
}

/// Open the selected transport
///
/// # Errors
///
/// Returns error if the backend cannot be initialized.
pub fn open_transport(selection: TransportSelection) -> Result<Arc<dyn Transport>> {
    use crate::backends::{SimulatedTransport, UioTransport};

    match selection {
        TransportSelection::Uio(config) => {
            let transport = UioTransport::open(&config)?;
            tracing::info!("Using UIO transport for board {}", config.board_index);
            Ok(Arc::new(transport))
        }
        TransportSelection::Simulated(config) => {
            tracing::info!("Using simulated transport ({} instances)", config.present_instances);
            Ok(Arc::new(SimulatedTransport::new(config)))
        }
    }
}

/// Reject CSR accesses the hardware window cannot serve
///
/// # Errors
///
/// Returns error if `instance >= max_instances`, or `offset` is misaligned or past the window.
pub fn check_csr_access(instance: usize, max_instances: usize, offset: u32) -> Result<()> {
    if instance >= max_instances {
        return Err(DlaError::invalid_access(format!(
            "CSR instance {instance} >= {max_instances}"
        )));
    }
    if !csr::is_valid_offset(offset) {
        return Err(DlaError::invalid_access(format!(
            "CSR offset {offset:#x} must be {}-byte aligned and below {:#x}",
            csr::ALIGNMENT,
            csr::WINDOW_SIZE
        )));
    }
    Ok(())
}

/// Reject external-memory ranges outside one instance's region
///
/// # Errors
///
/// Returns error if `addr + len` overflows or exceeds `size`.
pub fn check_ddr_range(addr: u64, len: usize, size: u64) -> Result<()> {
    let end = u64::try_from(len)
        .ok()
        .and_then(|len| addr.checked_add(len))
        .filter(|&end| end <= size);
    if end.is_none() {
        return Err(DlaError::invalid_access(format!(
            "DDR range {addr:#x}+{len:#x} exceeds instance memory of {size:#x} bytes"
        )));
    }
    Ok(())
}

/// Read a lo/hi counter pair, low word first
///
/// # Errors
///
/// Propagates transport read failures.
pub fn read_counter64(
    transport: &dyn Transport,
    instance: usize,
    lo_offset: u32,
    hi_offset: u32,
) -> Result<u64> {
    let lo = transport.read_csr(instance, lo_offset)?;
    let hi = transport.read_csr(instance, hi_offset)?;
    Ok((u64::from(hi) << 32) | u64::from(lo))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csr_access_checks() {
        assert!(check_csr_access(0, 1, csr::COMPLETION_COUNT).is_ok());
        assert!(check_csr_access(1, 1, csr::COMPLETION_COUNT).is_err());
        assert!(check_csr_access(0, 1, 0x201).is_err());
        assert!(check_csr_access(0, 1, csr::WINDOW_SIZE).is_err());
    }

    #[test]
    fn test_ddr_range_checks() {
        assert!(check_ddr_range(0, 16, 16).is_ok());
        assert!(check_ddr_range(8, 9, 16).is_err());
        assert!(check_ddr_range(u64::MAX, 2, u64::MAX).is_err());
        assert!(check_ddr_range(16, 0, 16).is_ok());
    }

    #[test]
    fn test_transport_type_display() {
        assert_eq!(TransportType::Uio.to_string(), "UIO");
        assert_eq!(TransportType::Simulated.to_string(), "Simulated");
    }
}
