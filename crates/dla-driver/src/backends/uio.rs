//! UIO transport for embedded SoC boards
//!
//! On SoC boards the accelerator sits behind the HPS-to-FPGA bridge and is
//! published to userspace by the generic UIO driver:
//!
//! ```text
//! /sys/class/uio/uioN/name          "coredla<board>"            CSR windows
//! /sys/class/uio/uioM/name          "stream_controller<board>"  mailbox RAM (optional)
//! /dev/msgdma_coredla<board>        external memory via the msgdma driver
//! ```
//!
//! CSR windows of successive instances are [`CSR_STRIDE`] apart inside the
//! mapped region. External memory is reached with positional reads and
//! writes on the msgdma character device; writes are split so that one
//! request never needs more than 1023 page descriptors.
//!
//! Interrupts arrive on the UIO file descriptor. UIO masks the line after
//! every event, so a background thread re-arms it (write 1), then polls
//! the descriptor together with a shutdown eventfd.

use super::mmap::MmapRegion;
use crate::error::{DlaError, Result};
use crate::transport::{
    check_csr_access, check_ddr_range, InterruptHandler, Transport, TransportType,
};
use dla_chip::board::{HpsBoard, CSR_STRIDE};
use rustix::event::{eventfd, poll, EventfdFlags, PollFd, PollFlags};
use rustix::io::Errno;
use std::fs::{File, OpenOptions};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Name prefix of the accelerator's UIO node
pub const COREDLA_PREFIX: &str = "coredla";
/// Name prefix of the stream controller's UIO node
pub const STREAM_CONTROLLER_PREFIX: &str = "stream_controller";
/// Prefix of the msgdma character device
pub const MSGDMA_PREFIX: &str = "msgdma_coredla";

/// Largest single msgdma request: 1023 descriptors of one page each
const DDR_CHUNK: usize = 4096 * 1023;

/// UIO backend configuration
#[derive(Debug, Clone)]
pub struct UioConfig {
    /// Where UIO devices are published (`/sys/class/uio`)
    pub sysfs_root: PathBuf,
    /// Where device nodes live (`/dev`)
    pub dev_root: PathBuf,
    /// Board number: the `N` in `coredlaN`
    pub board_index: u32,
    /// Board variant, for memory size and clocks
    pub board: HpsBoard,
    /// Start the interrupt thread
    pub interrupts: bool,
}

impl Default for UioConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys/class/uio"),
            dev_root: PathBuf::from("/dev"),
            board_index: 0,
            board: HpsBoard::default(),
            interrupts: true,
        }
    }
}

/// Size and in-page offset of one UIO map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UioMapInfo {
    /// Bytes in the map
    pub size: u64,
    /// Offset of the device registers within the first page
    pub offset: u64,
}

/// Find the UIO node whose sysfs `name` contains `device_name`
///
/// Returns the node name (e.g. `uio3`), or `None` when absent.
pub fn find_uio_device(sysfs_root: &Path, device_name: &str) -> Option<String> {
    list_uio_devices(sysfs_root, device_name).into_iter().next()
}

/// All UIO nodes whose sysfs `name` contains `pattern`, sorted by node name
pub fn list_uio_devices(sysfs_root: &Path, pattern: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(sysfs_root) else {
        return Vec::new();
    };
    let mut found: Vec<String> = entries
        .flatten()
        .filter_map(|entry| {
            let node = entry.file_name().to_string_lossy().into_owned();
            let name = std::fs::read_to_string(entry.path().join("name")).ok()?;
            name.trim().contains(pattern).then_some(node)
        })
        .collect();
    found.sort();
    found
}

/// Parse a sysfs integer (`0x`-prefixed hex or decimal)
///
/// # Errors
///
/// Returns error if the file cannot be read or does not hold an integer.
pub fn read_sysfs_u64(path: &Path) -> Result<u64> {
    let raw = std::fs::read_to_string(path).map_err(|_| DlaError::device_not_found(path))?;
    let text = raw.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };
    parsed.map_err(|e| {
        DlaError::transfer_failed(format!("{}: cannot parse {text:?}: {e}", path.display()))
    })
}

/// Read `maps/map<index>/{size,offset}` of a UIO node
///
/// # Errors
///
/// Returns error if either attribute is missing or malformed.
pub fn read_map_info(sysfs_root: &Path, node: &str, map_index: usize) -> Result<UioMapInfo> {
    let dir = sysfs_root.join(node).join("maps").join(format!("map{map_index}"));
    let size = read_sysfs_u64(&dir.join("size"))?;
    let offset = read_sysfs_u64(&dir.join("offset"))?;
    if size > u64::from(u32::MAX) {
        return Err(DlaError::invalid_access(format!(
            "{node} map{map_index} size {size:#x} exceeds 32 bits"
        )));
    }
    Ok(UioMapInfo { size, offset })
}

fn map_node(config: &UioConfig, node: &str) -> Result<MmapRegion> {
    let info = read_map_info(&config.sysfs_root, node, 0)?;
    let size = usize::try_from(info.size)
        .map_err(|_| DlaError::invalid_access(format!("{node} map too large")))?;
    let offset = usize::try_from(info.offset)
        .map_err(|_| DlaError::invalid_access(format!("{node} map offset too large")))?;
    MmapRegion::map_uio(&config.dev_root.join(node), 0, size, offset)
}

/// Accelerator transport over UIO + msgdma
#[derive(Debug)]
pub struct UioTransport {
    config: UioConfig,
    csr: MmapRegion,
    stream_controller: Option<MmapRegion>,
    ddr: File,
    irq: Option<UioInterrupt>,
}

impl UioTransport {
    /// Discover and map the board described by `config`
    ///
    /// # Errors
    ///
    /// Returns error if the accelerator UIO node or msgdma device is missing,
    /// or mapping fails. A missing stream controller is not an error.
    pub fn open(config: &UioConfig) -> Result<Self> {
        let index = config.board_index;
        let name = format!("{COREDLA_PREFIX}{index}");
        let node = find_uio_device(&config.sysfs_root, &name)
            .ok_or_else(|| DlaError::device_not_found(config.sysfs_root.join(&name)))?;
        debug!("{name} is {node}");
        let csr = map_node(config, &node)?;

        let stream_controller =
            match find_uio_device(&config.sysfs_root, &format!("{STREAM_CONTROLLER_PREFIX}{index}")) {
                Some(sc_node) => Some(map_node(config, &sc_node)?),
                None => {
                    debug!("No stream controller on board {index}");
                    None
                }
            };

        let ddr_path = config.dev_root.join(format!("{MSGDMA_PREFIX}{index}"));
        let ddr = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&ddr_path)
            .map_err(|_| DlaError::device_not_found(&ddr_path))?;

        let irq = if config.interrupts {
            match UioInterrupt::start(csr.file()) {
                Ok(irq) => Some(irq),
                Err(e) => {
                    warn!("{node}: interrupt unavailable ({e}); only polling will work");
                    None
                }
            }
        } else {
            None
        };

        info!(
            "Opened {name} on {}: CSR {:#x} bytes, stream controller {}, interrupts {}",
            config.board,
            csr.size(),
            if stream_controller.is_some() { "present" } else { "absent" },
            if irq.is_some() { "enabled" } else { "disabled" },
        );

        Ok(Self {
            config: config.clone(),
            csr,
            stream_controller,
            ddr,
            irq,
        })
    }

    fn csr_offset(instance: usize, offset: u32) -> usize {
        // instance < max_instances and offset < 2 KiB, checked by the caller
        #[allow(clippy::cast_possible_truncation)]
        let stride = CSR_STRIDE as usize;
        stride * instance + offset as usize
    }

    fn check_instance(&self, instance: usize) -> Result<()> {
        if instance >= self.max_instances() {
            return Err(DlaError::invalid_access(format!(
                "DDR instance {instance} >= {}",
                self.max_instances()
            )));
        }
        Ok(())
    }

    fn mailbox(&self) -> Result<&MmapRegion> {
        self.stream_controller
            .as_ref()
            .ok_or_else(|| DlaError::stream_controller("no stream controller attached"))
    }
}

fn pwrite_all(file: &File, mut buf: &[u8], mut offset: u64) -> Result<()> {
    while !buf.is_empty() {
        let n = rustix::io::pwrite(file, buf, offset).map_err(std::io::Error::from)?;
        if n == 0 {
            return Err(DlaError::transfer_failed(format!(
                "msgdma write stalled at {offset:#x}"
            )));
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

fn pread_exact(file: &File, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
    while !buf.is_empty() {
        let n = rustix::io::pread(file, &mut *buf, offset).map_err(std::io::Error::from)?;
        if n == 0 {
            return Err(DlaError::transfer_failed(format!(
                "msgdma read ended early at {offset:#x}"
            )));
        }
        buf = &mut std::mem::take(&mut buf)[n..];
        offset += n as u64;
    }
    Ok(())
}

impl Transport for UioTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Uio
    }

    fn max_instances(&self) -> usize {
        self.config.board.max_instances()
    }

    fn ddr_size_per_instance(&self) -> u64 {
        self.config.board.ddr_size_per_instance()
    }

    fn ddr_clock_mhz(&self) -> f64 {
        self.config.board.ddr_clock_mhz()
    }

    fn core_clock_mhz(&self) -> f64 {
        self.config.board.core_clock_mhz()
    }

    fn write_csr(&self, instance: usize, offset: u32, value: u32) -> Result<()> {
        check_csr_access(instance, self.max_instances(), offset)?;
        self.csr.write_u32(Self::csr_offset(instance, offset), value)
    }

    fn read_csr(&self, instance: usize, offset: u32) -> Result<u32> {
        check_csr_access(instance, self.max_instances(), offset)?;
        self.csr.read_u32(Self::csr_offset(instance, offset))
    }

    fn write_ddr(&self, instance: usize, addr: u64, data: &[u8]) -> Result<()> {
        self.check_instance(instance)?;
        check_ddr_range(addr, data.len(), self.ddr_size_per_instance())?;
        let mut at = addr;
        for chunk in data.chunks(DDR_CHUNK) {
            pwrite_all(&self.ddr, chunk, at)?;
            at += chunk.len() as u64;
        }
        Ok(())
    }

    fn read_ddr(&self, instance: usize, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.check_instance(instance)?;
        check_ddr_range(addr, buf.len(), self.ddr_size_per_instance())?;
        pread_exact(&self.ddr, buf, addr)
    }

    fn register_interrupt_handler(&self, handler: InterruptHandler) -> Result<()> {
        let irq = self.irq.as_ref().ok_or(DlaError::InterruptsUnsupported)?;
        *irq.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::from(handler));
        Ok(())
    }

    fn unregister_interrupt_handler(&self) {
        if let Some(irq) = &self.irq {
            irq.handler
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
    }

    fn has_stream_controller(&self) -> bool {
        self.stream_controller.is_some()
    }

    fn write_mailbox(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.mailbox()?.write_block(offset as usize, data)
    }

    fn read_mailbox(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.mailbox()?.read_block(offset as usize, buf)
    }
}

type SharedHandler = Arc<Mutex<Option<Arc<dyn Fn() + Send + Sync>>>>;

/// Interrupt service thread for one UIO node
struct UioInterrupt {
    handler: SharedHandler,
    shutdown: Arc<OwnedFd>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for UioInterrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UioInterrupt")
            .field("running", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

impl UioInterrupt {
    fn start(device: &File) -> Result<Self> {
        let device = device.try_clone()?;
        // Disabling fails when the device tree wires no IRQ to this node
        rustix::io::write(&device, &0u32.to_ne_bytes()).map_err(std::io::Error::from)?;

        let shutdown = Arc::new(eventfd(0, EventfdFlags::CLOEXEC).map_err(std::io::Error::from)?);
        let handler: SharedHandler = Arc::new(Mutex::new(None));

        let thread = {
            let shutdown = Arc::clone(&shutdown);
            let handler = Arc::clone(&handler);
            std::thread::Builder::new()
                .name("dla-uio-irq".into())
                .spawn(move || interrupt_loop(&device, &shutdown, &handler))?
        };

        Ok(Self {
            handler,
            shutdown,
            thread: Some(thread),
        })
    }
}

impl Drop for UioInterrupt {
    fn drop(&mut self) {
        if let Err(e) = rustix::io::write(&*self.shutdown, &1u64.to_ne_bytes()) {
            error!("Failed to signal interrupt thread shutdown: {e}");
            return;
        }
        if let Some(thread) = self.thread.take() {
            // the handler may hold the last transport reference
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("Interrupt thread panicked");
            }
        }
    }
}

enum PollOutcome {
    Shutdown,
    Interrupt,
    Spurious,
}

fn wait_for_event(device: &File, shutdown: &OwnedFd) -> std::result::Result<PollOutcome, Errno> {
    let mut fds = [
        PollFd::new(shutdown, PollFlags::IN),
        PollFd::new(device, PollFlags::IN),
    ];
    match poll(&mut fds, -1) {
        Ok(_) => {}
        Err(Errno::INTR) => return Ok(PollOutcome::Spurious),
        Err(e) => return Err(e),
    }
    if fds[0].revents().contains(PollFlags::IN) {
        Ok(PollOutcome::Shutdown)
    } else if fds[1].revents().contains(PollFlags::IN) {
        Ok(PollOutcome::Interrupt)
    } else {
        Ok(PollOutcome::Spurious)
    }
}

fn interrupt_loop(device: &File, shutdown: &OwnedFd, handler: &SharedHandler) {
    debug!("UIO interrupt thread started");
    loop {
        if let Err(e) = rustix::io::write(device, &1u32.to_ne_bytes()) {
            error!("Failed to re-arm UIO interrupt: {e}");
            return;
        }
        match wait_for_event(device, shutdown) {
            Ok(PollOutcome::Shutdown) => break,
            Ok(PollOutcome::Spurious) => {}
            Ok(PollOutcome::Interrupt) => {
                let mut count = [0u8; 4];
                match rustix::io::read(device, &mut count) {
                    Ok(n) if n == count.len() => {
                        let callback = handler.lock().unwrap_or_else(PoisonError::into_inner).clone();
                        if let Some(callback) = callback {
                            callback();
                        }
                    }
                    Ok(n) => {
                        error!("Short UIO event read ({n} bytes)");
                        return;
                    }
                    Err(e) => {
                        error!("UIO event read failed: {e}");
                        return;
                    }
                }
            }
            Err(e) => {
                error!("UIO poll failed: {e}");
                return;
            }
        }
    }
    debug!("UIO interrupt thread stopped");
}
