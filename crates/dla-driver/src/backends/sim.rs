//! Simulated transport
//!
//! Implements [`Transport`] over in-memory CSR windows, external memory and
//! mailbox RAM, modelling the parts of the hardware contract the runtime
//! depends on:
//!
//! 1. **Instance discovery**: the interrupt mask only reads back on present
//!    instances; absent slots read zero and ignore writes.
//! 2. **Identity ROM and license flag** at their fixed offsets.
//! 3. **Job queue**: writes to the input/output base register are counted as
//!    enqueued jobs; [`SimulatedTransport::complete_jobs`] advances the 32-bit
//!    completion counter (wrapping) and raises the done interrupt when unmasked.
//! 4. **Debug network**: request/valid/data handshake over per-module word maps.
//! 5. **Stream controller peer**: answers ping, initialize, schedule-item and
//!    get-status messages the way the controller firmware does.
//!
//! Every CSR and DDR write is counted and logged so tests can assert on
//! exact register sequences (or on their absence).

use crate::error::{DlaError, Result};
use crate::stream_controller::{
    InitializePayload, JobDescriptor, ManualArmDmaTransferPayload,
    ManualScheduleDlaInferencePayload, StatusPayload,
};
use crate::transport::{
    check_csr_access, check_ddr_range, InterruptHandler, Transport, TransportType,
};
use dla_chip::mailbox::{self, MessageType, StatusCode};
use dla_chip::{csr, debug_net, rom};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// Identity ROM contents of the simulated bitstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimIdentity {
    /// Architecture hash words
    pub arch_hash: [u32; rom::ARCH_HASH_WORDS],
    /// Build version string
    pub build_version: String,
    /// Architecture name string
    pub arch_name: String,
}

impl Default for SimIdentity {
    fn default() -> Self {
        Self {
            arch_hash: [0x1234_5678, 0x9abc_def0, 0x0fed_cba9, 0x8765_4321],
            build_version: "2024.3.0".to_string(),
            arch_name: "AGX7_Performance".to_string(),
        }
    }
}

/// Simulated board description
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Instance slots the simulated bitstream reports
    pub max_instances: usize,
    /// Instances actually present (interrupt mask reads back)
    pub present_instances: usize,
    /// External memory per present instance, in bytes
    pub ddr_size: u64,
    /// Clock (MHz) for the clock counters
    pub ddr_clock_mhz: f64,
    /// Core clock (MHz)
    pub core_clock_mhz: f64,
    /// Value of the license flag register
    pub license_flag: u32,
    /// Identity ROM contents
    pub identity: SimIdentity,
    /// Whether interrupt handlers may be registered
    pub interrupts: bool,
    /// Whether a stream-controller mailbox is attached
    pub stream_controller: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_instances: 4,
            present_instances: 1,
            ddr_size: 16 << 20,
            ddr_clock_mhz: 266.666_666,
            core_clock_mhz: 200.0,
            license_flag: csr::license::LICENSED,
            identity: SimIdentity::default(),
            interrupts: true,
            stream_controller: false,
        }
    }
}

impl SimConfig {
    /// Set the number of present instances
    #[must_use]
    pub const fn with_instances(mut self, present: usize) -> Self {
        self.present_instances = present;
        self
    }

    /// Set the per-instance external memory size
    #[must_use]
    pub const fn with_ddr_size(mut self, bytes: u64) -> Self {
        self.ddr_size = bytes;
        self
    }

    /// Set the license flag register value
    #[must_use]
    pub const fn with_license_flag(mut self, value: u32) -> Self {
        self.license_flag = value;
        self
    }

    /// Enable or disable interrupt support
    #[must_use]
    pub const fn with_interrupts(mut self, enabled: bool) -> Self {
        self.interrupts = enabled;
        self
    }

    /// Attach a stream-controller peer
    #[must_use]
    pub const fn with_stream_controller(mut self, enabled: bool) -> Self {
        self.stream_controller = enabled;
        self
    }

    /// Set the identity ROM contents
    #[must_use]
    pub fn with_identity(mut self, identity: SimIdentity) -> Self {
        self.identity = identity;
        self
    }
}

/// Counters and state of the simulated stream-controller firmware
#[derive(Debug, Clone, Default)]
pub struct PeerState {
    /// Whether the peer answers at all
    pub responsive: bool,
    /// Last initialize request
    pub initialized: Option<InitializePayload>,
    /// Job descriptors received, in order
    pub scheduled: Vec<JobDescriptor>,
    /// Manual DMA arm requests received
    pub manual_transfers: Vec<ManualArmDmaTransferPayload>,
    /// Manual inference requests received
    pub manual_inferences: Vec<ManualScheduleDlaInferencePayload>,
    /// Source buffers received
    pub received_source_buffers: u32,
    /// Jobs executed
    pub executed_jobs: u32,
    /// Messages the peer did not understand
    pub bad_messages: u32,
    /// Sequence id of the peer's next outgoing message
    send_sequence: u32,
    /// Incoming messages still to be ignored
    ignore_next: u32,
}

#[derive(Debug)]
struct SimState {
    csr: Vec<Vec<u32>>,
    ddr: Vec<Vec<u8>>,
    mailbox: Vec<u8>,
    debug_modules: BTreeMap<u32, HashMap<u32, u32>>,
    jobs_started: Vec<u64>,
    csr_log: Vec<(usize, u32, u32)>,
    ddr_writes: u64,
    peer: PeerState,
}

impl SimState {
    fn word(&self, instance: usize, offset: u32) -> u32 {
        self.csr[instance][(offset / 4) as usize]
    }

    fn set_word(&mut self, instance: usize, offset: u32, value: u32) {
        self.csr[instance][(offset / 4) as usize] = value;
    }

    fn mailbox_word(&self, offset: u32) -> u32 {
        let o = offset as usize;
        u32::from_le_bytes([
            self.mailbox[o],
            self.mailbox[o + 1],
            self.mailbox[o + 2],
            self.mailbox[o + 3],
        ])
    }

    fn set_mailbox_word(&mut self, offset: u32, value: u32) {
        let o = offset as usize;
        self.mailbox[o..o + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// In-memory accelerator model
pub struct SimulatedTransport {
    config: SimConfig,
    state: Mutex<SimState>,
    handler: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl std::fmt::Debug for SimulatedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SimulatedTransport {
    /// Build a simulated board
    ///
    /// # Panics
    ///
    /// Panics if `ddr_size` does not fit in `usize`.
    pub fn new(config: SimConfig) -> Self {
        let words = (csr::WINDOW_SIZE / 4) as usize;
        let mut csr_windows = vec![vec![0u32; words]; config.max_instances];
        let present = config.present_instances.min(config.max_instances);

        for window in csr_windows.iter_mut().take(present) {
            let id = &config.identity;
            for (i, w) in id.arch_hash.iter().enumerate() {
                window[(rom::ARCH_HASH / 4) as usize + i] = *w;
            }
            for (i, w) in rom::pack_string(&id.build_version, rom::BUILD_VERSION_SIZE)
                .into_iter()
                .enumerate()
            {
                window[(rom::BUILD_VERSION / 4) as usize + i] = w;
            }
            for (i, w) in rom::pack_string(&id.arch_name, rom::ARCH_NAME_SIZE)
                .into_iter()
                .enumerate()
            {
                window[(rom::ARCH_NAME / 4) as usize + i] = w;
            }
            window[(csr::LICENSE_FLAG / 4) as usize] = config.license_flag;
        }

        let ddr_len = usize::try_from(config.ddr_size).expect("simulated DDR size fits usize");
        let state = SimState {
            csr: csr_windows,
            ddr: vec![vec![0u8; ddr_len]; present],
            mailbox: vec![0u8; mailbox::RAM_SIZE as usize],
            debug_modules: BTreeMap::new(),
            jobs_started: vec![0; present],
            csr_log: Vec::new(),
            ddr_writes: 0,
            peer: PeerState {
                responsive: true,
                ..PeerState::default()
            },
        };

        debug!(
            "SimulatedTransport: {present}/{} instances, {} MB DDR each",
            config.max_instances,
            config.ddr_size >> 20
        );

        Self {
            config,
            state: Mutex::new(state),
            handler: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn present(&self, instance: usize) -> bool {
        instance < self.config.present_instances.min(self.config.max_instances)
    }

    fn fire_interrupt_if_unmasked(&self, instance: usize) {
        let unmasked = {
            let st = self.lock();
            st.word(instance, csr::INTERRUPT_MASK) & st.word(instance, csr::INTERRUPT_CONTROL) != 0
        };
        if unmasked {
            self.raise_interrupt();
        }
    }

    // ── Hardware-side hooks ──────────────────────────────────────────────────

    /// Finish `n` jobs on `instance`: advance the completion counter and
    /// signal the done interrupt
    pub fn complete_jobs(&self, instance: usize, n: u32) {
        {
            let mut st = self.lock();
            let count = st.word(instance, csr::COMPLETION_COUNT).wrapping_add(n);
            st.set_word(instance, csr::COMPLETION_COUNT, count);
            let status = st.word(instance, csr::INTERRUPT_CONTROL) | csr::interrupt::DONE;
            st.set_word(instance, csr::INTERRUPT_CONTROL, status);
            st.peer.executed_jobs = st.peer.executed_jobs.wrapping_add(n);
            trace!("sim: instance {instance} completion count -> {count}");
        }
        self.fire_interrupt_if_unmasked(instance);
    }

    /// Overwrite the raw completion counter without raising an interrupt
    pub fn set_completion_count(&self, instance: usize, raw: u32) {
        self.lock().set_word(instance, csr::COMPLETION_COUNT, raw);
    }

    /// Overwrite the descriptor-diagnostics register
    pub fn set_desc_diagnostics(&self, instance: usize, bits: u32) {
        self.lock().set_word(instance, csr::DESC_DIAGNOSTICS, bits);
    }

    /// Overwrite a lo/hi counter pair
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_counter64(&self, instance: usize, lo_offset: u32, value: u64) {
        let mut st = self.lock();
        st.set_word(instance, lo_offset, value as u32);
        st.set_word(instance, lo_offset + 4, (value >> 32) as u32);
    }

    /// Invoke the registered interrupt handler, if any
    pub fn raise_interrupt(&self) {
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Whether an interrupt handler is installed
    pub fn has_interrupt_handler(&self) -> bool {
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Publish a debug-network module with `(offset, description, value)` entries
    ///
    /// The self-describing list is laid out from address 0; counter offsets
    /// should sit above it.
    pub fn add_debug_module(&self, module: u32, entries: &[(u32, &str, u32)]) {
        let mut words = HashMap::new();
        let mut addr = 0u32;
        for &(offset, description, value) in entries {
            words.insert(addr, offset);
            addr += 4;
            let padded = (description.len() as u32 / 4 + 1) * 4;
            for w in rom::pack_string(description, padded) {
                words.insert(addr, w);
                addr += 4;
            }
            words.insert(offset, value);
        }
        words.insert(addr, 0);
        self.lock().debug_modules.insert(module, words);
    }

    /// Overwrite one word of a debug-network module's address space
    pub fn set_debug_word(&self, module: u32, address: u32, value: u32) {
        self.lock()
            .debug_modules
            .entry(module)
            .or_default()
            .insert(address, value);
    }

    /// Jobs enqueued through the input/output base register
    pub fn jobs_started(&self, instance: usize) -> u64 {
        self.lock().jobs_started.get(instance).copied().unwrap_or(0)
    }

    /// Every CSR write since the last [`Self::reset_counters`], in order
    pub fn csr_writes(&self) -> Vec<(usize, u32, u32)> {
        self.lock().csr_log.clone()
    }

    /// Number of DDR writes since the last [`Self::reset_counters`]
    pub fn ddr_write_count(&self) -> u64 {
        self.lock().ddr_writes
    }

    /// CSR plus DDR writes since the last [`Self::reset_counters`]
    pub fn write_count(&self) -> u64 {
        let st = self.lock();
        st.csr_log.len() as u64 + st.ddr_writes
    }

    /// Forget recorded writes
    pub fn reset_counters(&self) {
        let mut st = self.lock();
        st.csr_log.clear();
        st.ddr_writes = 0;
    }

    /// Copy of external memory, as the hardware would see it
    ///
    /// # Errors
    ///
    /// Returns error if the range is outside the instance's memory.
    pub fn peek_ddr(&self, instance: usize, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_ddr(instance, addr, &mut buf)?;
        Ok(buf)
    }

    /// Write external memory as the hardware would (not counted as a host write)
    ///
    /// # Errors
    ///
    /// Returns error if the range is outside the instance's memory.
    #[allow(clippy::cast_possible_truncation)]
    pub fn poke_ddr(&self, instance: usize, addr: u64, data: &[u8]) -> Result<()> {
        check_ddr_range(addr, data.len(), self.config.ddr_size)?;
        let mut st = self.lock();
        let mem = st
            .ddr
            .get_mut(instance)
            .ok_or_else(|| DlaError::invalid_access(format!("instance {instance} absent")))?;
        let start = addr as usize;
        mem[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Snapshot of the stream-controller peer
    pub fn peer(&self) -> PeerState {
        self.lock().peer.clone()
    }

    /// Make the stream-controller peer stop (or resume) answering
    pub fn set_peer_responsive(&self, responsive: bool) {
        self.lock().peer.responsive = responsive;
    }

    /// Make the stream-controller peer ignore its next `count` messages
    pub fn ignore_peer_messages(&self, count: u32) {
        self.lock().peer.ignore_next = count;
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn update_debug_network(st: &mut SimState, request: u32) {
        let module = request >> debug_net::MODULE_SHIFT;
        let address = request & debug_net::ADDRESS_MASK;
        let word = st
            .debug_modules
            .get(&module)
            .and_then(|words| words.get(&address))
            .copied();
        for instance in 0..st.csr.len() {
            st.set_word(instance, csr::DEBUG_NETWORK_VALID, u32::from(word.is_some()));
            st.set_word(instance, csr::DEBUG_NETWORK_DATA, word.unwrap_or(0));
        }
    }

    fn service_mailbox(st: &mut SimState) {
        if !st.peer.responsive {
            return;
        }
        if st.peer.ignore_next > 0 {
            st.peer.ignore_next -= 1;
            return;
        }
        let base = mailbox::SEND_OFFSET;
        let message_type = MessageType::from_u32(st.mailbox_word(base + mailbox::HEADER_TYPE));
        let sequence = st.mailbox_word(base + mailbox::HEADER_SEQUENCE);
        let payload_at = (base + mailbox::PAYLOAD) as usize;

        // acknowledge receipt
        st.set_mailbox_word(base + mailbox::HEADER_READY, sequence);
        trace!("sim peer: {message_type:?} seq {sequence}");

        let payload = st.mailbox[payload_at..payload_at + MAX_PAYLOAD].to_vec();
        let (reply, reply_payload): (MessageType, Vec<u8>) = match message_type {
            MessageType::Ping => (MessageType::Pong, Vec::new()),
            MessageType::GetStatus => {
                let status = StatusPayload {
                    status: StatusCode::Ok as u32,
                    status_line: 0,
                    received_source_buffers: st.peer.received_source_buffers,
                    scheduled_inferences: st.peer.scheduled.len() as u32,
                    executed_jobs: st.peer.executed_jobs,
                };
                (MessageType::Status, bytemuck::bytes_of(&status).to_vec())
            }
            MessageType::ScheduleItem => {
                let item: JobDescriptor = read_payload(&payload);
                st.peer.scheduled.push(item);
                (MessageType::NoOperation, Vec::new())
            }
            MessageType::InitializeStreamController => {
                let init: InitializePayload = read_payload(&payload);
                st.peer.initialized = Some(init);
                (MessageType::NoOperation, Vec::new())
            }
            MessageType::ManualArmDmaTransfer => {
                let arm: ManualArmDmaTransferPayload = read_payload(&payload);
                st.peer.manual_transfers.push(arm);
                (MessageType::NoOperation, Vec::new())
            }
            MessageType::ManualScheduleDlaInference => {
                let job: ManualScheduleDlaInferencePayload = read_payload(&payload);
                st.peer.manual_inferences.push(job);
                (MessageType::NoOperation, Vec::new())
            }
            _ => {
                st.peer.bad_messages += 1;
                return;
            }
        };

        let rx = mailbox::RECEIVE_OFFSET;
        let peer_sequence = st.peer.send_sequence;
        st.peer.send_sequence = peer_sequence.wrapping_add(1);
        st.set_mailbox_word(rx + mailbox::HEADER_TYPE, reply as u32);
        st.set_mailbox_word(rx + mailbox::HEADER_SEQUENCE, peer_sequence);
        let at = (rx + mailbox::PAYLOAD) as usize;
        st.mailbox[at..at + reply_payload.len()].copy_from_slice(&reply_payload);
        st.set_mailbox_word(rx + mailbox::HEADER_READY, mailbox::MESSAGE_READY_MAGIC);
    }
}

const MAX_PAYLOAD: usize = 32;

fn read_payload<T: bytemuck::Pod>(bytes: &[u8]) -> T {
    bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<T>()])
}

impl Transport for SimulatedTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Simulated
    }

    fn max_instances(&self) -> usize {
        self.config.max_instances
    }

    fn ddr_size_per_instance(&self) -> u64 {
        self.config.ddr_size
    }

    fn ddr_clock_mhz(&self) -> f64 {
        self.config.ddr_clock_mhz
    }

    fn core_clock_mhz(&self) -> f64 {
        self.config.core_clock_mhz
    }

    fn write_csr(&self, instance: usize, offset: u32, value: u32) -> Result<()> {
        check_csr_access(instance, self.config.max_instances, offset)?;
        let mut st = self.lock();
        st.csr_log.push((instance, offset, value));
        if !self.present(instance) || offset < rom::END {
            return Ok(());
        }
        match offset {
            csr::INTERRUPT_CONTROL => {
                let status = st.word(instance, offset) & !value;
                st.set_word(instance, offset, status);
            }
            csr::LICENSE_FLAG | csr::COMPLETION_COUNT => {}
            csr::DEBUG_NETWORK_ADDR => {
                st.set_word(instance, offset, value);
                Self::update_debug_network(&mut st, value);
            }
            csr::INPUT_OUTPUT_BASE_ADDR => {
                st.set_word(instance, offset, value);
                st.jobs_started[instance] += 1;
            }
            _ => st.set_word(instance, offset, value),
        }
        Ok(())
    }

    fn read_csr(&self, instance: usize, offset: u32) -> Result<u32> {
        check_csr_access(instance, self.config.max_instances, offset)?;
        if !self.present(instance) {
            return Ok(0);
        }
        Ok(self.lock().word(instance, offset))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_ddr(&self, instance: usize, addr: u64, data: &[u8]) -> Result<()> {
        check_ddr_range(addr, data.len(), self.config.ddr_size)?;
        let mut st = self.lock();
        st.ddr_writes += 1;
        let mem = st
            .ddr
            .get_mut(instance)
            .ok_or_else(|| DlaError::invalid_access(format!("instance {instance} absent")))?;
        let start = addr as usize;
        mem[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_ddr(&self, instance: usize, addr: u64, buf: &mut [u8]) -> Result<()> {
        check_ddr_range(addr, buf.len(), self.config.ddr_size)?;
        let st = self.lock();
        let mem = st
            .ddr
            .get(instance)
            .ok_or_else(|| DlaError::invalid_access(format!("instance {instance} absent")))?;
        let start = addr as usize;
        buf.copy_from_slice(&mem[start..start + buf.len()]);
        Ok(())
    }

    fn register_interrupt_handler(&self, handler: InterruptHandler) -> Result<()> {
        if !self.config.interrupts {
            return Err(DlaError::InterruptsUnsupported);
        }
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::from(handler));
        Ok(())
    }

    fn unregister_interrupt_handler(&self) {
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn has_stream_controller(&self) -> bool {
        self.config.stream_controller
    }

    fn write_mailbox(&self, offset: u32, data: &[u8]) -> Result<()> {
        if !self.config.stream_controller {
            return Err(DlaError::stream_controller("no stream controller attached"));
        }
        check_mailbox_range(offset, data.len())?;
        let mut st = self.lock();
        let start = offset as usize;
        st.mailbox[start..start + data.len()].copy_from_slice(data);
        let rings_doorbell = offset == mailbox::SEND_OFFSET + mailbox::HEADER_READY
            && data.len() >= 4
            && st.mailbox_word(offset) == mailbox::MESSAGE_READY_MAGIC;
        if rings_doorbell {
            Self::service_mailbox(&mut st);
        }
        Ok(())
    }

    fn read_mailbox(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        if !self.config.stream_controller {
            return Err(DlaError::stream_controller("no stream controller attached"));
        }
        check_mailbox_range(offset, buf.len())?;
        let st = self.lock();
        let start = offset as usize;
        buf.copy_from_slice(&st.mailbox[start..start + buf.len()]);
        Ok(())
    }
}

fn check_mailbox_range(offset: u32, len: usize) -> Result<()> {
    if offset as usize + len > mailbox::RAM_SIZE as usize {
        return Err(DlaError::invalid_access(format!(
            "mailbox range {offset:#x}+{len:#x} exceeds {:#x}",
            mailbox::RAM_SIZE
        )));
    }
    Ok(())
}
