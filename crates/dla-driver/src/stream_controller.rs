//! Stream-controller link
//!
//! Host-side client of the mailbox protocol spoken by the stream-controller
//! microcontroller. Each request is one message into the send half of the
//! mailbox followed by one reply from the receive half:
//!
//! ```text
//! host                                   controller
//!  | write type, seq, payload               |
//!  | write READY magic  ------------------> |
//!  | poll word 0 == seq  <----------------- | ack (copies seq)
//!  |                                        |
//!  | poll READY magic   <------------------ | reply
//!  | write peer seq back ----------------> | ack
//! ```
//!
//! Only one request may be in flight. The busy guard is a `try_lock`: a
//! second caller is turned away with `false` instead of queueing behind the
//! first.

use crate::error::Result;
use crate::transport::Transport;
use bytemuck::{Pod, Zeroable};
use dla_chip::mailbox::{self, MessageType, StatusCode};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// One job handed to the controller's queue
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct JobDescriptor {
    /// Config buffer base address
    pub config_base: u32,
    /// Config range register value (reader words minus two)
    pub config_size: u32,
    /// Input buffer address
    pub input_addr: u32,
    /// Output buffer address
    pub output_addr: u32,
}

/// Payload of [`MessageType::InitializeStreamController`]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct InitializePayload {
    /// Bytes per source buffer
    pub source_buffer_size: u32,
    /// Non-zero to drop source buffers when the queue is full
    pub drop_source_buffers: u32,
    /// Inference requests the host will schedule
    pub num_inference_requests: u32,
}

/// Payload of [`MessageType::Status`]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct StatusPayload {
    /// Raw [`StatusCode`]
    pub status: u32,
    /// Firmware source line that set the status
    pub status_line: u32,
    /// Source buffers received
    pub received_source_buffers: u32,
    /// Inferences scheduled
    pub scheduled_inferences: u32,
    /// Jobs executed
    pub executed_jobs: u32,
}

/// Payload of [`MessageType::ManualArmDmaTransfer`]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ManualArmDmaTransferPayload {
    /// Transfer length
    pub source_buffer_size: u32,
    /// Destination in external memory
    pub input_addr: u32,
    /// Non-zero when the source is the host processor
    pub from_hps: u32,
}

/// Payload of [`MessageType::ManualScheduleDlaInference`]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ManualScheduleDlaInferencePayload {
    /// Config buffer base address
    pub config_base: u32,
    /// Config range register value
    pub config_size: u32,
    /// Input buffer address
    pub input_addr: u32,
}

/// Controller counters from a status reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport(pub StatusPayload);

impl StatusReport {
    /// Decoded status code, if known
    pub const fn code(&self) -> Option<StatusCode> {
        StatusCode::from_u32(self.0.status)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.0;
        write!(
            f,
            "{},{},{},{},{}",
            s.status,
            s.status_line,
            s.received_source_buffers,
            s.scheduled_inferences,
            s.executed_jobs
        )
    }
}

#[derive(Debug, Default)]
struct LinkState {
    send_sequence: u32,
    last_receive_sequence: Option<u32>,
}

/// Reply pulled from the receive half
#[derive(Debug)]
struct Reply {
    message_type: MessageType,
    status: Option<StatusPayload>,
}

/// Client side of the stream-controller mailbox
pub struct StreamController {
    transport: Arc<dyn Transport>,
    state: Mutex<LinkState>,
    bad_messages: AtomicU32,
    poll_interval: Duration,
}

impl fmt::Debug for StreamController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamController")
            .field("transport", &self.transport.transport_type())
            .field("bad_messages", &self.bad_messages())
            .finish_non_exhaustive()
    }
}

impl StreamController {
    /// Link over `transport`'s mailbox
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: Mutex::new(LinkState::default()),
            bad_messages: AtomicU32::new(0),
            poll_interval: Duration::from_millis(mailbox::POLL_INTERVAL_MS),
        }
    }

    /// Liveness check
    ///
    /// # Errors
    ///
    /// Propagates mailbox access failures.
    pub fn ping(&self) -> Result<bool> {
        let Some(mut state) = self.try_acquire() else {
            return Ok(false);
        };
        self.transact(&mut state, MessageType::Ping, &[], MessageType::Pong)
            .map(|reply| reply.is_some())
    }

    /// Configure source buffering and the expected request count
    ///
    /// # Errors
    ///
    /// Propagates mailbox access failures.
    pub fn initialize(
        &self,
        source_buffer_size: u32,
        drop_source_buffers: bool,
        num_inference_requests: u32,
    ) -> Result<bool> {
        let payload = InitializePayload {
            source_buffer_size,
            drop_source_buffers: u32::from(drop_source_buffers),
            num_inference_requests,
        };
        let Some(mut state) = self.try_acquire() else {
            return Ok(false);
        };
        self.transact(
            &mut state,
            MessageType::InitializeStreamController,
            bytemuck::bytes_of(&payload),
            MessageType::NoOperation,
        )
        .map(|reply| reply.is_some())
    }

    /// Queue job descriptors, one message each
    ///
    /// Every descriptor is sent even after one goes unacknowledged; the
    /// result is `true` only if all of them were accepted.
    ///
    /// # Errors
    ///
    /// Propagates mailbox access failures.
    pub fn schedule_items(&self, items: &[JobDescriptor]) -> Result<bool> {
        let Some(mut state) = self.try_acquire() else {
            return Ok(false);
        };
        let mut all_accepted = true;
        for item in items {
            let reply = self.transact(
                &mut state,
                MessageType::ScheduleItem,
                bytemuck::bytes_of(item),
                MessageType::NoOperation,
            )?;
            all_accepted &= reply.is_some();
        }
        Ok(all_accepted)
    }

    /// Fetch the controller's counters
    ///
    /// Returns `None` when the link is busy or the controller does not answer.
    ///
    /// # Errors
    ///
    /// Propagates mailbox access failures.
    pub fn status(&self) -> Result<Option<StatusReport>> {
        let Some(mut state) = self.try_acquire() else {
            return Ok(None);
        };
        let reply = self.transact(&mut state, MessageType::GetStatus, &[], MessageType::Status)?;
        Ok(reply.and_then(|r| r.status).map(StatusReport))
    }

    /// Debug trigger: arm one input DMA transfer
    ///
    /// # Errors
    ///
    /// Propagates mailbox access failures.
    pub fn manual_arm_dma_transfer(
        &self,
        source_buffer_size: u32,
        input_addr: u32,
        from_hps: bool,
    ) -> Result<bool> {
        let payload = ManualArmDmaTransferPayload {
            source_buffer_size,
            input_addr,
            from_hps: u32::from(from_hps),
        };
        let Some(mut state) = self.try_acquire() else {
            return Ok(false);
        };
        self.transact(
            &mut state,
            MessageType::ManualArmDmaTransfer,
            bytemuck::bytes_of(&payload),
            MessageType::NoOperation,
        )
        .map(|reply| reply.is_some())
    }

    /// Debug trigger: start one inference
    ///
    /// # Errors
    ///
    /// Propagates mailbox access failures.
    pub fn manual_schedule_inference(
        &self,
        config_base: u32,
        config_size: u32,
        input_addr: u32,
    ) -> Result<bool> {
        let payload = ManualScheduleDlaInferencePayload {
            config_base,
            config_size,
            input_addr,
        };
        let Some(mut state) = self.try_acquire() else {
            return Ok(false);
        };
        self.transact(
            &mut state,
            MessageType::ManualScheduleDlaInference,
            bytemuck::bytes_of(&payload),
            MessageType::NoOperation,
        )
        .map(|reply| reply.is_some())
    }

    /// Replies with an unexpected message type seen so far
    pub fn bad_messages(&self) -> u32 {
        self.bad_messages.load(Ordering::Relaxed)
    }

    fn try_acquire(&self) -> Option<MutexGuard<'_, LinkState>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                debug!("stream controller busy, request rejected");
                None
            }
        }
    }

    fn transact(
        &self,
        state: &mut LinkState,
        message_type: MessageType,
        payload: &[u8],
        expected: MessageType,
    ) -> Result<Option<Reply>> {
        if !self.send(state, message_type, payload)? {
            warn!("stream controller did not acknowledge {message_type:?}");
            return Ok(None);
        }
        let Some(reply) = self.receive(state)? else {
            warn!("stream controller sent no reply to {message_type:?}");
            return Ok(None);
        };
        if reply.message_type != expected {
            warn!(
                "stream controller answered {message_type:?} with {:?}, expected {expected:?}",
                reply.message_type
            );
            return Ok(None);
        }
        Ok(Some(reply))
    }

    fn send(&self, state: &mut LinkState, message_type: MessageType, payload: &[u8]) -> Result<bool> {
        let base = mailbox::SEND_OFFSET;
        let sequence = state.send_sequence;

        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&(message_type as u32).to_le_bytes());
        frame.extend_from_slice(&sequence.to_le_bytes());
        frame.extend_from_slice(payload);
        self.transport
            .write_mailbox(base + mailbox::HEADER_TYPE, &frame)?;
        self.write_word(base + mailbox::HEADER_READY, mailbox::MESSAGE_READY_MAGIC)?;
        trace!("mailbox send {message_type:?} seq {sequence}");

        for _ in 0..mailbox::POLL_RETRIES {
            if self.read_word(base + mailbox::HEADER_READY)? == sequence {
                state.send_sequence = sequence.wrapping_add(1);
                return Ok(true);
            }
            thread::sleep(self.poll_interval);
        }
        Ok(false)
    }

    fn receive(&self, state: &mut LinkState) -> Result<Option<Reply>> {
        let base = mailbox::RECEIVE_OFFSET;

        let mut ready = false;
        for _ in 0..mailbox::POLL_RETRIES {
            if self.read_word(base + mailbox::HEADER_READY)? == mailbox::MESSAGE_READY_MAGIC {
                ready = true;
                break;
            }
            thread::sleep(self.poll_interval);
        }
        if !ready {
            return Ok(None);
        }

        let message_type = MessageType::from_u32(self.read_word(base + mailbox::HEADER_TYPE)?);
        let sequence = self.read_word(base + mailbox::HEADER_SEQUENCE)?;
        let status = match message_type {
            MessageType::Status => {
                let mut raw = [0u8; std::mem::size_of::<StatusPayload>()];
                self.transport
                    .read_mailbox(base + mailbox::PAYLOAD, &mut raw)?;
                Some(bytemuck::pod_read_unaligned::<StatusPayload>(&raw))
            }
            MessageType::Pong | MessageType::NoOperation => None,
            other => {
                self.bad_messages.fetch_add(1, Ordering::Relaxed);
                debug!("mailbox: unexpected {other:?} from controller");
                None
            }
        };

        self.write_word(base + mailbox::HEADER_READY, sequence)?;
        state.last_receive_sequence = Some(sequence);
        trace!("mailbox receive {message_type:?} seq {sequence}");
        Ok(Some(Reply {
            message_type,
            status,
        }))
    }

    fn read_word(&self, offset: u32) -> Result<u32> {
        let mut word = [0u8; 4];
        self.transport.read_mailbox(offset, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    fn write_word(&self, offset: u32, value: u32) -> Result<()> {
        self.transport.write_mailbox(offset, &value.to_le_bytes())
    }
}
