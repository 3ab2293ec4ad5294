//! Stream-controller mailbox.
//!
//! The stream controller is a soft microcontroller beside the accelerator.
//! Host and controller share a 4 KiB mailbox RAM split into two halves:
//!
//! ```text
//! 0x000  host -> controller   [ready/seq][type][seq][payload...]
//! 0x800  controller -> host   [ready/seq][type][seq][payload...]
//! ```
//!
//! The sender fills type, sequence and payload, then writes
//! [`MESSAGE_READY_MAGIC`] to the first word. The receiver acknowledges by
//! overwriting that word with the message's sequence id.

use std::fmt;

/// Size of the mailbox RAM.
pub const RAM_SIZE: u32 = 0x1000;
/// Host-to-controller half.
pub const SEND_OFFSET: u32 = 0x000;
/// Controller-to-host half.
pub const RECEIVE_OFFSET: u32 = 0x800;
/// Bytes available in one half.
pub const HALF_SIZE: u32 = RAM_SIZE / 2;

/// Ready marker written last by the sender.
pub const MESSAGE_READY_MAGIC: u32 = 0x5522_5522;

/// Header word: ready flag, or the acknowledged sequence id.
pub const HEADER_READY: u32 = 0;
/// Header word: [`MessageType`].
pub const HEADER_TYPE: u32 = 4;
/// Header word: sender's sequence id.
pub const HEADER_SEQUENCE: u32 = 8;
/// Payload start, relative to the half.
pub const PAYLOAD: u32 = 12;

/// Polls of the acknowledge/ready word before a transfer is abandoned.
pub const POLL_RETRIES: u32 = 100;
/// Sleep between polls, in milliseconds.
pub const POLL_INTERVAL_MS: u64 = 1;

/// Message discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// Not a message.
    Invalid = 0,
    /// Acknowledgement carrying no data.
    NoOperation = 1,
    /// Request a [`MessageType::Status`] reply.
    GetStatus = 2,
    /// Status counters.
    Status = 3,
    /// Queue one job descriptor.
    ScheduleItem = 4,
    /// Liveness probe.
    Ping = 5,
    /// Liveness reply.
    Pong = 6,
    /// Configure source buffers and the expected request count.
    InitializeStreamController = 7,
    /// Debug: arm one input DMA transfer by hand.
    ManualArmDmaTransfer = 8,
    /// Debug: start one inference by hand.
    ManualScheduleDlaInference = 9,
}

impl MessageType {
    /// Decode a header word; unknown values map to [`MessageType::Invalid`].
    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::NoOperation,
            2 => Self::GetStatus,
            3 => Self::Status,
            4 => Self::ScheduleItem,
            5 => Self::Ping,
            6 => Self::Pong,
            7 => Self::InitializeStreamController,
            8 => Self::ManualArmDmaTransfer,
            9 => Self::ManualScheduleDlaInference,
            _ => Self::Invalid,
        }
    }
}

/// Controller health codes reported in a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    /// Running normally.
    Ok = 1000,
    /// Unspecified failure.
    Error = 1001,
    /// A message with an unknown type arrived.
    BadMessage = 1002,
    /// A message arrived out of sequence.
    BadMessageSequence = 1003,
    /// A job descriptor was malformed.
    BadDescriptor = 1004,
    /// An asynchronous input transfer failed.
    AsyncTransferFailed = 1005,
    /// The modular scatter-gather DMA reported an error.
    MsgDmaFailed = 1006,
    /// A request carried an out-of-range parameter.
    InvalidParameter = 1007,
}

impl StatusCode {
    /// Decode a status word.
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1000 => Self::Ok,
            1001 => Self::Error,
            1002 => Self::BadMessage,
            1003 => Self::BadMessageSequence,
            1004 => Self::BadDescriptor,
            1005 => Self::AsyncTransferFailed,
            1006 => Self::MsgDmaFailed,
            1007 => Self::InvalidParameter,
            _ => return None,
        })
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::BadMessage => "bad message",
            Self::BadMessageSequence => "bad message sequence",
            Self::BadDescriptor => "bad descriptor",
            Self::AsyncTransferFailed => "async transfer failed",
            Self::MsgDmaFailed => "msgdma failed",
            Self::InvalidParameter => "invalid parameter",
        };
        f.write_str(name)
    }
}
