//! CSR window of one accelerator instance.
//!
//! Every instance exposes the same 2 KiB window. The identity ROM sits at
//! the bottom of the window (see [`crate::rom`]); the DMA/descriptor block
//! starts at `0x200`.
//!
//! ```text
//! 0x000-0x04F  identity ROM (read-only)
//! 0x200        interrupt control / mask
//! 0x210-0x224  descriptor registers and completion counter
//! 0x240-0x24C  clock counters (lo/hi)
//! 0x250-0x258  debug network request/valid/data
//! 0x260-0x274  external-memory traffic counters (lo/hi)
//! 0x280        streaming ready flag
//! ```
//!
//! Lo/hi counter pairs must be read low word first. Reading the low word
//! latches the high word so the pair cannot tear.

/// Size of one instance's CSR window in bytes.
pub const WINDOW_SIZE: u32 = 2048;

/// Every CSR access is a 32-bit word access at a 4-byte aligned offset.
pub const ALIGNMENT: u32 = 4;

// ── Interrupts ───────────────────────────────────────────────────────────────

/// Interrupt status. Write-one-to-clear.
pub const INTERRUPT_CONTROL: u32 = 0x200;
/// Interrupt enable mask. Absent instances read back zero.
pub const INTERRUPT_MASK: u32 = 0x204;

// ── Descriptor queue ─────────────────────────────────────────────────────────

/// External-memory address of the graph's config buffer.
pub const CONFIG_BASE_ADDR: u32 = 0x210;
/// Config reader range, in 8-byte words minus two (the reader counts down to -1).
pub const CONFIG_RANGE_MINUS_TWO: u32 = 0x214;
/// External-memory address of the input buffer; the output follows it.
/// Writing this register enqueues one job.
pub const INPUT_OUTPUT_BASE_ADDR: u32 = 0x218;
/// Descriptor-queue diagnostics, see [`desc_diagnostics`].
pub const DESC_DIAGNOSTICS: u32 = 0x21C;
/// External-memory address of the shared intermediate buffer.
pub const INTERMEDIATE_BASE_ADDR: u32 = 0x220;
/// Number of jobs completed since reset. Wraps at 2^32.
pub const COMPLETION_COUNT: u32 = 0x224;

// ── License ──────────────────────────────────────────────────────────────────

/// License flag, see [`license`].
pub const LICENSE_FLAG: u32 = 0x22C;

// ── Clock counters ───────────────────────────────────────────────────────────

/// Clocks during which the accelerator was executing a job (low word).
pub const CLOCKS_ACTIVE_LO: u32 = 0x240;
/// Clocks during which the accelerator was executing a job (high word).
pub const CLOCKS_ACTIVE_HI: u32 = 0x244;
/// Clocks from first job start to last job end (low word).
pub const CLOCKS_ALL_JOBS_LO: u32 = 0x248;
/// Clocks from first job start to last job end (high word).
pub const CLOCKS_ALL_JOBS_HI: u32 = 0x24C;

// ── Debug network ────────────────────────────────────────────────────────────

/// Debug-network request: `module << 24 | address`.
pub const DEBUG_NETWORK_ADDR: u32 = 0x250;
/// Nonzero once the response to the last request is available.
pub const DEBUG_NETWORK_VALID: u32 = 0x254;
/// Response data for the last request.
pub const DEBUG_NETWORK_DATA: u32 = 0x258;

// ── External-memory traffic counters ─────────────────────────────────────────

/// Input-feature words read from external memory (low word).
pub const INPUT_FEATURE_READ_COUNT_LO: u32 = 0x260;
/// Input-feature words read from external memory (high word).
pub const INPUT_FEATURE_READ_COUNT_HI: u32 = 0x264;
/// Filter words read from external memory (low word).
pub const INPUT_FILTER_READ_COUNT_LO: u32 = 0x268;
/// Filter words read from external memory (high word).
pub const INPUT_FILTER_READ_COUNT_HI: u32 = 0x26C;
/// Output-feature words written to external memory (low word).
pub const OUTPUT_FEATURE_WRITE_COUNT_LO: u32 = 0x270;
/// Output-feature words written to external memory (high word).
pub const OUTPUT_FEATURE_WRITE_COUNT_HI: u32 = 0x274;

// ── Streaming ────────────────────────────────────────────────────────────────

/// Set to 1 to let the accelerator self-trigger on streamed input.
pub const READY_STREAMING_IFACE: u32 = 0x280;

// ── Bit definitions ──────────────────────────────────────────────────────────

/// Bits of [`INTERRUPT_CONTROL`] and [`INTERRUPT_MASK`].
pub mod interrupt {
    /// Job error.
    pub const ERROR: u32 = 1 << 0;
    /// Job done.
    pub const DONE: u32 = 1 << 1;
    /// Both sources.
    pub const ALL: u32 = ERROR | DONE;
}

/// Bits of [`DESC_DIAGNOSTICS`](super::DESC_DIAGNOSTICS).
pub mod desc_diagnostics {
    /// A job was written while the descriptor queue was full.
    pub const OVERFLOW: u32 = 1 << 0;
    /// The descriptor queue is nearly full.
    pub const ALMOST_FULL: u32 = 1 << 1;
    /// The licensed inference budget is exhausted.
    pub const OUT_OF_INFERENCES: u32 = 1 << 2;
}

/// Values of [`LICENSE_FLAG`](super::LICENSE_FLAG).
pub mod license {
    /// Evaluation IP with a limited inference budget.
    pub const UNLICENSED: u32 = 0;
    /// Fully licensed IP.
    pub const LICENSED: u32 = 1;
}

/// Whether `offset` is a legal CSR word offset.
#[must_use]
pub const fn is_valid_offset(offset: u32) -> bool {
    offset % ALIGNMENT == 0 && offset < WINDOW_SIZE
}
