//! Identity ROM at the bottom of every CSR window.
//!
//! The ROM carries the values the compiler baked into a graph, so the host
//! can refuse to run a graph built for different hardware.
//!
//! ```text
//! 0x00  architecture hash    4 words
//! 0x10  build version        32 bytes, NUL-terminated ASCII
//! 0x30  architecture name    32 bytes, NUL-terminated ASCII
//! ```
//!
//! Strings are packed four characters per word, first character in the
//! least significant byte.

/// Architecture hash offset.
pub const ARCH_HASH: u32 = 0x00;
/// Architecture hash size in bytes.
pub const ARCH_HASH_SIZE: u32 = 16;
/// Architecture hash size in 32-bit words.
pub const ARCH_HASH_WORDS: usize = (ARCH_HASH_SIZE / 4) as usize;

/// Build version string offset.
pub const BUILD_VERSION: u32 = ARCH_HASH + ARCH_HASH_SIZE;
/// Build version field size in bytes.
pub const BUILD_VERSION_SIZE: u32 = 32;

/// Architecture name string offset.
pub const ARCH_NAME: u32 = BUILD_VERSION + BUILD_VERSION_SIZE;
/// Architecture name field size in bytes.
pub const ARCH_NAME_SIZE: u32 = 32;

/// First offset past the ROM.
pub const END: u32 = ARCH_NAME + ARCH_NAME_SIZE;

/// Pack an ASCII string into ROM words (NUL-padded to `field_size` bytes).
///
/// Used by simulators and tests that need to author a ROM image.
#[must_use]
pub fn pack_string(s: &str, field_size: u32) -> Vec<u32> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.resize(field_size as usize, 0);
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
