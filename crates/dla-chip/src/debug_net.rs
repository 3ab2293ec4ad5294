//! Debug network: a secondary self-describing register bus.
//!
//! Each attached module publishes a list of `(offset, description)` entries
//! starting at address 0 of its own address space:
//!
//! ```text
//! word 0:        counter offset (0 terminates the list)
//! word 1..:      description, ASCII packed 4 chars/word, NUL-terminated
//! next word:     next counter offset ...
//! ```
//!
//! A request is issued by writing `module << 24 | address` to
//! [`crate::csr::DEBUG_NETWORK_ADDR`], then polling
//! [`crate::csr::DEBUG_NETWORK_VALID`] before reading
//! [`crate::csr::DEBUG_NETWORK_DATA`].

/// Module ids occupy the top byte of a request.
pub const MODULE_SHIFT: u32 = 24;

/// Address bits within a module.
pub const ADDRESS_MASK: u32 = 0x00FF_FFFF;

/// Number of module ids to probe.
pub const MAX_MODULES: u32 = 256;

/// Valid-bit polls per request before giving up.
pub const VALID_RETRIES: u32 = 5;

/// Upper bound on words in one description string.
pub const MAX_DESCRIPTION_WORDS: u32 = 64;

/// Description prefix of entries that exist only for their read side effect
/// (e.g. freezing a counter group) and carry no reportable value.
pub const HIDDEN_PREFIX: char = '_';

/// Encode a request word.
#[must_use]
pub const fn request(module: u32, address: u32) -> u32 {
    (module << MODULE_SHIFT) | (address & ADDRESS_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encoding() {
        assert_eq!(request(0, 0), 0);
        assert_eq!(request(3, 0x10), 0x0300_0010);
        assert_eq!(request(1, 0xFFFF_FFFF), 0x01FF_FFFF);
    }
}
