//! External-memory word sizes and descriptor-queue geometry.
//!
//! Buffer sizes produced by the graph compiler are always whole numbers of
//! these words. A size that is not indicates a compiler/runtime mismatch.

/// Feature (activation) word: input, output and intermediate buffers.
pub const FEATURE_WORD_BYTES: u64 = 32;

/// Filter word: the combined config/filter/bias/scale buffer.
pub const FILTER_WORD_BYTES: u64 = 64;

/// Width of one config-reader transfer; the config range register counts these.
pub const CONFIG_READER_DATA_BYTES: u64 = 8;

/// Jobs the hardware descriptor queue can hold.
pub const DESCRIPTOR_QUEUE_JOBS: u32 = 64;

/// Descriptor-queue words consumed per job.
pub const DESCRIPTOR_WORDS_PER_JOB: u32 = 8;

/// Config range register value for `config_bytes` of config data.
///
/// The reader is a down-counter that stops at -1, so the register holds the
/// word count minus two. An empty config (graph parameters held in on-chip
/// ROM) wraps exactly as the hardware expects.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn config_range_minus_two(config_bytes: u64) -> u32 {
    (config_bytes / CONFIG_READER_DATA_BYTES).wrapping_sub(2) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_range() {
        assert_eq!(config_range_minus_two(64 * 8), 62);
        assert_eq!(config_range_minus_two(16), 0);
        assert_eq!(config_range_minus_two(0), 0xFFFF_FFFE);
    }

    #[test]
    fn filter_word_is_whole_feature_words() {
        assert_eq!(FILTER_WORD_BYTES % FEATURE_WORD_BYTES, 0);
        assert_eq!(FILTER_WORD_BYTES % CONFIG_READER_DATA_BYTES, 0);
    }
}
