//! Identity ROM access
//!
//! The bitstream carries an architecture hash, a build-version string and an
//! architecture name in the first words of every instance's CSR window. A
//! compiled graph records the same three values; graph setup refuses to run
//! on hardware that disagrees.

use crate::error::Result;
use crate::transport::Transport;
use dla_chip::rom;
use std::fmt;

/// Architecture hash words as stored in the ROM
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchHash(pub [u32; rom::ARCH_HASH_WORDS]);

impl fmt::Display for ArchHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, word) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{word:08x}")?;
        }
        Ok(())
    }
}

/// What a graph was compiled for, or what an instance reports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchIdentity {
    /// Architecture hash
    pub arch_hash: ArchHash,
    /// IP build version
    pub build_version: String,
    /// Architecture name
    pub arch_name: String,
}

impl ArchIdentity {
    /// Identity from its parts
    pub fn new(
        arch_hash: [u32; rom::ARCH_HASH_WORDS],
        build_version: impl Into<String>,
        arch_name: impl Into<String>,
    ) -> Self {
        Self {
            arch_hash: ArchHash(arch_hash),
            build_version: build_version.into(),
            arch_name: arch_name.into(),
        }
    }

    /// Read the identity ROM of `instance`
    ///
    /// # Errors
    ///
    /// Propagates CSR read failures.
    pub fn read(transport: &dyn Transport, instance: usize) -> Result<Self> {
        let mut hash = [0u32; rom::ARCH_HASH_WORDS];
        for (i, word) in (0u32..).zip(hash.iter_mut()) {
            *word = transport.read_csr(instance, rom::ARCH_HASH + 4 * i)?;
        }
        Ok(Self {
            arch_hash: ArchHash(hash),
            build_version: read_rom_string(
                transport,
                instance,
                rom::BUILD_VERSION,
                rom::BUILD_VERSION_SIZE,
            )?,
            arch_name: read_rom_string(transport, instance, rom::ARCH_NAME, rom::ARCH_NAME_SIZE)?,
        })
    }
}

impl fmt::Display for ArchIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (build {}, hash {})",
            self.arch_name, self.build_version, self.arch_hash
        )
    }
}

/// Read a NUL-terminated string packed 4 bytes per register
fn read_rom_string(
    transport: &dyn Transport,
    instance: usize,
    offset: u32,
    max_len: u32,
) -> Result<String> {
    let mut bytes = Vec::new();
    'words: for at in (offset..offset + max_len).step_by(4) {
        let word = transport.read_csr(instance, at)?;
        for b in word.to_le_bytes() {
            if b == 0 {
                break 'words;
            }
            bytes.push(b);
        }
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{SimConfig, SimIdentity, SimulatedTransport};

    #[test]
    fn test_read_identity() {
        let sim = SimulatedTransport::new(SimConfig::default());
        let id = ArchIdentity::read(&sim, 0).unwrap();
        let expected = SimIdentity::default();
        assert_eq!(id.arch_hash.0, expected.arch_hash);
        assert_eq!(id.build_version, expected.build_version);
        assert_eq!(id.arch_name, expected.arch_name);
    }

    #[test]
    fn test_string_fills_field() {
        let name = "A".repeat(rom::ARCH_NAME_SIZE as usize + 8);
        let sim = SimulatedTransport::new(SimConfig::default().with_identity(SimIdentity {
            arch_name: name,
            ..SimIdentity::default()
        }));
        let id = ArchIdentity::read(&sim, 0).unwrap();
        assert!(id.arch_name.len() <= rom::ARCH_NAME_SIZE as usize);
        assert!(id.arch_name.chars().all(|c| c == 'A'));
    }

    #[test]
    fn test_hash_display() {
        let hash = ArchHash([1, 0xdead_beef, 0, 0xffff_ffff]);
        assert_eq!(hash.to_string(), "00000001 deadbeef 00000000 ffffffff");
    }
}
