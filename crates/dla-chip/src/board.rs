//! Platform constants per board.
//!
//! Only the embedded SoC (HPS) boards are modelled; they expose the IP
//! through UIO with one instance per bitstream.

use std::fmt;

/// Stride between instance CSR windows inside the mapped register region.
pub const CSR_STRIDE: u64 = 0x1000;

/// Embedded SoC board variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HpsBoard {
    /// Agilex 7 SoC.
    Agx7,
    /// Agilex 5 SoC.
    Agx5,
    /// Arria 10 / Cyclone V SoC and anything else.
    #[default]
    Generic,
}

impl HpsBoard {
    /// Accelerator instances per bitstream.
    #[must_use]
    pub const fn max_instances(self) -> usize {
        1
    }

    /// External memory reserved for the accelerator, per instance.
    #[must_use]
    pub const fn ddr_size_per_instance(self) -> u64 {
        1 << 29
    }

    /// DDR interface clock (MHz) that drives the CSR clock counters.
    #[must_use]
    pub const fn ddr_clock_mhz(self) -> f64 {
        match self {
            Self::Agx7 => 333.3325,
            Self::Agx5 => 200.0,
            Self::Generic => 266.666_666,
        }
    }

    /// Accelerator core clock (MHz).
    #[must_use]
    pub const fn core_clock_mhz(self) -> f64 {
        match self {
            Self::Agx7 => 400.0,
            Self::Agx5 | Self::Generic => 200.0,
        }
    }
}

impl fmt::Display for HpsBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agx7 => write!(f, "Agilex 7 SoC"),
            Self::Agx5 => write!(f, "Agilex 5 SoC"),
            Self::Generic => write!(f, "generic SoC"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddr_fits_u32_address_space() {
        for board in [HpsBoard::Agx7, HpsBoard::Agx5, HpsBoard::Generic] {
            assert!(board.ddr_size_per_instance() <= 1 << 32);
            assert!(board.ddr_clock_mhz() > 0.0);
        }
    }
}
