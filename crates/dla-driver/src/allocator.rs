//! External-memory placement for one accelerator instance
//!
//! ```text
//! 0                                                           total_size
//! | shared (intermediate) ->      ...free...      <- private buffers |
//! ^ grows up to the high-water mark               ^ cursor moves down
//! ```
//!
//! Shared scratch data sits at the bottom so it can grow as larger graphs
//! are loaded without moving anything. Private buffers have sizes known up
//! front and are placed top-down. Only the boundary between the regions
//! ever moves; nothing is freed individually.
//!
//! The allocator is not internally synchronised. [`crate::Device`] keeps
//! one per instance behind a mutex held for the whole of graph placement.

use crate::error::{DlaError, Result};
use crate::transport::Transport;
use dla_chip::csr;
use tracing::debug;

/// Fixed base of the shared region
pub const SHARED_BASE: u64 = 0;

/// Two-ended bump allocator over one instance's external memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMemoryAllocator {
    total_size: u64,
    shared_high_water: u64,
    private_cursor: u64,
}

impl DeviceMemoryAllocator {
    /// Allocator over `total_size` bytes, both regions empty
    pub const fn new(total_size: u64) -> Self {
        Self {
            total_size,
            shared_high_water: 0,
            private_cursor: total_size,
        }
    }

    /// Reset to an empty layout over `total_size` bytes
    pub fn initialize(&mut self, total_size: u64) {
        *self = Self::new(total_size);
    }

    /// Grow the shared region to at least `size` bytes
    ///
    /// When the region grows, its base address is published to the
    /// instance's intermediate base register. Requests no larger than the
    /// current high-water mark change nothing.
    ///
    /// # Errors
    ///
    /// Returns [`DlaError::AllocationFailed`] if the shared region would reach
    /// into the private region; the high-water mark is left unchanged.
    /// Propagates the register write failure.
    pub fn allocate_shared_buffer(
        &mut self,
        size: u64,
        transport: &dyn Transport,
        instance: usize,
    ) -> Result<()> {
        if size <= self.shared_high_water {
            return Ok(());
        }
        if size > self.private_cursor {
            return Err(self.exhausted("shared intermediate", size));
        }

        transport.write_csr(instance, csr::INTERMEDIATE_BASE_ADDR, SHARED_BASE as u32)?;
        self.shared_high_water = size;
        debug!("instance {instance}: shared region now {size:#x} bytes");
        Ok(())
    }

    /// Carve `size` bytes aligned to `alignment` from the top of free space
    ///
    /// `alignment` must be a power of two. The returned address is the
    /// buffer base.
    ///
    /// # Errors
    ///
    /// Returns [`DlaError::AllocationFailed`] if the buffer (plus worst-case
    /// alignment padding) would reach into the shared region, or if
    /// `alignment` is not a power of two. On failure nothing changes.
    pub fn allocate_private_buffer(&mut self, size: u64, alignment: u64) -> Result<u64> {
        if !alignment.is_power_of_two() {
            return Err(DlaError::allocation_failed(format!(
                "alignment {alignment} is not a power of two"
            )));
        }

        let needed = self
            .shared_high_water
            .checked_add(size)
            .and_then(|n| n.checked_add(alignment));
        if needed.is_none_or(|n| n > self.private_cursor) {
            return Err(self.exhausted("private", size));
        }

        let unaligned = self.private_cursor - size;
        self.private_cursor = unaligned - unaligned % alignment;
        Ok(self.private_cursor)
    }

    /// Return both regions to empty without touching hardware
    pub fn clear(&mut self) {
        self.shared_high_water = 0;
        self.private_cursor = self.total_size;
    }

    /// Capacity in bytes
    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Current size of the shared region
    pub const fn shared_high_water(&self) -> u64 {
        self.shared_high_water
    }

    /// Lowest address used by private buffers
    pub const fn private_cursor(&self) -> u64 {
        self.private_cursor
    }

    /// Bytes between the two regions
    pub const fn free(&self) -> u64 {
        self.private_cursor - self.shared_high_water
    }

    fn exhausted(&self, what: &str, size: u64) -> DlaError {
        DlaError::allocation_failed(format!(
            "{what} buffer of {size} bytes does not fit: {} bytes free of {} \
             (shared {}, private {}). Reduce the graph size, enable more folding, \
             or lower the batch size",
            self.free(),
            self.total_size,
            self.shared_high_water,
            self.total_size - self.private_cursor,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{SimConfig, SimulatedTransport};

    fn sim() -> SimulatedTransport {
        SimulatedTransport::new(SimConfig::default().with_ddr_size(4096))
    }

    #[test]
    fn test_private_top_down_aligned() {
        let mut alloc = DeviceMemoryAllocator::new(1 << 20);
        let a = alloc.allocate_private_buffer(100, 64).unwrap();
        assert_eq!(a % 64, 0);
        assert!(a + 100 <= 1 << 20);
        let b = alloc.allocate_private_buffer(1000, 32).unwrap();
        assert_eq!(b % 32, 0);
        assert!(b + 1000 <= a, "ranges overlap");
    }

    #[test]
    fn test_shared_publishes_base_once_per_growth() {
        let transport = sim();
        let mut alloc = DeviceMemoryAllocator::new(4096);

        alloc.allocate_shared_buffer(256, &transport, 0).unwrap();
        alloc.allocate_shared_buffer(128, &transport, 0).unwrap();
        alloc.allocate_shared_buffer(256, &transport, 0).unwrap();
        assert_eq!(alloc.shared_high_water(), 256);
        assert_eq!(
            transport.csr_writes(),
            vec![(0, csr::INTERMEDIATE_BASE_ADDR, 0)]
        );

        alloc.allocate_shared_buffer(512, &transport, 0).unwrap();
        assert_eq!(alloc.shared_high_water(), 512);
        assert_eq!(transport.csr_writes().len(), 2);
    }

    #[test]
    fn test_shared_collision_is_atomic() {
        let transport = sim();
        let mut alloc = DeviceMemoryAllocator::new(4096);
        alloc.allocate_private_buffer(2048, 64).unwrap();
        let err = alloc.allocate_shared_buffer(3000, &transport, 0).unwrap_err();
        assert!(matches!(err, DlaError::AllocationFailed { .. }));
        assert_eq!(alloc.shared_high_water(), 0);
        assert_eq!(transport.write_count(), 0);
    }

    #[test]
    fn test_private_overflow_is_atomic() {
        let mut alloc = DeviceMemoryAllocator::new(4096);
        alloc.allocate_private_buffer(1024, 64).unwrap();
        let before = alloc.clone();

        let err = alloc.allocate_private_buffer(4096, 64).unwrap_err();
        assert!(matches!(err, DlaError::AllocationFailed { .. }));
        assert!(err.to_string().contains("batch size"));
        assert_eq!(alloc, before);
    }

    #[test]
    fn test_private_accounts_for_alignment_padding() {
        // exactly the free space, but no room for worst-case padding
        let mut alloc = DeviceMemoryAllocator::new(4096);
        assert!(alloc.allocate_private_buffer(4096, 64).is_err());
        assert!(alloc.allocate_private_buffer(4096 - 64, 64).is_ok());
    }

    #[test]
    fn test_rejects_non_power_of_two_alignment() {
        let mut alloc = DeviceMemoryAllocator::new(4096);
        assert!(alloc.allocate_private_buffer(64, 48).is_err());
        assert!(alloc.allocate_private_buffer(64, 0).is_err());
        assert_eq!(alloc.private_cursor(), 4096);
    }

    #[test]
    fn test_invariant_over_mixed_sequence() {
        let transport = SimulatedTransport::new(SimConfig::default().with_ddr_size(1 << 20));
        let mut alloc = DeviceMemoryAllocator::new(1 << 20);
        let mut placed: Vec<(u64, u64)> = Vec::new();

        let steps: &[(bool, u64, u64)] = &[
            (true, 4096, 0),
            (false, 3000, 32),
            (false, 64 * 10, 64),
            (true, 8192, 0),
            (false, 777, 4),
            (true, 1024, 0),
            (false, 50_000, 256),
            (false, 1, 1),
        ];
        for &(shared, size, align) in steps {
            if shared {
                alloc.allocate_shared_buffer(size, &transport, 0).unwrap();
            } else {
                let addr = alloc.allocate_private_buffer(size, align).unwrap();
                assert_eq!(addr % align, 0);
                for &(other, other_size) in &placed {
                    assert!(addr + size <= other || other + other_size <= addr);
                }
                placed.push((addr, size));
            }
            assert!(alloc.shared_high_water() <= alloc.private_cursor());
        }
    }

    #[test]
    fn test_clear_and_initialize() {
        let transport = sim();
        let mut alloc = DeviceMemoryAllocator::new(4096);
        alloc.allocate_shared_buffer(100, &transport, 0).unwrap();
        alloc.allocate_private_buffer(100, 4).unwrap();
        let writes = transport.write_count();

        alloc.clear();
        assert_eq!(alloc, DeviceMemoryAllocator::new(4096));
        assert_eq!(transport.write_count(), writes);

        alloc.initialize(8192);
        assert_eq!(alloc.private_cursor(), 8192);
        assert_eq!(alloc.free(), 8192);
    }
}
