//! Packet SRAM allocator
//!
//! The arena hands out byte ranges of the controller's shared packet SRAM.
//! Allocation only moves forward. There is no per-region free; the whole arena
//! is reclaimed with [`reset()`](Arena::reset) when the bus resets, since the
//! endpoint set is re-established as a unit after a reset.

/// A range of bytes inside the packet SRAM
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub struct Region {
    offset: usize,
    len: usize,
}

impl Region {
    pub(crate) const fn new(offset: usize, len: usize) -> Self {
        Region { offset, len }
    }
    /// Byte offset from the start of the packet SRAM
    pub const fn offset(&self) -> usize {
        self.offset
    }
    /// Usable length of the region
    pub const fn len(&self) -> usize {
        self.len
    }
    /// Indicates if the region has no usable bytes
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Packet SRAM bump allocator
pub struct Arena {
    /// First byte after the SETUP header
    start: usize,
    next_free: usize,
    end: usize,
    align: usize,
}

impl Arena {
    /// Create an arena over `size` bytes of packet SRAM
    ///
    /// The first `reserved` bytes belong to the hardware's SETUP buffer, and
    /// are never allocated. Every region starts on an `align` boundary.
    ///
    /// # Panics
    ///
    /// Panics if `align` isn't a power of two, or if `reserved` exceeds `size`.
    pub const fn new(size: usize, reserved: usize, align: usize) -> Self {
        assert!(align.is_power_of_two());
        assert!(reserved <= size);
        let start = round_up(reserved, align);
        Arena {
            start,
            next_free: start,
            end: size,
            align,
        }
    }

    /// Allocates a region of `size` bytes
    ///
    /// Returns `None` if the arena cannot fit the request. A rejected request
    /// leaves the arena untouched.
    pub fn allocate(&mut self, size: usize) -> Option<Region> {
        let offset = self.next_free;
        let next_free = offset.checked_add(checked_round_up(size, self.align)?)?;
        if next_free > self.end {
            None
        } else {
            self.next_free = next_free;
            Some(Region { offset, len: size })
        }
    }

    /// Indicates if the arena can satisfy all of `sizes`, allocated in order
    pub fn fits(&self, sizes: &[usize]) -> bool {
        sizes
            .iter()
            .try_fold(self.next_free, |next, size| {
                next.checked_add(checked_round_up(*size, self.align)?)
            })
            .is_some_and(|next| next <= self.end)
    }

    /// The offset of the next allocation
    pub fn mark(&self) -> usize {
        self.next_free
    }

    /// Release every region allocated after `mark`
    ///
    /// `mark` must come from [`mark()`](Arena::mark) within the same session.
    pub fn release_to(&mut self, mark: usize) {
        debug_assert!(mark >= self.start && mark <= self.next_free);
        self.next_free = mark.clamp(self.start, self.next_free);
    }

    /// Release every region
    pub fn reset(&mut self) {
        self.next_free = self.start;
    }

    /// Number of bytes that are still available
    pub fn remaining(&self) -> usize {
        self.end - self.next_free
    }
}

const fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

fn checked_round_up(size: usize, align: usize) -> Option<usize> {
    Some(size.checked_add(align - 1)? & !(align - 1))
}
