//! Volatile cell for memory that the USB transceiver reads and writes
//! behind our back, like the packet SRAM.

use core::cell::UnsafeCell;

#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T> VCell<T> {
    pub const fn new(val: T) -> Self {
        VCell(UnsafeCell::new(val))
    }
}

impl<T: Copy> VCell<T> {
    pub fn read(&self) -> T {
        unsafe { self.0.get().read_volatile() }
    }
    pub fn write(&self, val: T) {
        unsafe { self.0.get().write_volatile(val) }
    }
}

/// Copy `src` into consecutive cells, starting at `dst[0]`.
///
/// Returns the number of bytes copied, bounded by both lengths.
pub fn copy_to(dst: &[VCell<u8>], src: &[u8]) -> usize {
    dst.iter().zip(src).for_each(|(cell, byte)| cell.write(*byte));
    dst.len().min(src.len())
}

/// Copy consecutive cells, starting at `src[0]`, into `dst`.
///
/// Returns the number of bytes copied, bounded by both lengths.
pub fn copy_from(dst: &mut [u8], src: &[VCell<u8>]) -> usize {
    dst.iter_mut().zip(src).for_each(|(byte, cell)| *byte = cell.read());
    dst.len().min(src.len())
}
