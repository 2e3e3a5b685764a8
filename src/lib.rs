//! A USB full-speed device driver for controllers with a shared packet SRAM
//!
//! Small microcontrollers often stage every USB packet through one block of
//! on-chip SRAM, a few hundred bytes large, that the transceiver shares with
//! software. `sram-usbd` manages that memory, routes logical endpoints to the
//! controller's hardware slots, and splits transfers of any size into
//! packets. Controller specifics live behind the [`Port`] trait; the
//! [`numicro`] module implements it for the NuMicro USBD peripheral.
//!
//! # Usage
//!
//! 1. Define a safe implementation of [`Peripherals`] for your controller,
//!    and create its port.
//! 2. Create a [`Driver`], and [`start()`](Driver::start) it.
//! 3. Implement a [`Handler`] for your USB class, and call
//!    [`poll()`](Driver::poll) from the USB interrupt.
//!
//! Share the driver between the interrupt and the rest of your program with a
//! [`SharedDriver`].
//!
//! # Transfers
//!
//! Transfers borrow the caller's buffer until they complete. The driver copies
//! one packet at a time between the buffer and packet SRAM, and hands the
//! buffer back through the [`Handler`] once the last packet moves. A receive
//! ends when the buffer is full, or when the host sends a short packet. If the
//! host sends more than the buffer holds, the excess bytes are discarded and
//! the receive completes with `UsbError::BufferOverflow`.
//!
//! A SETUP packet discards any data stage in progress on endpoint 0, and hands
//! its buffer back through [`Handler::on_aborted`].
//!
//! # Logging
//!
//! Enable the `defmt-03` feature to log bus and endpoint events with `defmt`.
//! Only enable logging when you're certain that your logger isn't using USB!

#![no_std]

#[macro_use]
mod log;

mod arena;
mod bus;
mod dispatch;
mod driver;
mod endpoint;
mod port;
mod ral;
mod transfer;
mod vcell;

#[cfg(test)]
mod mock;

pub mod numicro;

pub use arena::Region;
pub use bus::SharedDriver;
pub use dispatch::{BusEvent, Handler};
pub use driver::{Driver, State};
pub use endpoint::{EndpointConfig, EndpointStatus};
pub use port::{DataToggle, Events, Interrupt, PacketStatus, Port, SlotConfig};
pub use transfer::Aborted;

/// Logical endpoints, including endpoint 0
pub const MAX_ENDPOINTS: usize = 8;
/// Hardware endpoint slots the driver can track
pub const MAX_SLOTS: usize = 8;
/// Size of a SETUP packet
pub const SETUP_PACKET_LEN: usize = 8;

/// A type that owns USB device controller registers
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the USB
/// register block, and its packet SRAM. The pointer returned by
/// [`usbd()`](Peripherals::usbd) is assumed to be valid for as long as the
/// driver exists, and will be cast to a register definition.
///
/// # Example
///
/// A safe implementation of `Peripherals` for a singleton that owns the
/// NuMicro USBD peripheral.
///
/// ```
/// use sram_usbd::Peripherals;
///
/// /// The USBD base address
/// const USBD: usize = 0x4006_0000;
///
/// struct Usbd {
///     _private: (),
/// }
///
/// impl Usbd {
///     /// Returns the USBD registers once; `None` after that
///     pub fn take() -> Option<Self> {
///         static TAKEN: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);
///         let taken = TAKEN.swap(true, core::sync::atomic::Ordering::SeqCst);
///         (!taken).then_some(Usbd { _private: () })
///     }
/// }
///
/// unsafe impl Peripherals for Usbd {
///     fn usbd(&self) -> *const () {
///         USBD as *const ()
///     }
/// }
///
/// let usbd = Usbd::take().unwrap();
/// assert_eq!(usbd.usbd(), 0x4006_0000 as *const ());
/// assert!(Usbd::take().is_none());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the USB device controller registers
    fn usbd(&self) -> *const ();
}
