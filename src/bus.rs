//! Interrupt-safe driver access

use crate::{dispatch::Handler, driver::Driver, port::Port};
use core::cell::RefCell;
use cortex_m::interrupt::{self, Mutex};

/// A [`Driver`] that's shared between the USB interrupt and the rest of the
/// program
///
/// Every access runs in a critical section, so endpoint and arena state never
/// changes underneath the interrupt handler.
///
/// # Example
///
/// ```no_run
/// use sram_usbd::{numicro::Usbd, Driver, Handler, Peripherals, SharedDriver};
///
/// struct Usb;
/// unsafe impl Peripherals for Usb {
///     fn usbd(&self) -> *const () {
///         0x4006_0000 as *const ()
///     }
/// }
///
/// struct Class;
/// impl<'b> Handler<'b, Usbd> for Class {
///     fn on_setup(&mut self, usb: &mut Driver<'b, Usbd>, endpoint: u8) {
///         let _setup = usb.read_setup_packet(endpoint);
///         // Decode the request, then start the data or status stage...
///         usb.begin_transmit(endpoint, &[]).ok();
///     }
///     fn on_in_complete(&mut self, _: &mut Driver<'b, Usbd>, _: u8, _: &'b [u8]) {}
///     fn on_out_complete(
///         &mut self,
///         _: &mut Driver<'b, Usbd>,
///         _: u8,
///         _: &'b mut [u8],
///         _: usb_device::Result<usize>,
///     ) {
///     }
/// }
///
/// let usb = SharedDriver::new(Driver::new(Usbd::new(Usb), 64));
/// usb.with_driver_mut(|usb| {
///     usb.start()?;
///     usb.attach();
///     Ok::<(), usb_device::UsbError>(())
/// })
/// .unwrap();
///
/// // In the USB interrupt handler:
/// usb.poll(&mut Class);
/// ```
pub struct SharedDriver<'b, P: Port> {
    usb: Mutex<RefCell<Driver<'b, P>>>,
}

impl<'b, P: Port> SharedDriver<'b, P> {
    pub fn new(usb: Driver<'b, P>) -> Self {
        SharedDriver {
            usb: Mutex::new(RefCell::new(usb)),
        }
    }

    /// Interrupt-safe, immutable access to the driver
    pub fn with_driver<R>(&self, func: impl FnOnce(&Driver<'b, P>) -> R) -> R {
        interrupt::free(|cs| {
            let usb = self.usb.borrow(cs);
            let usb = usb.borrow();
            func(&usb)
        })
    }

    /// Interrupt-safe, mutable access to the driver
    pub fn with_driver_mut<R>(&self, func: impl FnOnce(&mut Driver<'b, P>) -> R) -> R {
        interrupt::free(|cs| {
            let usb = self.usb.borrow(cs);
            let mut usb = usb.borrow_mut();
            func(&mut usb)
        })
    }

    /// Handle every pending event; see [`Driver::poll`]
    pub fn poll<H: Handler<'b, P> + ?Sized>(&self, handler: &mut H) {
        self.with_driver_mut(|usb| usb.poll(handler));
    }
}
