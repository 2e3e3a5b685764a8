//! Endpoint table
//!
//! The table maps logical endpoint numbers to hardware slots and packet SRAM,
//! and holds each endpoint's transfer state.

use crate::{
    arena::{Arena, Region},
    port::{DataToggle, Port, SlotConfig},
    transfer::Transfers,
    MAX_ENDPOINTS, MAX_SLOTS,
};
use usb_device::{endpoint::EndpointType, UsbDirection, UsbError};

/// Configuration of one logical endpoint
///
/// A direction is enabled by giving it a max packet size.
///
/// ```
/// use sram_usbd::EndpointConfig;
/// use usb_device::endpoint::EndpointType;
///
/// let ep0 = EndpointConfig::control(64);
/// let bulk = EndpointConfig::new(EndpointType::Bulk)
///     .with_in(64)
///     .with_out(64)
///     .with_zlt(true);
/// assert_eq!(bulk.max_packet_in, Some(64));
/// # let _ = ep0;
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    pub kind: EndpointType,
    pub max_packet_in: Option<u16>,
    pub max_packet_out: Option<u16>,
    /// End IN transfers that are a multiple of the max packet size with a
    /// zero length packet
    pub zero_length_termination: bool,
}

impl EndpointConfig {
    /// A bidirectional control endpoint
    pub const fn control(max_packet: u16) -> Self {
        EndpointConfig {
            kind: EndpointType::Control,
            max_packet_in: Some(max_packet),
            max_packet_out: Some(max_packet),
            zero_length_termination: false,
        }
    }

    /// An endpoint of `kind`, with no direction enabled
    pub const fn new(kind: EndpointType) -> Self {
        EndpointConfig {
            kind,
            max_packet_in: None,
            max_packet_out: None,
            zero_length_termination: false,
        }
    }

    #[must_use]
    pub const fn with_in(mut self, max_packet: u16) -> Self {
        self.max_packet_in = Some(max_packet);
        self
    }

    #[must_use]
    pub const fn with_out(mut self, max_packet: u16) -> Self {
        self.max_packet_out = Some(max_packet);
        self
    }

    #[must_use]
    pub const fn with_zlt(mut self, zlt: bool) -> Self {
        self.zero_length_termination = zlt;
        self
    }
}

/// Status of one direction of an endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum EndpointStatus {
    Disabled,
    Stalled,
    Active,
}

/// One direction of an endpoint, bound to a hardware slot and a packet buffer
#[derive(Debug)]
pub(crate) struct Pipe {
    slot: usize,
    direction: UsbDirection,
    region: Region,
    max_packet: usize,
    /// Sequence state of the last acknowledged packet
    toggle: DataToggle,
    /// `false` for isochronous pipes, which never toggle
    sync: bool,
    /// Size of the packet in flight
    armed: Option<usize>,
}

impl Pipe {
    fn new(slot: usize, direction: UsbDirection, region: Region, toggle: DataToggle, sync: bool) -> Self {
        Pipe {
            slot,
            direction,
            region,
            max_packet: region.len(),
            toggle,
            sync,
            armed: None,
        }
    }

    #[cfg(test)]
    pub fn for_test(slot: usize, direction: UsbDirection, offset: usize, max_packet: usize) -> Self {
        Pipe::new(
            slot,
            direction,
            Region::new(offset, max_packet),
            DataToggle::Data0,
            true,
        )
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn max_packet(&self) -> usize {
        self.max_packet
    }

    pub fn toggle(&self) -> DataToggle {
        self.toggle
    }

    pub fn set_toggle(&mut self, toggle: DataToggle) {
        self.toggle = toggle;
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Select the next PID, then hand `size` bytes to the hardware
    pub fn arm<P: Port>(&mut self, port: &mut P, size: usize) {
        debug_assert!(size <= self.max_packet);
        if self.sync {
            port.set_toggle(self.slot, self.direction, self.toggle.flip());
        }
        port.arm_packet(self.slot, self.direction, size);
        self.armed = Some(size);
    }

    /// The hardware moved the armed packet
    ///
    /// Returns the armed size, or `None` if nothing was in flight.
    pub fn acknowledge(&mut self) -> Option<usize> {
        let size = self.armed.take()?;
        if self.sync {
            self.toggle = self.toggle.flip();
        }
        Some(size)
    }

    pub fn set_stalled<P: Port>(&self, port: &mut P, stalled: bool) {
        port.set_stalled(self.slot, self.direction, stalled);
    }

    /// Take back the packet in flight, if any
    pub fn cancel<P: Port>(&mut self, port: &mut P) {
        if self.armed.take().is_some() {
            port.cancel_packet(self.slot, self.direction);
        }
    }
}

/// An enabled logical endpoint
pub(crate) struct Endpoint<'b> {
    pub config: EndpointConfig,
    pub tx: Option<Pipe>,
    pub rx: Option<Pipe>,
    pub transfers: Transfers<'b>,
}

impl Endpoint<'_> {
    pub fn pipe(&self, direction: UsbDirection) -> Option<&Pipe> {
        match direction {
            UsbDirection::In => self.tx.as_ref(),
            UsbDirection::Out => self.rx.as_ref(),
        }
    }

    pub fn pipe_mut(&mut self, direction: UsbDirection) -> Option<&mut Pipe> {
        match direction {
            UsbDirection::In => self.tx.as_mut(),
            UsbDirection::Out => self.rx.as_mut(),
        }
    }

    /// Take back every packet in flight
    pub fn cancel<P: Port>(&mut self, port: &mut P) {
        self.tx.iter_mut().chain(self.rx.iter_mut()).for_each(|pipe| pipe.cancel(port));
    }
}

/// Logical endpoints, their hardware slots, and the packet SRAM arena
pub(crate) struct EndpointTable<'b> {
    endpoints: [Option<Endpoint<'b>>; MAX_ENDPOINTS],
    /// The logical endpoint that owns each hardware slot
    owners: [Option<u8>; MAX_SLOTS],
    arena: Arena,
    /// Arena position right after endpoint 0 was allocated
    control_mark: Option<usize>,
}

impl<'b> EndpointTable<'b> {
    pub fn new<P: Port>() -> Self {
        EndpointTable {
            endpoints: core::array::from_fn(|_| None),
            owners: [None; MAX_SLOTS],
            arena: Arena::new(P::SRAM_SIZE, P::SETUP_RESERVED, P::BUFFER_ALIGN),
            control_mark: None,
        }
    }

    pub fn get(&self, number: u8) -> Option<&Endpoint<'b>> {
        self.endpoints.get(usize::from(number))?.as_ref()
    }

    pub fn get_mut(&mut self, number: u8) -> Option<&mut Endpoint<'b>> {
        self.endpoints.get_mut(usize::from(number))?.as_mut()
    }

    /// The logical endpoint that owns hardware `slot`
    pub fn owner(&self, slot: usize) -> Option<u8> {
        *self.owners.get(slot)?
    }

    /// Bytes of packet SRAM that are still free
    pub fn remaining(&self) -> usize {
        self.arena.remaining()
    }

    fn free_slots<P: Port>(&self) -> impl Iterator<Item = usize> + '_ {
        (0..P::SLOT_COUNT.min(MAX_SLOTS)).filter(move |slot| self.owners[*slot].is_none())
    }

    /// Allocate packet SRAM and hardware slots for `number`, and route its traffic
    ///
    /// Every check happens before the table, the arena, or the hardware
    /// changes. IN is allocated before OUT.
    pub fn enable<P: Port>(
        &mut self,
        port: &mut P,
        number: u8,
        config: &EndpointConfig,
    ) -> usb_device::Result<()> {
        let index = usize::from(number);
        if index >= MAX_ENDPOINTS || self.endpoints[index].is_some() {
            return Err(UsbError::InvalidEndpoint);
        }

        let sizes = [config.max_packet_in, config.max_packet_out];
        let usable = P::SRAM_SIZE.saturating_sub(P::SETUP_RESERVED);
        let invalid_size = |size: &Option<u16>| {
            size.is_some_and(|size| size == 0 || usize::from(size) > usable)
        };
        let bidirectional = sizes.iter().all(Option::is_some);
        if sizes.iter().any(invalid_size)
            || sizes.iter().all(Option::is_none)
            || (config.kind == EndpointType::Control && !bidirectional)
        {
            return Err(UsbError::Unsupported);
        }

        let directions = sizes.iter().flatten().count();
        let needed = if P::SLOT_PER_DIRECTION { directions } else { 1 };
        let slots = {
            let mut free = self.free_slots::<P>();
            [free.next(), if needed > 1 { free.next() } else { None }]
        };
        let granted = slots.iter().flatten().count();
        if granted < needed {
            return Err(UsbError::EndpointOverflow);
        }

        let mut request = [0usize; 2];
        for (dst, size) in request.iter_mut().zip(sizes.iter().flatten()) {
            *dst = usize::from(*size);
        }
        if !self.arena.fits(&request[..directions]) {
            return Err(UsbError::EndpointMemoryOverflow);
        }

        let (toggle, sync) = match config.kind {
            EndpointType::Control => (DataToggle::Data0, true),
            EndpointType::Isochronous { .. } => (DataToggle::Data0, false),
            _ => (P::INITIAL_TOGGLE, true),
        };

        let mut slots = slots.into_iter().flatten();
        let mut shared = None;
        let mut bind = |arena: &mut Arena, direction: UsbDirection, size: u16| -> usb_device::Result<Pipe> {
            let slot = match shared {
                Some(slot) if !P::SLOT_PER_DIRECTION => slot,
                _ => slots.next().ok_or(UsbError::EndpointOverflow)?,
            };
            shared = Some(slot);
            let region = arena
                .allocate(usize::from(size))
                .ok_or(UsbError::EndpointMemoryOverflow)?;
            Ok(Pipe::new(slot, direction, region, toggle, sync))
        };
        let tx = config
            .max_packet_in
            .map(|size| bind(&mut self.arena, UsbDirection::In, size))
            .transpose()?;
        let rx = config
            .max_packet_out
            .map(|size| bind(&mut self.arena, UsbDirection::Out, size))
            .transpose()?;

        if P::SLOT_PER_DIRECTION {
            for pipe in tx.iter().chain(rx.iter()) {
                let (tx, rx) = match pipe.direction {
                    UsbDirection::In => (Some(pipe.region), None),
                    UsbDirection::Out => (None, Some(pipe.region)),
                };
                self.route(port, pipe.slot, number, config.kind, tx, rx);
            }
        } else if let Some(slot) = tx.as_ref().or(rx.as_ref()).map(Pipe::slot) {
            let regions = (tx.as_ref().map(Pipe::region), rx.as_ref().map(Pipe::region));
            self.route(port, slot, number, config.kind, regions.0, regions.1);
        }

        debug!(
            "ENABLED EP{} IN={} OUT={}",
            number,
            tx.as_ref().map(Pipe::slot),
            rx.as_ref().map(Pipe::slot)
        );
        self.endpoints[index] = Some(Endpoint {
            config: *config,
            tx,
            rx,
            transfers: Transfers::new(config.kind),
        });
        if number == 0 {
            self.control_mark = Some(self.arena.mark());
        }
        Ok(())
    }

    fn route<P: Port>(
        &mut self,
        port: &mut P,
        slot: usize,
        number: u8,
        kind: EndpointType,
        tx: Option<Region>,
        rx: Option<Region>,
    ) {
        self.owners[slot] = Some(number);
        port.configure_slot(
            slot,
            &SlotConfig {
                endpoint: number,
                kind,
                tx,
                rx,
            },
        );
    }

    /// Stop routing traffic to `number`, and free its hardware slots
    ///
    /// The endpoint's transfers are dropped, and its packet SRAM stays
    /// allocated.
    pub fn disable<P: Port>(&mut self, port: &mut P, number: u8) -> Option<Endpoint<'b>> {
        let mut endpoint = self.endpoints.get_mut(usize::from(number))?.take()?;
        endpoint.cancel(port);
        for (slot, owner) in self.owners.iter_mut().enumerate() {
            if *owner == Some(number) {
                port.disable_slot(slot);
                *owner = None;
            }
        }
        debug!("DISABLED EP{}", number);
        Some(endpoint)
    }

    /// Disable every endpoint except endpoint 0, and give their packet SRAM
    /// back to the arena
    pub fn disable_all_except_control<P: Port>(&mut self, port: &mut P) {
        for number in 1..MAX_ENDPOINTS as u8 {
            self.disable(port, number);
        }
        match self.control_mark {
            Some(mark) => self.arena.release_to(mark),
            None => self.arena.reset(),
        }
    }

    /// Disable every endpoint, and release the whole arena
    pub fn reset<P: Port>(&mut self, port: &mut P) {
        for number in 0..MAX_ENDPOINTS as u8 {
            self.disable(port, number);
        }
        self.control_mark = None;
        self.arena.reset();
    }
}
