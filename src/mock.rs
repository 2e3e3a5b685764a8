//! In-memory port for host tests
//!
//! `SHARED` selects the controller generation: `true` routes both directions
//! of an endpoint through one hardware slot.

extern crate std;

use crate::{
    dispatch::{BusEvent, Handler},
    driver::Driver,
    port::{DataToggle, Events, Interrupt, PacketStatus, Port, SlotConfig},
    transfer::Aborted,
    MAX_SLOTS, SETUP_PACKET_LEN,
};
use std::vec::Vec;
use usb_device::UsbDirection;

/// An acknowledgement the driver gave, in order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cleared {
    Interrupts(Interrupt),
    Slot(usize),
}

fn direction_index(direction: UsbDirection) -> usize {
    match direction {
        UsbDirection::In => 0,
        UsbDirection::Out => 1,
    }
}

pub struct MockPort<const SHARED: bool> {
    pub sram: [u8; 512],
    pub setup: [u8; SETUP_PACKET_LEN],
    pub slots: [Option<SlotConfig>; MAX_SLOTS],
    pub stalled: [[bool; 2]; MAX_SLOTS],
    pub received: [usize; MAX_SLOTS],
    /// Every armed packet: slot, direction, size
    pub armed: Vec<(usize, UsbDirection, usize)>,
    /// Every selected PID: slot, toggle
    pub toggles: Vec<(usize, DataToggle)>,
    pub cancelled: Vec<(usize, UsbDirection)>,
    pub cleared: Vec<Cleared>,
    pub pending: Events,
    pub powered: bool,
    pub interrupts: bool,
    pub connected: bool,
    pub phy: bool,
    pub attached: bool,
    pub address: u8,
}

impl<const SHARED: bool> MockPort<SHARED> {
    pub fn new() -> Self {
        MockPort {
            sram: [0; 512],
            setup: [0; SETUP_PACKET_LEN],
            slots: [None; MAX_SLOTS],
            stalled: [[false; 2]; MAX_SLOTS],
            received: [0; MAX_SLOTS],
            armed: Vec::new(),
            toggles: Vec::new(),
            cancelled: Vec::new(),
            cleared: Vec::new(),
            pending: Events::none(),
            powered: false,
            interrupts: false,
            connected: false,
            phy: false,
            attached: false,
            address: 0,
        }
    }

    pub fn last_armed(&self) -> Option<(usize, UsbDirection, usize)> {
        self.armed.last().copied()
    }

    /// Sizes of the packets armed on `slot`, oldest first
    pub fn armed_sizes(&self, slot: usize) -> Vec<usize> {
        self.armed
            .iter()
            .filter(|(armed, _, _)| *armed == slot)
            .map(|(_, _, size)| *size)
            .collect()
    }

    /// PIDs selected on `slot`, oldest first
    pub fn toggles_on(&self, slot: usize) -> Vec<DataToggle> {
        self.toggles
            .iter()
            .filter(|(selected, _)| *selected == slot)
            .map(|(_, toggle)| *toggle)
            .collect()
    }

    pub fn raise(&mut self, interrupt: Interrupt) {
        self.pending.interrupts |= interrupt;
    }

    pub fn inject(&mut self, slot: usize, status: PacketStatus) {
        self.pending.slots |= 1 << slot;
        self.pending.status[slot] = Some(status);
    }

    /// Land `data` in packet SRAM at `offset`, as if received on `slot`
    pub fn host_sends(&mut self, slot: usize, offset: usize, data: &[u8]) {
        self.sram[offset..offset + data.len()].copy_from_slice(data);
        self.received[slot] = data.len();
    }

    /// The host sends an OUT packet to `slot`
    pub fn host_out(&mut self, slot: usize, data: &[u8]) {
        let region = self.slots[slot].and_then(|config| config.rx);
        let offset = region.map_or(0, |region| region.offset());
        self.host_sends(slot, offset, data);
        self.inject(slot, PacketStatus::OutAck(DataToggle::Data0));
    }

    /// The host acknowledges the IN packet on `slot`
    pub fn host_acks_in(&mut self, slot: usize) {
        self.inject(slot, PacketStatus::InAck);
    }

    pub fn host_setup(&mut self, packet: [u8; SETUP_PACKET_LEN]) {
        self.setup = packet;
        self.raise(Interrupt::SETUP);
    }
}

impl<const SHARED: bool> Port for MockPort<SHARED> {
    const SLOT_COUNT: usize = 8;
    const SRAM_SIZE: usize = 512;
    const SETUP_RESERVED: usize = 8;
    const BUFFER_ALIGN: usize = 8;
    const SLOT_PER_DIRECTION: bool = !SHARED;
    const INITIAL_TOGGLE: DataToggle = DataToggle::Data1;

    fn power_up(&mut self) {
        self.powered = true;
        self.phy = true;
    }
    fn power_down(&mut self) {
        self.powered = false;
        self.phy = false;
    }
    fn set_interrupts(&mut self, enable: bool) {
        self.interrupts = enable;
    }
    fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }
    fn is_attached(&self) -> bool {
        self.attached
    }
    fn set_phy_enabled(&mut self, enable: bool) {
        self.phy = enable;
    }
    fn set_address(&mut self, address: u8) {
        self.address = address;
    }

    fn events(&mut self) -> Events {
        self.pending
    }
    fn clear_interrupts(&mut self, interrupts: Interrupt) {
        self.pending.interrupts.remove(interrupts);
        self.cleared.push(Cleared::Interrupts(interrupts));
    }
    fn clear_slot(&mut self, slot: usize) {
        self.pending.slots &= !(1 << slot);
        self.pending.status[slot] = None;
        self.cleared.push(Cleared::Slot(slot));
    }

    fn configure_slot(&mut self, slot: usize, config: &SlotConfig) {
        self.slots[slot] = Some(*config);
        self.stalled[slot] = [false; 2];
    }
    fn disable_slot(&mut self, slot: usize) {
        self.slots[slot] = None;
    }
    fn is_slot_enabled(&self, slot: usize) -> bool {
        self.slots[slot].is_some()
    }

    fn set_toggle(&mut self, slot: usize, _: UsbDirection, toggle: DataToggle) {
        self.toggles.push((slot, toggle));
    }
    fn arm_packet(&mut self, slot: usize, direction: UsbDirection, size: usize) {
        self.armed.push((slot, direction, size));
    }
    fn cancel_packet(&mut self, slot: usize, direction: UsbDirection) {
        self.cancelled.push((slot, direction));
    }
    fn packet_size_received(&self, slot: usize) -> usize {
        self.received[slot]
    }

    fn set_stalled(&mut self, slot: usize, direction: UsbDirection, stalled: bool) {
        self.stalled[slot][direction_index(direction)] = stalled;
    }
    fn is_stalled(&self, slot: usize, direction: UsbDirection) -> bool {
        self.stalled[slot][direction_index(direction)]
    }

    fn write_sram(&mut self, offset: usize, data: &[u8]) {
        self.sram[offset..offset + data.len()].copy_from_slice(data);
    }
    fn read_sram(&self, offset: usize, data: &mut [u8]) {
        data.copy_from_slice(&self.sram[offset..offset + data.len()]);
    }
    fn read_setup(&self) -> [u8; SETUP_PACKET_LEN] {
        self.setup
    }
}

/// A callback the driver made
#[derive(Debug, PartialEq)]
pub enum Call<'b> {
    Setup {
        endpoint: u8,
        /// Endpoint toggles (IN, OUT) seen from inside the callback
        toggles: (Option<DataToggle>, Option<DataToggle>),
        packet: [u8; SETUP_PACKET_LEN],
    },
    InComplete(u8, &'b [u8]),
    OutComplete(u8, &'b mut [u8], usb_device::Result<usize>),
    Aborted(u8, Aborted<'b>),
    Bus(BusEvent),
}

/// Records every callback
#[derive(Default)]
pub struct Recorder<'b> {
    pub calls: Vec<Call<'b>>,
}

impl<'b, P: Port> Handler<'b, P> for Recorder<'b> {
    fn on_setup(&mut self, usb: &mut Driver<'b, P>, endpoint: u8) {
        self.calls.push(Call::Setup {
            endpoint,
            toggles: (
                usb.data_toggle(endpoint, UsbDirection::In),
                usb.data_toggle(endpoint, UsbDirection::Out),
            ),
            packet: usb.read_setup_packet(endpoint).unwrap(),
        });
    }
    fn on_in_complete(&mut self, _: &mut Driver<'b, P>, endpoint: u8, data: &'b [u8]) {
        self.calls.push(Call::InComplete(endpoint, data));
    }
    fn on_out_complete(
        &mut self,
        _: &mut Driver<'b, P>,
        endpoint: u8,
        buffer: &'b mut [u8],
        received: usb_device::Result<usize>,
    ) {
        self.calls.push(Call::OutComplete(endpoint, buffer, received));
    }
    fn on_aborted(&mut self, _: &mut Driver<'b, P>, endpoint: u8, aborted: Aborted<'b>) {
        self.calls.push(Call::Aborted(endpoint, aborted));
    }
    fn on_bus_event(&mut self, _: &mut Driver<'b, P>, event: BusEvent) {
        self.calls.push(Call::Bus(event));
    }
}
