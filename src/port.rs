//! Hardware port for a shared-SRAM USB device controller
//!
//! A [`Port`] is the thin, register-level face of one physical controller. The
//! driver never touches registers directly; it asks the port to route
//! endpoints to hardware slots, stage bytes in packet SRAM, arm packets, and
//! report interrupt status. That lets the transfer and interrupt logic run,
//! and be tested, without real hardware.

use crate::arena::Region;
use usb_device::{endpoint::EndpointType, UsbDirection};

/// The DATA0 / DATA1 synchronization bit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum DataToggle {
    Data0,
    Data1,
}

impl DataToggle {
    /// Returns the opposite toggle
    #[must_use]
    pub const fn flip(self) -> Self {
        match self {
            DataToggle::Data0 => DataToggle::Data1,
            DataToggle::Data1 => DataToggle::Data0,
        }
    }
}

impl From<bool> for DataToggle {
    fn from(data1: bool) -> Self {
        if data1 {
            DataToggle::Data1
        } else {
            DataToggle::Data0
        }
    }
}

/// The outcome of the last transaction on a hardware slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum PacketStatus {
    /// The host acknowledged an IN packet
    InAck,
    /// The host sent an IN token, and we NAKed it
    InNak,
    /// We acknowledged an OUT packet carrying the given PID
    OutAck(DataToggle),
    /// We acknowledged a SETUP packet
    SetupAck,
    /// An isochronous packet moved in the given direction
    IsochronousEnd(UsbDirection),
}

bitflags::bitflags! {
    /// Controller-wide interrupt conditions
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Interrupt: u8 {
        /// The host reset the bus
        const RESET = 1 << 0;
        /// The bus has been idle long enough to suspend
        const SUSPEND = 1 << 1;
        /// The host resumed the bus
        const RESUME = 1 << 2;
        /// The controller woke from power down
        const WAKEUP = 1 << 3;
        /// VBUS appeared or disappeared
        const FLOAT_DETECT = 1 << 4;
        /// A SETUP packet landed in the SETUP buffer
        const SETUP = 1 << 5;
    }
}

/// One snapshot of the controller's interrupt status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Events {
    /// Pending controller-wide conditions
    pub interrupts: Interrupt,
    /// Bit `n` is set when hardware slot `n` has a pending event
    pub slots: u16,
    /// Per-slot transaction status, meaningful for set `slots` bits
    pub status: [Option<PacketStatus>; crate::MAX_SLOTS],
}

impl Events {
    /// A snapshot with nothing pending
    pub const fn none() -> Self {
        Events {
            interrupts: Interrupt::empty(),
            slots: 0,
            status: [None; crate::MAX_SLOTS],
        }
    }

    /// Iterate the slots with pending events, lowest slot first
    pub fn pending_slots(&self) -> impl Iterator<Item = (usize, Option<PacketStatus>)> + '_ {
        (0..crate::MAX_SLOTS)
            .filter(move |slot| self.slots & (1 << slot) != 0)
            .map(move |slot| (slot, self.status[slot]))
    }
}

/// How a hardware slot should route traffic
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotConfig {
    /// Logical endpoint number
    pub endpoint: u8,
    pub kind: EndpointType,
    /// Packet buffer for IN traffic, if this slot transmits
    pub tx: Option<Region>,
    /// Packet buffer for OUT traffic, if this slot receives
    pub rx: Option<Region>,
}

/// Register-level access to one USB device controller
///
/// Slots are indices into the controller's endpoint register array. Methods
/// that take a direction only need it on generations where a single slot
/// carries both directions; see [`SLOT_PER_DIRECTION`](Port::SLOT_PER_DIRECTION).
pub trait Port {
    /// Number of hardware endpoint slots
    const SLOT_COUNT: usize;
    /// Size of the packet SRAM, in bytes
    const SRAM_SIZE: usize;
    /// Bytes at the start of packet SRAM that receive SETUP packets
    const SETUP_RESERVED: usize;
    /// Required alignment of every packet buffer
    const BUFFER_ALIGN: usize;
    /// `true` if every direction of a logical endpoint needs its own slot,
    /// `false` if one slot carries both directions.
    const SLOT_PER_DIRECTION: bool;
    /// Sequence state assigned to a non-control, non-isochronous endpoint
    /// when it's enabled, or when its halt is cleared.
    const INITIAL_TOGGLE: DataToggle;

    /// Power the controller and transceiver. Leaves interrupts masked.
    fn power_up(&mut self);
    /// Power down the controller and transceiver
    fn power_down(&mut self);
    /// Unmask (`true`) or mask (`false`) controller interrupts
    fn set_interrupts(&mut self, enable: bool);
    /// Connect (`true`) or disconnect (`false`) the D+ pull-up
    fn set_connected(&mut self, connected: bool);
    /// Indicates if VBUS is present
    fn is_attached(&self) -> bool;
    /// Power (`true`) or unpower (`false`) the transceiver only
    fn set_phy_enabled(&mut self, enable: bool);
    /// Program the device address
    fn set_address(&mut self, address: u8);

    /// Read the controller interrupt status once
    fn events(&mut self) -> Events;
    /// Acknowledge controller-wide conditions
    fn clear_interrupts(&mut self, interrupts: Interrupt);
    /// Acknowledge the event on `slot`
    fn clear_slot(&mut self, slot: usize);

    /// Route `slot` to a logical endpoint
    fn configure_slot(&mut self, slot: usize, config: &SlotConfig);
    /// Stop routing traffic to `slot`
    fn disable_slot(&mut self, slot: usize);
    /// Indicates if `slot` routes traffic
    fn is_slot_enabled(&self, slot: usize) -> bool;

    /// Select the PID for the next packet armed on `slot`
    fn set_toggle(&mut self, slot: usize, direction: UsbDirection, toggle: DataToggle);
    /// Hand `size` bytes (IN) or `size` bytes of room (OUT) to the hardware
    fn arm_packet(&mut self, slot: usize, direction: UsbDirection, size: usize);
    /// Take back a packet that was armed, but not yet moved
    fn cancel_packet(&mut self, slot: usize, direction: UsbDirection);
    /// Number of bytes received by the last OUT packet on `slot`
    fn packet_size_received(&self, slot: usize) -> usize;

    /// Stall (`true`) or unstall (`false`) a slot
    fn set_stalled(&mut self, slot: usize, direction: UsbDirection, stalled: bool);
    /// Indicates if the slot is stalled
    fn is_stalled(&self, slot: usize, direction: UsbDirection) -> bool;

    /// Copy `data` into packet SRAM at `offset`
    fn write_sram(&mut self, offset: usize, data: &[u8]);
    /// Copy packet SRAM at `offset` into `data`
    fn read_sram(&self, offset: usize, data: &mut [u8]);
    /// Read the last SETUP packet
    fn read_setup(&self) -> [u8; crate::SETUP_PACKET_LEN];
}
