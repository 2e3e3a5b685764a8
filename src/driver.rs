//! USB device driver
//!
//! The driver owns a [`Port`], the endpoint table, and the packet SRAM arena.
//! Collaborators (usually a class stack) configure endpoints, start transfers
//! with borrowed buffers, and get the buffers back through a [`Handler`](crate::Handler)
//! when [`poll()`](Driver::poll) sees them complete.

use crate::{
    endpoint::{Endpoint, EndpointConfig, EndpointStatus, EndpointTable},
    port::{DataToggle, Port},
    transfer::{InTransfer, OutTransfer},
    SETUP_PACKET_LEN,
};
use usb_device::{endpoint::EndpointType, UsbDirection, UsbError};

/// Driver lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum State {
    /// Powered down. Nothing but [`start()`](Driver::start) does anything.
    Disabled,
    /// Powered, and waiting for the host's first bus reset
    Reset,
    Running,
    Suspended,
}

/// A USB device driver for a shared packet SRAM controller
///
/// After you create a `Driver` with [`new()`](Driver::new), you must
///
/// - call [`start()`](Driver::start), which enables endpoint 0
/// - call [`attach()`](Driver::attach) to signal the host
/// - call [`poll()`](Driver::poll) from the USB interrupt
///
/// Interrupts for the peripheral must be masked while you call any other
/// method. [`SharedDriver`](crate::SharedDriver) does that for you.
pub struct Driver<'b, P: Port> {
    pub(crate) port: P,
    pub(crate) state: State,
    /// Where a resume returns to
    pub(crate) resume_state: State,
    pub(crate) table: EndpointTable<'b>,
    ep0: EndpointConfig,
    address: u8,
}

impl<'b, P: Port> Driver<'b, P> {
    /// Create a driver whose control endpoint moves `ep0_max_packet` bytes per
    /// packet
    ///
    /// The driver starts out [`Disabled`](State::Disabled), and doesn't touch
    /// the hardware.
    pub fn new(port: P, ep0_max_packet: u16) -> Self {
        Driver {
            port,
            state: State::Disabled,
            resume_state: State::Disabled,
            table: EndpointTable::new::<P>(),
            ep0: EndpointConfig::control(ep0_max_packet),
            address: 0,
        }
    }

    /// Power the controller, enable endpoint 0, and unmask interrupts
    ///
    /// Assumes that the peripheral clock is running. If endpoint 0 can't be
    /// allocated, the controller is powered back down and the driver stays
    /// disabled.
    pub fn start(&mut self) -> usb_device::Result<()> {
        self.port.power_up();
        self.table.reset(&mut self.port);
        if let Err(err) = self.table.enable(&mut self.port, 0, &self.ep0) {
            warn!("EP0 ALLOCATION FAILED");
            self.port.power_down();
            return Err(err);
        }
        self.address = 0;
        self.port.set_address(0);
        self.state = State::Reset;
        self.port.set_interrupts(true);
        debug!("STARTED");
        Ok(())
    }

    /// Mask interrupts, disable every endpoint, and power down
    ///
    /// Transfers in progress are dropped.
    pub fn stop(&mut self) {
        self.port.set_interrupts(false);
        self.table.reset(&mut self.port);
        self.port.power_down();
        self.state = State::Disabled;
        debug!("STOPPED");
    }

    /// Connect the D+ pull-up, so the host sees the device
    pub fn attach(&mut self) {
        self.port.set_connected(true);
    }

    /// Disconnect the D+ pull-up
    pub fn detach(&mut self) {
        self.port.set_connected(false);
    }

    /// Bus reset handling; the host's reset leaves only endpoint 0, at
    /// address 0, with fresh toggles.
    pub(crate) fn bus_reset(&mut self) {
        self.table.reset(&mut self.port);
        if self.table.enable(&mut self.port, 0, &self.ep0).is_err() {
            warn!("EP0 ALLOCATION FAILED");
        }
        self.address = 0;
        self.port.set_address(0);
        self.port.set_phy_enabled(true);
        self.state = State::Running;
    }

    /// Program the device address
    ///
    /// Call this after the status stage of SET_ADDRESS completes.
    pub fn set_address(&mut self, address: u8) {
        self.port.set_address(address);
        self.address = address;
        debug!("ADDRESS {}", address);
    }

    /// Enable endpoint `number`
    ///
    /// Endpoint 0 is enabled by [`start()`](Driver::start). Fails without side
    /// effects when there's no hardware slot (`EndpointOverflow`) or packet
    /// SRAM (`EndpointMemoryOverflow`) left for the endpoint.
    pub fn enable_endpoint(&mut self, number: u8, config: &EndpointConfig) -> usb_device::Result<()> {
        self.check_started()?;
        self.table.enable(&mut self.port, number, config)
    }

    /// Disable endpoint `number`, dropping its transfers
    ///
    /// The endpoint's packet SRAM isn't reclaimed until
    /// [`disable_endpoints()`](Driver::disable_endpoints) or a bus reset.
    pub fn disable_endpoint(&mut self, number: u8) -> usb_device::Result<()> {
        if number == 0 {
            return Err(UsbError::InvalidEndpoint);
        }
        self.table
            .disable(&mut self.port, number)
            .map(|_| ())
            .ok_or(UsbError::InvalidEndpoint)
    }

    /// Disable every endpoint except endpoint 0, and reclaim their packet SRAM
    pub fn disable_endpoints(&mut self) {
        self.table.disable_all_except_control(&mut self.port);
    }

    /// Enable zero-length termination for endpoint `number`
    ///
    /// Transfers that are a non-zero multiple of the max packet size end with
    /// a zero length packet. Takes effect for the next transfer.
    pub fn enable_zlt(&mut self, number: u8) -> usb_device::Result<()> {
        let endpoint = self.table.get_mut(number).ok_or(UsbError::InvalidEndpoint)?;
        endpoint.config.zero_length_termination = true;
        Ok(())
    }

    fn check_started(&self) -> usb_device::Result<()> {
        if self.state == State::Disabled {
            Err(UsbError::InvalidState)
        } else {
            Ok(())
        }
    }

    /// Send all of `data` on endpoint `number`
    ///
    /// The first packet is armed before this returns. `data` comes back
    /// through [`Handler::on_in_complete`](crate::Handler::on_in_complete).
    /// Fails with `WouldBlock` if the endpoint is already sending, or if it's
    /// a control endpoint with a data stage in progress.
    pub fn begin_transmit(&mut self, number: u8, data: &'b [u8]) -> usb_device::Result<()> {
        self.check_started()?;
        let Endpoint {
            config,
            tx,
            transfers,
            ..
        } = self.table.get_mut(number).ok_or(UsbError::InvalidEndpoint)?;
        let pipe = tx.as_mut().ok_or(UsbError::InvalidEndpoint)?;
        let transfer = InTransfer::new(data, pipe.max_packet(), config.zero_length_termination);
        let transfer = transfers.start_tx(transfer)?;
        transfer.arm(&mut self.port, pipe);
        trace!("EP{} TRANSMIT {}", number, data.len());
        Ok(())
    }

    /// Receive up to `buffer.len()` bytes on endpoint `number`
    ///
    /// The first packet is armed before this returns. `buffer` comes back
    /// through [`Handler::on_out_complete`](crate::Handler::on_out_complete).
    /// Fails with `WouldBlock` if the endpoint is already receiving, or if
    /// it's a control endpoint with a data stage in progress.
    pub fn begin_receive(&mut self, number: u8, buffer: &'b mut [u8]) -> usb_device::Result<()> {
        self.check_started()?;
        let Endpoint { rx, transfers, .. } =
            self.table.get_mut(number).ok_or(UsbError::InvalidEndpoint)?;
        let pipe = rx.as_mut().ok_or(UsbError::InvalidEndpoint)?;
        let size = buffer.len();
        let transfer = transfers.start_rx(OutTransfer::new(buffer))?;
        transfer.arm(&mut self.port, pipe);
        trace!("EP{} RECEIVE {}", number, size);
        Ok(())
    }

    /// Read the last SETUP packet received by control endpoint `number`
    pub fn read_setup_packet(&self, number: u8) -> usb_device::Result<[u8; SETUP_PACKET_LEN]> {
        let endpoint = self.table.get(number).ok_or(UsbError::InvalidEndpoint)?;
        if endpoint.config.kind != EndpointType::Control {
            return Err(UsbError::InvalidState);
        }
        Ok(self.port.read_setup())
    }

    /// Stall one direction of endpoint `number`
    ///
    /// A transfer in progress in that direction is dropped.
    pub fn stall(&mut self, number: u8, direction: UsbDirection) -> usb_device::Result<()> {
        let endpoint = self.table.get_mut(number).ok_or(UsbError::InvalidEndpoint)?;
        let pipe = endpoint.pipe_mut(direction).ok_or(UsbError::InvalidEndpoint)?;
        pipe.cancel(&mut self.port);
        let slot = pipe.slot();
        match direction {
            UsbDirection::In => drop(endpoint.transfers.take_tx()),
            UsbDirection::Out => drop(endpoint.transfers.take_rx()),
        }
        self.port.set_stalled(slot, direction, true);
        debug!("EP{} {} STALLED", number, direction);
        Ok(())
    }

    /// Clear a stall, and restart the data toggle of a non-control endpoint
    pub fn clear_stall(&mut self, number: u8, direction: UsbDirection) -> usb_device::Result<()> {
        let endpoint = self.table.get_mut(number).ok_or(UsbError::InvalidEndpoint)?;
        let kind = endpoint.config.kind;
        let pipe = endpoint.pipe_mut(direction).ok_or(UsbError::InvalidEndpoint)?;
        if kind != EndpointType::Control {
            pipe.set_toggle(P::INITIAL_TOGGLE);
        }
        self.port.set_stalled(pipe.slot(), direction, false);
        debug!("EP{} {} UNSTALLED", number, direction);
        Ok(())
    }

    /// Status of one direction of endpoint `number`
    pub fn endpoint_status(&self, number: u8, direction: UsbDirection) -> EndpointStatus {
        match self.pipe_slot(number, direction) {
            Some(slot) if self.port.is_slot_enabled(slot) => {
                if self.port.is_stalled(slot, direction) {
                    EndpointStatus::Stalled
                } else {
                    EndpointStatus::Active
                }
            }
            _ => EndpointStatus::Disabled,
        }
    }

    fn pipe_slot(&self, number: u8, direction: UsbDirection) -> Option<usize> {
        let pipe = self.table.get(number)?.pipe(direction)?;
        Some(pipe.slot())
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The programmed device address
    pub fn address(&self) -> u8 {
        self.address
    }

    /// The hardware slot that carries one direction of endpoint `number`
    pub fn hardware_slot(&self, number: u8, direction: UsbDirection) -> Option<usize> {
        self.pipe_slot(number, direction)
    }

    /// The sequence state of the last packet acknowledged in one direction of
    /// endpoint `number`
    pub fn data_toggle(&self, number: u8, direction: UsbDirection) -> Option<DataToggle> {
        let pipe = self.table.get(number)?.pipe(direction)?;
        Some(pipe.toggle())
    }

    /// Indicates if endpoint `number` is enabled
    pub fn is_enabled(&self, number: u8) -> bool {
        self.table.get(number).is_some()
    }

    /// Bytes of packet SRAM still available for endpoints
    pub fn remaining_sram(&self) -> usize {
        self.table.remaining()
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}
