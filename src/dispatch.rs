//! Interrupt dispatch
//!
//! [`Driver::poll`] reads the controller's interrupt status once, and handles
//! what it finds in a fixed order:
//!
//! 1. bus conditions (VBUS detect, reset, suspend, resume, wakeup),
//! 2. endpoint events, lowest hardware slot first,
//! 3. a received SETUP packet.
//!
//! Each flag is cleared right after its event is handled.

use crate::{
    driver::{Driver, State},
    port::{DataToggle, Interrupt, PacketStatus, Port},
    transfer::{Aborted, Progress},
};
use usb_device::UsbDirection;

/// A bus condition, reported through [`Handler::on_bus_event`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum BusEvent {
    /// The host reset the bus. Every endpoint except endpoint 0 is gone.
    Reset,
    Suspend,
    /// The host resumed the bus, or the controller woke up
    Wakeup,
    /// VBUS appeared
    Attached,
    /// VBUS disappeared
    Detached,
}

/// Receives driver events
///
/// Every callback runs in interrupt context, from [`Driver::poll`], and must
/// not block. Each callback gets the driver, so it can start the next
/// transfer right away.
pub trait Handler<'b, P: Port> {
    /// A SETUP packet arrived on control endpoint `endpoint`
    ///
    /// Read it with [`Driver::read_setup_packet`].
    fn on_setup(&mut self, usb: &mut Driver<'b, P>, endpoint: u8);

    /// The host acknowledged all of `data`
    fn on_in_complete(&mut self, usb: &mut Driver<'b, P>, endpoint: u8, data: &'b [u8]);

    /// A receive finished
    ///
    /// `received` holds the number of bytes written into `buffer`, or
    /// `UsbError::BufferOverflow` if the host sent more than `buffer` could hold.
    fn on_out_complete(
        &mut self,
        usb: &mut Driver<'b, P>,
        endpoint: u8,
        buffer: &'b mut [u8],
        received: usb_device::Result<usize>,
    );

    /// A data stage was discarded because a SETUP packet arrived
    fn on_aborted(&mut self, usb: &mut Driver<'b, P>, endpoint: u8, aborted: Aborted<'b>) {
        let _ = (usb, endpoint, aborted);
    }

    fn on_bus_event(&mut self, usb: &mut Driver<'b, P>, event: BusEvent) {
        let _ = (usb, event);
    }
}

impl<'b, P: Port> Driver<'b, P> {
    /// Handle every pending controller event
    ///
    /// Call this from the USB interrupt handler. Does nothing while the driver
    /// is stopped.
    pub fn poll<H: Handler<'b, P> + ?Sized>(&mut self, handler: &mut H) {
        if self.state == State::Disabled {
            return;
        }

        let events = self.port.events();
        let interrupts = events.interrupts;

        if interrupts.contains(Interrupt::FLOAT_DETECT) {
            let event = if self.port.is_attached() {
                BusEvent::Attached
            } else {
                BusEvent::Detached
            };
            debug!("VBUS {}", event);
            handler.on_bus_event(self, event);
            self.port.clear_interrupts(Interrupt::FLOAT_DETECT);
        }

        if interrupts.contains(Interrupt::RESET) {
            self.bus_reset();
            debug!("RESET");
            handler.on_bus_event(self, BusEvent::Reset);
            self.port.clear_interrupts(Interrupt::RESET);
        }

        if interrupts.contains(Interrupt::SUSPEND) {
            self.port.set_phy_enabled(false);
            if self.state != State::Suspended {
                self.resume_state = self.state;
            }
            self.state = State::Suspended;
            debug!("SUSPEND");
            handler.on_bus_event(self, BusEvent::Suspend);
            self.port.clear_interrupts(Interrupt::SUSPEND);
        }

        for wakeup in [Interrupt::RESUME, Interrupt::WAKEUP] {
            if interrupts.contains(wakeup) {
                self.port.set_phy_enabled(true);
                if self.state == State::Suspended {
                    self.state = self.resume_state;
                }
                debug!("WAKEUP");
                handler.on_bus_event(self, BusEvent::Wakeup);
                self.port.clear_interrupts(wakeup);
            }
        }

        for (slot, status) in events.pending_slots() {
            self.dispatch_slot(handler, slot, status);
            self.port.clear_slot(slot);
        }

        if interrupts.contains(Interrupt::SETUP) {
            self.setup_received(handler);
            self.port.clear_interrupts(Interrupt::SETUP);
        }
    }

    fn dispatch_slot<H: Handler<'b, P> + ?Sized>(
        &mut self,
        handler: &mut H,
        slot: usize,
        status: Option<PacketStatus>,
    ) {
        let Some(endpoint) = self.table.owner(slot) else {
            warn!("STRAY EVENT ON SLOT{}", slot);
            return;
        };
        match status {
            Some(PacketStatus::InAck) | Some(PacketStatus::IsochronousEnd(UsbDirection::In)) => {
                self.complete_in(handler, endpoint)
            }
            Some(PacketStatus::OutAck(_)) | Some(PacketStatus::IsochronousEnd(UsbDirection::Out)) => {
                self.complete_out(handler, endpoint)
            }
            Some(PacketStatus::InNak) => {
                trace!("EP{} IN NAK", endpoint);
            }
            Some(PacketStatus::SetupAck) => {
                trace!("EP{} SETUP ACK", endpoint);
            }
            None => {
                warn!("EP{} UNKNOWN STATUS ON SLOT{}", endpoint, slot);
            }
        }
    }

    fn complete_in<H: Handler<'b, P> + ?Sized>(&mut self, handler: &mut H, number: u8) {
        let Some(endpoint) = self.table.get_mut(number) else {
            return;
        };
        let Some(pipe) = endpoint.tx.as_mut() else {
            warn!("EP{} IN EVENT WITHOUT IN PIPE", number);
            return;
        };
        let Some(transfer) = endpoint.transfers.tx_mut() else {
            pipe.acknowledge();
            warn!("EP{} IN ACK WITHOUT TRANSFER", number);
            return;
        };
        if transfer.acknowledge(&mut self.port, pipe) == Progress::Complete {
            if let Some(transfer) = endpoint.transfers.take_tx() {
                trace!("EP{} IN COMPLETE {}", number, transfer.transferred());
                handler.on_in_complete(self, number, transfer.data());
            }
        }
    }

    fn complete_out<H: Handler<'b, P> + ?Sized>(&mut self, handler: &mut H, number: u8) {
        let Some(endpoint) = self.table.get_mut(number) else {
            return;
        };
        let Some(pipe) = endpoint.rx.as_mut() else {
            warn!("EP{} OUT EVENT WITHOUT OUT PIPE", number);
            return;
        };
        let Some(transfer) = endpoint.transfers.rx_mut() else {
            pipe.acknowledge();
            warn!("EP{} OUT ACK WITHOUT TRANSFER", number);
            return;
        };
        if transfer.receive(&mut self.port, pipe) == Progress::Complete {
            if let Some(transfer) = endpoint.transfers.take_rx() {
                let received = transfer.result();
                trace!("EP{} OUT COMPLETE {}", number, transfer.transferred());
                handler.on_out_complete(self, number, transfer.into_buffer(), received);
            }
        }
    }

    /// A SETUP packet ends whatever endpoint 0 was doing, clears its stall, and
    /// resynchronizes both directions to DATA0
    fn setup_received<H: Handler<'b, P> + ?Sized>(&mut self, handler: &mut H) {
        let Some(ep0) = self.table.get_mut(0) else {
            warn!("SETUP WITHOUT EP0");
            return;
        };
        ep0.cancel(&mut self.port);
        for pipe in ep0.tx.iter_mut().chain(ep0.rx.iter_mut()) {
            pipe.set_toggle(DataToggle::Data0);
            pipe.set_stalled(&mut self.port, false);
        }
        if let Some(aborted) = ep0.transfers.abort() {
            debug!("EP0 DATA STAGE ABORTED BY SETUP");
            handler.on_aborted(self, 0, aborted);
        }
        trace!("EP0 SETUP");
        handler.on_setup(self, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::BusEvent;
    use crate::{
        driver::{Driver, State},
        mock::{Call, Cleared, MockPort, Recorder},
        port::{DataToggle, Interrupt, PacketStatus},
        transfer::Aborted,
        EndpointConfig, EndpointStatus,
    };
    use usb_device::{endpoint::EndpointType, UsbDirection, UsbError};

    fn started<'b, const SHARED: bool>() -> Driver<'b, MockPort<SHARED>> {
        let mut usb = Driver::new(MockPort::new(), 64);
        usb.start().unwrap();
        usb
    }

    fn bulk() -> EndpointConfig {
        EndpointConfig::new(EndpointType::Bulk).with_in(64).with_out(64)
    }

    #[test]
    fn bulk_transmit_in_chunks() {
        let data = [0x5Au8; 150];
        let mut recorder = Recorder::default();
        let mut usb = started::<false>();
        usb.enable_endpoint(1, &bulk()).unwrap();
        let slot = usb.hardware_slot(1, UsbDirection::In).unwrap();
        usb.begin_transmit(1, &data).unwrap();

        for _ in 0..3 {
            usb.port_mut().host_acks_in(slot);
            usb.poll(&mut recorder);
        }

        assert_eq!(usb.port().armed_sizes(slot), [64, 64, 22]);
        assert_eq!(recorder.calls.len(), 1);
        assert!(matches!(recorder.calls[0], Call::InComplete(1, sent) if sent.len() == 150));
        assert_eq!(&usb.port().sram[8 + 128..8 + 128 + 22], &data[128..]);
    }

    #[test]
    fn setup_aborts_control_data_stage() {
        let mut buffer = [0u8; 128];
        let mut recorder = Recorder::default();
        let mut usb = started::<false>();
        let slot = usb.hardware_slot(0, UsbDirection::Out).unwrap();
        usb.begin_receive(0, &mut buffer).unwrap();

        usb.port_mut().host_out(slot, &[1; 64]);
        usb.poll(&mut recorder);
        assert!(recorder.calls.is_empty());
        assert_eq!(usb.data_toggle(0, UsbDirection::Out), Some(DataToggle::Data1));

        usb.port_mut().host_setup([0x80, 6, 0, 1, 0, 0, 64, 0]);
        usb.poll(&mut recorder);

        assert_eq!(recorder.calls.len(), 2);
        match &recorder.calls[0] {
            Call::Aborted(0, Aborted::Out(buffer, received)) => {
                assert_eq!(*received, 64);
                assert_eq!(&buffer[..64], &[1; 64]);
            }
            _ => panic!("expected an aborted OUT transfer"),
        }
        assert_eq!(
            recorder.calls[1],
            Call::Setup {
                endpoint: 0,
                toggles: (Some(DataToggle::Data0), Some(DataToggle::Data0)),
                packet: [0x80, 6, 0, 1, 0, 0, 64, 0],
            }
        );
        assert!(usb.port().cancelled.contains(&(slot, UsbDirection::Out)));
        assert!(!recorder
            .calls
            .iter()
            .any(|call| matches!(call, Call::OutComplete(..))));
    }

    #[test]
    fn zero_length_status_stage() {
        let mut recorder = Recorder::default();
        let mut usb = started::<false>();
        let slot = usb.hardware_slot(0, UsbDirection::In).unwrap();
        usb.begin_transmit(0, &[]).unwrap();
        assert_eq!(usb.port().last_armed(), Some((slot, UsbDirection::In, 0)));

        usb.port_mut().host_acks_in(slot);
        usb.poll(&mut recorder);
        assert!(matches!(recorder.calls[..], [Call::InComplete(0, sent)] if sent.is_empty()));
    }

    #[test]
    fn receive_overrun_reported() {
        let mut buffer = [0u8; 4];
        let mut recorder = Recorder::default();
        let mut usb = started::<false>();
        usb.enable_endpoint(1, &bulk()).unwrap();
        let slot = usb.hardware_slot(1, UsbDirection::Out).unwrap();
        usb.begin_receive(1, &mut buffer).unwrap();

        usb.port_mut().host_out(slot, &[1, 2, 3, 4, 5, 6, 7, 8]);
        usb.poll(&mut recorder);

        match &recorder.calls[..] {
            [Call::OutComplete(1, buffer, received)] => {
                assert_eq!(*received, Err(UsbError::BufferOverflow));
                assert_eq!(buffer, &[1, 2, 3, 4]);
            }
            _ => panic!("expected one OUT completion"),
        }
    }

    #[test]
    fn toggle_alternates_and_ignores_nak() {
        let data = [0u8; 192];
        let mut recorder = Recorder::default();
        let mut usb = started::<false>();
        usb.enable_endpoint(1, &bulk()).unwrap();
        let slot = usb.hardware_slot(1, UsbDirection::In).unwrap();
        assert_eq!(usb.data_toggle(1, UsbDirection::In), Some(DataToggle::Data1));
        usb.begin_transmit(1, &data).unwrap();

        usb.port_mut().inject(slot, PacketStatus::InNak);
        usb.poll(&mut recorder);
        assert_eq!(usb.data_toggle(1, UsbDirection::In), Some(DataToggle::Data1));
        assert_eq!(usb.port().armed_sizes(slot).len(), 1);

        for _ in 0..3 {
            usb.port_mut().host_acks_in(slot);
            usb.poll(&mut recorder);
        }
        assert_eq!(
            usb.port().toggles_on(slot),
            [DataToggle::Data0, DataToggle::Data1, DataToggle::Data0]
        );
        assert_eq!(usb.data_toggle(1, UsbDirection::In), Some(DataToggle::Data0));
    }

    #[test]
    fn events_cleared_in_order() {
        let data = [0u8; 8];
        let mut recorder = Recorder::default();
        let mut usb = started::<false>();
        usb.begin_transmit(0, &data).unwrap();

        usb.port_mut().raise(Interrupt::SUSPEND);
        usb.port_mut().host_acks_in(0);
        usb.port_mut().host_setup([0; 8]);
        usb.poll(&mut recorder);

        assert_eq!(
            usb.port().cleared,
            [
                Cleared::Interrupts(Interrupt::SUSPEND),
                Cleared::Slot(0),
                Cleared::Interrupts(Interrupt::SETUP),
            ]
        );
        assert_eq!(recorder.calls.len(), 3);
        assert_eq!(recorder.calls[0], Call::Bus(BusEvent::Suspend));
        assert!(matches!(recorder.calls[1], Call::InComplete(0, _)));
        assert!(matches!(recorder.calls[2], Call::Setup { endpoint: 0, .. }));
    }

    #[test]
    fn bus_reset_is_idempotent() {
        let mut recorder = Recorder::default();
        let mut usb = started::<false>();
        let remaining = usb.remaining_sram();
        usb.set_address(12);
        usb.enable_endpoint(1, &bulk()).unwrap();
        usb.enable_endpoint(2, &bulk()).unwrap();

        for _ in 0..2 {
            usb.port_mut().raise(Interrupt::RESET);
            usb.poll(&mut recorder);
            assert_eq!(usb.state(), State::Running);
            assert_eq!(usb.address(), 0);
            assert_eq!(usb.port().address, 0);
            assert!(usb.is_enabled(0));
            assert!(!usb.is_enabled(1));
            assert!(!usb.is_enabled(2));
            assert_eq!(usb.remaining_sram(), remaining);
            assert_eq!(usb.hardware_slot(0, UsbDirection::In), Some(0));
        }
        assert_eq!(
            recorder.calls,
            [Call::Bus(BusEvent::Reset), Call::Bus(BusEvent::Reset)]
        );
    }

    #[test]
    fn bus_reset_restarts_toggles() {
        let data = [0u8; 256];
        let mut buffer = [0u8; 128];
        for acknowledged in 1..=4 {
            let mut recorder = Recorder::default();
            let mut usb = started::<false>();
            let tx = usb.hardware_slot(0, UsbDirection::In).unwrap();
            usb.begin_transmit(0, &data).unwrap();
            for _ in 0..acknowledged {
                usb.port_mut().host_acks_in(tx);
                usb.poll(&mut recorder);
            }
            let expected = if acknowledged % 2 == 1 {
                DataToggle::Data1
            } else {
                DataToggle::Data0
            };
            assert_eq!(usb.data_toggle(0, UsbDirection::In), Some(expected));

            usb.port_mut().raise(Interrupt::RESET);
            usb.poll(&mut recorder);
            assert_eq!(usb.data_toggle(0, UsbDirection::In), Some(DataToggle::Data0));
            assert_eq!(usb.data_toggle(0, UsbDirection::Out), Some(DataToggle::Data0));
        }

        let mut recorder = Recorder::default();
        let mut usb = started::<false>();
        let rx = usb.hardware_slot(0, UsbDirection::Out).unwrap();
        usb.begin_receive(0, &mut buffer).unwrap();
        usb.port_mut().host_out(rx, &[1; 64]);
        usb.poll(&mut recorder);
        assert_eq!(usb.data_toggle(0, UsbDirection::Out), Some(DataToggle::Data1));

        usb.port_mut().raise(Interrupt::RESET);
        usb.poll(&mut recorder);
        assert_eq!(usb.data_toggle(0, UsbDirection::Out), Some(DataToggle::Data0));
    }

    #[test]
    fn reset_wakes_suspended_device() {
        let mut recorder = Recorder::default();
        let mut usb = started::<false>();
        usb.port_mut().raise(Interrupt::RESET);
        usb.poll(&mut recorder);
        usb.port_mut().raise(Interrupt::SUSPEND);
        usb.poll(&mut recorder);
        assert!(!usb.port().phy);

        usb.port_mut().raise(Interrupt::RESET);
        usb.poll(&mut recorder);
        assert_eq!(usb.state(), State::Running);
        assert!(usb.port().phy);
    }

    #[test]
    fn resume_returns_to_state_before_suspend() {
        let mut recorder = Recorder::default();
        let mut usb = started::<false>();
        assert_eq!(usb.state(), State::Reset);

        usb.port_mut().raise(Interrupt::SUSPEND);
        usb.poll(&mut recorder);
        usb.port_mut().raise(Interrupt::SUSPEND);
        usb.poll(&mut recorder);
        assert_eq!(usb.state(), State::Suspended);

        usb.port_mut().raise(Interrupt::WAKEUP);
        usb.poll(&mut recorder);
        assert_eq!(usb.state(), State::Reset);
        assert!(usb.port().phy);
    }

    #[test]
    fn setup_clears_control_stall() {
        let mut recorder = Recorder::default();
        let mut usb = started::<false>();
        usb.stall(0, UsbDirection::In).unwrap();
        usb.stall(0, UsbDirection::Out).unwrap();
        assert_eq!(usb.endpoint_status(0, UsbDirection::In), EndpointStatus::Stalled);

        usb.port_mut().host_setup([0x80, 6, 0, 1, 0, 0, 18, 0]);
        usb.poll(&mut recorder);

        assert_eq!(usb.endpoint_status(0, UsbDirection::In), EndpointStatus::Active);
        assert_eq!(usb.endpoint_status(0, UsbDirection::Out), EndpointStatus::Active);
        assert!(matches!(recorder.calls[..], [Call::Setup { endpoint: 0, .. }]));
    }

    #[test]
    fn suspend_and_resume() {
        let mut recorder = Recorder::default();
        let mut usb = started::<false>();
        usb.port_mut().raise(Interrupt::RESET);
        usb.poll(&mut recorder);

        usb.port_mut().raise(Interrupt::SUSPEND);
        usb.poll(&mut recorder);
        assert_eq!(usb.state(), State::Suspended);
        assert!(!usb.port().phy);
        assert!(usb.is_enabled(0));

        usb.port_mut().raise(Interrupt::RESUME);
        usb.poll(&mut recorder);
        assert_eq!(usb.state(), State::Running);
        assert!(usb.port().phy);
        assert_eq!(recorder.calls.last(), Some(&Call::Bus(BusEvent::Wakeup)));
    }

    #[test]
    fn vbus_detect() {
        let mut recorder = Recorder::default();
        let mut usb = started::<false>();
        usb.port_mut().attached = true;
        usb.port_mut().raise(Interrupt::FLOAT_DETECT);
        usb.poll(&mut recorder);
        usb.port_mut().attached = false;
        usb.port_mut().raise(Interrupt::FLOAT_DETECT);
        usb.poll(&mut recorder);
        assert_eq!(
            recorder.calls,
            [Call::Bus(BusEvent::Attached), Call::Bus(BusEvent::Detached)]
        );
    }

    #[test]
    fn stray_slot_event_is_ignored() {
        let mut recorder = Recorder::default();
        let mut usb = started::<false>();
        usb.port_mut().host_acks_in(5);
        usb.poll(&mut recorder);
        assert!(recorder.calls.is_empty());
        assert_eq!(usb.port().cleared, [Cleared::Slot(5)]);
    }

    #[test]
    fn stopped_driver_ignores_events() {
        let mut recorder = Recorder::default();
        let mut usb = started::<false>();
        usb.stop();
        usb.port_mut().raise(Interrupt::RESET);
        usb.poll(&mut recorder);
        assert!(recorder.calls.is_empty());
        assert_eq!(usb.state(), State::Disabled);
    }

    #[test]
    fn shared_slot_routes_by_direction() {
        let data = [7u8; 10];
        let mut buffer = [0u8; 10];
        let mut recorder = Recorder::default();
        let mut usb = started::<true>();
        usb.enable_endpoint(1, &bulk()).unwrap();
        let slot = usb.hardware_slot(1, UsbDirection::In).unwrap();
        assert_eq!(usb.hardware_slot(1, UsbDirection::Out), Some(slot));

        usb.begin_transmit(1, &data).unwrap();
        usb.begin_receive(1, &mut buffer).unwrap();
        usb.port_mut().host_out(slot, &[3; 10]);
        usb.poll(&mut recorder);
        usb.port_mut().host_acks_in(slot);
        usb.poll(&mut recorder);

        match &recorder.calls[..] {
            [Call::OutComplete(1, buffer, Ok(10)), Call::InComplete(1, sent)] => {
                assert_eq!(buffer, &[3; 10]);
                assert_eq!(sent.len(), 10);
            }
            _ => panic!("unexpected callbacks"),
        }
    }
}
