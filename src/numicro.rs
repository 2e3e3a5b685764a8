//! NuMicro USBD port
//!
//! The USBD peripheral has eight endpoint slots, each carrying one direction,
//! and 512 bytes of packet SRAM. SETUP packets always land in the first eight
//! bytes of the SRAM.

use crate::{
    arena::Region,
    port::{DataToggle, Events, Interrupt, PacketStatus, Port, SlotConfig},
    ral::{self, usbd::ep},
    vcell, SETUP_PACKET_LEN,
};
use usb_device::{endpoint::EndpointType, UsbDirection};

/// Cycles to drive SE0 when the controller powers up
const SE0_CYCLES: u32 = 1_000;

/// NuMicro USBD registers
pub struct Usbd {
    usbd: ral::usbd::Instance,
}

impl Usbd {
    /// Take the USBD registers owned by `peripherals`
    ///
    /// Assumes that the USB clock is already running.
    pub fn new<P: crate::Peripherals>(peripherals: P) -> Self {
        Usbd {
            usbd: ral::instance(&peripherals),
        }
    }

    fn ep(&self, slot: usize) -> &ral::usbd::EpRegisters {
        &self.usbd.EP[slot]
    }

    fn slot_direction(&self, slot: usize) -> UsbDirection {
        if ral::read_reg!(ep, self.ep(slot), CFG, STATE == ep::CFG::STATE_IN) {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    fn decode(&self, slot: usize, epsts: u32) -> Option<PacketStatus> {
        use ral::usbd::EPSTS;
        let code = (epsts >> (EPSTS::SLOT_OFFSET + 3 * slot as u32)) & 0b111;
        match code {
            EPSTS::IN_ACK => Some(PacketStatus::InAck),
            EPSTS::IN_NAK => Some(PacketStatus::InNak),
            EPSTS::OUT_DATA0_ACK => Some(PacketStatus::OutAck(DataToggle::Data0)),
            EPSTS::OUT_DATA1_ACK => Some(PacketStatus::OutAck(DataToggle::Data1)),
            EPSTS::SETUP_ACK => Some(PacketStatus::SetupAck),
            EPSTS::ISO_END => Some(PacketStatus::IsochronousEnd(self.slot_direction(slot))),
            _ => None,
        }
    }
}

impl Port for Usbd {
    const SLOT_COUNT: usize = 8;
    const SRAM_SIZE: usize = ral::usbd::SRAM_SIZE;
    const SETUP_RESERVED: usize = SETUP_PACKET_LEN;
    const BUFFER_ALIGN: usize = 8;
    const SLOT_PER_DIRECTION: bool = true;
    const INITIAL_TOGGLE: DataToggle = DataToggle::Data1;

    fn power_up(&mut self) {
        ral::write_reg!(
            ral::usbd,
            self.usbd,
            ATTR,
            BYTEM: 1,
            PWRDN: 1,
            USB_EN: 1,
            PHY_EN: 1
        );
        ral::write_reg!(ral::usbd, self.usbd, STBUFSEG, 0);
        ral::write_reg!(ral::usbd, self.usbd, DRVSE0, DRVSE0: 1);
        cortex_m::asm::delay(SE0_CYCLES);
        ral::write_reg!(ral::usbd, self.usbd, DRVSE0, DRVSE0: 0);
        ral::write_reg!(ral::usbd, self.usbd, INTEN, 0);
        ral::write_reg!(
            ral::usbd,
            self.usbd,
            INTSTS,
            BUS_STS: 1,
            USB_STS: 1,
            FLDET_STS: 1,
            WAKEUP_STS: 1,
            EPEVT: 0xFF,
            SETUP: 1
        );
    }

    fn power_down(&mut self) {
        ral::modify_reg!(
            ral::usbd,
            self.usbd,
            ATTR,
            PWRDN: 0,
            DPPU_EN: 0,
            USB_EN: 0,
            PHY_EN: 0
        );
    }

    fn set_interrupts(&mut self, enable: bool) {
        if enable {
            ral::write_reg!(
                ral::usbd,
                self.usbd,
                INTEN,
                BUS_IE: 1,
                USB_IE: 1,
                FLDET_IE: 1,
                WAKEUP_IE: 1,
                WAKEUP_EN: 1
            );
        } else {
            ral::write_reg!(ral::usbd, self.usbd, INTEN, 0);
        }
    }

    fn set_connected(&mut self, connected: bool) {
        ral::modify_reg!(ral::usbd, self.usbd, ATTR, DPPU_EN: connected as u32);
    }

    fn is_attached(&self) -> bool {
        ral::read_reg!(ral::usbd, self.usbd, FLDET, FLDET == 1)
    }

    fn set_phy_enabled(&mut self, enable: bool) {
        ral::modify_reg!(ral::usbd, self.usbd, ATTR, PHY_EN: enable as u32);
    }

    fn set_address(&mut self, address: u8) {
        ral::write_reg!(ral::usbd, self.usbd, FADDR, FADDR: address as u32);
    }

    fn events(&mut self) -> Events {
        let (bus, usb, fldet, wakeup, epevt, setup) = ral::read_reg!(
            ral::usbd,
            self.usbd,
            INTSTS,
            BUS_STS,
            USB_STS,
            FLDET_STS,
            WAKEUP_STS,
            EPEVT,
            SETUP
        );

        let mut events = Events::none();
        if fldet != 0 {
            events.interrupts |= Interrupt::FLOAT_DETECT;
        }
        if bus != 0 {
            let (reset, suspend, resume) =
                ral::read_reg!(ral::usbd, self.usbd, ATTR, USBRST, SUSPEND, RESUME);
            events.interrupts.set(Interrupt::RESET, reset != 0);
            events.interrupts.set(Interrupt::SUSPEND, suspend != 0);
            events.interrupts.set(Interrupt::RESUME, resume != 0);
        }
        if wakeup != 0 {
            events.interrupts |= Interrupt::WAKEUP;
        }
        if usb != 0 {
            let epsts = ral::read_reg!(ral::usbd, self.usbd, EPSTS);
            events.slots = epevt as u16;
            for slot in 0..Self::SLOT_COUNT {
                if epevt & (1 << slot) != 0 {
                    events.status[slot] = self.decode(slot, epsts);
                }
            }
            if setup != 0 {
                events.interrupts |= Interrupt::SETUP;
            }
        }
        events
    }

    fn clear_interrupts(&mut self, interrupts: Interrupt) {
        let bus = interrupts.intersects(Interrupt::RESET | Interrupt::SUSPEND | Interrupt::RESUME);
        ral::write_reg!(
            ral::usbd,
            self.usbd,
            INTSTS,
            BUS_STS: bus as u32,
            FLDET_STS: interrupts.contains(Interrupt::FLOAT_DETECT) as u32,
            WAKEUP_STS: interrupts.contains(Interrupt::WAKEUP) as u32,
            SETUP: interrupts.contains(Interrupt::SETUP) as u32
        );
    }

    /// `USB_STS` drops by itself once every slot and SETUP flag is clear.
    fn clear_slot(&mut self, slot: usize) {
        ral::write_reg!(ral::usbd, self.usbd, INTSTS, EPEVT: 1 << slot);
    }

    fn configure_slot(&mut self, slot: usize, config: &SlotConfig) {
        let (region, state): (Region, u32) = match (config.tx, config.rx) {
            (Some(region), _) => (region, ep::CFG::STATE_IN),
            (None, Some(region)) => (region, ep::CFG::STATE_OUT),
            (None, None) => return,
        };
        let isochronous = matches!(config.kind, EndpointType::Isochronous { .. });
        // The controller drops a control slot's stall when SETUP arrives.
        let control = matches!(config.kind, EndpointType::Control);
        let regs = self.ep(slot);
        ral::write_reg!(ep, regs, BUFSEG, BUFSEG: (region.offset() >> 3) as u32);
        ral::write_reg!(
            ep,
            regs,
            CFG,
            EPNUM: config.endpoint as u32,
            ISOCH: isochronous as u32,
            STATE: state,
            CSTALL: control as u32
        );
        ral::write_reg!(ep, regs, CFGP, CLRRDY: 1);
    }

    fn disable_slot(&mut self, slot: usize) {
        let regs = self.ep(slot);
        ral::write_reg!(ep, regs, CFG, 0);
        ral::write_reg!(ep, regs, CFGP, CLRRDY: 1);
    }

    fn is_slot_enabled(&self, slot: usize) -> bool {
        ral::read_reg!(ep, self.ep(slot), CFG, STATE != ep::CFG::STATE_DISABLED)
    }

    fn set_toggle(&mut self, slot: usize, _: UsbDirection, toggle: DataToggle) {
        let data1 = toggle == DataToggle::Data1;
        ral::modify_reg!(ep, self.ep(slot), CFG, DSQ_SYNC: data1 as u32);
    }

    fn arm_packet(&mut self, slot: usize, _: UsbDirection, size: usize) {
        ral::write_reg!(ep, self.ep(slot), MXPLD, MXPLD: size as u32);
    }

    fn cancel_packet(&mut self, slot: usize, _: UsbDirection) {
        ral::modify_reg!(ep, self.ep(slot), CFGP, CLRRDY: 1);
    }

    fn packet_size_received(&self, slot: usize) -> usize {
        ral::read_reg!(ep, self.ep(slot), MXPLD, MXPLD) as usize
    }

    fn set_stalled(&mut self, slot: usize, _: UsbDirection, stalled: bool) {
        ral::modify_reg!(ep, self.ep(slot), CFGP, SSTALL: stalled as u32);
    }

    fn is_stalled(&self, slot: usize, _: UsbDirection) -> bool {
        ral::read_reg!(ep, self.ep(slot), CFGP, SSTALL == 1)
    }

    fn write_sram(&mut self, offset: usize, data: &[u8]) {
        if let Some(sram) = self.usbd.SRAM.get(offset..) {
            vcell::copy_to(sram, data);
        }
    }

    fn read_sram(&self, offset: usize, data: &mut [u8]) {
        if let Some(sram) = self.usbd.SRAM.get(offset..) {
            vcell::copy_from(data, sram);
        }
    }

    fn read_setup(&self) -> [u8; SETUP_PACKET_LEN] {
        let mut setup = [0; SETUP_PACKET_LEN];
        vcell::copy_from(&mut setup, &self.usbd.SRAM);
        setup
    }
}
