//! Register access layer for the NuMicro USBD peripheral
//!
//! The register block and field modules follow the layout that the
//! `ral-registers` macros expect: every register is a field of the block, and
//! every bit field is a module holding its `offset` and `mask`.

pub use ral_registers::{modify_reg, read_reg, write_reg, RORegister, RWRegister};

macro_rules! fields {
    ($($field:ident: $offset:expr, $width:expr;)+) => {
        $(
            #[allow(non_snake_case, non_upper_case_globals, dead_code)]
            pub mod $field {
                pub const offset: u32 = $offset;
                pub const mask: u32 = ((1 << $width) - 1) << $offset;
                pub mod R {}
                pub mod W {}
                pub mod RW {}
            }
        )+
    };
}

#[allow(non_snake_case)]
pub mod usbd {
    use super::{RORegister, RWRegister};
    use crate::vcell::VCell;
    use core::ops::Deref;

    /// Per-slot endpoint registers
    #[repr(C)]
    pub struct EpRegisters {
        /// Packet buffer offset, from the start of the packet SRAM
        pub BUFSEG: RWRegister<u32>,
        /// Bytes to send, or room to receive. Writing arms the slot.
        pub MXPLD: RWRegister<u32>,
        pub CFG: RWRegister<u32>,
        pub CFGP: RWRegister<u32>,
    }

    #[repr(C)]
    pub struct RegisterBlock {
        pub INTEN: RWRegister<u32>,
        /// Interrupt status, write one to clear
        pub INTSTS: RWRegister<u32>,
        pub FADDR: RWRegister<u32>,
        pub EPSTS: RORegister<u32>,
        pub ATTR: RWRegister<u32>,
        pub FLDET: RORegister<u32>,
        pub STBUFSEG: RWRegister<u32>,
        _reserved0: [u32; 29],
        pub DRVSE0: RWRegister<u32>,
        _reserved1: [u32; 27],
        /// Packet SRAM shared by every endpoint
        pub SRAM: [VCell<u8>; SRAM_SIZE],
        _reserved2: [u32; 128],
        pub EP: [EpRegisters; 8],
    }

    pub const SRAM_SIZE: usize = 512;

    const _: () = assert!(core::mem::size_of::<RegisterBlock>() == 0x580);

    /// Owned USBD registers
    pub struct Instance {
        addr: *const RegisterBlock,
    }

    impl Instance {
        /// # Safety
        ///
        /// `addr` must point to USBD registers that nothing else uses, and stay
        /// valid for the life of the instance.
        pub const unsafe fn new(addr: *const RegisterBlock) -> Self {
            Instance { addr }
        }
    }

    impl Deref for Instance {
        type Target = RegisterBlock;
        fn deref(&self) -> &RegisterBlock {
            // Safety: see the constructor.
            unsafe { &*self.addr }
        }
    }

    unsafe impl Send for Instance {}

    pub mod INTEN {
        fields! {
            BUS_IE: 0, 1;
            USB_IE: 1, 1;
            FLDET_IE: 2, 1;
            WAKEUP_IE: 3, 1;
            WAKEUP_EN: 8, 1;
        }
    }

    pub mod INTSTS {
        fields! {
            BUS_STS: 0, 1;
            USB_STS: 1, 1;
            FLDET_STS: 2, 1;
            WAKEUP_STS: 3, 1;
            EPEVT: 16, 8;
            SETUP: 31, 1;
        }
    }

    pub mod FADDR {
        fields! {
            FADDR: 0, 7;
        }
    }

    pub mod EPSTS {
        fields! {
            OVERRUN: 7, 1;
        }
        /// Each slot reports a three bit status, starting here
        pub const SLOT_OFFSET: u32 = 8;
        pub const IN_ACK: u32 = 0;
        pub const IN_NAK: u32 = 1;
        pub const OUT_DATA0_ACK: u32 = 2;
        pub const SETUP_ACK: u32 = 3;
        pub const OUT_DATA1_ACK: u32 = 6;
        pub const ISO_END: u32 = 7;
    }

    pub mod ATTR {
        fields! {
            USBRST: 0, 1;
            SUSPEND: 1, 1;
            RESUME: 2, 1;
            TIMEOUT: 3, 1;
            PHY_EN: 4, 1;
            RWAKEUP: 5, 1;
            USB_EN: 7, 1;
            DPPU_EN: 8, 1;
            PWRDN: 9, 1;
            BYTEM: 10, 1;
        }
    }

    pub mod FLDET {
        fields! {
            FLDET: 0, 1;
        }
    }

    pub mod STBUFSEG {
        fields! {
            STBUFSEG: 3, 6;
        }
    }

    pub mod DRVSE0 {
        fields! {
            DRVSE0: 0, 1;
        }
    }

    /// Field modules for [`EpRegisters`]
    pub mod ep {
        pub mod BUFSEG {
            fields! {
                BUFSEG: 3, 6;
            }
        }

        pub mod MXPLD {
            fields! {
                MXPLD: 0, 9;
            }
        }

        pub mod CFG {
            fields! {
                EPNUM: 0, 4;
                ISOCH: 4, 1;
                STATE: 5, 2;
                DSQ_SYNC: 7, 1;
                CSTALL: 9, 1;
            }
            pub const STATE_DISABLED: u32 = 0;
            pub const STATE_OUT: u32 = 1;
            pub const STATE_IN: u32 = 2;
        }

        pub mod CFGP {
            fields! {
                CLRRDY: 0, 1;
                SSTALL: 1, 1;
            }
        }
    }
}

/// Acquire the USBD registers from `peripherals`
pub fn instance<P: crate::Peripherals>(peripherals: &P) -> usbd::Instance {
    // Safety: a `Peripherals` implementation promises an owned, valid block.
    unsafe { usbd::Instance::new(peripherals.usbd().cast()) }
}
