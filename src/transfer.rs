//! Transfer chunking
//!
//! A transfer is a caller-owned buffer of any size. The hardware moves one
//! packet of at most `max_packet` bytes at a time, staged through the pipe's
//! packet SRAM region. The types here track how far a transfer has come, and
//! arm the next packet after each acknowledgement.
//!
//! Invariants:
//!
//! - `transferred` never exceeds the buffer length.
//! - A packet is only zero bytes long when nothing else is left to send, or
//!   receive. A zero length IN transfer still sends one zero length packet.
//! - The toggle moves once per acknowledged packet, never when a packet is
//!   armed or NAKed.

use crate::{endpoint::Pipe, port::Port};
use usb_device::{endpoint::EndpointType, UsbError};

/// What happened after a packet was acknowledged
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Progress {
    /// The next packet is armed, or nothing was in flight
    Pending,
    /// The transfer is finished, and may be handed back to its owner
    Complete,
}

/// A device-to-host transfer
pub(crate) struct InTransfer<'b> {
    data: &'b [u8],
    transferred: usize,
    /// A zero length packet still has to go out
    zlp: bool,
}

impl<'b> InTransfer<'b> {
    /// Prepare to send `data`
    ///
    /// If `zlt` is set, a transfer that's a multiple of `max_packet` ends with
    /// an extra zero length packet.
    pub fn new(data: &'b [u8], max_packet: usize, zlt: bool) -> Self {
        InTransfer {
            data,
            transferred: 0,
            zlp: data.is_empty() || (zlt && data.len() % max_packet == 0),
        }
    }

    pub fn data(&self) -> &'b [u8] {
        self.data
    }

    pub fn transferred(&self) -> usize {
        self.transferred
    }

    fn next_chunk(&self, max_packet: usize) -> Option<&'b [u8]> {
        let remaining = &self.data[self.transferred..];
        if !remaining.is_empty() {
            Some(&remaining[..remaining.len().min(max_packet)])
        } else if self.zlp {
            Some(&[])
        } else {
            None
        }
    }

    /// Stage and arm the next packet
    ///
    /// Does nothing if the pipe already has a packet in flight.
    pub fn arm<P: Port>(&self, port: &mut P, pipe: &mut Pipe) {
        if pipe.is_armed() {
            return;
        }
        if let Some(chunk) = self.next_chunk(pipe.max_packet()) {
            port.write_sram(pipe.region().offset(), chunk);
            pipe.arm(port, chunk.len());
        }
    }

    /// Account for the packet the host just acknowledged, and arm the next one
    pub fn acknowledge<P: Port>(&mut self, port: &mut P, pipe: &mut Pipe) -> Progress {
        let Some(sent) = pipe.acknowledge() else {
            return Progress::Pending;
        };
        if sent == 0 {
            self.zlp = false;
        }
        self.transferred += sent;
        debug_assert!(self.transferred <= self.data.len());

        if self.is_complete() {
            Progress::Complete
        } else {
            self.arm(port, pipe);
            Progress::Pending
        }
    }

    fn is_complete(&self) -> bool {
        self.transferred == self.data.len() && !self.zlp
    }
}

/// A host-to-device transfer
pub(crate) struct OutTransfer<'b> {
    buffer: &'b mut [u8],
    transferred: usize,
    /// The host sent more than the buffer could hold
    overrun: bool,
}

impl<'b> OutTransfer<'b> {
    /// Prepare to receive up to `buffer.len()` bytes
    pub fn new(buffer: &'b mut [u8]) -> Self {
        OutTransfer {
            buffer,
            transferred: 0,
            overrun: false,
        }
    }

    pub fn transferred(&self) -> usize {
        self.transferred
    }

    /// The number of bytes received, or an overrun
    pub fn result(&self) -> usb_device::Result<usize> {
        if self.overrun {
            Err(UsbError::BufferOverflow)
        } else {
            Ok(self.transferred)
        }
    }

    pub fn into_buffer(self) -> &'b mut [u8] {
        self.buffer
    }

    fn next_chunk(&self, max_packet: usize) -> usize {
        (self.buffer.len() - self.transferred).min(max_packet)
    }

    /// Arm the pipe to accept the next packet
    ///
    /// Does nothing if the pipe already has a packet in flight.
    pub fn arm<P: Port>(&self, port: &mut P, pipe: &mut Pipe) {
        if !pipe.is_armed() {
            pipe.arm(port, self.next_chunk(pipe.max_packet()));
        }
    }

    /// Copy the packet the hardware just accepted out of packet SRAM
    ///
    /// Bytes beyond the end of the caller's buffer are left in packet SRAM,
    /// and the transfer finishes as an overrun. A packet that's shorter than
    /// what was armed finishes the transfer.
    pub fn receive<P: Port>(&mut self, port: &mut P, pipe: &mut Pipe) -> Progress {
        let Some(armed) = pipe.acknowledge() else {
            return Progress::Pending;
        };
        let received = port.packet_size_received(pipe.slot());
        let remaining = &mut self.buffer[self.transferred..];
        let accepted = received.min(remaining.len()).min(pipe.region().len());
        port.read_sram(pipe.region().offset(), &mut remaining[..accepted]);
        self.transferred += accepted;

        if received > accepted {
            warn!(
                "EP SLOT{} OVERRUN {} > {}",
                pipe.slot(),
                received,
                accepted
            );
            self.overrun = true;
            Progress::Complete
        } else if self.transferred == self.buffer.len() || received < armed {
            Progress::Complete
        } else {
            self.arm(port, pipe);
            Progress::Pending
        }
    }
}

/// A transfer that was thrown away before it finished
///
/// The buffer is handed back so that its owner can reuse it.
#[derive(Debug, PartialEq, Eq)]
pub enum Aborted<'b> {
    /// An IN transfer, and the number of bytes the host acknowledged
    In(&'b [u8], usize),
    /// An OUT transfer, and the number of bytes received
    Out(&'b mut [u8], usize),
}

/// Transfer state of a control endpoint
///
/// A control endpoint runs one data stage at a time, in either direction.
pub(crate) enum Control<'b> {
    Idle,
    InProgressIn(InTransfer<'b>),
    InProgressOut(OutTransfer<'b>),
}

/// Transfer state of one logical endpoint
pub(crate) enum Transfers<'b> {
    Control(Control<'b>),
    Data {
        tx: Option<InTransfer<'b>>,
        rx: Option<OutTransfer<'b>>,
    },
}

impl<'b> Transfers<'b> {
    pub fn new(kind: EndpointType) -> Self {
        if kind == EndpointType::Control {
            Transfers::Control(Control::Idle)
        } else {
            Transfers::Data { tx: None, rx: None }
        }
    }

    pub fn tx_mut(&mut self) -> Option<&mut InTransfer<'b>> {
        match self {
            Transfers::Control(Control::InProgressIn(tx)) => Some(tx),
            Transfers::Data { tx, .. } => tx.as_mut(),
            Transfers::Control(_) => None,
        }
    }

    pub fn rx_mut(&mut self) -> Option<&mut OutTransfer<'b>> {
        match self {
            Transfers::Control(Control::InProgressOut(rx)) => Some(rx),
            Transfers::Data { rx, .. } => rx.as_mut(),
            Transfers::Control(_) => None,
        }
    }

    pub fn take_tx(&mut self) -> Option<InTransfer<'b>> {
        match self {
            Transfers::Control(control @ Control::InProgressIn(_)) => {
                match core::mem::replace(control, Control::Idle) {
                    Control::InProgressIn(tx) => Some(tx),
                    _ => None,
                }
            }
            Transfers::Data { tx, .. } => tx.take(),
            Transfers::Control(_) => None,
        }
    }

    pub fn take_rx(&mut self) -> Option<OutTransfer<'b>> {
        match self {
            Transfers::Control(control @ Control::InProgressOut(_)) => {
                match core::mem::replace(control, Control::Idle) {
                    Control::InProgressOut(rx) => Some(rx),
                    _ => None,
                }
            }
            Transfers::Data { rx, .. } => rx.take(),
            Transfers::Control(_) => None,
        }
    }

    /// Install a new IN transfer
    ///
    /// Fails with `WouldBlock` if the direction (or, for a control endpoint,
    /// either direction) already has a transfer.
    pub fn start_tx(&mut self, transfer: InTransfer<'b>) -> usb_device::Result<&mut InTransfer<'b>> {
        match self {
            Transfers::Control(control @ Control::Idle) => {
                *control = Control::InProgressIn(transfer);
            }
            Transfers::Data { tx: tx @ None, .. } => {
                *tx = Some(transfer);
            }
            _ => return Err(UsbError::WouldBlock),
        }
        self.tx_mut().ok_or(UsbError::InvalidState)
    }

    /// Install a new OUT transfer
    ///
    /// Fails with `WouldBlock` if the direction (or, for a control endpoint,
    /// either direction) already has a transfer.
    pub fn start_rx(&mut self, transfer: OutTransfer<'b>) -> usb_device::Result<&mut OutTransfer<'b>> {
        match self {
            Transfers::Control(control @ Control::Idle) => {
                *control = Control::InProgressOut(transfer);
            }
            Transfers::Data { rx: rx @ None, .. } => {
                *rx = Some(transfer);
            }
            _ => return Err(UsbError::WouldBlock),
        }
        self.rx_mut().ok_or(UsbError::InvalidState)
    }

    /// Discard whatever data stage is in progress
    pub fn abort(&mut self) -> Option<Aborted<'b>> {
        if let Some(tx) = self.take_tx() {
            Some(Aborted::In(tx.data(), tx.transferred()))
        } else if let Some(rx) = self.take_rx() {
            let transferred = rx.transferred();
            Some(Aborted::Out(rx.into_buffer(), transferred))
        } else {
            None
        }
    }
}
