//! The endpoint 0 state machine for one device port.
//!
//! The pipe owns the control transfer buffer and the stage bookkeeping; who
//! handles a request is decided one level up, in the stack's dispatch chain.
//! A newly received SETUP packet always wins: whatever transfer was in
//! flight is aborted and the pipe restarts from the new packet.

use crate::control::SetupPacket;
use crate::driver::UsbdDriver;
use crate::endpoint::EndpointAddress;
use crate::{Result, UsbDirection};
use core::cmp::min;

#[cfg(not(feature = "control-buffer-256"))]
pub(crate) const CONTROL_BUF_LEN: usize = 128;

#[cfg(feature = "control-buffer-256")]
pub(crate) const CONTROL_BUF_LEN: usize = 256;

const EP0_OUT: EndpointAddress = EndpointAddress::ep0_out();
const EP0_IN: EndpointAddress = EndpointAddress::ep0_in();

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum PipeState {
    /// No transfer in progress, or stages done and waiting for dispatch.
    Idle,
    /// IN data stage, more chunks to send.
    DataIn,
    /// IN data stage, all data queued, a short-packet ZLP still owed.
    DataInZlp,
    /// IN data stage, final packet queued.
    DataInLast,
    /// IN transfer waiting for the host's status-stage OUT ZLP.
    StatusOut,
    /// OUT data stage in progress for the carried request.
    DataOut(SetupPacket),
    /// Status-stage IN ZLP queued for an OUT or no-data transfer.
    StatusIn,
    /// Endpoint 0 stalled until the next SETUP packet.
    Error,
}

/// Outcome of an OUT completion on endpoint 0.
pub(crate) enum OutComplete {
    None,
    /// The OUT data stage finished; the payload is in the pipe buffer and
    /// the carried request wants its completion callback.
    DataReady(SetupPacket),
    /// The status stage of an IN transfer finished.
    StatusComplete,
}

/// Outcome of an IN completion on endpoint 0.
pub(crate) enum InComplete {
    None,
    /// The IN data stage finished; this many bytes went to the host.
    DataSent(usize),
    /// The status stage of an OUT or no-data transfer finished.
    StatusComplete,
}

pub(crate) struct ControlPipe {
    state: PipeState,
    max_packet_size_0: u8,
    buf: [u8; CONTROL_BUF_LEN],
    i: usize,
    len: usize,
    need_zlp: bool,
}

impl ControlPipe {
    pub(crate) fn new(max_packet_size_0: u8) -> ControlPipe {
        ControlPipe {
            state: PipeState::Idle,
            max_packet_size_0,
            buf: [0; CONTROL_BUF_LEN],
            i: 0,
            len: 0,
            need_zlp: false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = PipeState::Idle;
        self.i = 0;
        self.len = 0;
        self.need_zlp = false;
    }

    /// The whole transfer buffer, lent to handlers for response assembly.
    pub(crate) fn buf(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// The received OUT data-stage payload.
    pub(crate) fn data(&self) -> &[u8] {
        &self.buf[..self.i]
    }

    /// Reads and parses a fresh SETUP packet, abandoning any transfer that
    /// was still in flight. Returns the parsed request for dispatch, or
    /// `None` when the packet is undeliverable (an OUT data stage larger
    /// than the transfer buffer, answered with a STALL).
    pub(crate) fn handle_setup<D: UsbdDriver>(
        &mut self,
        driver: &mut D,
    ) -> Result<Option<SetupPacket>> {
        let mut raw = [0u8; 8];
        driver.read_setup(&mut raw)?;
        let setup = SetupPacket::parse(&raw)?;

        match self.state {
            PipeState::Idle => {}
            PipeState::Error => {
                driver.endpoint_stall(EP0_IN, false)?;
                driver.endpoint_stall(EP0_OUT, false)?;
            }
            _ => {
                driver.endpoint_abort(EP0_IN)?;
                driver.endpoint_abort(EP0_OUT)?;
            }
        }

        self.i = 0;
        self.len = 0;
        self.need_zlp = false;

        if setup.direction == UsbDirection::Out && setup.length > 0 {
            if usize::from(setup.length) > self.buf.len() {
                usb_debug!("ep0: OUT data stage too long ({} bytes)", setup.length);
                self.set_error(driver)?;
                return Ok(None);
            }
            self.state = PipeState::DataOut(setup);
        } else {
            self.state = PipeState::Idle;
        }

        Ok(Some(setup))
    }

    /// Drives the pipe on an OUT completion for endpoint 0.
    pub(crate) fn handle_out<D: UsbdDriver>(&mut self, driver: &mut D) -> Result<OutComplete> {
        match self.state {
            PipeState::DataOut(setup) => {
                let count = driver.endpoint_read(EP0_OUT, &mut self.buf[self.i..])?;
                self.i += count;

                if self.i >= usize::from(setup.length)
                    || count < usize::from(self.max_packet_size_0)
                {
                    self.state = PipeState::Idle;
                    Ok(OutComplete::DataReady(setup))
                } else {
                    Ok(OutComplete::None)
                }
            }
            PipeState::StatusOut => {
                let mut none = [0u8; 0];
                let _ = driver.endpoint_read(EP0_OUT, &mut none)?;
                self.state = PipeState::Idle;
                Ok(OutComplete::StatusComplete)
            }
            // Stray completion after an abort or stall.
            _ => Ok(OutComplete::None),
        }
    }

    /// Drives the pipe on an IN completion for endpoint 0.
    pub(crate) fn handle_in_complete<D: UsbdDriver>(
        &mut self,
        driver: &mut D,
    ) -> Result<InComplete> {
        match self.state {
            PipeState::DataIn => {
                self.write_in_chunk(driver)?;
                Ok(InComplete::None)
            }
            PipeState::DataInZlp => {
                driver.endpoint_write(EP0_IN, &[])?;
                self.state = PipeState::DataInLast;
                Ok(InComplete::None)
            }
            PipeState::DataInLast => {
                self.state = PipeState::StatusOut;
                Ok(InComplete::DataSent(self.len))
            }
            PipeState::StatusIn => {
                self.state = PipeState::Idle;
                Ok(InComplete::StatusComplete)
            }
            _ => Ok(InComplete::None),
        }
    }

    /// Accepts an IN request: sends `len` bytes of the buffer, capped at
    /// the host's `wLength`, terminating with a ZLP when the host asked
    /// for more than it gets and the response ends on a packet boundary.
    pub(crate) fn accept_in<D: UsbdDriver>(
        &mut self,
        driver: &mut D,
        setup: &SetupPacket,
        len: usize,
    ) -> Result<()> {
        let requested = usize::from(setup.length);
        self.len = min(len, requested);
        self.i = 0;
        self.need_zlp = self.len < requested
            && self.len % usize::from(self.max_packet_size_0) == 0
            && self.len > 0;
        self.state = PipeState::DataIn;
        self.write_in_chunk(driver)
    }

    /// Accepts an OUT or no-data request: queues the status-stage IN ZLP.
    pub(crate) fn accept_status<D: UsbdDriver>(&mut self, driver: &mut D) -> Result<()> {
        driver.endpoint_write(EP0_IN, &[])?;
        self.state = PipeState::StatusIn;
        Ok(())
    }

    /// Rejects the request: stalls both directions of endpoint 0 until the
    /// next SETUP packet.
    pub(crate) fn reject<D: UsbdDriver>(&mut self, driver: &mut D) -> Result<()> {
        self.set_error(driver)
    }

    fn set_error<D: UsbdDriver>(&mut self, driver: &mut D) -> Result<()> {
        driver.endpoint_stall(EP0_IN, true)?;
        driver.endpoint_stall(EP0_OUT, true)?;
        self.state = PipeState::Error;
        Ok(())
    }

    fn write_in_chunk<D: UsbdDriver>(&mut self, driver: &mut D) -> Result<()> {
        let count = min(usize::from(self.max_packet_size_0), self.len - self.i);
        let count = driver.endpoint_write(EP0_IN, &self.buf[self.i..self.i + count])?;
        self.i += count;

        if self.i >= self.len {
            self.state = if self.need_zlp && count == usize::from(self.max_packet_size_0) {
                PipeState::DataInZlp
            } else {
                PipeState::DataInLast
            };
        }

        Ok(())
    }
}
