//! The class-function seam: handler trait and control-transfer data access.

use crate::control::SetupPacket;
use crate::driver::EndpointEvent;
use crate::endpoint::EndpointAddress;
use crate::{Result, UsbError};

/// The class types a composite device can expose, in dispatch precedence
/// order. SETUP requests and endpoint events are offered to instances in
/// this order, custom classes first.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClassType {
    CustomClass = 0,
    Audio = 1,
    Cdc = 2,
    Hid = 3,
    Msc = 4,
}

impl ClassType {
    /// All class types in dispatch precedence order.
    pub const ALL: [ClassType; 5] = [
        ClassType::CustomClass,
        ClassType::Audio,
        ClassType::Cdc,
        ClassType::Hid,
        ClassType::Msc,
    ];
}

/// Identifies one configured class instance: a class type plus the index of
/// the instance within that type's registry.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClassInstanceId {
    pub class: ClassType,
    pub index: u8,
}

impl ClassInstanceId {
    pub const fn new(class: ClassType, index: u8) -> Self {
        ClassInstanceId { class, index }
    }
}

/// Outcome of offering a control request (or a data-stage completion) to a
/// handler.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestStatus {
    /// The handler did not claim the request; the next candidate is
    /// consulted.
    NotProcessed,
    /// The request was processed; the stack drives the remaining stages.
    Ok,
    /// The request was recognized but is unsupported; endpoint 0 is
    /// stalled. This is a normal protocol outcome, not a fault.
    Stall,
    /// The handler is busy; the stage is left pending (NAK) and will be
    /// retried by the host.
    Nak,
}

/// Access to the endpoint 0 buffer for the duration of one
/// `setup_packet_received` call.
///
/// A handler claiming an IN request writes its response here; the stack
/// sends at most `wLength` bytes of it during the data stage. The borrow
/// ends with the call, so a handler cannot retain the buffer past the
/// transfer.
pub struct ControlData<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> ControlData<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> ControlData<'a> {
        ControlData { buf, len: 0 }
    }

    /// Copies a complete response into the buffer.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.buf.len() {
            return Err(UsbError::BufferOverflow);
        }

        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }

    /// The raw buffer, for handlers that assemble a response in place.
    /// Call [`set_len`](ControlData::set_len) afterwards.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        self.buf
    }

    /// Records how many bytes of the buffer form the response.
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.buf.len() {
            return Err(UsbError::BufferOverflow);
        }

        self.len = len;
        Ok(())
    }

    /// Length recorded so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The capability set every class function implements.
///
/// Every method has a benign default, so a handler only implements the
/// operations its class actually uses. The stack guarantees that
/// `setup_packet_received`, the data-stage completions and
/// `setup_packet_processed` of one control transfer all go to the same
/// instance, and that endpoint callbacks are only made for endpoints the
/// instance owns.
pub trait DeviceClass {
    /// Called once when the owning device is initialized. Worker threads,
    /// semaphores and timers are created here through the kernel boundary;
    /// a creation failure is reported by returning an error, and the
    /// orchestrator continues with the remaining instances.
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once when the owning device is torn down.
    fn uninitialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called on USB bus reset. Must return internal state to the
    /// post-construction default.
    fn reset(&mut self) {}

    /// Called after the host selects a non-zero configuration, before any
    /// endpoint is started.
    fn configuration_set(&mut self, value: u8) {
        let _ = value;
    }

    /// Called when an owned endpoint becomes usable. Typically arms the
    /// first transfer or releases a worker thread.
    fn endpoint_start(&mut self, addr: EndpointAddress) {
        let _ = addr;
    }

    /// Called when an owned endpoint stops being usable.
    fn endpoint_stop(&mut self, addr: EndpointAddress) {
        let _ = addr;
    }

    /// Offered a SETUP packet addressed to this instance's interfaces or
    /// endpoints. For an IN request, a claiming handler writes its response
    /// into `data`.
    fn setup_packet_received(
        &mut self,
        setup: &SetupPacket,
        data: &mut ControlData<'_>,
    ) -> RequestStatus {
        let _ = (setup, data);
        RequestStatus::NotProcessed
    }

    /// Notified after the status stage of a claimed control transfer
    /// completes, for stateful requests such as CDC line coding.
    fn setup_packet_processed(&mut self, setup: &SetupPacket) {
        let _ = setup;
    }

    /// The data stage of a claimed OUT control transfer completed; `data`
    /// is the received payload, valid only for this call.
    fn out_data_received(&mut self, data: &[u8]) -> RequestStatus {
        let _ = data;
        RequestStatus::NotProcessed
    }

    /// The data stage of a claimed IN control transfer completed; `len`
    /// bytes were sent to the host.
    fn in_data_sent(&mut self, len: usize) -> RequestStatus {
        let _ = len;
        RequestStatus::NotProcessed
    }

    /// An event occurred on an owned non-control endpoint. Most handlers
    /// signal a worker thread and return; no I/O happens on this path.
    fn endpoint_event(&mut self, addr: EndpointAddress, event: EndpointEvent) {
        let _ = (addr, event);
    }

    /// The host cleared a halt condition on an owned endpoint. Mass
    /// storage uses this to re-arm its bulk IN endpoint after a phase
    /// error.
    fn feature_stall_cleared(&mut self, addr: EndpointAddress) {
        let _ = addr;
    }
}
