//! Per-port runtime state.

use crate::class::ClassInstanceId;
use crate::config::{DeviceConfig, MAX_INTERFACES};
use crate::control::SetupPacket;
use crate::control_pipe::ControlPipe;
use crate::driver::{DeviceEvent, EndpointEvent, UsbdDriver};
use crate::endpoint::{EndpointAddress, EndpointSet};
use crate::kernel::UsbKernel;
use crate::{Result, UsbError};
use portable_atomic::{AtomicU32, Ordering};

/// The enumeration states of a USB device.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    /// The device has been attached or reset but has no address yet. It
    /// answers control requests on the default address.
    Default,
    /// The host has given the device an address with SET_ADDRESS.
    Addressed,
    /// The host has selected a configuration; class traffic can flow.
    Configured,
    /// The bus is suspended. The previous state is restored on resume.
    Suspend,
}

/// Where a claimed control transfer is routed for its remaining stages.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum DispatchTarget {
    /// The stack core itself (standard requests).
    Core,
    /// The application-level device hook.
    Hook,
    /// The class instance that claimed the SETUP packet.
    Instance(ClassInstanceId),
}

/// The winner of the SETUP dispatch chain, remembered until the transfer's
/// status stage completes. Completion callbacks go here and nowhere else.
#[derive(Copy, Clone)]
pub(crate) struct ClaimedRequest {
    pub(crate) target: DispatchTarget,
    pub(crate) setup: SetupPacket,
}

/// Serial number string descriptor capacity: header plus 32 UTF-16 code
/// units.
const SERIAL_CAPACITY: usize = 2 + 32 * 2;

/// Events recorded from interrupt context, waiting to be drained by the
/// device core thread.
///
/// Device events are one bit per [`DeviceEvent`] discriminant; endpoint
/// events are one bit per endpoint address, split by kind, using
/// [`EndpointAddress::mask_bit`] numbering.
pub(crate) struct PendingEvents {
    device: AtomicU32,
    ep_setup: AtomicU32,
    ep_out: AtomicU32,
    ep_in: AtomicU32,
}

/// A drained snapshot of [`PendingEvents`].
#[derive(Copy, Clone, Default)]
pub(crate) struct TakenEvents {
    pub(crate) device: u32,
    pub(crate) ep_setup: u32,
    pub(crate) ep_out: u32,
    pub(crate) ep_in: u32,
}

impl TakenEvents {
    pub(crate) fn is_empty(&self) -> bool {
        self.device == 0 && self.ep_setup == 0 && self.ep_out == 0 && self.ep_in == 0
    }
}

impl PendingEvents {
    pub(crate) const fn new() -> PendingEvents {
        PendingEvents {
            device: AtomicU32::new(0),
            ep_setup: AtomicU32::new(0),
            ep_out: AtomicU32::new(0),
            ep_in: AtomicU32::new(0),
        }
    }

    pub(crate) fn signal_device(&self, event: DeviceEvent) {
        self.device.fetch_or(1 << (event as u32), Ordering::SeqCst);
    }

    pub(crate) fn signal_endpoint(&self, addr: EndpointAddress, event: EndpointEvent) {
        let word = match event {
            EndpointEvent::SetupReceived => &self.ep_setup,
            EndpointEvent::OutDataReceived => &self.ep_out,
            EndpointEvent::InDataSent => &self.ep_in,
        };
        word.fetch_or(1 << u32::from(addr.mask_bit()), Ordering::SeqCst);
    }

    pub(crate) fn take(&self) -> TakenEvents {
        TakenEvents {
            device: self.device.swap(0, Ordering::SeqCst),
            ep_setup: self.ep_setup.swap(0, Ordering::SeqCst),
            ep_out: self.ep_out.swap(0, Ordering::SeqCst),
            ep_in: self.ep_in.swap(0, Ordering::SeqCst),
        }
    }

    pub(crate) fn device_event_bit(event: DeviceEvent) -> u32 {
        1 << (event as u32)
    }
}

/// Runtime state of one device port: the driver handle, enumeration state,
/// the endpoint 0 pipe and the event words its interrupt glue fills in.
pub struct Device<'a, D: UsbdDriver, K: UsbKernel> {
    pub(crate) index: u8,
    pub(crate) driver: D,
    pub(crate) config: &'a DeviceConfig<'a>,
    pub(crate) state: DeviceState,
    pub(crate) resume_state: DeviceState,
    pub(crate) configuration: u8,
    pub(crate) alt_settings: [u8; MAX_INTERFACES],
    pub(crate) remote_wakeup_enabled: bool,
    pub(crate) high_speed: bool,
    pub(crate) stalled: EndpointSet,
    pub(crate) pending: PendingEvents,
    pub(crate) control: ControlPipe,
    pub(crate) pending_address: Option<u8>,
    pub(crate) claimed: Option<ClaimedRequest>,
    pub(crate) thread: Option<K::ThreadId>,
    serial: heapless::Vec<u8, SERIAL_CAPACITY>,
}

impl<'a, D: UsbdDriver, K: UsbKernel> Device<'a, D, K> {
    pub(crate) fn new(index: u8, driver: D, config: &'a DeviceConfig<'a>) -> Device<'a, D, K> {
        Device {
            index,
            driver,
            config,
            state: DeviceState::Default,
            resume_state: DeviceState::Default,
            configuration: 0,
            alt_settings: [0; MAX_INTERFACES],
            remote_wakeup_enabled: false,
            high_speed: false,
            stalled: EndpointSet::EMPTY,
            pending: PendingEvents::new(),
            control: ControlPipe::new(config.max_packet_size_0),
            pending_address: None,
            claimed: None,
            thread: None,
            serial: heapless::Vec::new(),
        }
    }

    /// Gets the current enumeration state of the device.
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// The configuration value selected by the host, or 0 when
    /// unconfigured.
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    /// Whether the host has enabled the remote wakeup feature.
    pub fn remote_wakeup_enabled(&self) -> bool {
        self.remote_wakeup_enabled
    }

    /// Whether the current session enumerated at high speed.
    pub fn high_speed(&self) -> bool {
        self.high_speed
    }

    /// Borrows the driver, for application code that needs side-channel
    /// access to the controller.
    pub fn driver(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Overrides the serial number string served at string index 3, for
    /// serials only known at run time. Truncated to 32 characters.
    pub fn set_serial_number(&mut self, serial: &str) -> Result<()> {
        self.serial.clear();
        self.serial
            .extend_from_slice(&[0, crate::control::descriptor_type::STRING])
            .map_err(|_| UsbError::BufferOverflow)?;

        for unit in serial.encode_utf16().take(32) {
            self.serial
                .extend_from_slice(&unit.to_le_bytes())
                .map_err(|_| UsbError::BufferOverflow)?;
        }

        self.serial[0] = self.serial.len() as u8;
        Ok(())
    }

    /// Loads the runtime serial number descriptor into the control buffer
    /// and returns its length, or `None` when no serial has been set.
    pub(crate) fn serial_response(&mut self) -> Option<usize> {
        if self.serial.is_empty() {
            return None;
        }

        let buf = self.control.buf();
        let len = core::cmp::min(self.serial.len(), buf.len());
        buf[..len].copy_from_slice(&self.serial[..len]);
        Some(len)
    }

    /// Returns protocol state to its bus-reset defaults. The driver-side
    /// reset has already happened on the hardware when this runs.
    pub(crate) fn reset_state(&mut self) {
        self.state = DeviceState::Default;
        self.resume_state = DeviceState::Default;
        self.configuration = 0;
        self.alt_settings = [0; MAX_INTERFACES];
        self.remote_wakeup_enabled = false;
        self.high_speed = false;
        self.stalled.clear();
        self.pending_address = None;
        self.claimed = None;
        self.control.reset();
    }
}
