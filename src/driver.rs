//! The hardware controller boundary.
//!
//! One [`UsbdDriver`] instance drives one physical USB device port. The
//! stack calls the operations below; the driver glue reports line and
//! transfer activity back by signalling [`DeviceEvent`]s and
//! [`EndpointEvent`]s into [`UsbStack`](crate::UsbStack), usually from
//! interrupt context.

use crate::endpoint::{EndpointAddress, EndpointConfig};
use crate::Result;

/// Device-level events produced by the hardware controller.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceEvent {
    /// USB bus reset detected.
    Reset,
    /// The port has been attached to a host.
    Connect,
    /// The port has been detached from the host.
    Disconnect,
    /// Bus suspend detected.
    Suspend,
    /// Resume signalling detected after a suspend.
    Resume,
    /// The link switched to high speed during reset signalling.
    HighSpeed,
    /// VBUS power appeared.
    VbusOn,
    /// VBUS power went away.
    VbusOff,
}

/// Per-endpoint events produced by the hardware controller.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EndpointEvent {
    /// A SETUP packet is waiting to be read with
    /// [`UsbdDriver::read_setup`]. Only reported for endpoint 0.
    SetupReceived,
    /// An OUT transfer completed; its data is waiting to be read with
    /// [`UsbdDriver::endpoint_read`].
    OutDataReceived,
    /// An IN transfer completed; all queued data has been sent to the host.
    InDataSent,
}

/// Optional capabilities a driver can report.
#[derive(Copy, Clone, Default, Debug)]
pub struct DriverCapabilities {
    /// The driver can detect VBUS level and reports `VbusOn`/`VbusOff`.
    pub vbus_detection: bool,
    /// The driver can signal resume to the host (remote wakeup).
    pub remote_wakeup: bool,
}

/// A trait for device-side USB controller drivers. Implement this to add
/// support for a new hardware platform.
///
/// All operations run to completion without blocking; transfer completion is
/// reported asynchronously through endpoint events.
pub trait UsbdDriver {
    /// Initializes the controller. Called once before any other operation.
    fn initialize(&mut self) -> Result<()>;

    /// Releases the controller. No operation may be called afterwards until
    /// the next `initialize`.
    fn uninitialize(&mut self) -> Result<()>;

    /// Powers the peripheral up or down.
    fn power_control(&mut self, on: bool) -> Result<()>;

    /// Activates the pull-up, making the device visible to the host.
    fn connect(&mut self) -> Result<()>;

    /// Deactivates the pull-up, simulating a cable detach.
    fn disconnect(&mut self) -> Result<()>;

    /// Sets the device USB address.
    fn set_address(&mut self, addr: u8) -> Result<()>;

    /// Reads the last received SETUP packet. Only valid while an
    /// [`EndpointEvent::SetupReceived`] is pending.
    fn read_setup(&mut self, buf: &mut [u8; 8]) -> Result<()>;

    /// Configures and enables a non-control endpoint.
    fn endpoint_configure(&mut self, config: &EndpointConfig) -> Result<()>;

    /// Disables a previously configured endpoint.
    fn endpoint_unconfigure(&mut self, addr: EndpointAddress) -> Result<()>;

    /// Reads a single received packet and returns its length.
    ///
    /// # Errors
    ///
    /// * [`WouldBlock`](crate::UsbError::WouldBlock) - no packet is waiting.
    ///   Note that a received zero-length packet is valid and returns
    ///   `Ok(0)`.
    /// * [`BufferOverflow`](crate::UsbError::BufferOverflow) - the packet is
    ///   longer than `buf`.
    fn endpoint_read(&mut self, addr: EndpointAddress, buf: &mut [u8]) -> Result<usize>;

    /// Queues a single packet for transmission and returns the number of
    /// bytes accepted.
    ///
    /// # Errors
    ///
    /// * [`WouldBlock`](crate::UsbError::WouldBlock) - a previous packet is
    ///   still pending.
    fn endpoint_write(&mut self, addr: EndpointAddress, buf: &[u8]) -> Result<usize>;

    /// Sets or clears the STALL condition for an endpoint. Clearing the
    /// condition also resets the endpoint's data toggle.
    fn endpoint_stall(&mut self, addr: EndpointAddress, stalled: bool) -> Result<()>;

    /// Aborts any transfer in progress on an endpoint.
    fn endpoint_abort(&mut self, addr: EndpointAddress) -> Result<()>;

    /// Number of bytes transferred by the last completed transfer on an
    /// endpoint. Class workers use this after an endpoint event.
    fn endpoint_transfer_count(&self, addr: EndpointAddress) -> usize;

    /// Signals resume to the host. Only meaningful when the host has enabled
    /// remote wakeup.
    fn remote_wakeup(&mut self) -> Result<()>;

    /// Reports the driver's optional capabilities.
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::default()
    }

    /// Indicates that `set_address` must be called while the SET_ADDRESS
    /// status stage is still pending, not after it completes.
    ///
    /// `false` corresponds to the USB 2.0 spec, 9.4.6; some controllers
    /// handle the deferral in hardware and need the address early.
    const QUIRK_SET_ADDRESS_BEFORE_STATUS: bool = false;
}
