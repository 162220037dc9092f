//! Composite USB device protocol stack.
//!
//! This crate implements the device-side core of a composite USB stack: the
//! endpoint 0 control state machine, the class-instance registries with
//! chain-of-responsibility SETUP dispatch, the non-control endpoint event
//! dispatcher and the lifecycle orchestration across up to four independent
//! device ports.
//!
//! The hardware controller and the RTOS are external collaborators reached
//! through the [`driver::UsbdDriver`] and [`kernel::UsbKernel`] traits. Class
//! business logic plugs in through the [`class::DeviceClass`] trait; a class
//! type with no configured instances costs nothing at runtime.

#![no_std]

/// Direction of USB traffic. The values can be ORed into an endpoint number
/// to produce an endpoint address.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbDirection {
    /// Host to device.
    Out = 0x00,
    /// Device to host.
    In = 0x80,
}

/// Errors returned by the stack core.
///
/// Protocol-level rejections (STALL) are not errors; they are normal outcomes
/// expressed through [`class::RequestStatus`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// An operation would block waiting on hardware.
    WouldBlock,
    /// A device, instance or interface index is outside the configured range.
    OutOfRange,
    /// Received a malformed SETUP packet.
    InvalidSetupPacket,
    /// An operation is not valid in the current state.
    InvalidState,
    /// Data does not fit in the buffer provided for it.
    BufferOverflow,
    /// Two class instances claim the same endpoint on one device.
    EndpointTaken,
    /// Two class instances claim the same interface on one device.
    InterfaceTaken,
    /// A per-class-type instance table is full.
    InstanceLimit,
    /// The hardware controller reported a fault.
    Driver,
    /// Thread, semaphore or timer creation failed.
    Kernel,
    /// The operation is not supported by this driver or configuration.
    Unsupported,
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, UsbError>;

#[macro_use]
mod macros;

pub mod class;
pub mod config;
pub mod control;
pub mod driver;
pub mod endpoint;
pub mod kernel;

mod control_pipe;
mod device;
mod registry;
mod stack;

pub use crate::device::{Device, DeviceState};
pub use crate::registry::ClassRegistry;
pub use crate::stack::UsbStack;

/// Convenience re-exports for application-side code.
pub mod prelude {
    pub use crate::class::ClassType;
    pub use crate::config::{DeviceConfig, InstanceConfig, StackConfig};
    pub use crate::device::{Device, DeviceState};
    pub use crate::stack::UsbStack;
    pub use crate::{Result, UsbError};
}

/// Convenience re-exports for class implementations.
pub mod class_prelude {
    pub use crate::class::{ClassInstanceId, ClassType, ControlData, DeviceClass, RequestStatus};
    pub use crate::control::{Recipient, RequestType, SetupPacket};
    pub use crate::driver::EndpointEvent;
    pub use crate::endpoint::{EndpointAddress, EndpointType};
    pub use crate::kernel::{ThreadTask, UsbKernel};
    pub use crate::{Result, UsbDirection, UsbError};
}
