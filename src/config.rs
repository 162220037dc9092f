//! Static configuration tables.
//!
//! Everything here is assembled at build time and read by the core as
//! immutable data. [`StackConfig::validate`] is run before any device is
//! created, so an invalid configuration (overlapping endpoint ownership, a
//! dangling device reference) never becomes a runtime condition.

use crate::endpoint::{EndpointConfig, EndpointSet};
use crate::{Result, UsbError};

/// Maximum number of device ports.
pub const MAX_DEVICES: usize = 4;

/// Maximum number of interfaces per device.
pub const MAX_INTERFACES: usize = 16;

/// Per-class-type instance limits.
pub mod limits {
    pub const CUSTOM_CLASS: usize = 4;
    pub const AUDIO: usize = 4;
    pub const CDC: usize = 8;
    pub const HID: usize = 8;
    pub const MSC: usize = 4;
}

/// The descriptor byte tables for one device. Content generation is a
/// build-time concern; the core serves these blobs verbatim.
#[derive(Copy, Clone)]
pub struct DescriptorSet<'a> {
    /// Device descriptor.
    pub device: &'a [u8],
    /// Device qualifier descriptor, for high-speed capable devices.
    pub device_qualifier: Option<&'a [u8]>,
    /// Full-speed configuration descriptor (with all class and endpoint
    /// descriptors concatenated).
    pub configuration: &'a [u8],
    /// High-speed configuration descriptor, if the device is high-speed
    /// capable.
    pub configuration_hs: Option<&'a [u8]>,
    /// Other-speed configuration descriptor.
    pub other_speed_configuration: Option<&'a [u8]>,
    /// String descriptors, indexed by string index. Index 0 is the
    /// LANGID table.
    pub strings: &'a [&'a [u8]],
    /// Microsoft OS string descriptor, served at string index 0xEE.
    pub os_string: Option<&'a [u8]>,
    /// Microsoft extended compat ID OS descriptor, served for the OS
    /// vendor request with `wIndex` 4.
    pub os_compat_id: Option<&'a [u8]>,
}

impl<'a> DescriptorSet<'a> {
    /// A descriptor set with only the mandatory tables.
    pub const fn new(device: &'a [u8], configuration: &'a [u8], strings: &'a [&'a [u8]]) -> Self {
        DescriptorSet {
            device,
            device_qualifier: None,
            configuration,
            configuration_hs: None,
            other_speed_configuration: None,
            strings,
            os_string: None,
            os_compat_id: None,
        }
    }
}

/// Static configuration of one device port.
#[derive(Copy, Clone)]
pub struct DeviceConfig<'a> {
    /// Maximum packet size for endpoint 0: 8, 16, 32 or 64.
    pub max_packet_size_0: u8,
    /// Number of interfaces in the active configuration.
    pub interface_count: u8,
    /// The `bConfigurationValue` the host selects with SET_CONFIGURATION.
    pub configuration_value: u8,
    /// Configuration descriptor `bmAttributes` (bit 6 self-powered, bit 5
    /// remote wakeup).
    pub bm_attributes: u8,
    /// Whether the port may enumerate at high speed.
    pub high_speed_capable: bool,
    /// Vendor code for Microsoft OS descriptor requests, if supported.
    pub os_descriptor_vendor_code: Option<u8>,
    /// Descriptor byte tables.
    pub descriptors: DescriptorSet<'a>,
}

impl DeviceConfig<'_> {
    pub fn self_powered(&self) -> bool {
        (self.bm_attributes & 0x40) != 0
    }

    pub fn supports_remote_wakeup(&self) -> bool {
        (self.bm_attributes & 0x20) != 0
    }
}

/// Static binding of one class instance: owning device, interface numbers
/// and the endpoint group the instance owns.
#[derive(Copy, Clone)]
pub struct InstanceConfig<'a> {
    /// Index of the owning device port.
    pub device: u8,
    /// Interface numbers belonging to this instance.
    pub interfaces: &'a [u8],
    /// Endpoints belonging to this instance, one entry per address.
    pub endpoints: &'a [EndpointConfig],
}

impl InstanceConfig<'_> {
    /// The endpoint-address set derived from the endpoint table.
    pub fn endpoint_set(&self) -> EndpointSet {
        EndpointSet::from_configs(self.endpoints)
    }

    pub fn owns_interface(&self, number: u8) -> bool {
        self.interfaces.contains(&number)
    }
}

/// The complete static configuration: the device table plus one instance
/// table per class type, in dispatch precedence order.
#[derive(Copy, Clone)]
pub struct StackConfig<'a> {
    pub devices: &'a [DeviceConfig<'a>],
    pub custom_class: &'a [InstanceConfig<'a>],
    pub audio: &'a [InstanceConfig<'a>],
    pub cdc: &'a [InstanceConfig<'a>],
    pub hid: &'a [InstanceConfig<'a>],
    pub msc: &'a [InstanceConfig<'a>],
}

impl<'a> StackConfig<'a> {
    /// A configuration with devices but no class instances, for tests and
    /// incremental bring-up.
    pub const fn devices_only(devices: &'a [DeviceConfig<'a>]) -> Self {
        StackConfig {
            devices,
            custom_class: &[],
            audio: &[],
            cdc: &[],
            hid: &[],
            msc: &[],
        }
    }

    /// The instance tables in dispatch precedence order.
    pub fn class_tables(&self) -> [&'a [InstanceConfig<'a>]; 5] {
        [self.custom_class, self.audio, self.cdc, self.hid, self.msc]
    }

    /// Checks the whole configuration.
    ///
    /// * device count and per-type instance counts within limits,
    /// * every instance bound to an existing device,
    /// * interface numbers within the owning device's interface count,
    /// * no endpoint address owned by two instances on the same device,
    /// * no interface number owned by two instances on the same device,
    /// * EP0 max packet size is one of 8, 16, 32, 64.
    pub fn validate(&self) -> Result<()> {
        if self.devices.len() > MAX_DEVICES {
            return Err(UsbError::OutOfRange);
        }

        for dev in self.devices {
            match dev.max_packet_size_0 {
                8 | 16 | 32 | 64 => {}
                _ => return Err(UsbError::Unsupported),
            }
            if usize::from(dev.interface_count) > MAX_INTERFACES {
                return Err(UsbError::OutOfRange);
            }
        }

        let caps = [
            limits::CUSTOM_CLASS,
            limits::AUDIO,
            limits::CDC,
            limits::HID,
            limits::MSC,
        ];
        for (table, cap) in self.class_tables().iter().zip(caps.iter()) {
            if table.len() > *cap {
                return Err(UsbError::InstanceLimit);
            }
        }

        for (dev_index, dev) in self.devices.iter().enumerate() {
            let mut claimed_eps = EndpointSet::EMPTY;
            let mut claimed_ifs = [false; MAX_INTERFACES];

            for table in self.class_tables().iter() {
                for inst in table.iter() {
                    if usize::from(inst.device) >= self.devices.len() {
                        return Err(UsbError::OutOfRange);
                    }
                    if usize::from(inst.device) != dev_index {
                        continue;
                    }

                    let eps = inst.endpoint_set();
                    if eps.intersects(&claimed_eps) {
                        return Err(UsbError::EndpointTaken);
                    }
                    for ep in inst.endpoints {
                        if ep.address.is_control() {
                            return Err(UsbError::EndpointTaken);
                        }
                        claimed_eps.insert(ep.address);
                    }

                    for num in inst.interfaces {
                        let num = usize::from(*num);
                        if num >= usize::from(dev.interface_count) {
                            return Err(UsbError::OutOfRange);
                        }
                        if claimed_ifs[num] {
                            return Err(UsbError::InterfaceTaken);
                        }
                        claimed_ifs[num] = true;
                    }
                }
            }
        }

        Ok(())
    }
}
