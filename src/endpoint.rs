//! Endpoint addressing and the endpoint-ownership bit set.

use crate::UsbDirection;
use num_enum::TryFromPrimitive;

/// USB endpoint address that contains a direction and a number.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointAddress(u8);

impl From<u8> for EndpointAddress {
    #[inline]
    fn from(addr: u8) -> EndpointAddress {
        EndpointAddress(addr & 0x8f)
    }
}

impl From<EndpointAddress> for u8 {
    #[inline]
    fn from(addr: EndpointAddress) -> u8 {
        addr.0
    }
}

impl EndpointAddress {
    const INBIT: u8 = UsbDirection::In as u8;

    /// The OUT direction of endpoint 0.
    pub const fn ep0_out() -> EndpointAddress {
        EndpointAddress(0x00)
    }

    /// The IN direction of endpoint 0.
    pub const fn ep0_in() -> EndpointAddress {
        EndpointAddress(0x80)
    }

    /// Constructs a new EndpointAddress with the given number and direction.
    #[inline]
    pub fn from_parts(number: u8, dir: UsbDirection) -> Self {
        EndpointAddress((number & 0x0f) | dir as u8)
    }

    /// Gets the direction part of the address.
    #[inline]
    pub fn direction(&self) -> UsbDirection {
        if (self.0 & Self::INBIT) != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    /// Gets the number part of the endpoint address.
    #[inline]
    pub fn number(&self) -> u8 {
        self.0 & !Self::INBIT
    }

    /// Whether this is the control endpoint (either direction of EP0).
    #[inline]
    pub fn is_control(&self) -> bool {
        self.number() == 0
    }

    /// Gets the bit position used for this address in per-device event and
    /// ownership masks: 0..=15 for OUT endpoints, 16..=31 for IN endpoints.
    #[inline]
    pub fn mask_bit(&self) -> u8 {
        ((self.0 & 0x80) >> 3) | (self.0 & 0x0f)
    }
}

/// USB endpoint transfer type. The values match the descriptor
/// `bmAttributes` transfer type bits.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EndpointType {
    /// Control endpoint. Only used for endpoint 0.
    Control = 0b00,
    /// Isochronous endpoint. Used for time-critical unreliable data.
    Isochronous = 0b01,
    /// Bulk endpoint. Used for large amounts of best-effort reliable data.
    Bulk = 0b10,
    /// Interrupt endpoint. Used for small amounts of time-critical reliable
    /// data.
    Interrupt = 0b11,
}

/// Static configuration of one non-control endpoint.
#[derive(Copy, Clone, Debug)]
pub struct EndpointConfig {
    /// Endpoint address.
    pub address: EndpointAddress,
    /// Endpoint transfer type.
    pub ep_type: EndpointType,
    /// Maximum packet size in bytes.
    pub max_packet_size: u16,
    /// Polling interval for interrupt and isochronous endpoints.
    pub interval: u8,
}

impl EndpointConfig {
    /// Shorthand for building an endpoint entry in a configuration table.
    pub const fn new(address: u8, ep_type: EndpointType, max_packet_size: u16, interval: u8) -> Self {
        EndpointConfig {
            address: EndpointAddress(address & 0x8f),
            ep_type,
            max_packet_size,
            interval,
        }
    }
}

/// A set of endpoint addresses on one device, stored as a 32-bit mask with
/// one bit per (number, direction) pair.
#[derive(Copy, Clone, Eq, PartialEq, Default, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointSet(u32);

impl EndpointSet {
    /// The empty set.
    pub const EMPTY: EndpointSet = EndpointSet(0);

    /// Builds the set owned by an instance from its endpoint table.
    pub fn from_configs(configs: &[EndpointConfig]) -> EndpointSet {
        let mut set = EndpointSet(0);
        for ep in configs {
            set.insert(ep.address);
        }
        set
    }

    #[inline]
    pub fn insert(&mut self, addr: EndpointAddress) {
        self.0 |= 1u32 << addr.mask_bit();
    }

    #[inline]
    pub fn remove(&mut self, addr: EndpointAddress) {
        self.0 &= !(1u32 << addr.mask_bit());
    }

    #[inline]
    pub fn contains(&self, addr: EndpointAddress) -> bool {
        (self.0 & (1u32 << addr.mask_bit())) != 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Whether the two sets share any endpoint address.
    #[inline]
    pub fn intersects(&self, other: &EndpointSet) -> bool {
        (self.0 & other.0) != 0
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}
