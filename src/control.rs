//! SETUP packet model and the standard request vocabulary.

use crate::{Result, UsbDirection, UsbError};
use num_enum::TryFromPrimitive;

/// Control request type, from the `bmRequestType` type bits.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestType {
    /// A USB standard request, handled by the stack core itself.
    Standard = 0,
    /// A request intended for a USB class function.
    Class = 1,
    /// A vendor-specific request.
    Vendor = 2,
    /// Reserved.
    Reserved = 3,
}

/// Control request recipient, from the `bmRequestType` recipient bits.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recipient {
    /// The request addresses the device as a whole.
    Device = 0,
    /// The request addresses an interface; `index` holds the interface number.
    Interface = 1,
    /// The request addresses an endpoint; `index` holds the endpoint address.
    Endpoint = 2,
    /// None of the above.
    Other = 3,
    /// Reserved recipient values (4..=31).
    Reserved = 4,
}

/// A control request read from an 8-byte SETUP packet.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    /// Direction of the data stage, if any.
    pub direction: UsbDirection,
    /// Type of the request.
    pub request_type: RequestType,
    /// Recipient of the request.
    pub recipient: Recipient,
    /// Request code. Its meaning depends on the previous fields.
    pub request: u8,
    /// The `wValue` field.
    pub value: u16,
    /// The `wIndex` field.
    pub index: u16,
    /// Length of the data stage. For OUT transfers this is the exact length
    /// the host will send; for IN transfers the maximum length the device
    /// should return.
    pub length: u16,
}

impl SetupPacket {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_DESCRIPTOR: u8 = 7;
    pub const GET_CONFIGURATION: u8 = 8;
    pub const SET_CONFIGURATION: u8 = 9;
    pub const GET_INTERFACE: u8 = 10;
    pub const SET_INTERFACE: u8 = 11;
    pub const SYNCH_FRAME: u8 = 12;

    pub const FEATURE_ENDPOINT_HALT: u16 = 0;
    pub const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;

    /// Parses an 8-byte SETUP packet.
    pub fn parse(buf: &[u8]) -> Result<SetupPacket> {
        if buf.len() != 8 {
            return Err(UsbError::InvalidSetupPacket);
        }

        let rt = buf[0];

        Ok(SetupPacket {
            direction: if (rt & 0x80) != 0 {
                UsbDirection::In
            } else {
                UsbDirection::Out
            },
            // Two bits wide, so the only failure mode is the Reserved value
            // itself.
            request_type: RequestType::try_from_primitive((rt >> 5) & 0b11)
                .unwrap_or(RequestType::Reserved),
            recipient: Recipient::try_from_primitive(rt & 0b1_1111).unwrap_or(Recipient::Reserved),
            request: buf[1],
            value: u16::from_le_bytes([buf[2], buf[3]]),
            index: u16::from_le_bytes([buf[4], buf[5]]),
            length: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }

    /// Gets the descriptor type and index from the value field of a
    /// GET_DESCRIPTOR request.
    pub fn descriptor_type_index(&self) -> (u8, u8) {
        ((self.value >> 8) as u8, self.value as u8)
    }
}

/// Standard descriptor types, for the GET_DESCRIPTOR request.
pub mod descriptor_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
    pub const DEVICE_QUALIFIER: u8 = 6;
    pub const OTHER_SPEED_CONFIGURATION: u8 = 7;
    pub const BOS: u8 = 15;
}

/// String descriptor index reserved by the Microsoft OS descriptor scheme.
pub const OS_STRING_INDEX: u8 = 0xee;
