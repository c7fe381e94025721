use crate::parse::{ParseError, ParseResult, bytes::be_u8};
use crate::serialize::{self, Serializable};
use bytes::{Bytes, BytesMut};
use derive_try_from_primitive::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// The command classes this driver implements or needs to recognize.
/// CC identifiers 0xF1..=0xFF introduce an extended (16-bit) identifier,
/// which is handled by the raw CC codec.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive, Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum CommandClasses {
    NoOperation = 0x00,
    Basic = 0x20,
    MultiChannel = 0x60,
    TransportService = 0x55,
    CRC16Encapsulation = 0x56,
    DeviceResetLocally = 0x5a,
    Supervision = 0x6c,
    ManufacturerSpecific = 0x72,
    WakeUp = 0x84,
    Version = 0x86,
    MultiCommand = 0x8f,
    Security = 0x98,
    Security2 = 0x9f,
}

impl CommandClasses {
    pub fn parse(i: &mut Bytes) -> ParseResult<Self> {
        let raw = be_u8(i)?;
        Self::try_from(raw)
            .map_err(|_| ParseError::not_implemented(format!("unknown command class {:#04x}", raw)))
    }
}

impl Serializable for CommandClasses {
    fn serialize(&self, output: &mut BytesMut) {
        serialize::bytes::be_u8(*self as u8).serialize(output);
    }
}

impl Display for CommandClasses {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommandClasses::NoOperation => "No Operation",
            CommandClasses::Basic => "Basic",
            CommandClasses::MultiChannel => "Multi Channel",
            CommandClasses::TransportService => "Transport Service",
            CommandClasses::CRC16Encapsulation => "CRC-16 Encapsulation",
            CommandClasses::DeviceResetLocally => "Device Reset Locally",
            CommandClasses::Supervision => "Supervision",
            CommandClasses::ManufacturerSpecific => "Manufacturer Specific",
            CommandClasses::WakeUp => "Wake Up",
            CommandClasses::Version => "Version",
            CommandClasses::MultiCommand => "Multi Command",
            CommandClasses::Security => "Security",
            CommandClasses::Security2 => "Security 2",
        };
        write!(f, "{}", name)
    }
}

/// Separates supported from controlled CCs in node information frames
pub const COMMAND_CLASS_SUPPORT_CONTROL_MARK: u8 = 0xef;
