use crate::parse::{ParseError, ParseResult, bytes::be_u8};
use crate::serialize::{self, Serializable};
use bytes::{Bytes, BytesMut};
use derive_try_from_primitive::TryFromPrimitive;

/// The function IDs of the Serial API messages this driver knows how to
/// handle. Messages with other function types are carried as raw payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum FunctionType {
    GetSerialApiInitData = 0x02,

    /// A command class frame from another node
    ApplicationCommand = 0x04,

    GetControllerCapabilities = 0x05,
    GetSerialApiCapabilities = 0x07,

    SoftReset = 0x08,

    /// Sent by the controller after the Serial API has been started (again)
    SerialApiStarted = 0x0a,

    SendData = 0x13,
    GetControllerVersion = 0x15,
    SendDataAbort = 0x16,

    /// Get Home ID and controller node ID
    GetControllerId = 0x20,

    GetNodeProtocolInfo = 0x41,

    /// Node information frame updates, including lost/alive transitions
    ApplicationUpdate = 0x49,

    /// Get info (supported command classes) for the specified node
    RequestNodeInfo = 0x60,

    /// A command class frame from another node, reported by a bridge controller
    BridgeApplicationCommand = 0xa8,
}

impl FunctionType {
    pub fn parse(i: &mut Bytes) -> ParseResult<Self> {
        let raw = be_u8(i)?;
        Self::try_from(raw).map_err(|_| {
            ParseError::not_implemented(format!("unknown function type {:#04x}", raw))
        })
    }
}

impl Serializable for FunctionType {
    fn serialize(&self, output: &mut BytesMut) {
        serialize::bytes::be_u8(*self as u8).serialize(output);
    }
}
