use crate::parse::{ParseError, ParseResult, bytes::be_u8};
use crate::serialize::{self, Serializable};
use bytes::{Bytes, BytesMut};
use derive_try_from_primitive::TryFromPrimitive;

/// Whether a message is a request or a response. Requests may originate from
/// either the host or the controller, responses always answer a host request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x00,
    Response = 0x01,
}

impl MessageType {
    pub fn parse(i: &mut Bytes) -> ParseResult<Self> {
        let raw = be_u8(i)?;
        Self::try_from(raw)
            .map_err(|_| ParseError::validation_failure(format!("unknown message type {:#04x}", raw)))
    }
}

impl Serializable for MessageType {
    fn serialize(&self, output: &mut BytesMut) {
        serialize::bytes::be_u8(*self as u8).serialize(output);
    }
}
