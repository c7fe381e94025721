use crate::commandclass_raw::CCRaw;
use crate::prelude::*;
use bytes::{Bytes, BytesMut};
use derive_try_from_primitive::TryFromPrimitive;
use zwh_core::parse::{bytes::be_u8, multi::length_value};
use zwh_core::prelude::*;
use zwh_core::serialize;

#[derive(Debug, Clone, Copy, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum MultiCommandCCCommand {
    CommandEncapsulation = 0x01,
}

/// Bundles multiple commands in one frame. This driver does not process
/// multi-encapsulating wrappers; the dispatcher rejects them after parsing.
/// The inner commands are kept raw so the rejection can be logged usefully.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiCommandCCCommandEncapsulation {
    pub encapsulated: Vec<CCRaw>,
}

impl CCBase for MultiCommandCCCommandEncapsulation {}

impl CCValues for MultiCommandCCCommandEncapsulation {}

impl CCId for MultiCommandCCCommandEncapsulation {
    fn cc_id(&self) -> CommandClasses {
        CommandClasses::MultiCommand
    }

    fn cc_command(&self) -> Option<u8> {
        Some(MultiCommandCCCommand::CommandEncapsulation as _)
    }
}

impl CCParsable for MultiCommandCCCommandEncapsulation {
    fn parse(i: &mut Bytes, _ctx: &CCParsingContext) -> ParseResult<Self> {
        let count = be_u8(i)?;
        let mut encapsulated = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let raw = length_value(be_u8, CCRaw::parse).parse(i)?;
            encapsulated.push(raw);
        }

        Ok(Self { encapsulated })
    }
}

impl SerializableWith<&CCEncodingContext> for MultiCommandCCCommandEncapsulation {
    fn serialize(&self, output: &mut BytesMut, _ctx: &CCEncodingContext) {
        use serialize::bytes::{be_u8, slice};

        be_u8(self.encapsulated.len() as u8).serialize(output);
        for raw in &self.encapsulated {
            let payload = raw.as_bytes();
            be_u8(payload.len() as u8).serialize(output);
            slice(&payload).serialize(output);
        }
    }
}

impl ToLogPayload for MultiCommandCCCommandEncapsulation {
    fn to_log_payload(&self) -> LogPayload {
        LogPayloadDict::new()
            .with_entry("commands", self.encapsulated.len())
            .into()
    }
}
