use crate::prelude::*;
use bytes::{Bytes, BytesMut};
use derive_try_from_primitive::TryFromPrimitive;
use zwh_core::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum DeviceResetLocallyCCCommand {
    Notification = 0x01,
}

/// Sent by a node that was factory reset. The driver responds by removing
/// the node from the network.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct DeviceResetLocallyCCNotification {}

impl CCBase for DeviceResetLocallyCCNotification {}

impl CCValues for DeviceResetLocallyCCNotification {}

impl CCId for DeviceResetLocallyCCNotification {
    fn cc_id(&self) -> CommandClasses {
        CommandClasses::DeviceResetLocally
    }

    fn cc_command(&self) -> Option<u8> {
        Some(DeviceResetLocallyCCCommand::Notification as _)
    }
}

impl CCParsable for DeviceResetLocallyCCNotification {
    fn parse(_i: &mut Bytes, _ctx: &CCParsingContext) -> ParseResult<Self> {
        // No payload
        Ok(Self {})
    }
}

impl SerializableWith<&CCEncodingContext> for DeviceResetLocallyCCNotification {
    fn serialize(&self, _output: &mut BytesMut, _ctx: &CCEncodingContext) {
        // No payload
    }
}

impl ToLogPayload for DeviceResetLocallyCCNotification {
    fn to_log_payload(&self) -> LogPayload {
        LogPayload::empty()
    }
}
