use crate::message::{
    MessageBase, MessageEncodingContext, MessageId, MessageParsable, MessageParsingContext,
};
use bytes::{Bytes, BytesMut};
use zwh_core::parse::bytes::{be_u8, rest};
use zwh_core::prelude::*;
use zwh_core::serialize;

/// Sent by the controller after the Serial API has started (again),
/// e.g. following a soft reset
#[derive(Debug, Clone, PartialEq)]
pub struct SerialApiStartedRequest {
    pub wake_up_reason: u8,
    pub watchdog_enabled: bool,
    /// Device capabilities, not interpreted by the driver core
    pub remainder: Bytes,
}

impl MessageBase for SerialApiStartedRequest {}

impl MessageId for SerialApiStartedRequest {
    fn message_type(&self) -> MessageType {
        MessageType::Request
    }

    fn function_type(&self) -> FunctionType {
        FunctionType::SerialApiStarted
    }

    fn origin(&self) -> MessageOrigin {
        MessageOrigin::Controller
    }
}

impl MessageParsable for SerialApiStartedRequest {
    fn parse(i: &mut Bytes, _ctx: &MessageParsingContext) -> ParseResult<Self> {
        let wake_up_reason = be_u8(i)?;
        let watchdog_enabled = be_u8(i)? == 0x01;
        let remainder = rest(i)?;

        Ok(Self {
            wake_up_reason,
            watchdog_enabled,
            remainder,
        })
    }
}

impl SerializableWith<&MessageEncodingContext> for SerialApiStartedRequest {
    fn serialize(&self, output: &mut BytesMut, _ctx: &MessageEncodingContext) {
        use serialize::bytes::{be_u8, slice};
        be_u8(self.wake_up_reason).serialize(output);
        be_u8(if self.watchdog_enabled { 0x01 } else { 0x00 }).serialize(output);
        slice(&self.remainder).serialize(output);
    }
}

impl ToLogPayload for SerialApiStartedRequest {
    fn to_log_payload(&self) -> LogPayload {
        LogPayloadDict::new()
            .with_entry("wake up reason", self.wake_up_reason)
            .with_entry("watchdog enabled", self.watchdog_enabled)
            .into()
    }
}
