use crate::message::{
    MessageBase, MessageEncodingContext, MessageId, MessageParsable, MessageParsingContext,
    MessageRequest,
};
use bytes::{Bytes, BytesMut};
use zwh_core::prelude::*;

/// Restarts the controller firmware. The controller answers with a
/// Serial API Started message once it is back up, not with a response.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct SoftResetRequest {}

impl MessageBase for SoftResetRequest {}

impl MessageId for SoftResetRequest {
    fn message_type(&self) -> MessageType {
        MessageType::Request
    }

    fn function_type(&self) -> FunctionType {
        FunctionType::SoftReset
    }

    fn origin(&self) -> MessageOrigin {
        MessageOrigin::Host
    }
}

impl MessageRequest for SoftResetRequest {
    // No response, no callback
}

impl MessageParsable for SoftResetRequest {
    fn parse(_i: &mut Bytes, _ctx: &MessageParsingContext) -> ParseResult<Self> {
        // No payload
        Ok(Self {})
    }
}

impl SerializableWith<&MessageEncodingContext> for SoftResetRequest {
    fn serialize(&self, _output: &mut BytesMut, _ctx: &MessageEncodingContext) {
        // No payload
    }
}

impl ToLogPayload for SoftResetRequest {
    fn to_log_payload(&self) -> LogPayload {
        LogPayload::empty()
    }
}
