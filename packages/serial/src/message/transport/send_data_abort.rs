use crate::message::{
    MessageBase, MessageEncodingContext, MessageId, MessageParsable, MessageParsingContext,
    MessageRequest,
};
use bytes::{Bytes, BytesMut};
use zwh_core::prelude::*;

/// Aborts an ongoing SendData transmission. Sent before retrying when the
/// previous attempt never produced a callback.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct SendDataAbortRequest {}

impl MessageBase for SendDataAbortRequest {}

impl MessageId for SendDataAbortRequest {
    fn message_type(&self) -> MessageType {
        MessageType::Request
    }

    fn function_type(&self) -> FunctionType {
        FunctionType::SendDataAbort
    }

    fn origin(&self) -> MessageOrigin {
        MessageOrigin::Host
    }
}

impl MessageRequest for SendDataAbortRequest {
    // Fire and forget: no response, no callback
}

impl MessageParsable for SendDataAbortRequest {
    fn parse(_i: &mut Bytes, _ctx: &MessageParsingContext) -> ParseResult<Self> {
        // No payload
        Ok(Self {})
    }
}

impl SerializableWith<&MessageEncodingContext> for SendDataAbortRequest {
    fn serialize(&self, _output: &mut BytesMut, _ctx: &MessageEncodingContext) {
        // No payload
    }
}

impl ToLogPayload for SendDataAbortRequest {
    fn to_log_payload(&self) -> LogPayload {
        LogPayload::empty()
    }
}
