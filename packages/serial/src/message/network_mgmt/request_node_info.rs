use crate::message::{
    Message, MessageBase, MessageEncodingContext, MessageId, MessageParsable,
    MessageParsingContext, MessageRequest,
};
use bytes::{Bytes, BytesMut};
use typed_builder::TypedBuilder;
use zwh_core::parse::bytes::be_u8;
use zwh_core::prelude::*;
use zwh_core::serialize;

/// Asks a node for its node information frame. The response only confirms
/// that the request went out; the actual node information arrives later as
/// an Application Update.
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct RequestNodeInfoRequest {
    #[builder(setter(into))]
    pub node_id: NodeId,
}

impl MessageBase for RequestNodeInfoRequest {}

impl MessageId for RequestNodeInfoRequest {
    fn message_type(&self) -> MessageType {
        MessageType::Request
    }

    fn function_type(&self) -> FunctionType {
        FunctionType::RequestNodeInfo
    }

    fn origin(&self) -> MessageOrigin {
        MessageOrigin::Host
    }
}

impl MessageRequest for RequestNodeInfoRequest {
    fn expects_response(&self) -> bool {
        true
    }

    fn test_response(&self, response: &Message) -> bool {
        matches!(response, Message::RequestNodeInfoResponse(_))
    }
}

impl MessageParsable for RequestNodeInfoRequest {
    fn parse(i: &mut Bytes, ctx: &MessageParsingContext) -> ParseResult<Self> {
        let node_id = NodeId::parse(i, ctx.node_id_type)?;
        Ok(Self { node_id })
    }
}

impl SerializableWith<&MessageEncodingContext> for RequestNodeInfoRequest {
    fn serialize(&self, output: &mut BytesMut, ctx: &MessageEncodingContext) {
        self.node_id.serialize(output, ctx.node_id_type);
    }
}

impl ToLogPayload for RequestNodeInfoRequest {
    fn to_log_payload(&self) -> LogPayload {
        LogPayloadDict::new()
            .with_entry("node id", self.node_id.to_string())
            .into()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestNodeInfoResponse {
    pub was_sent: bool,
}

impl MessageBase for RequestNodeInfoResponse {
    fn is_ok(&self) -> bool {
        self.was_sent
    }
}

impl MessageId for RequestNodeInfoResponse {
    fn message_type(&self) -> MessageType {
        MessageType::Response
    }

    fn function_type(&self) -> FunctionType {
        FunctionType::RequestNodeInfo
    }

    fn origin(&self) -> MessageOrigin {
        MessageOrigin::Controller
    }
}

impl MessageParsable for RequestNodeInfoResponse {
    fn parse(i: &mut Bytes, _ctx: &MessageParsingContext) -> ParseResult<Self> {
        let was_sent = be_u8(i)? > 0;
        Ok(Self { was_sent })
    }
}

impl SerializableWith<&MessageEncodingContext> for RequestNodeInfoResponse {
    fn serialize(&self, output: &mut BytesMut, _ctx: &MessageEncodingContext) {
        serialize::bytes::be_u8(if self.was_sent { 0x01 } else { 0x00 }).serialize(output);
    }
}

impl ToLogPayload for RequestNodeInfoResponse {
    fn to_log_payload(&self) -> LogPayload {
        LogPayloadDict::new()
            .with_entry("was sent", self.was_sent)
            .into()
    }
}
