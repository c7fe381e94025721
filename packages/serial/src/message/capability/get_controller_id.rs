use crate::message::{
    Message, MessageBase, MessageEncodingContext, MessageId, MessageParsable,
    MessageParsingContext, MessageRequest,
};
use bytes::{Bytes, BytesMut};
use zwh_core::parse::bytes::be_u32;
use zwh_core::prelude::*;
use zwh_core::serialize;

/// Asks the controller for the network home id and its own node id
#[derive(Default, Debug, Clone, PartialEq)]
pub struct GetControllerIdRequest {}

impl MessageBase for GetControllerIdRequest {}

impl MessageId for GetControllerIdRequest {
    fn message_type(&self) -> MessageType {
        MessageType::Request
    }

    fn function_type(&self) -> FunctionType {
        FunctionType::GetControllerId
    }

    fn origin(&self) -> MessageOrigin {
        MessageOrigin::Host
    }
}

impl MessageRequest for GetControllerIdRequest {
    fn expects_response(&self) -> bool {
        true
    }

    fn test_response(&self, response: &Message) -> bool {
        matches!(response, Message::GetControllerIdResponse(_))
    }
}

impl MessageParsable for GetControllerIdRequest {
    fn parse(_i: &mut Bytes, _ctx: &MessageParsingContext) -> ParseResult<Self> {
        // No payload
        Ok(Self {})
    }
}

impl SerializableWith<&MessageEncodingContext> for GetControllerIdRequest {
    fn serialize(&self, _output: &mut BytesMut, _ctx: &MessageEncodingContext) {
        // No payload
    }
}

impl ToLogPayload for GetControllerIdRequest {
    fn to_log_payload(&self) -> LogPayload {
        LogPayload::empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetControllerIdResponse {
    pub home_id: HomeId,
    pub own_node_id: NodeId,
}

impl MessageBase for GetControllerIdResponse {}

impl MessageId for GetControllerIdResponse {
    fn message_type(&self) -> MessageType {
        MessageType::Response
    }

    fn function_type(&self) -> FunctionType {
        FunctionType::GetControllerId
    }

    fn origin(&self) -> MessageOrigin {
        MessageOrigin::Controller
    }
}

impl MessageParsable for GetControllerIdResponse {
    fn parse(i: &mut Bytes, ctx: &MessageParsingContext) -> ParseResult<Self> {
        let home_id = HomeId::new(be_u32(i)?);
        let own_node_id = NodeId::parse(i, ctx.node_id_type)?;

        Ok(Self {
            home_id,
            own_node_id,
        })
    }
}

impl SerializableWith<&MessageEncodingContext> for GetControllerIdResponse {
    fn serialize(&self, output: &mut BytesMut, ctx: &MessageEncodingContext) {
        serialize::bytes::be_u32(self.home_id.into()).serialize(output);
        self.own_node_id.serialize(output, ctx.node_id_type);
    }
}

impl ToLogPayload for GetControllerIdResponse {
    fn to_log_payload(&self) -> LogPayload {
        LogPayloadDict::new()
            .with_entry("home id", format!("{:?}", self.home_id))
            .with_entry("own node id", self.own_node_id.to_string())
            .into()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zwh_core::hex_bytes;

    #[test]
    fn test_parse_response() {
        let mut input = hex_bytes!("deadbeef01");
        let response =
            GetControllerIdResponse::parse(&mut input, &MessageParsingContext::default())
                .unwrap();
        assert_eq!(response.home_id, HomeId::new(0xdeadbeef));
        assert_eq!(response.own_node_id, NodeId::new(1u8));
    }
}
