use crate::message::{
    MessageBase, MessageEncodingContext, MessageId, MessageParsable, MessageParsingContext,
};
use bytes::{Bytes, BytesMut};
use zwh_cc::prelude::*;
use zwh_core::parse::{bytes::be_u8, multi::length_value};
use zwh_core::prelude::*;
use zwh_core::serialize;

const RECEIVE_STATUS_LOW_POWER: u8 = 0x02;
const RECEIVE_STATUS_TYPE_BROADCAST: u8 = 0x04;
const RECEIVE_STATUS_TYPE_MULTICAST: u8 = 0x08;

fn frame_addressing_from_status(status: u8) -> FrameAddressing {
    if status & RECEIVE_STATUS_TYPE_BROADCAST != 0 {
        FrameAddressing::Broadcast
    } else if status & RECEIVE_STATUS_TYPE_MULTICAST != 0 {
        FrameAddressing::Multicast
    } else {
        FrameAddressing::Singlecast
    }
}

/// A command class frame received from another node
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationCommandRequest {
    pub receive_status: u8,
    pub frame_addressing: FrameAddressing,
    pub command: WithAddress<CC>,
}

impl ApplicationCommandRequest {
    pub fn is_low_power(&self) -> bool {
        self.receive_status & RECEIVE_STATUS_LOW_POWER != 0
    }
}

impl MessageBase for ApplicationCommandRequest {}

impl MessageId for ApplicationCommandRequest {
    fn message_type(&self) -> MessageType {
        MessageType::Request
    }

    fn function_type(&self) -> FunctionType {
        FunctionType::ApplicationCommand
    }

    fn origin(&self) -> MessageOrigin {
        MessageOrigin::Controller
    }
}

impl MessageParsable for ApplicationCommandRequest {
    fn parse(i: &mut Bytes, ctx: &MessageParsingContext) -> ParseResult<Self> {
        let receive_status = be_u8(i)?;
        let frame_addressing = frame_addressing_from_status(receive_status);
        let source_node_id = NodeId::parse(i, ctx.node_id_type)?;

        let cc_ctx = CCParsingContext::builder()
            .source_node_id(source_node_id)
            .own_node_id(ctx.own_node_id)
            .frame_addressing(Some(frame_addressing))
            .build();
        let command = length_value(be_u8, |i: &mut Bytes| {
            let raw = CCRaw::parse(i)?;
            CC::try_from_raw(raw, &cc_ctx)
        })
        .parse(i)?;

        let destination = match frame_addressing {
            FrameAddressing::Singlecast => Destination::Singlecast(ctx.own_node_id),
            FrameAddressing::Multicast => Destination::Multicast(vec![ctx.own_node_id]),
            FrameAddressing::Broadcast => Destination::Broadcast,
        };
        let address = CCAddress {
            source_node_id,
            destination,
            endpoint_index: EndpointIndex::Root,
        };

        Ok(Self {
            receive_status,
            frame_addressing,
            command: command.with_address(address),
        })
    }
}

impl SerializableWith<&MessageEncodingContext> for ApplicationCommandRequest {
    fn serialize(&self, output: &mut BytesMut, ctx: &MessageEncodingContext) {
        use serialize::bytes::{be_u8, slice};

        be_u8(self.receive_status).serialize(output);
        self.command
            .address()
            .source_node_id
            .serialize(output, ctx.node_id_type);

        let cc_ctx = CCEncodingContext::builder()
            .own_node_id(ctx.own_node_id)
            .build();
        let payload = self.command.as_ref().as_raw(&cc_ctx).as_bytes();
        be_u8(payload.len() as u8).serialize(output);
        slice(&payload).serialize(output);
    }
}

impl ToLogPayload for ApplicationCommandRequest {
    fn to_log_payload(&self) -> LogPayload {
        LogPayloadDict::new()
            .with_entry(
                "source node",
                self.command.address().source_node_id.to_string(),
            )
            .with_entry("addressing", format!("{:?}", self.frame_addressing))
            .with_nested(self.command.to_log_payload())
            .into()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zwh_core::hex_bytes;

    #[test]
    fn test_parse_basic_report() {
        // status 0x00, source node 7, length 3, Basic Report 0x63
        let mut input = hex_bytes!("000703200363");
        let ctx = MessageParsingContext::builder()
            .own_node_id(NodeId::new(1u8))
            .build();
        let msg = ApplicationCommandRequest::parse(&mut input, &ctx).unwrap();
        assert_eq!(msg.frame_addressing, FrameAddressing::Singlecast);
        assert_eq!(msg.command.address().source_node_id, NodeId::new(7u8));
        assert!(matches!(msg.command.as_ref(), CC::BasicCCReport(_)));
    }
}
