use crate::message::{
    MessageBase, MessageEncodingContext, MessageId, MessageParsable, MessageParsingContext,
};
use bytes::{Bytes, BytesMut};
use zwh_cc::prelude::*;
use zwh_core::parse::{bytes::be_u8, multi::length_value};
use zwh_core::prelude::*;
use zwh_core::serialize;

const RECEIVE_STATUS_TYPE_BROADCAST: u8 = 0x04;
const RECEIVE_STATUS_TYPE_MULTICAST: u8 = 0x08;

/// A command class frame received by a bridge controller, which reports the
/// addressed (virtual) node explicitly
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeApplicationCommandRequest {
    pub receive_status: u8,
    pub frame_addressing: FrameAddressing,
    pub destination_node_id: NodeId,
    pub command: WithAddress<CC>,
}

impl MessageBase for BridgeApplicationCommandRequest {}

impl MessageId for BridgeApplicationCommandRequest {
    fn message_type(&self) -> MessageType {
        MessageType::Request
    }

    fn function_type(&self) -> FunctionType {
        FunctionType::BridgeApplicationCommand
    }

    fn origin(&self) -> MessageOrigin {
        MessageOrigin::Controller
    }
}

impl MessageParsable for BridgeApplicationCommandRequest {
    fn parse(i: &mut Bytes, ctx: &MessageParsingContext) -> ParseResult<Self> {
        let receive_status = be_u8(i)?;
        let frame_addressing = if receive_status & RECEIVE_STATUS_TYPE_BROADCAST != 0 {
            FrameAddressing::Broadcast
        } else if receive_status & RECEIVE_STATUS_TYPE_MULTICAST != 0 {
            FrameAddressing::Multicast
        } else {
            FrameAddressing::Singlecast
        };
        let destination_node_id = NodeId::parse(i, ctx.node_id_type)?;
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
            FrameAddressing::Singlecast => Destination::Singlecast(destination_node_id),
            FrameAddressing::Multicast => Destination::Multicast(vec![destination_node_id]),
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
            destination_node_id,
            command: command.with_address(address),
        })
    }
}

impl SerializableWith<&MessageEncodingContext> for BridgeApplicationCommandRequest {
    fn serialize(&self, output: &mut BytesMut, ctx: &MessageEncodingContext) {
        use serialize::bytes::{be_u8, slice};

        be_u8(self.receive_status).serialize(output);
        self.destination_node_id.serialize(output, ctx.node_id_type);
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

impl ToLogPayload for BridgeApplicationCommandRequest {
    fn to_log_payload(&self) -> LogPayload {
        LogPayloadDict::new()
            .with_entry(
                "source node",
                self.command.address().source_node_id.to_string(),
            )
            .with_entry("destination node", self.destination_node_id.to_string())
            .with_nested(self.command.to_log_payload())
            .into()
    }
}
