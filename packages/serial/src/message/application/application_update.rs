use crate::message::{
    MessageBase, MessageEncodingContext, MessageId, MessageParsable, MessageParsingContext,
};
use bytes::{Bytes, BytesMut};
use derive_try_from_primitive::TryFromPrimitive;
use zwh_core::parse::bytes::{be_u8, rest};
use zwh_core::prelude::*;
use zwh_core::serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ApplicationUpdateStatus {
    NodeInfoReceived = 0x84,
    NodeInfoRequestDone = 0x82,
    NodeInfoRequestFailed = 0x81,
    RoutingPending = 0x80,
    NodeAdded = 0x40,
    NodeRemoved = 0x20,
    SucIdChanged = 0x10,
}

/// Reports node information frames and topology changes
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationUpdateRequest {
    pub update_status: ApplicationUpdateStatus,
    pub node_id: NodeId,
    /// The node information frame, not interpreted by the driver core
    pub node_information: Bytes,
}

impl MessageBase for ApplicationUpdateRequest {}

impl MessageId for ApplicationUpdateRequest {
    fn message_type(&self) -> MessageType {
        MessageType::Request
    }

    fn function_type(&self) -> FunctionType {
        FunctionType::ApplicationUpdate
    }

    fn origin(&self) -> MessageOrigin {
        MessageOrigin::Controller
    }
}

impl MessageParsable for ApplicationUpdateRequest {
    fn parse(i: &mut Bytes, ctx: &MessageParsingContext) -> ParseResult<Self> {
        let status = be_u8(i)?;
        let update_status = ApplicationUpdateStatus::try_from(status).map_err(|_| {
            ParseError::validation_failure(format!("unknown update status {:#04x}", status))
        })?;
        let node_id = NodeId::parse(i, ctx.node_id_type)?;
        let node_information = rest(i)?;

        Ok(Self {
            update_status,
            node_id,
            node_information,
        })
    }
}

impl SerializableWith<&MessageEncodingContext> for ApplicationUpdateRequest {
    fn serialize(&self, output: &mut BytesMut, ctx: &MessageEncodingContext) {
        use serialize::bytes::{be_u8, slice};
        be_u8(self.update_status as u8).serialize(output);
        self.node_id.serialize(output, ctx.node_id_type);
        slice(&self.node_information).serialize(output);
    }
}

impl ToLogPayload for ApplicationUpdateRequest {
    fn to_log_payload(&self) -> LogPayload {
        LogPayloadDict::new()
            .with_entry("update status", format!("{:?}", self.update_status))
            .with_entry("node id", self.node_id.to_string())
            .into()
    }
}
