use crate::message::{
    Message, MessageBase, MessageEncodingContext, MessageId, MessageParsable,
    MessageParsingContext, MessageRequest,
};
use bytes::{Bytes, BytesMut};
use typed_builder::TypedBuilder;
use zwh_cc::prelude::*;
use zwh_core::parse::{bytes::be_u8, multi::length_value};
use zwh_core::prelude::*;
use zwh_core::serialize;

#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct SendDataRequest {
    #[builder(setter(into))]
    pub node_id: NodeId,
    pub command: CC,
    #[builder(setter(skip), default)]
    pub callback_id: Option<u8>,
    #[builder(default)]
    pub transmit_options: TransmitOptions,
}

impl MessageBase for SendDataRequest {
    fn callback_id(&self) -> Option<u8> {
        self.callback_id
    }
}

impl MessageId for SendDataRequest {
    fn message_type(&self) -> MessageType {
        MessageType::Request
    }

    fn function_type(&self) -> FunctionType {
        FunctionType::SendData
    }

    fn origin(&self) -> MessageOrigin {
        MessageOrigin::Host
    }
}

impl MessageRequest for SendDataRequest {
    fn expects_response(&self) -> bool {
        true
    }

    fn test_response(&self, response: &Message) -> bool {
        matches!(response, Message::SendDataResponse(_))
    }

    fn expects_callback(&self) -> bool {
        self.callback_id.is_some()
    }

    fn test_callback(&self, callback: &Message) -> bool {
        // The callback is correlated by its id; a mismatch is ignored
        let Message::SendDataCallback(callback) = callback else {
            return false;
        };
        self.callback_id.is_some() && callback.callback_id == self.callback_id
    }

    fn needs_callback_id(&self) -> bool {
        true
    }

    fn set_callback_id(&mut self, callback_id: Option<u8>) {
        self.callback_id = callback_id;
    }
}

impl MessageParsable for SendDataRequest {
    fn parse(i: &mut Bytes, ctx: &MessageParsingContext) -> ParseResult<Self> {
        let node_id = NodeId::parse(i, ctx.node_id_type)?;
        let command = length_value(be_u8, |i: &mut Bytes| {
            let raw = CCRaw::parse(i)?;
            let cc_ctx = CCParsingContext::builder()
                .own_node_id(ctx.own_node_id)
                .build();
            CC::try_from_raw(raw, &cc_ctx)
        })
        .parse(i)?;
        let transmit_options = TransmitOptions::parse(i)?;
        let callback_id = be_u8(i)?;

        Ok(Self {
            node_id,
            command,
            callback_id: Some(callback_id),
            transmit_options,
        })
    }
}

impl SerializableWith<&MessageEncodingContext> for SendDataRequest {
    fn serialize(&self, output: &mut BytesMut, ctx: &MessageEncodingContext) {
        use serialize::bytes::{be_u8, slice};

        let cc_ctx = CCEncodingContext::builder()
            .node_id(self.node_id)
            .own_node_id(ctx.own_node_id)
            .build();
        let payload = self.command.as_raw(&cc_ctx).as_bytes();

        self.node_id.serialize(output, ctx.node_id_type);
        be_u8(payload.len() as u8).serialize(output);
        slice(&payload).serialize(output);
        self.transmit_options.serialize(output);
        be_u8(self.callback_id.unwrap_or(0)).serialize(output);
    }
}

impl ToLogPayload for SendDataRequest {
    fn to_log_payload(&self) -> LogPayload {
        let mut ret = LogPayloadDict::new()
            .with_entry("node id", self.node_id.to_string())
            .with_entry("transmit options", self.transmit_options.to_string());
        if let Some(callback_id) = self.callback_id {
            ret = ret.with_entry("callback id", callback_id);
        }
        ret.with_nested(self.command.to_log_payload()).into()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendDataResponse {
    pub was_sent: bool,
}

impl MessageBase for SendDataResponse {
    fn is_ok(&self) -> bool {
        self.was_sent
    }
}

impl MessageId for SendDataResponse {
    fn message_type(&self) -> MessageType {
        MessageType::Response
    }

    fn function_type(&self) -> FunctionType {
        FunctionType::SendData
    }

    fn origin(&self) -> MessageOrigin {
        MessageOrigin::Controller
    }
}

impl MessageParsable for SendDataResponse {
    fn parse(i: &mut Bytes, _ctx: &MessageParsingContext) -> ParseResult<Self> {
        let was_sent = be_u8(i)? > 0;
        Ok(Self { was_sent })
    }
}

impl SerializableWith<&MessageEncodingContext> for SendDataResponse {
    fn serialize(&self, output: &mut BytesMut, _ctx: &MessageEncodingContext) {
        serialize::bytes::be_u8(if self.was_sent { 0x01 } else { 0x00 }).serialize(output);
    }
}

impl ToLogPayload for SendDataResponse {
    fn to_log_payload(&self) -> LogPayload {
        LogPayloadDict::new()
            .with_entry("was sent", self.was_sent)
            .into()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendDataCallback {
    pub callback_id: Option<u8>,
    pub transmit_status: TransmitStatus,
    pub transmit_report: TransmitReport,
}

impl MessageBase for SendDataCallback {
    fn is_ok(&self) -> bool {
        self.transmit_status == TransmitStatus::Ok
    }

    fn callback_id(&self) -> Option<u8> {
        self.callback_id
    }
}

impl MessageId for SendDataCallback {
    fn message_type(&self) -> MessageType {
        MessageType::Request
    }

    fn function_type(&self) -> FunctionType {
        FunctionType::SendData
    }

    fn origin(&self) -> MessageOrigin {
        MessageOrigin::Controller
    }
}

impl MessageParsable for SendDataCallback {
    fn parse(i: &mut Bytes, _ctx: &MessageParsingContext) -> ParseResult<Self> {
        let callback_id = be_u8(i)?;
        let transmit_status = TransmitStatus::parse(i)?;
        let transmit_report = TransmitReport::parse(i, transmit_status != TransmitStatus::NoAck)?;

        Ok(Self {
            callback_id: Some(callback_id),
            transmit_status,
            transmit_report,
        })
    }
}

impl SerializableWith<&MessageEncodingContext> for SendDataCallback {
    fn serialize(&self, output: &mut BytesMut, _ctx: &MessageEncodingContext) {
        use serialize::bytes::{be_u8, be_u16};

        be_u8(self.callback_id.unwrap_or(0)).serialize(output);
        self.transmit_status.serialize(output);
        be_u16(self.transmit_report.tx_ticks).serialize(output);
    }
}

impl ToLogPayload for SendDataCallback {
    fn to_log_payload(&self) -> LogPayload {
        let mut ret = LogPayloadDict::new();
        if let Some(callback_id) = self.callback_id {
            ret = ret.with_entry("callback id", callback_id);
        }
        ret.with_entry(
            "transmit status",
            format!(
                "{:?}, took {} ms",
                self.transmit_status,
                self.transmit_report.tx_ticks as u32 * 10
            ),
        )
        .into()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zwh_core::hex_bytes;

    #[test]
    fn test_request_roundtrip() {
        let mut request = SendDataRequest::builder()
            .node_id(5u8)
            .command(BasicCCSet { target_value: 0x63 }.into())
            .build();
        request.set_callback_id(Some(0x21));

        let ctx = MessageEncodingContext::default();
        let raw = Message::from(request.clone()).as_raw(&ctx);
        // node 5, length 3, Basic Set 0x63, default transmit options, callback 0x21
        assert_eq!(
            raw.payload.as_ref(),
            &[0x05, 0x03, 0x20, 0x01, 0x63, 0x25, 0x21]
        );

        let parse_ctx = MessageParsingContext::builder()
            .origin(MessageOrigin::Host)
            .build();
        let parsed = Message::try_from_raw(raw, &parse_ctx).unwrap();
        assert_eq!(parsed, Message::SendDataRequest(request));
    }

    #[test]
    fn test_callback_correlation() {
        let mut request = SendDataRequest::builder()
            .node_id(5u8)
            .command(BasicCCSet { target_value: 0 }.into())
            .build();
        request.set_callback_id(Some(0x10));

        let matching = Message::SendDataCallback(SendDataCallback {
            callback_id: Some(0x10),
            transmit_status: TransmitStatus::Ok,
            transmit_report: TransmitReport::default(),
        });
        let other = Message::SendDataCallback(SendDataCallback {
            callback_id: Some(0x11),
            transmit_status: TransmitStatus::Ok,
            transmit_report: TransmitReport::default(),
        });

        assert!(request.test_callback(&matching));
        // A mismatched callback id is ignored, not an error
        assert!(!request.test_callback(&other));
    }

    #[test]
    fn test_parse_callback() {
        let mut input = hex_bytes!("2100000002014f7f7f7f7f00010300000000000201");
        let callback =
            SendDataCallback::parse(&mut input, &MessageParsingContext::default()).unwrap();
        assert_eq!(callback.callback_id, Some(0x21));
        assert_eq!(callback.transmit_status, TransmitStatus::Ok);
    }
}
