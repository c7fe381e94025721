use crate::message::{
    Message, MessageBase, MessageEncodingContext, MessageId, MessageParsable,
    MessageParsingContext, MessageRequest,
};
use bytes::{Bytes, BytesMut};
use zwh_core::parse::bytes::{be_u8, streaming::take_while0};
use zwh_core::prelude::*;
use zwh_core::serialize;

#[derive(Default, Debug, Clone, PartialEq)]
pub struct GetControllerVersionRequest {}

impl MessageBase for GetControllerVersionRequest {}

impl MessageId for GetControllerVersionRequest {
    fn message_type(&self) -> MessageType {
        MessageType::Request
    }

    fn function_type(&self) -> FunctionType {
        FunctionType::GetControllerVersion
    }

    fn origin(&self) -> MessageOrigin {
        MessageOrigin::Host
    }
}

impl MessageRequest for GetControllerVersionRequest {
    fn expects_response(&self) -> bool {
        true
    }

    fn test_response(&self, response: &Message) -> bool {
        matches!(response, Message::GetControllerVersionResponse(_))
    }
}

impl MessageParsable for GetControllerVersionRequest {
    fn parse(_i: &mut Bytes, _ctx: &MessageParsingContext) -> ParseResult<Self> {
        // No payload
        Ok(Self {})
    }
}

impl SerializableWith<&MessageEncodingContext> for GetControllerVersionRequest {
    fn serialize(&self, _output: &mut BytesMut, _ctx: &MessageEncodingContext) {
        // No payload
    }
}

impl ToLogPayload for GetControllerVersionRequest {
    fn to_log_payload(&self) -> LogPayload {
        LogPayload::empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetControllerVersionResponse {
    /// The version string of the Z-Wave library, e.g. "Z-Wave 7.19"
    pub library_version: String,
    pub library_type: u8,
}

impl MessageBase for GetControllerVersionResponse {}

impl MessageId for GetControllerVersionResponse {
    fn message_type(&self) -> MessageType {
        MessageType::Response
    }

    fn function_type(&self) -> FunctionType {
        FunctionType::GetControllerVersion
    }

    fn origin(&self) -> MessageOrigin {
        MessageOrigin::Controller
    }
}

impl MessageParsable for GetControllerVersionResponse {
    fn parse(i: &mut Bytes, _ctx: &MessageParsingContext) -> ParseResult<Self> {
        // The version is a zero-terminated string
        let version = take_while0(|b| b != 0).parse(i)?;
        let library_version = String::from_utf8_lossy(&version).trim().to_string();
        if !i.is_empty() {
            // Skip the terminator
            let _ = be_u8(i)?;
        }
        let library_type = if i.is_empty() { 0 } else { be_u8(i)? };

        Ok(Self {
            library_version,
            library_type,
        })
    }
}

impl SerializableWith<&MessageEncodingContext> for GetControllerVersionResponse {
    fn serialize(&self, output: &mut BytesMut, _ctx: &MessageEncodingContext) {
        use serialize::bytes::{be_u8, slice};
        slice(self.library_version.as_bytes()).serialize(output);
        be_u8(0).serialize(output);
        be_u8(self.library_type).serialize(output);
    }
}

impl ToLogPayload for GetControllerVersionResponse {
    fn to_log_payload(&self) -> LogPayload {
        LogPayloadDict::new()
            .with_entry("library version", self.library_version.clone())
            .with_entry("library type", self.library_type)
            .into()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_response() {
        let mut payload = b"Z-Wave 7.19".to_vec();
        payload.push(0x00);
        payload.push(0x01);
        let mut input = Bytes::from(payload);

        let response =
            GetControllerVersionResponse::parse(&mut input, &MessageParsingContext::default())
                .unwrap();
        assert_eq!(response.library_version, "Z-Wave 7.19");
        assert_eq!(response.library_type, 0x01);
    }
}
