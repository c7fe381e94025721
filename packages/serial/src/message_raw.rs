use crate::frame::{SerialControlByte, SerialFrame};
use bytes::{Bytes, BytesMut};
use std::fmt::Debug;
use zwh_core::checksum::xor_sum;
use zwh_core::parse::{
    bytes::{
        be_u8,
        complete::{literal, skip, take},
    },
    combinators::peek,
};
use zwh_core::prelude::*;
use zwh_core::serialize;

/// A host <-> controller message with validated framing, but an unparsed
/// payload. The function type is kept as a raw byte so unknown functions can
/// be acknowledged and dropped instead of NAKed.
#[derive(Clone, PartialEq)]
pub struct MessageRaw {
    pub message_type: MessageType,
    pub function_type: u8,
    pub payload: Bytes,
    pub checksum: u8,
}

impl Debug for MessageRaw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRaw")
            .field("message_type", &self.message_type)
            .field("function_type", &format_args!("{:#04x}", &self.function_type))
            .field("payload", &format_args!("0x{}", hex::encode(&self.payload)))
            .field("checksum", &format_args!("{:#04x}", &self.checksum))
            .finish()
    }
}

impl MessageRaw {
    pub fn new(message_type: MessageType, function_type: FunctionType, payload: Bytes) -> Self {
        Self {
            message_type,
            function_type: function_type as u8,
            payload,
            // Computed during serialization
            checksum: 0,
        }
    }

    /// The typed function type, if this driver knows it
    pub fn known_function_type(&self) -> Option<FunctionType> {
        FunctionType::try_from(self.function_type).ok()
    }
}

fn message_checksum(buffer: &[u8]) -> u8 {
    xor_sum(&buffer[1..buffer.len() - 1])
}

impl Parsable for MessageRaw {
    fn parse(i: &mut Bytes) -> ParseResult<Self> {
        // Extract the length, while ensuring that the buffer...
        let (_, len, _) = peek((
            // ...starts with SOF
            literal(SerialControlByte::SOF as u8),
            // (read length)
            be_u8,
            // ...and contains at least 5 bytes
            take(3usize),
        ))
        .parse(i)?;
        validate(len >= 3, "message frame is too short")?;

        // Remember a copy of the message buffer for the checksum later
        let raw_data: Bytes = i.clone().split_to(len as usize + 2);

        // Skip the SOF and length bytes
        skip(2usize).parse(i)?;

        let message_type = MessageType::parse(i)?;
        let function_type = be_u8(i)?;
        let payload = take(len - 3).parse(i)?;
        let checksum = be_u8(i)?;

        let expected_checksum = message_checksum(&raw_data);
        validate(
            checksum == expected_checksum,
            format!(
                "checksum mismatch: expected {:#04x}, got {:#04x}",
                expected_checksum, checksum
            ),
        )?;

        Ok(Self {
            message_type,
            function_type,
            payload,
            checksum,
        })
    }
}

impl MessageRaw {
    fn serialize_no_checksum(&self) -> impl Serializable + '_ {
        use serialize::{
            bytes::{be_u8, slice},
            sequence::tuple,
        };

        tuple((
            be_u8(SerialControlByte::SOF as u8),
            be_u8(self.payload.len() as u8 + 3),
            self.message_type,
            be_u8(self.function_type),
            slice(&self.payload),
            // checksum placeholder
            be_u8(0),
        ))
    }
}

impl Serializable for MessageRaw {
    fn serialize(&self, output: &mut BytesMut) {
        use serialize::bytes::slice;

        let mut buf = self.serialize_no_checksum().as_bytes_mut();
        let checksum = message_checksum(&buf);
        // Then update the checksum in the buffer
        let len = buf.len();
        buf[len - 1] = checksum;

        slice(buf).serialize(output);
    }
}

impl From<MessageRaw> for SerialFrame {
    fn from(val: MessageRaw) -> Self {
        SerialFrame::Message(val)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zwh_core::hex_bytes;

    #[test]
    fn test_parse_valid_checksum() {
        // This is an actual message with a correct checksum
        let mut input = hex_bytes!("01030002fe");
        let result = MessageRaw::parse(&mut input);
        assert!(result.is_ok());
    }

    #[test]
    fn test_parse_invalid_checksum() {
        let mut input = hex_bytes!("01030002ff");
        let result = MessageRaw::parse(&mut input);
        match result {
            Ok(_) => panic!("Expected an error"),
            Err(ParseError::Incomplete(_)) => panic!("Expected a parser error"),
            Err(_) => (),
        }
    }

    #[test]
    fn test_serialize() {
        let msg = MessageRaw {
            message_type: MessageType::Request,
            function_type: FunctionType::GetSerialApiInitData as u8,
            payload: Bytes::new(),
            checksum: 0u8,
        };

        let expected = hex_bytes!("01030002fe");
        let actual = msg.as_bytes_mut();
        assert_eq!(actual, expected);
    }
}
