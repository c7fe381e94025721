use bytes::{Bytes, BytesMut};
use zwh_core::parse::{
    ParseError, ParseResult,
    bytes::{be_u8, peek_u8, rest},
};
use zwh_core::prelude::*;
use zwh_core::serialize;

/// CC identifiers 0xF1..=0xFF mark an extended, 16-bit identifier
const EXTENDED_CC_ID_START: u8 = 0xf1;

/// An unparsed command class PDU: identifier, command and opaque payload
#[derive(Clone, PartialEq)]
pub struct CCRaw {
    pub cc_id: CommandClasses,
    pub cc_command: Option<u8>,
    pub payload: Bytes,
}

impl std::fmt::Debug for CCRaw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CCRaw")
            .field("cc_id", &self.cc_id)
            .field("cc_command", &self.cc_command.map(|c| format!("{:#04x}", c)))
            .field("payload", &format!("0x{}", hex::encode(&self.payload)))
            .finish()
    }
}

impl Parsable for CCRaw {
    fn parse(i: &mut Bytes) -> ParseResult<Self> {
        let id_byte = peek_u8(i)?;
        if id_byte >= EXTENDED_CC_ID_START {
            // Extended identifiers exist on the wire, but none of them are
            // implemented by this driver
            let _ = be_u8(i)?;
            let ext = be_u8(i)?;
            return Err(ParseError::not_implemented(format!(
                "unknown extended command class {:#06x}",
                ((id_byte as u16) << 8) | ext as u16
            )));
        }

        let cc_id = CommandClasses::parse(i)?;
        // The No Operation CC is a single byte without command or payload
        let cc_command = if i.is_empty() { None } else { Some(be_u8(i)?) };
        let payload = rest(i)?;

        Ok(Self {
            cc_id,
            cc_command,
            payload,
        })
    }
}

impl Serializable for CCRaw {
    fn serialize(&self, output: &mut BytesMut) {
        use serialize::bytes::{be_u8, slice};

        self.cc_id.serialize(output);
        if let Some(cc_command) = self.cc_command {
            be_u8(cc_command).serialize(output);
        }
        slice(&self.payload).serialize(output);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zwh_core::hex_bytes;

    #[test]
    fn test_parse_basic_set() {
        let mut input = hex_bytes!("200100");
        let raw = CCRaw::parse(&mut input).unwrap();
        assert_eq!(raw.cc_id, CommandClasses::Basic);
        assert_eq!(raw.cc_command, Some(0x01));
        assert_eq!(raw.payload.as_ref(), &[0x00]);
    }

    #[test]
    fn test_parse_no_operation() {
        let mut input = hex_bytes!("00");
        let raw = CCRaw::parse(&mut input).unwrap();
        assert_eq!(raw.cc_id, CommandClasses::NoOperation);
        assert_eq!(raw.cc_command, None);
        assert!(raw.payload.is_empty());
    }

    #[test]
    fn test_parse_unknown_cc() {
        let mut input = hex_bytes!("ee01");
        let result = CCRaw::parse(&mut input);
        assert!(result.is_err());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let raw = CCRaw {
            cc_id: CommandClasses::Basic,
            cc_command: Some(0x02),
            payload: Bytes::new(),
        };
        let serialized = raw.as_bytes();
        assert_eq!(serialized.as_ref(), &[0x20, 0x02]);

        let mut input = serialized;
        let reparsed = CCRaw::parse(&mut input).unwrap();
        assert_eq!(reparsed, raw);
    }
}
