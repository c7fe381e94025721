use crate::prelude::*;
use bytes::{Bytes, BytesMut};
use derive_try_from_primitive::TryFromPrimitive;
use zwh_core::checksum::crc16_incremental;
use zwh_core::parse::bytes::{be_u16, complete::take};
use zwh_core::prelude::*;
use zwh_core::serialize;

#[derive(Debug, Clone, Copy, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum Crc16CCCommand {
    CommandEncapsulation = 0x01,
}

/// Protects a command with a CRC-16 checksum for nodes without a checksummed
/// transport. Mutually exclusive with Security encapsulation.
#[derive(Debug, Clone, PartialEq)]
pub struct Crc16CCCommandEncapsulation {
    pub encapsulated: Box<CC>,
}

impl Crc16CCCommandEncapsulation {
    pub fn new(encapsulated: CC) -> Self {
        Self {
            encapsulated: Box::new(encapsulated),
        }
    }
}

impl CCBase for Crc16CCCommandEncapsulation {
    fn expects_response(&self) -> bool {
        // The encapsulated CC decides whether a response is expected
        self.encapsulated.expects_response()
    }

    fn test_response(&self, response: &CC) -> bool {
        // The encapsulated CC decides whether the response is the expected one
        let CC::Crc16CCCommandEncapsulation(Crc16CCCommandEncapsulation { encapsulated }) =
            response
        else {
            return false;
        };
        self.encapsulated.test_response(encapsulated)
    }
}

impl CCValues for Crc16CCCommandEncapsulation {}

impl CCId for Crc16CCCommandEncapsulation {
    fn cc_id(&self) -> CommandClasses {
        CommandClasses::CRC16Encapsulation
    }

    fn cc_command(&self) -> Option<u8> {
        Some(Crc16CCCommand::CommandEncapsulation as _)
    }
}

impl CCParsable for Crc16CCCommandEncapsulation {
    fn parse(i: &mut Bytes, ctx: &CCParsingContext) -> ParseResult<Self> {
        validate(i.len() >= 2, "CRC-16 encapsulation is too short")?;
        let mut payload = take(i.len() - 2usize).parse(i)?;
        let checksum = be_u16(i)?;

        // The checksum includes the entire CRC16 CC
        let expected_checksum = crc16_incremental()
            .update(&[
                CommandClasses::CRC16Encapsulation as u8,
                Crc16CCCommand::CommandEncapsulation as u8,
            ])
            .update(&payload)
            .get();

        validate(
            checksum == expected_checksum,
            format!(
                "checksum mismatch: expected {:#06x}, got {:#06x}",
                expected_checksum, checksum
            ),
        )?;

        let raw = CCRaw::parse(&mut payload)?;
        let encapsulated = CC::try_from_raw(raw, ctx)?;

        Ok(Self {
            encapsulated: Box::new(encapsulated),
        })
    }
}

impl SerializableWith<&CCEncodingContext> for Crc16CCCommandEncapsulation {
    fn serialize(&self, output: &mut BytesMut, ctx: &CCEncodingContext) {
        use serialize::bytes::{be_u16, slice};

        let payload = self.encapsulated.as_raw(ctx).as_bytes();

        // The checksum includes the entire CRC16 CC
        let checksum = crc16_incremental()
            .update(&[
                self.cc_id() as u8,
                Crc16CCCommand::CommandEncapsulation as u8,
            ])
            .update(&payload)
            .get();

        slice(&payload).serialize(output);
        be_u16(checksum).serialize(output);
    }
}

impl ToLogPayload for Crc16CCCommandEncapsulation {
    fn to_log_payload(&self) -> LogPayload {
        LogPayloadText::new("CRC-16 encapsulation")
            .with_nested(self.encapsulated.to_log_payload())
            .into()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let cc = Crc16CCCommandEncapsulation::new(BasicCCSet { target_value: 0x42 }.into());

        let ctx = CCEncodingContext::default();
        let raw = CC::from(cc.clone()).as_raw(&ctx);

        let parsed = CC::try_from_raw(raw, &CCParsingContext::default()).unwrap();
        assert_eq!(parsed, CC::Crc16CCCommandEncapsulation(cc));
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let cc = Crc16CCCommandEncapsulation::new(BasicCCSet { target_value: 0x42 }.into());
        let ctx = CCEncodingContext::default();
        let mut raw = CC::from(cc).as_raw(&ctx);

        // Flip a payload bit, the checksum no longer matches
        let mut payload = raw.payload.to_vec();
        payload[0] ^= 0x01;
        raw.payload = Bytes::from(payload);

        assert!(CC::try_from_raw(raw, &CCParsingContext::default()).is_err());
    }
}
