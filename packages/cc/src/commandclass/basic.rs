use crate::prelude::*;
use bytes::{Bytes, BytesMut};
use derive_try_from_primitive::TryFromPrimitive;
use typed_builder::TypedBuilder;
use zwh_core::cache::CacheValue;
use zwh_core::parse::bytes::be_u8;
use zwh_core::parse::combinators::opt;
use zwh_core::prelude::*;
use zwh_core::serialize;
use zwh_core::value_id::ValueId;

#[derive(Debug, Clone, Copy, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum BasicCCCommand {
    Set = 0x01,
    Get = 0x02,
    Report = 0x03,
}

const PROPERTY_CURRENT_VALUE: u32 = 0;
const PROPERTY_TARGET_VALUE: u32 = 1;

#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct BasicCCSet {
    pub target_value: u8,
}

impl CCBase for BasicCCSet {}

impl CCValues for BasicCCSet {}

impl CCId for BasicCCSet {
    fn cc_id(&self) -> CommandClasses {
        CommandClasses::Basic
    }

    fn cc_command(&self) -> Option<u8> {
        Some(BasicCCCommand::Set as _)
    }
}

impl CCParsable for BasicCCSet {
    fn parse(i: &mut Bytes, _ctx: &CCParsingContext) -> ParseResult<Self> {
        let target_value = be_u8(i)?;
        Ok(Self { target_value })
    }
}

impl SerializableWith<&CCEncodingContext> for BasicCCSet {
    fn serialize(&self, output: &mut BytesMut, _ctx: &CCEncodingContext) {
        use serialize::bytes::be_u8;
        be_u8(self.target_value).serialize(output);
    }
}

impl ToLogPayload for BasicCCSet {
    fn to_log_payload(&self) -> LogPayload {
        LogPayloadDict::new()
            .with_entry("target value", self.target_value)
            .into()
    }
}

#[derive(Default, Debug, Clone, PartialEq)]
pub struct BasicCCGet {}

impl CCBase for BasicCCGet {
    fn expects_response(&self) -> bool {
        true
    }

    fn test_response(&self, response: &CC) -> bool {
        matches!(response, CC::BasicCCReport(_))
    }
}

impl CCValues for BasicCCGet {}

impl CCId for BasicCCGet {
    fn cc_id(&self) -> CommandClasses {
        CommandClasses::Basic
    }

    fn cc_command(&self) -> Option<u8> {
        Some(BasicCCCommand::Get as _)
    }
}

impl CCParsable for BasicCCGet {
    fn parse(_i: &mut Bytes, _ctx: &CCParsingContext) -> ParseResult<Self> {
        // No payload
        Ok(Self {})
    }
}

impl SerializableWith<&CCEncodingContext> for BasicCCGet {
    fn serialize(&self, _output: &mut BytesMut, _ctx: &CCEncodingContext) {
        // No payload
    }
}

impl ToLogPayload for BasicCCGet {
    fn to_log_payload(&self) -> LogPayload {
        LogPayload::empty()
    }
}

#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct BasicCCReport {
    pub current_value: u8,
    /// Version 2+ appends the target value and a duration
    #[builder(default)]
    pub target_value: Option<u8>,
    #[builder(default)]
    pub duration: Option<DurationReport>,
}

impl CCBase for BasicCCReport {}

impl CCValues for BasicCCReport {
    fn to_values(&self) -> Vec<(ValueId, CacheValue)> {
        let mut ret = vec![(
            ValueId::new(CommandClasses::Basic, PROPERTY_CURRENT_VALUE),
            CacheValue::UInt8(self.current_value),
        )];
        if let Some(target_value) = self.target_value {
            ret.push((
                ValueId::new(CommandClasses::Basic, PROPERTY_TARGET_VALUE),
                CacheValue::UInt8(target_value),
            ));
        }
        ret
    }
}

impl CCId for BasicCCReport {
    fn cc_id(&self) -> CommandClasses {
        CommandClasses::Basic
    }

    fn cc_command(&self) -> Option<u8> {
        Some(BasicCCCommand::Report as _)
    }
}

impl CCParsable for BasicCCReport {
    fn parse(i: &mut Bytes, _ctx: &CCParsingContext) -> ParseResult<Self> {
        let current_value = be_u8(i)?;
        let target_value = opt(be_u8).parse(i)?;
        let duration = opt(be_u8).parse(i)?.map(DurationReport::parse_u8);

        Ok(Self {
            current_value,
            target_value,
            duration,
        })
    }
}

impl SerializableWith<&CCEncodingContext> for BasicCCReport {
    fn serialize(&self, output: &mut BytesMut, _ctx: &CCEncodingContext) {
        use serialize::bytes::be_u8;
        be_u8(self.current_value).serialize(output);
        if let Some(target_value) = self.target_value {
            be_u8(target_value).serialize(output);
            be_u8(self.duration.unwrap_or(DurationReport::Unknown).as_u8()).serialize(output);
        }
    }
}

impl ToLogPayload for BasicCCReport {
    fn to_log_payload(&self) -> LogPayload {
        let mut ret = LogPayloadDict::new().with_entry("current value", self.current_value);
        if let Some(target_value) = self.target_value {
            ret = ret.with_entry("target value", target_value);
        }
        if let Some(duration) = self.duration {
            ret = ret.with_entry("duration", duration.to_string());
        }
        ret.into()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zwh_core::hex_bytes;

    #[test]
    fn test_parse_report_v1() {
        let mut input = hex_bytes!("63");
        let report = BasicCCReport::parse(&mut input, &CCParsingContext::default()).unwrap();
        assert_eq!(report.current_value, 0x63);
        assert_eq!(report.target_value, None);
        assert_eq!(report.duration, None);
    }

    #[test]
    fn test_parse_report_v2() {
        let mut input = hex_bytes!("000a05");
        let report = BasicCCReport::parse(&mut input, &CCParsingContext::default()).unwrap();
        assert_eq!(report.current_value, 0x00);
        assert_eq!(report.target_value, Some(0x0a));
        assert_eq!(report.duration, Some(DurationReport::Seconds(5)));
    }
}
