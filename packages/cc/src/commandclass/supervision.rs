use crate::prelude::*;
use bytes::{Bytes, BytesMut};
use derive_try_from_primitive::TryFromPrimitive;
use typed_builder::TypedBuilder;
use zwh_core::parse::{ParseError, bytes::be_u8, multi::length_value};
use zwh_core::prelude::*;
use zwh_core::serialize;

#[derive(Debug, Clone, Copy, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum SupervisionCCCommand {
    Get = 0x01,
    Report = 0x02,
}

/// The application-layer result a node reports for a supervised command
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum SupervisionStatus {
    NoSupport = 0x00,
    Working = 0x01,
    Fail = 0x02,
    Success = 0xff,
}

const SESSION_ID_MASK: u8 = 0b0011_1111;
const STATUS_UPDATES_MASK: u8 = 0b1000_0000;
const MORE_UPDATES_MASK: u8 = 0b1000_0000;

/// Wraps a command to request an application-layer acknowledgement
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct SupervisionCCGet {
    /// Correlates the Report(s) with this Get, 6 bits on the wire
    pub session_id: u8,
    /// Whether the node should send additional reports while working
    #[builder(default)]
    pub status_updates_requested: bool,
    pub encapsulated: Box<CC>,
}

impl SupervisionCCGet {
    pub fn new(session_id: u8, encapsulated: CC) -> Self {
        Self {
            session_id: session_id & SESSION_ID_MASK,
            status_updates_requested: false,
            encapsulated: Box::new(encapsulated),
        }
    }
}

impl CCBase for SupervisionCCGet {
    // Supervision Reports are handled by the session registry, not matched
    // as responses, so a Get does not expect a CC response here.
}

impl CCValues for SupervisionCCGet {}

impl CCId for SupervisionCCGet {
    fn cc_id(&self) -> CommandClasses {
        CommandClasses::Supervision
    }

    fn cc_command(&self) -> Option<u8> {
        Some(SupervisionCCCommand::Get as _)
    }
}

impl CCParsable for SupervisionCCGet {
    fn parse(i: &mut Bytes, ctx: &CCParsingContext) -> ParseResult<Self> {
        let flags = be_u8(i)?;
        let session_id = flags & SESSION_ID_MASK;
        let status_updates_requested = flags & STATUS_UPDATES_MASK != 0;
        let encapsulated = length_value(be_u8, |i: &mut Bytes| {
            let raw = CCRaw::parse(i)?;
            CC::try_from_raw(raw, ctx)
        })
        .parse(i)?;

        Ok(Self {
            session_id,
            status_updates_requested,
            encapsulated: Box::new(encapsulated),
        })
    }
}

impl SerializableWith<&CCEncodingContext> for SupervisionCCGet {
    fn serialize(&self, output: &mut BytesMut, ctx: &CCEncodingContext) {
        use serialize::bytes::{be_u8, slice};

        let mut flags = self.session_id & SESSION_ID_MASK;
        if self.status_updates_requested {
            flags |= STATUS_UPDATES_MASK;
        }
        be_u8(flags).serialize(output);

        let payload = self.encapsulated.as_raw(ctx).as_bytes();
        be_u8(payload.len() as u8).serialize(output);
        slice(&payload).serialize(output);
    }
}

impl ToLogPayload for SupervisionCCGet {
    fn to_log_payload(&self) -> LogPayload {
        LogPayloadDict::new()
            .with_entry("session id", self.session_id)
            .with_entry("status updates", self.status_updates_requested)
            .with_nested(self.encapsulated.to_log_payload())
            .into()
    }
}

/// The application-layer acknowledgement for a supervised command
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct SupervisionCCReport {
    pub session_id: u8,
    pub more_updates_follow: bool,
    pub status: SupervisionStatus,
    pub duration: DurationReport,
}

impl CCBase for SupervisionCCReport {}

impl CCValues for SupervisionCCReport {}

impl CCId for SupervisionCCReport {
    fn cc_id(&self) -> CommandClasses {
        CommandClasses::Supervision
    }

    fn cc_command(&self) -> Option<u8> {
        Some(SupervisionCCCommand::Report as _)
    }
}

impl CCParsable for SupervisionCCReport {
    fn parse(i: &mut Bytes, _ctx: &CCParsingContext) -> ParseResult<Self> {
        let flags = be_u8(i)?;
        let session_id = flags & SESSION_ID_MASK;
        let more_updates_follow = flags & MORE_UPDATES_MASK != 0;
        let status = be_u8(i)?;
        let status = SupervisionStatus::try_from(status).map_err(|_| {
            ParseError::validation_failure(format!("unknown supervision status {:#04x}", status))
        })?;
        let duration = DurationReport::parse_u8(be_u8(i)?);

        Ok(Self {
            session_id,
            more_updates_follow,
            status,
            duration,
        })
    }
}

impl SerializableWith<&CCEncodingContext> for SupervisionCCReport {
    fn serialize(&self, output: &mut BytesMut, _ctx: &CCEncodingContext) {
        use serialize::bytes::be_u8;

        let mut flags = self.session_id & SESSION_ID_MASK;
        if self.more_updates_follow {
            flags |= MORE_UPDATES_MASK;
        }
        be_u8(flags).serialize(output);
        be_u8(self.status as u8).serialize(output);
        be_u8(self.duration.as_u8()).serialize(output);
    }
}

impl ToLogPayload for SupervisionCCReport {
    fn to_log_payload(&self) -> LogPayload {
        LogPayloadDict::new()
            .with_entry("session id", self.session_id)
            .with_entry("more updates follow", self.more_updates_follow)
            .with_entry("status", format!("{:?}", self.status))
            .with_entry("duration", self.duration.to_string())
            .into()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zwh_core::hex_bytes;

    #[test]
    fn test_get_roundtrip() {
        let get = SupervisionCCGet::new(0x21, BasicCCSet { target_value: 0xff }.into());

        let ctx = CCEncodingContext::default();
        let raw = CC::from(get.clone()).as_raw(&ctx);
        // flags (session 0x21), length 3, Basic Set 0xff
        assert_eq!(raw.payload.as_ref(), &[0x21, 0x03, 0x20, 0x01, 0xff]);

        let parsed = CC::try_from_raw(raw, &CCParsingContext::default()).unwrap();
        assert_eq!(parsed, CC::SupervisionCCGet(get));
    }

    #[test]
    fn test_parse_report() {
        let mut input = hex_bytes!("a1ff00");
        let report =
            SupervisionCCReport::parse(&mut input, &CCParsingContext::default()).unwrap();
        assert_eq!(report.session_id, 0x21);
        assert!(report.more_updates_follow);
        assert_eq!(report.status, SupervisionStatus::Success);
        assert_eq!(report.duration, DurationReport::Seconds(0));
    }
}
