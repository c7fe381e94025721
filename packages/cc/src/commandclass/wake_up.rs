use crate::prelude::*;
use bytes::{Bytes, BytesMut};
use derive_try_from_primitive::TryFromPrimitive;
use typed_builder::TypedBuilder;
use zwh_core::parse::bytes::be_u8;
use zwh_core::prelude::*;
use zwh_core::serialize;

#[derive(Debug, Clone, Copy, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum WakeUpCCCommand {
    IntervalSet = 0x04,
    IntervalGet = 0x05,
    IntervalReport = 0x06,
    WakeUpNotification = 0x07,
    NoMoreInformation = 0x08,
    IntervalCapabilitiesGet = 0x09,
    IntervalCapabilitiesReport = 0x0a,
}

/// Configures the wake up interval and the node to notify when waking up
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct WakeUpCCIntervalSet {
    /// Wake up interval in seconds, 24 bits on the wire
    pub interval_seconds: u32,
    /// Which node to send the Wake Up Notification to
    #[builder(setter(into))]
    pub controller_node_id: NodeId,
}

impl CCBase for WakeUpCCIntervalSet {}

impl CCValues for WakeUpCCIntervalSet {}

impl CCId for WakeUpCCIntervalSet {
    fn cc_id(&self) -> CommandClasses {
        CommandClasses::WakeUp
    }

    fn cc_command(&self) -> Option<u8> {
        Some(WakeUpCCCommand::IntervalSet as _)
    }
}

impl CCParsable for WakeUpCCIntervalSet {
    fn parse(i: &mut Bytes, _ctx: &CCParsingContext) -> ParseResult<Self> {
        let b0 = be_u8(i)?;
        let b1 = be_u8(i)?;
        let b2 = be_u8(i)?;
        let interval_seconds = ((b0 as u32) << 16) | ((b1 as u32) << 8) | b2 as u32;
        let controller_node_id = NodeId::parse(i, NodeIdType::NodeId8Bit)?;

        Ok(Self {
            interval_seconds,
            controller_node_id,
        })
    }
}

impl SerializableWith<&CCEncodingContext> for WakeUpCCIntervalSet {
    fn serialize(&self, output: &mut BytesMut, _ctx: &CCEncodingContext) {
        use serialize::bytes::be_u8;
        be_u8((self.interval_seconds >> 16) as u8).serialize(output);
        be_u8((self.interval_seconds >> 8) as u8).serialize(output);
        be_u8(self.interval_seconds as u8).serialize(output);
        self.controller_node_id
            .serialize(output, NodeIdType::NodeId8Bit);
    }
}

impl ToLogPayload for WakeUpCCIntervalSet {
    fn to_log_payload(&self) -> LogPayload {
        LogPayloadDict::new()
            .with_entry("interval", format!("{} s", self.interval_seconds))
            .with_entry("controller node", self.controller_node_id.to_string())
            .into()
    }
}

/// Sent by a battery powered node when it wakes up
#[derive(Default, Debug, Clone, PartialEq)]
pub struct WakeUpCCWakeUpNotification {}

impl CCBase for WakeUpCCWakeUpNotification {}

impl CCValues for WakeUpCCWakeUpNotification {}

impl CCId for WakeUpCCWakeUpNotification {
    fn cc_id(&self) -> CommandClasses {
        CommandClasses::WakeUp
    }

    fn cc_command(&self) -> Option<u8> {
        Some(WakeUpCCCommand::WakeUpNotification as _)
    }
}

impl CCParsable for WakeUpCCWakeUpNotification {
    fn parse(_i: &mut Bytes, _ctx: &CCParsingContext) -> ParseResult<Self> {
        // No payload
        Ok(Self {})
    }
}

impl SerializableWith<&CCEncodingContext> for WakeUpCCWakeUpNotification {
    fn serialize(&self, _output: &mut BytesMut, _ctx: &CCEncodingContext) {
        // No payload
    }
}

impl ToLogPayload for WakeUpCCWakeUpNotification {
    fn to_log_payload(&self) -> LogPayload {
        LogPayload::empty()
    }
}

/// Tells a woken up node that it may go back to sleep
#[derive(Default, Debug, Clone, PartialEq)]
pub struct WakeUpCCNoMoreInformation {}

impl CCBase for WakeUpCCNoMoreInformation {}

impl CCValues for WakeUpCCNoMoreInformation {}

impl CCId for WakeUpCCNoMoreInformation {
    fn cc_id(&self) -> CommandClasses {
        CommandClasses::WakeUp
    }

    fn cc_command(&self) -> Option<u8> {
        Some(WakeUpCCCommand::NoMoreInformation as _)
    }
}

impl CCParsable for WakeUpCCNoMoreInformation {
    fn parse(_i: &mut Bytes, _ctx: &CCParsingContext) -> ParseResult<Self> {
        // No payload
        Ok(Self {})
    }
}

impl SerializableWith<&CCEncodingContext> for WakeUpCCNoMoreInformation {
    fn serialize(&self, _output: &mut BytesMut, _ctx: &CCEncodingContext) {
        // No payload
    }
}

impl ToLogPayload for WakeUpCCNoMoreInformation {
    fn to_log_payload(&self) -> LogPayload {
        LogPayload::empty()
    }
}
