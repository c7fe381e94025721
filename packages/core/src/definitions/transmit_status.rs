use crate::parse::{ParseError, ParseResult, bytes::be_u8};
use crate::serialize::{self, Serializable};
use bytes::{Bytes, BytesMut};
use derive_try_from_primitive::TryFromPrimitive;

/// The radio-level result of a SendData callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum TransmitStatus {
    Ok = 0x00,
    /// The node did not acknowledge the frame
    NoAck = 0x01,
    Fail = 0x02,
    NotIdle = 0x03,
    NoRoute = 0x04,
}

impl TransmitStatus {
    pub fn parse(i: &mut Bytes) -> ParseResult<Self> {
        let raw = be_u8(i)?;
        Self::try_from(raw).map_err(|_| {
            ParseError::validation_failure(format!("unknown transmit status {:#04x}", raw))
        })
    }
}

impl Serializable for TransmitStatus {
    fn serialize(&self, output: &mut BytesMut) {
        serialize::bytes::be_u8(*self as u8).serialize(output);
    }
}

/// Additional information about a completed transmission. The controller
/// appends more detail (routing attempts, RSSI, ...), which the scheduler
/// does not interpret; only the transmission time is kept.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransmitReport {
    /// Transmission time in 10 ms ticks
    pub tx_ticks: u16,
}

impl TransmitReport {
    pub fn parse(i: &mut Bytes, present: bool) -> ParseResult<Self> {
        if !present || i.len() < 2 {
            return Ok(Self::default());
        }
        let tx_ticks = crate::parse::bytes::be_u16(i)?;
        // The remaining detail is not interpreted
        let _ = crate::parse::bytes::rest(i)?;
        Ok(Self { tx_ticks })
    }
}
