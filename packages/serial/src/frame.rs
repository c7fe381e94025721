use bytes::{Bytes, BytesMut};
use derive_try_from_primitive::TryFromPrimitive;
use zwh_core::parse::{
    ParseError, ParseResult,
    bytes::{peek_u8, streaming::{take, take_while1}},
};
use zwh_core::prelude::*;
use zwh_core::serialize;

use crate::message_raw::MessageRaw;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum SerialControlByte {
    SOF = 0x01,
    ACK = 0x06,
    NAK = 0x15,
    CAN = 0x18,
}

/// The single-byte flow control frames of the Serial API
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ControlFlow {
    ACK = 0x06,
    NAK = 0x15,
    CAN = 0x18,
}

impl std::fmt::Display for ControlFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A frame as it appears on the wire: flow control byte, data frame or
/// garbage that could not be assigned to either
#[derive(Clone, Debug, PartialEq)]
pub enum RawSerialFrame {
    ControlFlow(ControlFlow),
    Data(Bytes),
    Garbage(Bytes),
}

/// A frame after the first parsing step
#[derive(Clone, Debug, PartialEq)]
pub enum SerialFrame {
    ControlFlow(ControlFlow),
    Message(MessageRaw),
}

impl RawSerialFrame {
    /// Extracts the next frame from a byte buffer. Streaming: returns an
    /// Incomplete error when more bytes are needed.
    pub fn parse(i: &mut Bytes) -> ParseResult<Self> {
        let first = peek_u8(i)?;

        if let Ok(control) = ControlFlow::try_from(first) {
            let _ = take(1usize).parse(i)?;
            return Ok(RawSerialFrame::ControlFlow(control));
        }

        if first == SerialControlByte::SOF as u8 {
            // frame = SOF, length, type, function, payload, checksum
            if i.len() < 2 {
                return Err(ParseError::needed(2 - i.len()));
            }
            let length = i[1] as usize;
            let data = take(length + 2).parse(i)?;
            return Ok(RawSerialFrame::Data(data));
        }

        // Skip over anything that doesn't belong to a frame to re-synchronize
        let garbage =
            take_while1(|b| SerialControlByte::try_from(b).is_err()).parse(i)?;
        Ok(RawSerialFrame::Garbage(garbage))
    }
}

impl Serializable for RawSerialFrame {
    fn serialize(&self, output: &mut BytesMut) {
        use serialize::bytes::{be_u8, slice};
        match self {
            RawSerialFrame::ControlFlow(byte) => be_u8(*byte as u8).serialize(output),
            RawSerialFrame::Data(data) => slice(data).serialize(output),
            RawSerialFrame::Garbage(data) => slice(data).serialize(output),
        }
    }
}

/// Accumulates bytes from the transport and emits complete frames
#[derive(Default)]
pub struct SerialFramer {
    buffer: BytesMut,
}

impl SerialFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds received bytes and returns all frames that are now complete
    pub fn push_bytes(&mut self, data: &[u8]) -> Vec<RawSerialFrame> {
        self.buffer.extend_from_slice(data);

        let mut ret = Vec::new();
        loop {
            let mut input = self.buffer.clone().freeze();
            match RawSerialFrame::parse(&mut input) {
                Ok(frame) => {
                    let consumed = self.buffer.len() - input.len();
                    let _ = self.buffer.split_to(consumed);
                    ret.push(frame);
                }
                Err(ParseError::Incomplete(_)) => break,
                Err(_) => {
                    // Drop one byte and try again
                    let _ = self.buffer.split_to(1);
                }
            }
            if self.buffer.is_empty() {
                break;
            }
        }
        ret
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zwh_core::hex_bytes;

    #[test]
    fn test_parse_control_flow() {
        let mut data = hex_bytes!("0606151801");
        assert_eq!(
            RawSerialFrame::parse(&mut data),
            Ok(RawSerialFrame::ControlFlow(ControlFlow::ACK))
        );
        assert_eq!(
            RawSerialFrame::parse(&mut data),
            Ok(RawSerialFrame::ControlFlow(ControlFlow::ACK))
        );
        assert_eq!(
            RawSerialFrame::parse(&mut data),
            Ok(RawSerialFrame::ControlFlow(ControlFlow::NAK))
        );
        assert_eq!(
            RawSerialFrame::parse(&mut data),
            Ok(RawSerialFrame::ControlFlow(ControlFlow::CAN))
        );
        // Only the SOF of the next frame is left, more data is needed
        assert!(matches!(
            RawSerialFrame::parse(&mut data),
            Err(ParseError::Incomplete(_))
        ));
    }

    #[test]
    fn test_parse_data() {
        let mut data = hex_bytes!("01030008f406");
        let expected = hex_bytes!("01030008f4");
        assert_eq!(
            RawSerialFrame::parse(&mut data),
            Ok(RawSerialFrame::Data(expected))
        );
        assert_eq!(data.as_ref(), &[0x06]);
    }

    #[test]
    fn test_garbage_is_skipped() {
        let mut data = hex_bytes!("07080901");
        let expected = hex_bytes!("070809");
        assert_eq!(
            RawSerialFrame::parse(&mut data),
            Ok(RawSerialFrame::Garbage(expected))
        );
        assert_eq!(data.as_ref(), &[0x01]);
    }

    #[test]
    fn test_framer_reassembles_partial_data() {
        let mut framer = SerialFramer::new();
        assert_eq!(framer.push_bytes(&hex::decode("010300").unwrap()), vec![]);
        let frames = framer.push_bytes(&hex::decode("08f406").unwrap());
        assert_eq!(
            frames,
            vec![
                RawSerialFrame::Data(hex_bytes!("01030008f4")),
                RawSerialFrame::ControlFlow(ControlFlow::ACK),
            ]
        );
    }
}
