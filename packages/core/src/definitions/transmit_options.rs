use crate::parse::{ParseResult, bytes::be_u8};
use crate::serialize::{self, Serializable};
use bytes::{Bytes, BytesMut};
use std::fmt::Display;

const ACK: u8 = 0x01;
const LOW_POWER: u8 = 0x02;
const AUTO_ROUTE: u8 = 0x04;
const NO_ROUTE: u8 = 0x10;
const EXPLORE: u8 = 0x20;

/// Radio transmission options for SendData
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TransmitOptions(u8);

impl TransmitOptions {
    pub fn new(raw: u8) -> Self {
        Self(raw)
    }

    pub fn ack(&self) -> bool {
        self.0 & ACK != 0
    }

    pub fn low_power(&self) -> bool {
        self.0 & LOW_POWER != 0
    }

    pub fn auto_route(&self) -> bool {
        self.0 & AUTO_ROUTE != 0
    }

    pub fn no_route(&self) -> bool {
        self.0 & NO_ROUTE != 0
    }

    pub fn explore(&self) -> bool {
        self.0 & EXPLORE != 0
    }

    pub fn parse(i: &mut Bytes) -> ParseResult<Self> {
        Ok(Self(be_u8(i)?))
    }
}

impl Default for TransmitOptions {
    fn default() -> Self {
        Self(ACK | AUTO_ROUTE | EXPLORE)
    }
}

impl Serializable for TransmitOptions {
    fn serialize(&self, output: &mut BytesMut) {
        serialize::bytes::be_u8(self.0).serialize(output);
    }
}

impl std::fmt::Debug for TransmitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransmitOptions({:#04x})", self.0)
    }
}

impl Display for TransmitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if self.ack() {
            parts.push("ACK");
        }
        if self.low_power() {
            parts.push("low power");
        }
        if self.auto_route() {
            parts.push("auto route");
        }
        if self.no_route() {
            parts.push("no route");
        }
        if self.explore() {
            parts.push("explore");
        }
        write!(f, "{}", parts.join(", "))
    }
}
