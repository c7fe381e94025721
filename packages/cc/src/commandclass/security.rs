use crate::prelude::*;
use bytes::{Bytes, BytesMut};
use derive_try_from_primitive::TryFromPrimitive;
use ux::u4;
use zwh_core::parse::{
    bytes::{be_u8, complete::take, rest},
    fail_validation,
};
use zwh_core::prelude::*;
use zwh_core::security::crypto::{compute_mac, decrypt_aes_ofb, encrypt_aes_ofb};
use zwh_core::security::{S0_HALF_NONCE_SIZE, S0_MAC_SIZE, S0Nonce, S0SecurityManager};
use zwh_core::serialize;

#[derive(Debug, Clone, Copy, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum SecurityCCCommand {
    CommandsSupportedGet = 0x02,
    CommandsSupportedReport = 0x03,
    SchemeGet = 0x04,
    SchemeReport = 0x05,
    NetworkKeySet = 0x06,
    NetworkKeyVerify = 0x07,
    SchemeInherit = 0x08,
    NonceGet = 0x40,
    NonceReport = 0x80,
    CommandEncapsulation = 0x81,
    CommandEncapsulationNonceGet = 0xc1,
}

/// The data the S0 MAC is computed over
struct S0AuthData<'a> {
    sender_nonce: &'a [u8],
    receiver_nonce: &'a [u8],
    cc_command: SecurityCCCommand,
    sending_node_id: NodeId,
    receiving_node_id: NodeId,
    ciphertext: &'a [u8],
}

impl Serializable for S0AuthData<'_> {
    fn serialize(&self, output: &mut BytesMut) {
        use serialize::bytes::{be_u8, slice};

        slice(self.sender_nonce).serialize(output);
        slice(self.receiver_nonce).serialize(output);
        be_u8(self.cc_command as u8).serialize(output);
        self.sending_node_id
            .serialize(output, NodeIdType::NodeId8Bit);
        self.receiving_node_id
            .serialize(output, NodeIdType::NodeId8Bit);
        be_u8(self.ciphertext.len() as u8).serialize(output);
        slice(self.ciphertext).serialize(output);
    }
}

#[derive(Default, Debug, Clone, PartialEq)]
pub struct SecurityCCNonceGet {}

impl CCBase for SecurityCCNonceGet {
    fn expects_response(&self) -> bool {
        true
    }

    fn test_response(&self, response: &CC) -> bool {
        matches!(response, CC::SecurityCCNonceReport(_))
    }
}

impl CCValues for SecurityCCNonceGet {}

impl CCId for SecurityCCNonceGet {
    fn cc_id(&self) -> CommandClasses {
        CommandClasses::Security
    }

    fn cc_command(&self) -> Option<u8> {
        Some(SecurityCCCommand::NonceGet as _)
    }
}

impl CCParsable for SecurityCCNonceGet {
    fn parse(_i: &mut Bytes, _ctx: &CCParsingContext) -> ParseResult<Self> {
        // No payload
        Ok(Self {})
    }
}

impl SerializableWith<&CCEncodingContext> for SecurityCCNonceGet {
    fn serialize(&self, _output: &mut BytesMut, _ctx: &CCEncodingContext) {
        // No payload
    }
}

impl ToLogPayload for SecurityCCNonceGet {
    fn to_log_payload(&self) -> LogPayload {
        LogPayload::empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecurityCCNonceReport {
    pub nonce: S0Nonce,
}

impl CCBase for SecurityCCNonceReport {}

impl CCValues for SecurityCCNonceReport {}

impl CCId for SecurityCCNonceReport {
    fn cc_id(&self) -> CommandClasses {
        CommandClasses::Security
    }

    fn cc_command(&self) -> Option<u8> {
        Some(SecurityCCCommand::NonceReport as _)
    }
}

impl CCParsable for SecurityCCNonceReport {
    fn parse(i: &mut Bytes, _ctx: &CCParsingContext) -> ParseResult<Self> {
        let nonce = take(S0_HALF_NONCE_SIZE).parse(i)?;
        let nonce = S0Nonce::new(nonce);
        Ok(Self { nonce })
    }
}

impl SerializableWith<&CCEncodingContext> for SecurityCCNonceReport {
    fn serialize(&self, output: &mut BytesMut, _ctx: &CCEncodingContext) {
        use serialize::bytes::slice;
        slice(self.nonce.get()).serialize(output);
    }
}

impl ToLogPayload for SecurityCCNonceReport {
    fn to_log_payload(&self) -> LogPayload {
        LogPayloadDict::new()
            .with_entry("nonce", self.nonce.to_string())
            .into()
    }
}

const SEQUENCED_MASK: u8 = 0b0001_0000;
const SECOND_FRAME_MASK: u8 = 0b0010_0000;
const SEQUENCE_COUNTER_MASK: u8 = 0b0000_1111;

#[derive(Debug, Clone, PartialEq)]
pub enum S0EncapsulationState {
    /// The plaintext inner command, before encryption or after decryption
    /// and sequence merging
    Plaintext { encapsulated: Box<CC> },
    /// One frame of a sequenced transmission after decryption. Merged with
    /// its sibling via the CC session mechanism.
    Partial {
        second_frame: bool,
        sequence_counter: u4,
        decrypted: Bytes,
    },
    /// The wire form
    Encrypted {
        sender_nonce: Bytes,
        ciphertext: Bytes,
        receiver_nonce_id: u8,
        mac: Bytes,
    },
}

/// The S0 secure envelope. Parsing yields the [S0EncapsulationState::Encrypted]
/// state; the encapsulation pipeline performs the actual decryption since it
/// owns access to the security manager.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityCCCommandEncapsulation {
    pub state: S0EncapsulationState,
}

impl SecurityCCCommandEncapsulation {
    pub fn new(encapsulated: CC) -> Self {
        Self {
            state: S0EncapsulationState::Plaintext {
                encapsulated: Box::new(encapsulated),
            },
        }
    }

    pub fn encapsulated(&self) -> Option<&CC> {
        match &self.state {
            S0EncapsulationState::Plaintext { encapsulated } => Some(encapsulated),
            _ => None,
        }
    }

    /// Encrypts the plaintext command for transmission. The receiver nonce
    /// must have been obtained through a Nonce Get/Report handshake.
    pub fn encrypt(
        &mut self,
        manager: &S0SecurityManager,
        own_node_id: NodeId,
        destination: NodeId,
        receiver_nonce: &S0Nonce,
    ) -> ParseResult<()> {
        let S0EncapsulationState::Plaintext { encapsulated } = &self.state else {
            return fail_validation("S0 encapsulation is already encrypted");
        };

        let inner = encapsulated
            .as_raw(&CCEncodingContext::default())
            .as_bytes();
        // The first encrypted byte carries the sequencing information.
        // Outgoing frames are never sequenced; large payloads use the
        // Transport Service instead.
        let mut plaintext = BytesMut::with_capacity(inner.len() + 1);
        serialize::bytes::be_u8(0x00).serialize(&mut plaintext);
        serialize::bytes::slice(&inner).serialize(&mut plaintext);

        let sender_nonce = S0Nonce::random();
        let iv = [sender_nonce.get().as_ref(), receiver_nonce.get().as_ref()].concat();
        let ciphertext = encrypt_aes_ofb(&plaintext, manager.enc_key(), &iv);

        let auth_data = S0AuthData {
            sender_nonce: sender_nonce.get(),
            receiver_nonce: receiver_nonce.get(),
            cc_command: SecurityCCCommand::CommandEncapsulation,
            sending_node_id: own_node_id,
            receiving_node_id: destination,
            ciphertext: &ciphertext,
        };
        let mac = compute_mac(&auth_data.as_bytes(), manager.auth_key());

        self.state = S0EncapsulationState::Encrypted {
            sender_nonce: sender_nonce.get().clone(),
            ciphertext: Bytes::from(ciphertext),
            receiver_nonce_id: receiver_nonce.id(),
            mac: Bytes::from(mac),
        };
        Ok(())
    }

    /// Verifies the MAC and decrypts the wire form. Afterwards the state is
    /// either [S0EncapsulationState::Plaintext] or, for sequenced frames,
    /// [S0EncapsulationState::Partial].
    pub fn decrypt(
        &mut self,
        manager: &mut S0SecurityManager,
        ctx: &CCParsingContext,
    ) -> ParseResult<()> {
        let S0EncapsulationState::Encrypted {
            sender_nonce,
            ciphertext,
            receiver_nonce_id,
            mac,
        } = &self.state
        else {
            // Already decrypted
            return Ok(());
        };

        let Some(receiver_nonce) = manager.try_get_own_nonce(*receiver_nonce_id) else {
            return fail_validation(format!(
                "no nonce with id {:#04x} available",
                receiver_nonce_id
            ));
        };

        let auth_data = S0AuthData {
            sender_nonce,
            receiver_nonce: receiver_nonce.get(),
            cc_command: SecurityCCCommand::CommandEncapsulation,
            sending_node_id: ctx.source_node_id,
            receiving_node_id: ctx.own_node_id,
            ciphertext,
        };
        let expected_mac = compute_mac(&auth_data.as_bytes(), manager.auth_key());
        if expected_mac != mac.as_ref() {
            return fail_validation("S0 MAC mismatch");
        }

        let iv = [sender_nonce.as_ref(), receiver_nonce.get().as_ref()].concat();
        let plaintext = decrypt_aes_ofb(ciphertext, manager.enc_key(), &iv);
        let mut plaintext = Bytes::from(plaintext);

        let frame_control = be_u8(&mut plaintext)?;
        let sequenced = frame_control & SEQUENCED_MASK != 0;
        let second_frame = frame_control & SECOND_FRAME_MASK != 0;
        let sequence_counter = u4::new(frame_control & SEQUENCE_COUNTER_MASK);

        if sequenced {
            self.state = S0EncapsulationState::Partial {
                second_frame,
                sequence_counter,
                decrypted: plaintext,
            };
        } else {
            let raw = CCRaw::parse(&mut plaintext)?;
            let encapsulated = CC::try_from_raw(raw, ctx)?;
            self.state = S0EncapsulationState::Plaintext {
                encapsulated: Box::new(encapsulated),
            };
        }
        Ok(())
    }
}

impl CCBase for SecurityCCCommandEncapsulation {
    fn expects_response(&self) -> bool {
        // The encapsulated CC decides whether a response is expected
        match &self.state {
            S0EncapsulationState::Plaintext { encapsulated } => encapsulated.expects_response(),
            // Partially parsed or encrypted commands cannot expect a response
            _ => false,
        }
    }

    fn test_response(&self, response: &CC) -> bool {
        // We can only compare two decrypted CCs
        let S0EncapsulationState::Plaintext { encapsulated: sent } = &self.state else {
            return false;
        };

        let CC::SecurityCCCommandEncapsulation(SecurityCCCommandEncapsulation {
            state: S0EncapsulationState::Plaintext {
                encapsulated: received,
            },
        }) = response
        else {
            return false;
        };

        sent.test_response(received)
    }
}

impl CCValues for SecurityCCCommandEncapsulation {}

impl CCId for SecurityCCCommandEncapsulation {
    fn cc_id(&self) -> CommandClasses {
        CommandClasses::Security
    }

    fn cc_command(&self) -> Option<u8> {
        Some(SecurityCCCommand::CommandEncapsulation as _)
    }
}

impl CCParsable for SecurityCCCommandEncapsulation {
    fn parse(i: &mut Bytes, _ctx: &CCParsingContext) -> ParseResult<Self> {
        validate(
            i.len() > S0_HALF_NONCE_SIZE + 1 + S0_MAC_SIZE,
            "S0 encapsulation is too short",
        )?;

        let sender_nonce = take(S0_HALF_NONCE_SIZE).parse(i)?;
        let ciphertext = take(i.len() - 1 - S0_MAC_SIZE).parse(i)?;
        let receiver_nonce_id = be_u8(i)?;
        let mac = rest(i)?;

        Ok(Self {
            state: S0EncapsulationState::Encrypted {
                sender_nonce,
                ciphertext,
                receiver_nonce_id,
                mac,
            },
        })
    }
}

impl SerializableWith<&CCEncodingContext> for SecurityCCCommandEncapsulation {
    fn serialize(&self, output: &mut BytesMut, _ctx: &CCEncodingContext) {
        use serialize::bytes::{be_u8, slice};

        let S0EncapsulationState::Encrypted {
            sender_nonce,
            ciphertext,
            receiver_nonce_id,
            mac,
        } = &self.state
        else {
            panic!("S0 encapsulation must be encrypted before serialization");
        };

        slice(sender_nonce).serialize(output);
        slice(ciphertext).serialize(output);
        be_u8(*receiver_nonce_id).serialize(output);
        slice(mac).serialize(output);
    }
}

impl CCSession for SecurityCCCommandEncapsulation {
    fn session_id(&self) -> Option<u32> {
        match &self.state {
            S0EncapsulationState::Partial {
                sequence_counter, ..
            } => Some(u8::from(*sequence_counter) as u32),
            _ => None,
        }
    }

    fn is_session_complete(&self, other_ccs: &[CC]) -> bool {
        let S0EncapsulationState::Partial {
            second_frame,
            sequence_counter,
            ..
        } = &self.state
        else {
            return true;
        };
        if *second_frame {
            // We are the second frame, the first one must be buffered
            other_ccs.iter().any(|cc| {
                matches!(
                    cc,
                    CC::SecurityCCCommandEncapsulation(SecurityCCCommandEncapsulation {
                        state: S0EncapsulationState::Partial {
                            second_frame: false,
                            sequence_counter: other_counter,
                            ..
                        },
                    }) if other_counter == sequence_counter
                )
            })
        } else {
            false
        }
    }

    fn merge_session(&mut self, ctx: &CCParsingContext, other_ccs: Vec<CC>) -> ParseResult<()> {
        let S0EncapsulationState::Partial {
            second_frame,
            sequence_counter,
            decrypted,
        } = &self.state
        else {
            return Ok(());
        };
        validate(
            *second_frame,
            "the final frame of a sequenced S0 transmission must have the second frame flag set",
        )?;

        let sequence_counter = *sequence_counter;
        let first = other_ccs.into_iter().find_map(|cc| match cc {
            CC::SecurityCCCommandEncapsulation(SecurityCCCommandEncapsulation {
                state:
                    S0EncapsulationState::Partial {
                        second_frame: false,
                        sequence_counter: other_counter,
                        decrypted,
                    },
            }) if other_counter == sequence_counter => Some(decrypted),
            _ => None,
        });
        let Some(first) = first else {
            return fail_validation("missing first frame of sequenced S0 transmission");
        };

        let mut complete = Bytes::from([first.as_ref(), decrypted.as_ref()].concat());
        let raw = CCRaw::parse(&mut complete)?;
        let encapsulated = CC::try_from_raw(raw, ctx)?;
        self.state = S0EncapsulationState::Plaintext {
            encapsulated: Box::new(encapsulated),
        };
        Ok(())
    }
}

impl ToLogPayload for SecurityCCCommandEncapsulation {
    fn to_log_payload(&self) -> LogPayload {
        match &self.state {
            S0EncapsulationState::Plaintext { encapsulated } => {
                LogPayloadText::new("S0 encapsulation")
                    .with_nested(encapsulated.to_log_payload())
                    .into()
            }
            S0EncapsulationState::Partial {
                sequence_counter, ..
            } => LogPayloadDict::new()
                .with_entry("S0 encapsulation", "partial frame")
                .with_entry("sequence counter", u8::from(*sequence_counter))
                .into(),
            S0EncapsulationState::Encrypted { ciphertext, .. } => LogPayloadDict::new()
                .with_entry("S0 encapsulation", "encrypted")
                .with_entry("ciphertext length", ciphertext.len())
                .into(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;
    use zwh_core::security::S0SecurityManagerOptions;

    fn manager_for(own_node_id: u8) -> S0SecurityManager {
        S0SecurityManager::new(S0SecurityManagerOptions {
            own_node_id: NodeId::new(own_node_id),
            network_key: vec![0x0b; 16],
            nonce_timeout: Duration::from_millis(5000),
        })
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        // Controller is node 1, the secure device is node 5
        let controller = NodeId::new(1u8);
        let device = NodeId::new(5u8);

        let mut ours = manager_for(1);
        let mut theirs = manager_for(5);

        // The device hands out a nonce, which we learn through a Nonce Report
        let receiver_nonce = theirs.generate_nonce(controller);
        ours.set_nonce(device, controller, receiver_nonce.clone(), true);

        let inner: CC = BasicCCSet { target_value: 0x63 }.into();
        let mut encap = SecurityCCCommandEncapsulation::new(inner.clone());
        let nonce = ours.try_claim_nonce(device).unwrap();
        encap.encrypt(&ours, controller, device, &nonce).unwrap();

        // Serialize and reparse like the device would
        let ctx = CCEncodingContext::default();
        let raw = CC::from(encap).as_raw(&ctx);
        let parse_ctx = CCParsingContext::builder()
            .source_node_id(controller)
            .own_node_id(device)
            .build();
        let parsed = CC::try_from_raw(raw, &parse_ctx).unwrap();
        let CC::SecurityCCCommandEncapsulation(mut received) = parsed else {
            panic!("expected S0 encapsulation");
        };

        received.decrypt(&mut theirs, &parse_ctx).unwrap();
        assert_eq!(received.encapsulated(), Some(&inner));
    }

    #[test]
    fn test_tampered_mac_rejected() {
        let controller = NodeId::new(1u8);
        let device = NodeId::new(5u8);

        let mut ours = manager_for(1);
        let mut theirs = manager_for(5);

        let receiver_nonce = theirs.generate_nonce(controller);
        ours.set_nonce(device, controller, receiver_nonce.clone(), true);

        let mut encap =
            SecurityCCCommandEncapsulation::new(BasicCCSet { target_value: 0x63 }.into());
        let nonce = ours.try_claim_nonce(device).unwrap();
        encap.encrypt(&ours, controller, device, &nonce).unwrap();

        // Corrupt the ciphertext
        let S0EncapsulationState::Encrypted {
            ref mut ciphertext, ..
        } = encap.state
        else {
            unreachable!()
        };
        let mut bad = ciphertext.to_vec();
        bad[0] ^= 0xff;
        *ciphertext = Bytes::from(bad);

        let parse_ctx = CCParsingContext::builder()
            .source_node_id(controller)
            .own_node_id(device)
            .build();
        assert!(encap.decrypt(&mut theirs, &parse_ctx).is_err());
    }
}
