use crate::prelude::*;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use ux::u7;
use zwh_core::prelude::*;
use zwh_core::security::{S0SecurityManager, S2SecurityManager, SpanState};

/// Shared handles to the security managers. The managers are owned here and
/// only mutated through the encapsulation pipeline.
#[derive(Default, Clone)]
pub struct SecurityManagers {
    pub s0: Option<Arc<Mutex<S0SecurityManager>>>,
    pub s2: Option<Arc<Mutex<S2SecurityManager>>>,
}

impl SecurityManagers {
    pub fn none() -> Self {
        Self::default()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncapsulationError {
    #[error("No network key is configured for the required security level")]
    NoSecurity,
    #[error("Multi Command encapsulation is not supported")]
    MultiCommandNotSupported,
    #[error(transparent)]
    Security2(#[from] S2DecryptError),
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

/// What a command needs before it can leave the host
#[derive(Debug, Clone, PartialEq)]
pub enum WrapOutcome {
    /// The command is fully encapsulated and ready to transmit
    Ready(CC),
    /// An S0 Nonce Get/Report handshake must happen first
    NeedsS0Nonce,
    /// An S2 Nonce Get/Report exchange must happen first
    NeedsS2Nonce,
}

/// Supervision parameters chosen by the caller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupervisionWrap {
    pub session_id: u8,
    pub status_updates: bool,
}

/// Per-command encapsulation policy, resolved by the driver from the node's
/// capabilities and the caller's wishes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WrapPolicy {
    pub own_node_id: NodeId,
    pub home_id: HomeId,
    /// The security level to apply, if any. S2 classes take precedence over
    /// S0 when the node supports both.
    pub security_class: Option<SecurityClass>,
    /// Whether to protect unsecured commands with a CRC-16 checksum.
    /// Mutually exclusive with security.
    pub use_crc16: bool,
    pub supervision: Option<SupervisionWrap>,
}

/// The result of unwrapping an inbound command
#[derive(Debug, Clone, PartialEq)]
pub struct Decapsulated {
    pub cc: WithAddress<CC>,
    /// Set when the command was wrapped in a Supervision Get; the caller
    /// must answer with a Supervision Report for this session.
    pub supervision: Option<SupervisionWrap>,
}

/// Applies the outgoing encapsulation layers in the canonical order:
/// Supervision first (innermost), then Multi Channel, then either Security
/// or CRC-16 (outermost). Transport Service fragmentation happens later at
/// the message layer, based on the size of the fully wrapped command.
pub fn encapsulate(
    cc: CC,
    address: &CCAddress,
    policy: &WrapPolicy,
    managers: &SecurityManagers,
) -> Result<WrapOutcome, EncapsulationError> {
    let mut current = cc;

    if let Some(supervision) = &policy.supervision {
        let mut get = SupervisionCCGet::new(supervision.session_id, current);
        get.status_updates_requested = supervision.status_updates;
        current = get.into();
    }

    if let EndpointIndex::Endpoint(index) = address.endpoint_index {
        current = MultiChannelCCCommandEncapsulation::new(index, current).into();
    }

    // Security applies to singlecast traffic only
    let destination = match &address.destination {
        Destination::Singlecast(node_id) => Some(*node_id),
        _ => None,
    };

    match (policy.security_class, destination) {
        (Some(class), Some(destination)) if class.is_s2() || class == SecurityClass::Temporary => {
            let Some(s2) = &managers.s2 else {
                return Err(EncapsulationError::NoSecurity);
            };
            let mut s2 = s2.lock().expect("S2 security manager lock poisoned");
            match s2.span_state(destination) {
                SpanState::Established(_) | SpanState::RemoteEI(_) => {
                    let sequence_number = s2.next_sequence_number();
                    let mut encap = Security2CCMessageEncapsulation::new(sequence_number, current);
                    encap.encrypt(&mut s2, destination, policy.home_id, &class)?;
                    Ok(WrapOutcome::Ready(encap.into()))
                }
                _ => Ok(WrapOutcome::NeedsS2Nonce),
            }
        }

        (Some(SecurityClass::S0Legacy), Some(destination)) => {
            let Some(s0) = &managers.s0 else {
                return Err(EncapsulationError::NoSecurity);
            };
            let mut s0 = s0.lock().expect("S0 security manager lock poisoned");
            let Some(receiver_nonce) = s0.try_claim_nonce(destination) else {
                return Ok(WrapOutcome::NeedsS0Nonce);
            };
            let own_node_id = s0.own_node_id();
            let mut encap = SecurityCCCommandEncapsulation::new(current);
            encap.encrypt(&s0, own_node_id, destination, &receiver_nonce)?;
            Ok(WrapOutcome::Ready(encap.into()))
        }

        _ if policy.use_crc16 => Ok(WrapOutcome::Ready(
            Crc16CCCommandEncapsulation::new(current).into(),
        )),

        _ => Ok(WrapOutcome::Ready(current)),
    }
}

/// Strips the encapsulation layers of an inbound command outermost first,
/// recording each stripped wrapper in the encapsulation flags so replies can
/// mirror them. Stops early when an S0 sequenced frame needs its sibling;
/// the caller merges the session and calls this again.
pub fn decapsulate(
    cc: WithAddress<CC>,
    own_node_id: NodeId,
    home_id: HomeId,
    security_class: Option<SecurityClass>,
    managers: &SecurityManagers,
) -> Result<Decapsulated, EncapsulationError> {
    let address = cc.address().clone();
    let mut flags = cc.flags();
    let mut supervision = None;
    let mut endpoint_index = address.endpoint_index;
    let (_, mut current) = cc.split();

    let parse_ctx = CCParsingContext::builder()
        .source_node_id(address.source_node_id)
        .own_node_id(own_node_id)
        .frame_addressing(Some((&address.destination).into()))
        .build();

    loop {
        current = match current {
            CC::SupervisionCCGet(get) => {
                flags |= EncapsulationFlags::SUPERVISION;
                supervision = Some(SupervisionWrap {
                    session_id: get.session_id,
                    status_updates: get.status_updates_requested,
                });
                *get.encapsulated
            }

            CC::MultiChannelCCCommandEncapsulation(encap) => {
                flags |= EncapsulationFlags::MULTI_CHANNEL;
                // The sender's source endpoint addresses the reply
                if encap.source_endpoint != u7::new(0) {
                    endpoint_index = EndpointIndex::Endpoint(u8::from(encap.source_endpoint));
                }
                *encap.encapsulated
            }

            CC::Crc16CCCommandEncapsulation(encap) => {
                flags |= EncapsulationFlags::CRC16;
                *encap.encapsulated
            }

            CC::SecurityCCCommandEncapsulation(mut encap) => {
                let Some(s0) = &managers.s0 else {
                    return Err(EncapsulationError::NoSecurity);
                };
                {
                    let mut s0 = s0.lock().expect("S0 security manager lock poisoned");
                    encap.decrypt(&mut s0, &parse_ctx)?;
                }
                flags |= EncapsulationFlags::SECURITY;
                match encap.state {
                    S0EncapsulationState::Plaintext { encapsulated } => *encapsulated,
                    // A sequenced frame: hand it back for session merging
                    _ => {
                        let mut ret = CC::SecurityCCCommandEncapsulation(encap)
                            .with_address(address.clone());
                        ret.set_flags(flags);
                        return Ok(Decapsulated {
                            cc: ret,
                            supervision,
                        });
                    }
                }
            }

            CC::Security2CCMessageEncapsulation(mut encap) => {
                let Some(s2) = &managers.s2 else {
                    return Err(EncapsulationError::Security2(S2DecryptError::NotInitialized));
                };
                let class = security_class
                    .ok_or(EncapsulationError::Security2(S2DecryptError::NotInitialized))?;
                {
                    let mut s2 = s2.lock().expect("S2 security manager lock poisoned");
                    encap.decrypt(&mut s2, &parse_ctx, home_id, &class)?;
                }
                flags |= EncapsulationFlags::SECURITY;
                match encap.state {
                    S2EncapsulationState::Plaintext { encapsulated } => *encapsulated,
                    _ => unreachable!("decrypt leaves the S2 encapsulation in plaintext state"),
                }
            }

            CC::MultiCommandCCCommandEncapsulation(_) => {
                return Err(EncapsulationError::MultiCommandNotSupported);
            }

            done => {
                let mut address = address.clone();
                address.endpoint_index = endpoint_index;
                let mut ret = done.with_address(address);
                ret.set_flags(flags);
                return Ok(Decapsulated {
                    cc: ret,
                    supervision,
                });
            }
        };
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;
    use zwh_core::security::{S0SecurityManagerOptions, S2SecurityManagerOptions};

    fn address_for(destination: u8) -> CCAddress {
        CCAddress {
            source_node_id: NodeId::new(1u8),
            destination: Destination::Singlecast(NodeId::new(destination)),
            endpoint_index: EndpointIndex::Root,
        }
    }

    fn policy() -> WrapPolicy {
        WrapPolicy {
            own_node_id: NodeId::new(1u8),
            home_id: HomeId::new(0xdeadbeef),
            security_class: None,
            use_crc16: false,
            supervision: None,
        }
    }

    fn unwrap_ready(outcome: WrapOutcome) -> CC {
        match outcome {
            WrapOutcome::Ready(cc) => cc,
            other => panic!("expected a ready command, got {:?}", other),
        }
    }

    fn decapsulate_inbound(
        cc: CC,
        source: u8,
        policy: &WrapPolicy,
        managers: &SecurityManagers,
    ) -> Decapsulated {
        let address = CCAddress {
            source_node_id: NodeId::new(source),
            destination: Destination::Singlecast(policy.own_node_id),
            endpoint_index: EndpointIndex::Root,
        };
        decapsulate(
            cc.with_address(address),
            policy.own_node_id,
            policy.home_id,
            policy.security_class,
            managers,
        )
        .unwrap()
    }

    #[test]
    fn test_plain_command_passes_through() {
        let cc: CC = BasicCCSet { target_value: 1 }.into();
        let outcome = encapsulate(
            cc.clone(),
            &address_for(4),
            &policy(),
            &SecurityManagers::none(),
        )
        .unwrap();
        assert_eq!(unwrap_ready(outcome), cc);
    }

    #[test]
    fn test_supervision_and_multi_channel_order() {
        let mut policy = policy();
        policy.supervision = Some(SupervisionWrap {
            session_id: 5,
            status_updates: false,
        });
        let mut address = address_for(4);
        address.endpoint_index = EndpointIndex::Endpoint(2);

        let cc: CC = BasicCCSet { target_value: 1 }.into();
        let outcome =
            encapsulate(cc, &address, &policy, &SecurityManagers::none()).unwrap();

        // Multi Channel must be outside of Supervision
        let CC::MultiChannelCCCommandEncapsulation(mc) = unwrap_ready(outcome) else {
            panic!("expected multi channel on the outside");
        };
        assert!(matches!(*mc.encapsulated, CC::SupervisionCCGet(_)));
    }

    #[test]
    fn test_crc16_applied_without_security() {
        let mut policy = policy();
        policy.use_crc16 = true;

        let cc: CC = BasicCCGet::default().into();
        let outcome = encapsulate(
            cc,
            &address_for(4),
            &policy,
            &SecurityManagers::none(),
        )
        .unwrap();
        assert!(matches!(
            unwrap_ready(outcome),
            CC::Crc16CCCommandEncapsulation(_)
        ));
    }

    #[test]
    fn test_s0_without_nonce_requests_handshake() {
        let mut policy = policy();
        policy.security_class = Some(SecurityClass::S0Legacy);

        let managers = SecurityManagers {
            s0: Some(Arc::new(Mutex::new(S0SecurityManager::new(
                S0SecurityManagerOptions {
                    own_node_id: NodeId::new(1u8),
                    network_key: vec![0x0b; 16],
                    nonce_timeout: Duration::from_millis(5000),
                },
            )))),
            s2: None,
        };

        let cc: CC = BasicCCSet { target_value: 1 }.into();
        let outcome = encapsulate(cc, &address_for(4), &policy, &managers).unwrap();
        assert_eq!(outcome, WrapOutcome::NeedsS0Nonce);
    }

    #[test]
    fn test_s2_without_span_requests_handshake() {
        let mut policy = policy();
        policy.security_class = Some(SecurityClass::S2Authenticated);

        let mut s2 = S2SecurityManager::new(S2SecurityManagerOptions {
            own_node_id: NodeId::new(1u8),
        });
        s2.set_network_key(SecurityClass::S2Authenticated, &[0x07; 16]);
        let managers = SecurityManagers {
            s0: None,
            s2: Some(Arc::new(Mutex::new(s2))),
        };

        let cc: CC = BasicCCSet { target_value: 1 }.into();
        let outcome = encapsulate(cc, &address_for(9), &policy, &managers).unwrap();
        assert_eq!(outcome, WrapOutcome::NeedsS2Nonce);
    }

    #[test]
    fn test_multi_command_rejected() {
        let cc: CC = MultiCommandCCCommandEncapsulation {
            encapsulated: vec![],
        }
        .into();
        let address = CCAddress {
            source_node_id: NodeId::new(4u8),
            destination: Destination::Singlecast(NodeId::new(1u8)),
            endpoint_index: EndpointIndex::Root,
        };
        let result = decapsulate(
            cc.with_address(address),
            NodeId::new(1u8),
            HomeId::new(0),
            None,
            &SecurityManagers::none(),
        );
        assert_eq!(result, Err(EncapsulationError::MultiCommandNotSupported));
    }

    #[test]
    fn test_idempotent_encapsulation_roundtrip() {
        // Wrap with Supervision + Multi Channel + CRC-16, unwrap, and verify
        // the flags reflect every stripped wrapper
        let mut policy = policy();
        policy.use_crc16 = true;
        policy.supervision = Some(SupervisionWrap {
            session_id: 9,
            status_updates: false,
        });
        let mut address = address_for(4);
        address.endpoint_index = EndpointIndex::Endpoint(3);

        let inner: CC = BasicCCSet { target_value: 0x63 }.into();
        let outcome = encapsulate(
            inner.clone(),
            &address,
            &policy,
            &SecurityManagers::none(),
        )
        .unwrap();
        let wrapped = unwrap_ready(outcome);

        // Pretend the identical frame arrives from the peer
        let result = decapsulate_inbound(wrapped, 4, &policy, &SecurityManagers::none());
        assert_eq!(*result.cc.as_ref(), inner);
        assert!(result.cc.flags().contains(EncapsulationFlags::SUPERVISION));
        assert!(result.cc.flags().contains(EncapsulationFlags::MULTI_CHANNEL));
        assert!(result.cc.flags().contains(EncapsulationFlags::CRC16));
        assert_eq!(
            result.supervision,
            Some(SupervisionWrap {
                session_id: 9,
                status_updates: false,
            })
        );
    }

    #[test]
    fn test_s0_end_to_end() {
        // Two managers play controller (node 1) and device (node 5)
        let controller = NodeId::new(1u8);
        let device = NodeId::new(5u8);
        let make_manager = |own: NodeId| {
            Arc::new(Mutex::new(S0SecurityManager::new(S0SecurityManagerOptions {
                own_node_id: own,
                network_key: vec![0x0b; 16],
                nonce_timeout: Duration::from_millis(5000),
            })))
        };

        let ours = SecurityManagers {
            s0: Some(make_manager(controller)),
            s2: None,
        };
        let theirs = SecurityManagers {
            s0: Some(make_manager(device)),
            s2: None,
        };

        // Nonce handshake
        let receiver_nonce = theirs
            .s0
            .as_ref()
            .unwrap()
            .lock()
            .unwrap()
            .generate_nonce(controller);
        ours.s0
            .as_ref()
            .unwrap()
            .lock()
            .unwrap()
            .set_nonce(device, controller, receiver_nonce, true);

        let mut policy = policy();
        policy.security_class = Some(SecurityClass::S0Legacy);

        let inner: CC = BasicCCSet { target_value: 0x42 }.into();
        let outcome =
            encapsulate(inner.clone(), &address_for(5), &policy, &ours).unwrap();
        let wrapped = unwrap_ready(outcome);

        // The device decapsulates with its own manager
        let mut device_policy = policy;
        device_policy.own_node_id = device;
        let result = decapsulate_inbound(wrapped, 1, &device_policy, &theirs);
        assert_eq!(*result.cc.as_ref(), inner);
        assert!(result.cc.flags().contains(EncapsulationFlags::SECURITY));
    }
}
