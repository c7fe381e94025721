use super::node::NodeStatus;
use super::*;
use crate::error::Error;
use crate::options::{DriverOptions, SecurityKeys};
use bytes::Bytes;
use futures::StreamExt;
use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;
use zwh_cc::prelude::*;
use zwh_serial::prelude::*;

fn frame_for(message: Message) -> RawSerialFrame {
    let raw = message.as_raw(&MessageEncodingContext::default());
    RawSerialFrame::Data(raw.as_bytes())
}

/// Parses a frame the driver wrote, i.e. from the host's perspective
fn parse_data_frame(frame: &RawSerialFrame) -> Option<Message> {
    let RawSerialFrame::Data(data) = frame else {
        return None;
    };
    let mut data = data.clone();
    let raw = MessageRaw::parse(&mut data).ok()?;
    let ctx = MessageParsingContext::builder()
        .origin(MessageOrigin::Host)
        .build();
    Message::try_from_raw(raw, &ctx).ok()
}

/// Drives a full startup against a scripted controller: the identification
/// messages are answered and the driver becomes ready.
#[test]
fn test_startup_sequence() {
    let options = DriverOptions::builder().enable_soft_reset(false).build();
    let (driver, mut actor, adapter) = Driver::new(options).unwrap();

    let mut pool = LocalPool::new();
    let spawner = pool.spawner();

    spawner
        .spawn_local(async move {
            actor.run().await;
        })
        .unwrap();

    // The scripted controller: ACK every data frame and answer the
    // identification requests
    let mut serial_in = adapter.serial_in;
    let mut serial_out = adapter.serial_out;
    spawner
        .spawn_local(async move {
            while let Some(frame) = serial_out.next().await {
                let Some(message) = parse_data_frame(&frame) else {
                    continue;
                };
                let _ = serial_in
                    .try_send(RawSerialFrame::ControlFlow(ControlFlow::ACK));

                let response: Option<Message> = match message {
                    Message::GetControllerVersionRequest(_) => Some(
                        GetControllerVersionResponse {
                            library_version: "Z-Wave 7.19".to_string(),
                            library_type: 0x01,
                        }
                        .into(),
                    ),
                    Message::GetControllerIdRequest(_) => Some(
                        GetControllerIdResponse {
                            home_id: HomeId::new(0xdeadbeef),
                            own_node_id: NodeId::new(1u8),
                        }
                        .into(),
                    ),
                    _ => None,
                };
                if let Some(response) = response {
                    let _ = serial_in.try_send(frame_for(response));
                }
            }
        })
        .unwrap();

    pool.run_until(async {
        driver.init().await.unwrap();
    });

    assert!(driver.is_ready());
    assert_eq!(driver.storage.home_id(), Some(HomeId::new(0xdeadbeef)));
    assert_eq!(driver.storage.own_node_id(), NodeId::new(1u8));
    assert_eq!(
        driver.storage.library_version().as_deref(),
        Some("Z-Wave 7.19")
    );
}

fn actor_for_test(options: DriverOptions) -> (Driver, DriverActor, DriverAdapter) {
    Driver::new(options).unwrap()
}

fn s2_frame_from(node_id: u8) -> RawSerialFrame {
    // An S2 encapsulation that cannot be decrypted: no SPAN exists
    let encap = Security2CCMessageEncapsulation {
        sequence_number: 7,
        extensions: Vec::new(),
        state: S2EncapsulationState::Encrypted {
            ciphertext_and_tag: Bytes::from(vec![0x42u8; 20]),
        },
    };
    let message: Message = ApplicationCommandRequest {
        receive_status: 0,
        frame_addressing: FrameAddressing::Singlecast,
        command: CC::from(encap).with_address(CCAddress {
            source_node_id: NodeId::new(node_id),
            destination: Destination::Singlecast(NodeId::new(1u8)),
            endpoint_index: EndpointIndex::Root,
        }),
    }
    .into();
    frame_for(message)
}

/// Spec scenario: an S2 frame without an established SPAN is ACKed and
/// answered with exactly one Nonce Report; a second failure inside the same
/// window does not enqueue another.
#[test]
fn test_s2_no_span_nonce_report_dedup() {
    let options = DriverOptions::builder()
        .security_keys(
            SecurityKeys::builder()
                .s2_authenticated(vec![0x07; 16])
                .build(),
        )
        .build();
    let (driver, mut actor, mut adapter) = actor_for_test(options);
    driver.storage.set_own_node_id(NodeId::new(1u8));
    actor.handle_input(DriverInput::InitSecurityManagers);
    actor.handle_input(DriverInput::SetupNode {
        node_id: NodeId::new(9u8),
        config: NodeConfig {
            security_class: Some(SecurityClass::S2Authenticated),
            ..Default::default()
        },
    });

    // First failure: ACK plus a Nonce Report transaction
    actor.handle_serial_frame(s2_frame_from(9));
    let mut acks = 0;
    let mut nonce_reports = 0;
    while let Ok(Some(frame)) = adapter.serial_out.try_next() {
        match frame {
            RawSerialFrame::ControlFlow(ControlFlow::ACK) => acks += 1,
            ref data @ RawSerialFrame::Data(_) => {
                if let Some(Message::SendDataRequest(request)) = parse_data_frame(data) {
                    if matches!(request.command, CC::Security2CCNonceReport(_)) {
                        nonce_reports += 1;
                    }
                }
            }
            _ => {}
        }
    }
    assert_eq!(acks, 1);
    assert_eq!(nonce_reports, 1);

    // Second failure in the same window: ACK only, no second report
    actor.handle_serial_frame(s2_frame_from(9));
    let mut acks = 0;
    let mut data_frames = 0;
    while let Ok(Some(frame)) = adapter.serial_out.try_next() {
        match frame {
            RawSerialFrame::ControlFlow(ControlFlow::ACK) => acks += 1,
            RawSerialFrame::Data(_) => data_frames += 1,
            _ => {}
        }
    }
    assert_eq!(acks, 1);
    assert_eq!(data_frames, 0);
    assert_eq!(actor.scheduler.queue_len(), 0);
}

/// Spec scenario: removing a node rejects its queued transactions and purges
/// its security state
#[test]
fn test_remove_node_purges_state() {
    let options = DriverOptions::builder()
        .security_keys(SecurityKeys::builder().s0_legacy(vec![0x0b; 16]).build())
        .build();
    let (driver, mut actor, _adapter) = actor_for_test(options);
    driver.storage.set_own_node_id(NodeId::new(1u8));
    actor.handle_input(DriverInput::InitSecurityManagers);

    // A cached nonce for node 3 exists
    if let Some(s0) = &actor.security.s0 {
        let mut s0 = s0.lock().unwrap();
        let nonce = s0.generate_nonce(NodeId::new(3u8));
        drop(nonce);
        let peer_nonce = zwh_core::security::S0Nonce::random();
        s0.set_nonce(NodeId::new(3u8), NodeId::new(1u8), peer_nonce, true);
    }

    // Queue transactions for node 3
    let mut receivers = Vec::new();
    for _ in 0..3 {
        let (result_tx, result_rx) = futures::channel::oneshot::channel();
        let (status_tx, _status_rx) = futures::channel::oneshot::channel();
        actor.handle_input(DriverInput::EnqueueTransaction {
            message: SendDataRequest::builder()
                .node_id(3u8)
                .command(BasicCCGet::default().into())
                .build()
                .into(),
            options: SendMessageOptions {
                priority: Some(transaction::Priority::Normal),
                ..Default::default()
            },
            result_tx,
            status_tx,
        });
        receivers.push(result_rx);
    }

    actor.handle_input(DriverInput::RemoveNode {
        node_id: NodeId::new(3u8),
    });

    for mut rx in receivers {
        let result = rx.try_recv().unwrap().unwrap();
        assert!(matches!(result, Err(Error::NodeRemoved(_))));
    }
    assert!(!actor.nodes.contains_key(&NodeId::new(3u8)));
    if let Some(s0) = &actor.security.s0 {
        assert!(s0.lock().unwrap().try_claim_nonce(NodeId::new(3u8)).is_none());
    }
}

/// A node that stops answering transitions per its power model, and its
/// pending traffic moves to the wake-up band
#[test]
fn test_node_timeout_transitions() {
    let (driver, mut actor, mut adapter) = actor_for_test(DriverOptions::default());
    driver.storage.set_own_node_id(NodeId::new(1u8));

    actor.handle_input(DriverInput::SetupNode {
        node_id: NodeId::new(5u8),
        config: NodeConfig {
            can_sleep: true,
            supports_wake_up: true,
            ..Default::default()
        },
    });

    // One transaction becomes active, one stays queued
    let mut receivers = Vec::new();
    for _ in 0..2 {
        let (result_tx, result_rx) = futures::channel::oneshot::channel();
        let (status_tx, _status_rx) = futures::channel::oneshot::channel();
        actor.handle_input(DriverInput::EnqueueTransaction {
            message: SendDataRequest::builder()
                .node_id(5u8)
                .command(BasicCCSet { target_value: 1 }.into())
                .build()
                .into(),
            options: SendMessageOptions {
                priority: Some(transaction::Priority::Normal),
                change_node_status_on_timeout: true,
                ..Default::default()
            },
            result_tx,
            status_tx,
        });
        receivers.push(result_rx);
    }

    // Fail the active transaction through its attempts by feeding NoAck
    // callbacks
    for _ in 0..3 {
        // Find the transmitted SendData to learn its callback id
        let mut callback_id = None;
        while let Ok(Some(frame)) = adapter.serial_out.try_next() {
            if let Some(Message::SendDataRequest(request)) = parse_data_frame(&frame) {
                callback_id = request.callback_id;
            }
        }
        let Some(callback_id) = callback_id else {
            // Retry is pending; drive time past the backoff
            let deadline = actor.scheduler.next_wakeup().unwrap();
            let ctx = driver.storage.encoding_context();
            let effects = actor
                .scheduler
                .handle_time(deadline + std::time::Duration::from_millis(1), &ctx);
            actor.run_scheduler_effects(effects);
            continue;
        };

        actor.handle_serial_frame(RawSerialFrame::ControlFlow(ControlFlow::ACK));
        actor.handle_serial_frame(frame_for(SendDataResponse { was_sent: true }.into()));
        actor.handle_serial_frame(frame_for(
            SendDataCallback {
                callback_id: Some(callback_id),
                transmit_status: TransmitStatus::NoAck,
                transmit_report: Default::default(),
            }
            .into(),
        ));

        // Drive any scheduled retry
        if let Some(deadline) = actor.scheduler.next_wakeup() {
            let ctx = driver.storage.encoding_context();
            let effects = actor
                .scheduler
                .handle_time(deadline + std::time::Duration::from_millis(1), &ctx);
            actor.run_scheduler_effects(effects);
        }
    }

    // The sleeping node is now asleep and the remaining transaction waits in
    // the wake-up band
    assert_eq!(
        actor.nodes.get(&NodeId::new(5u8)).unwrap().status,
        NodeStatus::Asleep
    );
    assert_eq!(actor.scheduler.queue_len(), 1);
    assert!(!actor.scheduler.has_active_transaction());

    let mut first = receivers.remove(0);
    let result = first.try_recv().unwrap().unwrap();
    assert!(matches!(result, Err(Error::NodeTimeout(_))));
}
