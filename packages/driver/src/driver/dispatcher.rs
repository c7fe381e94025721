use super::actor::DriverActor;
use super::node::{NodeStatus, TransportSession};
use super::transaction::Priority;
use super::DriverEvent;
use std::time::Instant;
use ux::u4;
use zwh_cc::prelude::*;
use zwh_core::prelude::*;
use zwh_core::security::S2SecurityManager;
use zwh_core::value_id::EndpointValueId;
use zwh_logging::Direction;
use zwh_serial::prelude::*;

impl DriverActor {
    /// The wire-level disposition of inbound frames: valid data frames are
    /// ACKed, framing errors are NAKed to resynchronize.
    pub(crate) fn handle_serial_frame(&mut self, frame: RawSerialFrame) {
        match frame {
            RawSerialFrame::ControlFlow(byte) => {
                self.serial_log().control_flow(byte, Direction::Inbound);
                let now = Instant::now();
                let ctx = self.storage.encoding_context();
                let effects = self.scheduler.handle_control_flow(byte, now, &ctx);
                self.run_scheduler_effects(effects);
            }

            RawSerialFrame::Data(mut bytes) => {
                self.serial_log().data(&bytes, Direction::Inbound);
                match MessageRaw::parse(&mut bytes) {
                    Ok(raw) => {
                        // The framing is valid, ACK before doing anything else
                        self.transmit(SerialFrame::ControlFlow(ControlFlow::ACK));
                        self.dispatch_message_raw(raw);
                    }
                    Err(e) => {
                        self.driver_log()
                            .warn(|| format!("malformed frame: {}", e));
                        self.transmit(SerialFrame::ControlFlow(ControlFlow::NAK));
                    }
                }
            }

            RawSerialFrame::Garbage(bytes) => {
                self.serial_log().discarded(&bytes);
                self.transmit(SerialFrame::ControlFlow(ControlFlow::NAK));
            }
        }
    }

    /// The three dispositions of an inbound message: scheduler correlation,
    /// a pending awaiter, or the unsolicited path.
    fn dispatch_message_raw(&mut self, raw: MessageRaw) {
        let parse_ctx = self.storage.parsing_context();
        let message = match Message::try_from_raw(raw, &parse_ctx) {
            Ok(message) => message,
            Err(e) => {
                // Already ACKed; decode failures are dropped on the floor
                self.driver_log()
                    .debug(|| format!("dropping undecodable message: {}", e));
                return;
            }
        };

        // 1. The active transaction may be waiting for this response/callback
        let now = Instant::now();
        let enc_ctx = self.storage.encoding_context();
        let (leftover, effects) = self.scheduler.handle_message(message, now, &enc_ctx);
        self.run_scheduler_effects(effects);
        let Some(message) = leftover else {
            return;
        };

        // 2. A wait_for_message awaiter; insertion ordered, first match wins
        if let Some(channel) = self.awaited_messages.take_matching(&message) {
            self.controller_log().message(&message, Direction::Inbound);
            let _ = channel.send(Ok(message));
            return;
        }

        // 3. Unsolicited
        self.handle_unsolicited_message(message);
    }

    fn handle_unsolicited_message(&mut self, message: Message) {
        match message {
            Message::ApplicationCommandRequest(msg) => {
                self.handle_cc(msg.command);
            }
            Message::BridgeApplicationCommandRequest(msg) => {
                self.handle_cc(msg.command);
            }
            other => {
                self.controller_log().message(&other, Direction::Inbound);

                let function_type = other.function_type();
                if let Some(handlers) = self.request_handlers.get_mut(&function_type) {
                    let mut handled = None;
                    for (index, (handler, _)) in handlers.iter_mut().enumerate() {
                        if handler(&other) {
                            handled = Some(index);
                            break;
                        }
                    }
                    if let Some(index) = handled {
                        // One-time handlers remove themselves on success
                        if handlers[index].1 {
                            handlers.remove(index);
                        }
                        return;
                    }
                }

                self.driver_log().debug(|| {
                    format!("no handler for unsolicited {:?}", function_type)
                });
            }
        }
    }

    /// Routes an inbound CC: liveness bookkeeping, Transport Service
    /// reassembly, decapsulation, session assembly, persistence, and finally
    /// the per-CC handlers.
    pub(crate) fn handle_cc(&mut self, cc: WithAddress<CC>) {
        let source = cc.address().source_node_id;
        self.ensure_node(source);

        // Any traffic proves the node is there: Dead nodes come back alive,
        // sleeping nodes are awake while they talk to us
        let current = self.nodes.get(&source).map(|n| n.status);
        match current {
            Some(NodeStatus::Unknown) | Some(NodeStatus::Dead) | Some(NodeStatus::Asleep) => {
                let status = self
                    .nodes
                    .get(&source)
                    .map(|n| n.status_on_traffic())
                    .unwrap_or(NodeStatus::Alive);
                self.set_node_status(source, status);
            }
            _ => {}
        }

        self.node_log(source, cc.address().endpoint_index)
            .command(&cc, Direction::Inbound);

        // Transport Service segments feed the reassembly machine and never
        // reach the encapsulation pipeline directly
        if matches!(
            cc.as_ref(),
            CC::TransportServiceCCFirstSegment(_)
                | CC::TransportServiceCCSubsequentSegment(_)
                | CC::TransportServiceCCSegmentRequest(_)
                | CC::TransportServiceCCSegmentComplete(_)
                | CC::TransportServiceCCSegmentWait(_)
        ) {
            self.handle_transport_segment(cc);
            return;
        }

        let own_node_id = self.storage.own_node_id();
        let home_id = self.storage.home_id().unwrap_or_default();
        let security_class = self.effective_security_class(source);

        let decapsulated = match decapsulate(cc, own_node_id, home_id, security_class, &self.security)
        {
            Ok(decapsulated) => decapsulated,
            Err(EncapsulationError::Security2(
                error @ (S2DecryptError::NoSpan | S2DecryptError::CannotDecode),
            )) => {
                self.handle_s2_decode_failure(source, error);
                return;
            }
            Err(EncapsulationError::MultiCommandNotSupported) => {
                self.node_log(source, EndpointIndex::Root)
                    .error(|| "rejecting Multi Command encapsulation");
                return;
            }
            Err(e) => {
                self.node_log(source, EndpointIndex::Root)
                    .error(|| format!("failed to unwrap command: {}", e));
                return;
            }
        };
        let Decapsulated { cc, supervision } = decapsulated;

        // Commands split across multiple frames are buffered until complete
        if CCSession::session_id(cc.as_ref()).is_some() {
            let parse_ctx = CCParsingContext::builder()
                .source_node_id(source)
                .own_node_id(own_node_id)
                .build();
            let flags = cc.flags();
            let address = cc.address().clone();
            match self.sessions.handle(source, cc.unwrap(), &parse_ctx) {
                Ok(Some(merged)) => {
                    let mut merged = merged.with_address(address);
                    merged.set_flags(flags);
                    // The merged command may still carry encapsulation
                    self.handle_decapsulated_cc(merged, supervision);
                }
                Ok(None) => {
                    // More frames are expected
                }
                Err(e) => {
                    self.node_log(source, EndpointIndex::Root)
                        .error(|| format!("failed to merge partial commands: {}", e));
                }
            }
            return;
        }

        self.handle_decapsulated_cc(cc, supervision);
    }

    /// The inner disposition after all wrappers are stripped
    fn handle_decapsulated_cc(
        &mut self,
        cc: WithAddress<CC>,
        supervision: Option<SupervisionWrap>,
    ) {
        let source = cc.address().source_node_id;

        // A merged S0 session may still need one more unwrap round
        if matches!(cc.as_ref(), CC::SecurityCCCommandEncapsulation(_)) {
            let own_node_id = self.storage.own_node_id();
            let home_id = self.storage.home_id().unwrap_or_default();
            let security_class = self.effective_security_class(source);
            match decapsulate(cc, own_node_id, home_id, security_class, &self.security) {
                Ok(Decapsulated {
                    cc,
                    supervision: inner_supervision,
                }) => {
                    self.handle_decapsulated_cc(cc, supervision.or(inner_supervision));
                }
                Err(e) => {
                    self.node_log(source, EndpointIndex::Root)
                        .error(|| format!("failed to unwrap merged command: {}", e));
                }
            }
            return;
        }

        // Discard commands that must be secure but arrived in the clear
        let insecure = {
            let node = self.nodes.get(&source);
            node.is_some_and(|n| {
                n.highest_security_class
                    .is_some_and(|c| c != SecurityClass::None)
                    && n.secure_ccs.contains(&cc.cc_id())
                    && !cc.flags().contains(EncapsulationFlags::SECURITY)
            })
        };
        if insecure {
            self.node_log(source, cc.address().endpoint_index)
                .warn(|| format!("discarding insecure {}", cc.cc_id()));
            return;
        }

        self.persist_cc_values(&cc);

        // Nonce material is stored before anyone gets to observe the CC, so
        // a waiting encapsulation sees it immediately
        let handled = self.handle_security_cc(&cc);

        // A pending wait_for_command awaiter comes before generic routing
        if let Some(channel) = self.awaited_ccs.take_matching(&cc) {
            let _ = channel.send(Ok(cc.clone()));
            self.reply_supervision(source, &cc, supervision, true);
            return;
        }

        if handled {
            self.reply_supervision(source, &cc, supervision, true);
            return;
        }

        let accepted = self.route_cc(&cc);
        self.reply_supervision(source, &cc, supervision, accepted);
    }

    /// Stores nonces and entropy inputs carried by security CCs and answers
    /// nonce requests. Returns whether the CC is fully handled here.
    fn handle_security_cc(&mut self, cc: &WithAddress<CC>) -> bool {
        let source = cc.address().source_node_id;
        match cc.as_ref() {
            // S0: hand out a fresh nonce
            CC::SecurityCCNonceGet(_) => {
                self.send_s0_nonce_report(source);
                true
            }

            // S0: the peer answered our Nonce Get
            CC::SecurityCCNonceReport(report) => {
                if let Some(s0) = &self.security.s0 {
                    let own_node_id = self.storage.own_node_id();
                    s0.lock().unwrap().set_nonce(
                        source,
                        own_node_id,
                        report.nonce.clone(),
                        true,
                    );
                }
                // Awaiters may still want to see it
                false
            }

            // S2: hand out a fresh entropy input
            CC::Security2CCNonceGet(_) => {
                self.send_s2_nonce_report(source);
                true
            }

            // S2: the peer sent its receiver entropy input
            CC::Security2CCNonceReport(report) => {
                if report.span_os {
                    if let (Some(s2), Some(receiver_ei)) =
                        (&self.security.s2, &report.receiver_ei)
                    {
                        s2.lock()
                            .unwrap()
                            .set_remote_ei(source, receiver_ei.to_vec());
                    }
                }
                false
            }

            CC::DeviceResetLocallyCCNotification(_) => {
                self.node_log(source, EndpointIndex::Root)
                    .info(|| "device was reset locally, removing it");
                self.remove_node(source);
                true
            }

            CC::SupervisionCCReport(report) => {
                let consumed = self
                    .nodes
                    .get_mut(&source)
                    .is_some_and(|node| node.handle_supervision_report(report));
                consumed
            }

            _ => false,
        }
    }

    /// Hands an application command to its handlers. Returns whether anyone
    /// accepted it.
    fn route_cc(&mut self, cc: &WithAddress<CC>) -> bool {
        match cc.as_ref() {
            // The wake-up notification itself is fully handled by the
            // liveness transition that already happened
            CC::WakeUpCCWakeUpNotification(_) => true,
            CC::NotImplemented(_) => {
                self.node_log(cc.address().source_node_id, cc.address().endpoint_index)
                    .debug(|| "dropping unimplemented command");
                false
            }
            _ => {
                self.emit_event(DriverEvent::Unsolicited(cc.clone()));
                true
            }
        }
    }

    /// Answers a Supervision Get wrapper, mirroring the encapsulation of the
    /// command it acknowledged
    fn reply_supervision(
        &mut self,
        destination: NodeId,
        cc: &WithAddress<CC>,
        supervision: Option<SupervisionWrap>,
        accepted: bool,
    ) {
        let Some(supervision) = supervision else {
            return;
        };

        let report = SupervisionCCReport {
            session_id: supervision.session_id,
            more_updates_follow: false,
            status: if accepted {
                SupervisionStatus::Success
            } else {
                SupervisionStatus::NoSupport
            },
            duration: DurationReport::Seconds(0),
        };

        let flags = cc.flags();
        let address = CCAddress {
            source_node_id: self.storage.own_node_id(),
            destination: Destination::Singlecast(destination),
            endpoint_index: cc.address().endpoint_index,
        };
        let policy = WrapPolicy {
            own_node_id: self.storage.own_node_id(),
            home_id: self.storage.home_id().unwrap_or_default(),
            security_class: if flags.contains(EncapsulationFlags::SECURITY) {
                self.effective_security_class(destination)
            } else {
                None
            },
            use_crc16: flags.contains(EncapsulationFlags::CRC16),
            supervision: None,
        };

        match encapsulate(report.into(), &address, &policy, &self.security) {
            Ok(WrapOutcome::Ready(wrapped)) => {
                self.send_reply_cc(destination, wrapped, Priority::Supervision, None);
            }
            Ok(_) => {
                // No usable nonce right now; the node will repeat the Get
                self.node_log(destination, EndpointIndex::Root)
                    .warn(|| "cannot answer supervision without a nonce");
            }
            Err(e) => {
                self.node_log(destination, EndpointIndex::Root)
                    .error(|| format!("failed to wrap supervision report: {}", e));
            }
        }
    }

    fn send_s0_nonce_report(&mut self, destination: NodeId) {
        let Some(s0) = &self.security.s0 else {
            self.node_log(destination, EndpointIndex::Root)
                .warn(|| "received a Nonce Get but S0 is not configured");
            return;
        };
        let nonce = s0.lock().unwrap().generate_nonce(destination);
        self.send_reply_cc(
            destination,
            SecurityCCNonceReport { nonce }.into(),
            Priority::Nonce,
            None,
        );
    }

    fn send_s2_nonce_report(&mut self, destination: NodeId) {
        let Some(s2) = &self.security.s2 else {
            self.node_log(destination, EndpointIndex::Root)
                .warn(|| "received an S2 Nonce Get but S2 is not configured");
            return;
        };
        let (sequence_number, receiver_ei) = {
            let mut s2 = s2.lock().unwrap();
            let receiver_ei = S2SecurityManager::generate_ei();
            s2.set_local_ei(destination, receiver_ei.clone());
            (s2.next_sequence_number(), receiver_ei)
        };
        self.pending_nonce_reports
            .insert(destination, Instant::now());
        self.send_reply_cc(
            destination,
            Security2CCNonceReport::new_sos(sequence_number, receiver_ei).into(),
            Priority::Nonce,
            None,
        );
    }

    /// S2 decode failures are answered with a Nonce Report to resynchronize
    /// the SPAN, at most once per window. A repeated failure while a
    /// bootstrap is running aborts the bootstrap.
    fn handle_s2_decode_failure(&mut self, source: NodeId, error: S2DecryptError) {
        self.node_log(source, EndpointIndex::Root)
            .warn(|| format!("failed to decrypt S2 message: {}", error));

        if !self.pending_nonce_reports.contains_key(&source) {
            if let Some(s2) = &self.security.s2 {
                s2.lock().unwrap().reset_span(source);
            }
            self.send_s2_nonce_report(source);
            return;
        }

        // Already resynchronizing. If this node is mid-bootstrap, give up.
        let mid_bootstrap = self
            .security
            .s2
            .as_ref()
            .is_some_and(|s2| s2.lock().unwrap().has_temp_key());
        if mid_bootstrap {
            self.node_log(source, EndpointIndex::Root)
                .error(|| "aborting S2 bootstrap after repeated decode failures");
            if let Some(s2) = &self.security.s2 {
                s2.lock().unwrap().retire_temp_key();
            }
            self.send_reply_cc(
                source,
                Security2CCKexFail {
                    fail_type: KexFailType::BootstrappingCanceled,
                }
                .into(),
                Priority::Nonce,
                None,
            );
        }
    }

    /// Feeds a Transport Service segment into the per-(node, session)
    /// reassembly machine and interprets its effects
    fn handle_transport_segment(&mut self, cc: WithAddress<CC>) {
        let source = cc.address().source_node_id;

        match cc.unwrap() {
            CC::TransportServiceCCFirstSegment(segment) => {
                let session_id = u8::from(segment.session_id);
                let node = self.ensure_node(source);
                // A first segment for a session that previously completed
                // implicitly closes it; the machine reinitializes itself
                let session = node
                    .transport_sessions
                    .entry(session_id)
                    .or_insert_with(|| TransportSession {
                        rx: TransportServiceRx::new(),
                        timer: None,
                    });
                let effects = session.rx.handle(TransportServiceRxInput::FirstSegment {
                    datagram_size: segment.datagram_size,
                    fragment: segment.fragment,
                });
                self.apply_transport_effects(source, session_id, effects);
            }

            CC::TransportServiceCCSubsequentSegment(segment) => {
                let session_id = u8::from(segment.session_id);
                let node = self.ensure_node(source);
                let Some(session) = node.transport_sessions.get_mut(&session_id) else {
                    // A lone subsequent segment: ask for the beginning
                    self.send_reply_cc(
                        source,
                        TransportServiceCCSegmentRequest {
                            session_id: segment.session_id,
                            datagram_offset: 0,
                        }
                        .into(),
                        Priority::Nonce,
                        None,
                    );
                    return;
                };
                let effects = session
                    .rx
                    .handle(TransportServiceRxInput::SubsequentSegment {
                        datagram_offset: segment.datagram_offset,
                        fragment: segment.fragment,
                    });
                self.apply_transport_effects(source, session_id, effects);
            }

            CC::TransportServiceCCSegmentRequest(request) => {
                self.retransmit_fragment(source, request.session_id, request.datagram_offset);
            }

            CC::TransportServiceCCSegmentComplete(_) => {
                if let Some(node) = self.nodes.get_mut(&source) {
                    node.last_tx_datagram = None;
                }
            }

            CC::TransportServiceCCSegmentWait(wait) => {
                self.node_log(source, EndpointIndex::Root).debug(|| {
                    format!(
                        "peer asks to wait, {} segments pending",
                        wait.pending_segments
                    )
                });
            }

            _ => unreachable!("caller matched transport service segments"),
        }
    }

    fn apply_transport_effects(
        &mut self,
        source: NodeId,
        session_id: u8,
        effects: Vec<TransportServiceRxEffect>,
    ) {
        let timeout = self.options.timeouts.request_missing_segment;
        for effect in effects {
            match effect {
                TransportServiceRxEffect::RequestSegment { datagram_offset } => {
                    self.send_reply_cc(
                        source,
                        TransportServiceCCSegmentRequest {
                            session_id: u4::new(session_id),
                            datagram_offset,
                        }
                        .into(),
                        Priority::Nonce,
                        None,
                    );
                }

                TransportServiceRxEffect::SendSegmentComplete => {
                    self.send_reply_cc(
                        source,
                        TransportServiceCCSegmentComplete {
                            session_id: u4::new(session_id),
                        }
                        .into(),
                        Priority::Nonce,
                        None,
                    );
                }

                TransportServiceRxEffect::StartMissingSegmentTimer => {
                    if let Some(session) = self
                        .nodes
                        .get_mut(&source)
                        .and_then(|n| n.transport_sessions.get_mut(&session_id))
                    {
                        session.timer = Some(Instant::now() + timeout);
                    }
                }

                TransportServiceRxEffect::StopMissingSegmentTimer => {
                    if let Some(session) = self
                        .nodes
                        .get_mut(&source)
                        .and_then(|n| n.transport_sessions.get_mut(&session_id))
                    {
                        session.timer = None;
                    }
                }

                TransportServiceRxEffect::DatagramReady(datagram) => {
                    // The reassembled datagram is a complete CC
                    if let Some(node) = self.nodes.get_mut(&source) {
                        node.transport_sessions.remove(&session_id);
                    }
                    let mut input = datagram;
                    let parse_ctx = CCParsingContext::builder()
                        .source_node_id(source)
                        .own_node_id(self.storage.own_node_id())
                        .build();
                    let parsed = CCRaw::parse(&mut input)
                        .and_then(|raw| CC::try_from_raw(raw, &parse_ctx));
                    match parsed {
                        Ok(inner) => {
                            let address = CCAddress {
                                source_node_id: source,
                                destination: Destination::Singlecast(
                                    self.storage.own_node_id(),
                                ),
                                endpoint_index: EndpointIndex::Root,
                            };
                            self.handle_cc(inner.with_address(address));
                        }
                        Err(e) => {
                            self.node_log(source, EndpointIndex::Root).error(|| {
                                format!("failed to parse reassembled datagram: {}", e)
                            });
                        }
                    }
                }
            }
        }
    }

    /// Fires the missing-segment timers of all reassembly sessions that are
    /// due, which makes them request their first missing segment
    pub(crate) fn handle_transport_timers(&mut self, now: Instant) {
        let due: Vec<(NodeId, u8)> = self
            .nodes
            .values()
            .flat_map(|node| {
                node.transport_sessions
                    .iter()
                    .filter(|(_, session)| session.timer.is_some_and(|at| at <= now))
                    .map(move |(session_id, _)| (node.node_id, *session_id))
            })
            .collect();

        for (node_id, session_id) in due {
            let Some(session) = self
                .nodes
                .get_mut(&node_id)
                .and_then(|n| n.transport_sessions.get_mut(&session_id))
            else {
                continue;
            };
            session.timer = None;
            let effects = session.rx.handle(TransportServiceRxInput::Timeout);
            self.apply_transport_effects(node_id, session_id, effects);
        }
    }

    /// Answers a Segment Request by retransmitting the requested fragment of
    /// the last outgoing datagram
    fn retransmit_fragment(&mut self, source: NodeId, session_id: u4, datagram_offset: u16) {
        let fragment = {
            let Some(node) = self.nodes.get(&source) else {
                return;
            };
            let Some((stored_session, datagram, fragment_size)) = &node.last_tx_datagram else {
                return;
            };
            if *stored_session != session_id {
                return;
            }
            let offset = datagram_offset as usize;
            if offset >= datagram.len() {
                return;
            }
            let end = (offset + fragment_size).min(datagram.len());
            let fragment = bytes::Bytes::copy_from_slice(&datagram[offset..end]);
            if offset == 0 {
                CC::from(TransportServiceCCFirstSegment {
                    datagram_size: datagram.len() as u16,
                    session_id,
                    fragment,
                })
            } else {
                CC::from(TransportServiceCCSubsequentSegment {
                    datagram_size: datagram.len() as u16,
                    session_id,
                    datagram_offset,
                    fragment,
                })
            }
        };
        self.send_reply_cc(source, fragment, Priority::Nonce, None);
    }

    /// Persists the values a CC carries into the in-memory cache and the
    /// on-disk value log
    fn persist_cc_values(&mut self, cc: &WithAddress<CC>) {
        let values = cc.to_values();
        if values.is_empty() {
            return;
        }
        let address = cc.address();
        for (value_id, value) in values {
            let key = EndpointValueId::new(
                address.source_node_id,
                address.endpoint_index,
                value_id,
            );
            self.storage.value_cache_mut().insert(key, value.clone());
            if let Some(cache) = &mut self.cache {
                cache.record_value(key, Some(value));
            }
        }
    }
}
