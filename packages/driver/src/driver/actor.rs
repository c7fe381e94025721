use super::awaited::AwaitedRegistry;
use super::cache::DriverCache;
use super::node::{self, NodeStatus, NodeStorage};
use super::scheduler::{SchedulerEffect, SendScheduler};
use super::storage::DriverStorage;
use super::transaction::{Priority, Transaction, TransactionResult};
use super::{
    DriverEvent, DriverEventSender, DriverInput, DriverInputReceiver, DriverInputSender,
    NodeConfig, RequestHandler, SendCommandOptions, SendCommandStatus, SendMessageOptions,
};
use crate::LogSender;
use crate::error::{Error, Result};
use crate::options::DriverOptions;
use futures::channel::{mpsc, oneshot};
use futures::{FutureExt, StreamExt, select_biased};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use zwh_cc::prelude::*;
use zwh_cc::session::PartialCCSessions;
use zwh_core::prelude::*;
use zwh_core::security::{
    S0SecurityManager, S0SecurityManagerOptions, S2SecurityManager, S2SecurityManagerOptions,
};
use zwh_core::util::MaybeSleep;
use zwh_logging::loggers::controller::ControllerLogger;
use zwh_logging::loggers::driver::DriverLogger;
use zwh_logging::loggers::node::NodeLogger;
use zwh_logging::loggers::serial::SerialLogger;
use zwh_logging::{Direction, LocalImmutableLogger, LogInfo, Loglevel};
use zwh_serial::prelude::*;

/// How long after a node's last successful transaction the driver checks
/// whether it may go back to sleep
const NODE_SLEEP_DEBOUNCE: Duration = Duration::from_millis(1000);

/// The tag on the WakeUpNoMoreInformation transaction the sleep debounce sends
pub(crate) const SLEEP_TAG: &str = "node-sleep";

/// The maximum CC size that fits a singlecast frame; larger commands are
/// fragmented through the Transport Service
const SEND_DATA_MTU: usize = 46;

pub struct DriverActor {
    pub(crate) options: Arc<DriverOptions>,
    pub(crate) storage: Arc<DriverStorage>,
    pub(crate) awaited_messages: Arc<AwaitedRegistry<Message>>,
    pub(crate) awaited_ccs: Arc<AwaitedRegistry<WithAddress<CC>>>,

    serial_in: mpsc::Receiver<RawSerialFrame>,
    serial_out: mpsc::Sender<RawSerialFrame>,
    log_queue: LogSender,
    #[allow(dead_code)]
    input_tx: DriverInputSender,
    input_rx: DriverInputReceiver,
    event_tx: DriverEventSender,

    pub(crate) scheduler: SendScheduler,
    pub(crate) nodes: BTreeMap<NodeId, NodeStorage>,
    pub(crate) security: SecurityManagers,
    pub(crate) sessions: PartialCCSessions,
    pub(crate) request_handlers: HashMap<FunctionType, Vec<(RequestHandler, bool)>>,
    /// Nodes we already answered with an S2 Nonce Report, so repeated decode
    /// failures within the window do not flood the queue
    pub(crate) pending_nonce_reports: BTreeMap<NodeId, Instant>,
    pub(crate) cache: Option<DriverCache>,
    destroyed: bool,
}

impl DriverActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        options: Arc<DriverOptions>,
        storage: Arc<DriverStorage>,
        awaited_messages: Arc<AwaitedRegistry<Message>>,
        awaited_ccs: Arc<AwaitedRegistry<WithAddress<CC>>>,
        serial_in: mpsc::Receiver<RawSerialFrame>,
        serial_out: mpsc::Sender<RawSerialFrame>,
        log_queue: LogSender,
        input_tx: DriverInputSender,
        input_rx: DriverInputReceiver,
        event_tx: DriverEventSender,
    ) -> Self {
        let scheduler = SendScheduler::new(options.timeouts, options.attempts);
        Self {
            options,
            storage,
            awaited_messages,
            awaited_ccs,
            serial_in,
            serial_out,
            log_queue,
            input_tx,
            input_rx,
            event_tx,
            scheduler,
            nodes: BTreeMap::new(),
            security: SecurityManagers::none(),
            sessions: PartialCCSessions::new(),
            request_handlers: HashMap::new(),
            pending_nonce_reports: BTreeMap::new(),
            cache: None,
            destroyed: false,
        }
    }

    pub async fn run(&mut self) {
        self.driver_log().info(|| "driver starting");

        while !self.destroyed {
            let now = Instant::now();
            let sleep_duration = self
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(now));
            let sleep = MaybeSleep::new(sleep_duration);

            select_biased! {
                // Inbound frames are handled before anything else, so the
                // controller can go back to what it was doing
                frame = self.serial_in.next() => {
                    match frame {
                        Some(frame) => self.handle_serial_frame(frame),
                        // The serial channel closed: the IO pump is gone
                        None => {
                            self.emit_event(DriverEvent::Error(
                                "serial connection lost".to_string(),
                            ));
                            break;
                        }
                    }
                },
                input = self.input_rx.next() => {
                    if let Some(input) = input {
                        self.handle_input(input);
                    }
                },
                _ = sleep.fuse() => {
                    self.handle_timers(Instant::now());
                }
            }
        }

        self.shutdown();
    }

    /// The earliest instant any of the driver's timers fires
    fn next_deadline(&self) -> Option<Instant> {
        let mut ret = self.scheduler.next_wakeup();
        let mut merge = |deadline: Option<Instant>| {
            if let Some(deadline) = deadline {
                ret = Some(match ret {
                    Some(existing) => existing.min(deadline),
                    None => deadline,
                });
            }
        };

        for node in self.nodes.values() {
            merge(node.sleep_debounce_at);
            for session in node.transport_sessions.values() {
                merge(session.timer);
            }
        }
        if let Some(cache) = &self.cache {
            merge(cache.next_flush(Instant::now()));
        }
        if let Some(first) = self.pending_nonce_reports.values().min() {
            merge(Some(*first + self.options.timeouts.nonce));
        }
        merge(self.awaited_messages.next_expiration());
        merge(self.awaited_ccs.next_expiration());

        ret
    }

    pub(crate) fn handle_input(&mut self, input: DriverInput) {
        match input {
            DriverInput::EnqueueTransaction {
                message,
                options,
                result_tx,
                status_tx,
            } => {
                let result = self.enqueue_transaction(message, options, result_tx);
                let _ = status_tx.send(result);
            }

            DriverInput::EncapsulateAndSend {
                command,
                destination,
                options,
                result_tx,
                status_tx,
            } => {
                let result = self.encapsulate_and_send(command, destination, options, result_tx);
                let _ = status_tx.send(result);
            }

            DriverInput::RegisterRequestHandler {
                function_type,
                handler,
                once,
            } => {
                self.request_handlers
                    .entry(function_type)
                    .or_default()
                    .push((handler, once));
            }

            DriverInput::SetupNode { node_id, config } => {
                self.setup_node(node_id, config);
            }

            DriverInput::RemoveNode { node_id } => {
                self.remove_node(node_id);
            }

            DriverInput::InitSecurityManagers => {
                self.init_security_managers();
            }

            DriverInput::OpenCache => {
                self.open_cache();
            }

            DriverInput::SendNonceGet {
                destination,
                s2,
                result_tx,
            } => {
                self.send_nonce_get(destination, s2, result_tx);
            }

            DriverInput::MarkReady => {
                self.storage.set_ready(true);
                self.emit_event(DriverEvent::Ready);
            }

            DriverInput::PauseSends => {
                self.scheduler.pause();
            }

            DriverInput::ResumeSends => {
                let now = Instant::now();
                let ctx = self.storage.encoding_context();
                let effects = self.scheduler.unpause(now, &ctx);
                self.run_scheduler_effects(effects);
            }

            DriverInput::Destroy { callback } => {
                self.destroyed = true;
                let _ = callback.send(());
            }

            DriverInput::Log { log, level } => {
                let _ = self.log_queue.try_send((log, level));
            }
        }
    }

    fn enqueue_transaction(
        &mut self,
        message: Message,
        options: SendMessageOptions,
        result_tx: oneshot::Sender<TransactionResult>,
    ) -> Result<()> {
        let now = Instant::now();
        let priority = options.priority.unwrap_or(Priority::Controller);

        let mut transaction = Transaction::with_promise(priority, message, result_tx);
        transaction.tag = options.tag;
        transaction.pause_after_dispatch = options.pause_after_dispatch;
        transaction.change_node_status_on_timeout = options.change_node_status_on_timeout;
        if let Some(expires_in) = options.expires_in {
            transaction.expires_at = Some(now + expires_in);
        }

        let ctx = self.storage.encoding_context();
        let effects = self.scheduler.add(transaction, now, &ctx);
        self.run_scheduler_effects(effects);
        Ok(())
    }

    /// Applies the encapsulation pipeline to a CC and enqueues the resulting
    /// SendData, fragmenting through the Transport Service when the wrapped
    /// command exceeds the MTU.
    fn encapsulate_and_send(
        &mut self,
        command: CC,
        destination: NodeId,
        options: SendCommandOptions,
        result_tx: oneshot::Sender<TransactionResult>,
    ) -> Result<SendCommandStatus> {
        let now = Instant::now();
        let own_node_id = self.storage.own_node_id();
        self.ensure_node(destination);

        let address = CCAddress {
            source_node_id: own_node_id,
            destination: Destination::Singlecast(destination),
            endpoint_index: options.endpoint,
        };

        let policy = self.wrap_policy(destination, &command, &options);
        let outcome = encapsulate(command, &address, &policy, &self.security)?;
        let wrapped = match outcome {
            WrapOutcome::Ready(wrapped) => wrapped,
            WrapOutcome::NeedsS0Nonce => return Ok(SendCommandStatus::NeedsS0Nonce),
            WrapOutcome::NeedsS2Nonce => return Ok(SendCommandStatus::NeedsS2Nonce),
        };

        let priority = options.priority.unwrap_or(Priority::Normal);
        let ctx = self.storage.encoding_context();
        let cc_ctx = CCEncodingContext::builder()
            .node_id(destination)
            .own_node_id(own_node_id)
            .build();
        let encoded = wrapped.as_raw(&cc_ctx).as_bytes();

        let mut effects = Vec::new();
        if encoded.len() > SEND_DATA_MTU {
            // Radio-level fragmentation: the datagram is the fully wrapped
            // command, each segment travels as its own SendData
            let node = self.nodes.get_mut(&destination).expect("ensured above");
            let session_id = node.next_transport_session_id();
            node.last_tx_datagram = Some((session_id, encoded.to_vec(), SEND_DATA_MTU));

            let segments =
                fragment_datagram(&encoded, session_id, SEND_DATA_MTU);
            let count = segments.len();
            let mut result_tx = Some(result_tx);
            for (index, segment) in segments.into_iter().enumerate() {
                let message: Message = SendDataRequest::builder()
                    .node_id(destination)
                    .command(segment)
                    .build()
                    .into();
                // The promise settles with the last segment
                let transaction = if index + 1 == count {
                    let mut t = Transaction::with_promise(
                        priority,
                        message,
                        result_tx.take().expect("only the last segment takes it"),
                    );
                    if let Some(expires_in) = options.expires_in {
                        t.expires_at = Some(now + expires_in);
                    }
                    t
                } else {
                    let (t, _rx) = Transaction::new(priority, message);
                    t
                };
                effects.extend(self.scheduler.add(transaction, now, &ctx));
            }
        } else {
            let message: Message = SendDataRequest::builder()
                .node_id(destination)
                .command(wrapped)
                .build()
                .into();
            let mut transaction = Transaction::with_promise(priority, message, result_tx);
            if let Some(expires_in) = options.expires_in {
                transaction.expires_at = Some(now + expires_in);
            }
            effects.extend(self.scheduler.add(transaction, now, &ctx));
        }

        self.run_scheduler_effects(effects);
        Ok(SendCommandStatus::Enqueued)
    }

    fn wrap_policy(
        &mut self,
        destination: NodeId,
        command: &CC,
        options: &SendCommandOptions,
    ) -> WrapPolicy {
        let own_node_id = self.storage.own_node_id();
        let home_id = self.storage.home_id().unwrap_or_default();
        let security_class = self.effective_security_class(destination);

        let node = self.nodes.get_mut(&destination).expect("node exists");
        let supervision = if is_set_type(command)
            && (options.use_supervision || node.supports_supervision)
        {
            Some(SupervisionWrap {
                session_id: node.register_supervision_session(Box::new(|_update| {
                    // The radio-level promise reports delivery; supervision
                    // progress is only logged here
                })),
                status_updates: false,
            })
        } else {
            None
        };

        WrapPolicy {
            own_node_id,
            home_id,
            security_class,
            use_crc16: security_class.is_none() && node.supports_crc16,
            supervision,
        }
    }

    /// Resolves the security level to use for a node: S2 classes take
    /// precedence over S0, a bootstrap temp key over everything
    pub(crate) fn effective_security_class(&self, node_id: NodeId) -> Option<SecurityClass> {
        let has_temp_key = self
            .security
            .s2
            .as_ref()
            .is_some_and(|s2| s2.lock().unwrap().has_temp_key());
        if has_temp_key {
            return Some(SecurityClass::Temporary);
        }

        let node = self.nodes.get(&node_id)?;
        match node.highest_security_class {
            Some(class) if class.is_s2() => {
                let has_key = self
                    .security
                    .s2
                    .as_ref()
                    .is_some_and(|s2| s2.lock().unwrap().has_key(&class));
                has_key.then_some(class)
            }
            Some(SecurityClass::S0Legacy) if self.security.s0.is_some() => {
                Some(SecurityClass::S0Legacy)
            }
            _ => None,
        }
    }

    fn setup_node(&mut self, node_id: NodeId, config: NodeConfig) {
        let added = !self.nodes.contains_key(&node_id);
        let node = self
            .nodes
            .entry(node_id)
            .or_insert_with(|| NodeStorage::new(node_id));
        node.can_sleep = config.can_sleep;
        node.supports_wake_up = config.supports_wake_up;
        node.keep_awake = config.keep_awake;
        node.wake_up_interval = config.wake_up_interval;
        node.highest_security_class = config.security_class;
        node.supports_supervision = config.supports_supervision;
        node.supports_crc16 = config.supports_crc16;
        node.secure_ccs = config.secure_ccs.iter().copied().collect();

        self.persist_node(node_id);
        if added {
            self.emit_event(DriverEvent::NodeAdded(node_id));
        }
    }

    /// Creates a node entry when traffic from an unknown node arrives
    pub(crate) fn ensure_node(&mut self, node_id: NodeId) -> &mut NodeStorage {
        if !self.nodes.contains_key(&node_id) {
            self.nodes.insert(node_id, NodeStorage::new(node_id));
            self.emit_event(DriverEvent::NodeAdded(node_id));
        }
        self.nodes.get_mut(&node_id).expect("just inserted")
    }

    /// Removes a node: every queued transaction for it is rejected, its
    /// sessions and nonce state are purged and its cache entries dropped.
    pub(crate) fn remove_node(&mut self, node_id: NodeId) {
        let now = Instant::now();
        let ctx = self.storage.encoding_context();

        let reducer = node::node_removed_reducer(node_id);
        let effects = self.scheduler.reduce(&reducer, now, &ctx);
        self.run_scheduler_effects(effects);

        self.nodes.remove(&node_id);
        self.scheduler.set_node_awake(node_id);
        self.sessions.purge_node(node_id);
        self.pending_nonce_reports.remove(&node_id);
        if let Some(s0) = &self.security.s0 {
            s0.lock().unwrap().delete_nonce_for_receiver(node_id);
        }
        if let Some(s2) = &self.security.s2 {
            s2.lock().unwrap().remove_peer(node_id);
        }
        if let Some(cache) = &mut self.cache {
            cache.record_node_removed(node_id);
        }

        self.emit_event(DriverEvent::NodeRemoved(node_id));
    }

    fn init_security_managers(&mut self) {
        let own_node_id = self.storage.own_node_id();
        let keys = &self.options.security_keys;
        let logger = self.driver_log();

        if let Some(s0_key) = &keys.s0_legacy {
            logger.info(|| "S0 network key configured, enabling the S0 security manager");
            self.security.s0 = Some(Arc::new(Mutex::new(S0SecurityManager::new(
                S0SecurityManagerOptions {
                    own_node_id,
                    network_key: s0_key.clone(),
                    nonce_timeout: self.options.timeouts.nonce,
                },
            ))));
        } else {
            logger.warn(|| {
                "No S0 network key configured, communication with S0 devices will not work"
            });
        }

        let s2_keys = [
            (SecurityClass::S2Unauthenticated, &keys.s2_unauthenticated),
            (SecurityClass::S2Authenticated, &keys.s2_authenticated),
            (SecurityClass::S2AccessControl, &keys.s2_access_control),
        ];
        if s2_keys.iter().any(|(_, key)| key.is_some()) {
            let mut manager = S2SecurityManager::new(S2SecurityManagerOptions { own_node_id });
            for (class, key) in s2_keys {
                if let Some(key) = key {
                    manager.set_network_key(class, key);
                }
            }
            self.driver_log()
                .info(|| "S2 network keys configured, enabling the S2 security manager");
            self.security.s2 = Some(Arc::new(Mutex::new(manager)));
        }
    }

    fn open_cache(&mut self) {
        let Some(cache_dir) = &self.options.storage.cache_dir else {
            return;
        };
        let Some(home_id) = self.storage.home_id() else {
            self.driver_log()
                .warn(|| "cannot open the cache before the home id is known");
            return;
        };

        match DriverCache::open(
            cache_dir,
            self.options.storage.lock_dir.as_deref(),
            home_id,
            self.options.storage.throttle,
            self.options.storage.clear_on_open,
        ) {
            Ok(cache) => {
                // Revive what a previous run knew about the network
                if let Ok(nodes) = cache.revive_nodes() {
                    for revived in nodes {
                        let node = self
                            .nodes
                            .entry(revived.node_id)
                            .or_insert_with(|| NodeStorage::new(revived.node_id));
                        node.can_sleep = revived.can_sleep;
                        node.supports_wake_up = revived.supports_wake_up;
                        node.highest_security_class = revived.security_class;
                        node.status = revived.status;
                    }
                }
                if let Ok(values) = cache.revive_values() {
                    self.storage.value_cache_mut().extend(values);
                }
                self.cache = Some(cache);
            }
            Err(e) => {
                // A missing cache is not fatal, the network is re-learned
                self.driver_log()
                    .error(|| format!("failed to open the cache: {}", e));
                self.emit_event(DriverEvent::Error(format!("cache error: {}", e)));
            }
        }
    }

    pub(crate) fn persist_node(&mut self, node_id: NodeId) {
        let Some(node) = self.nodes.get(&node_id) else {
            return;
        };
        if let Some(cache) = &mut self.cache {
            cache.record_node(
                node_id,
                node.can_sleep,
                node.supports_wake_up,
                node.highest_security_class,
                node.status,
            );
        }
    }

    /// Applies a node status change including the queue consequences:
    /// Awake -> Asleep moves traffic to the wake-up band, Asleep -> Awake
    /// brings it back ahead of the wake-up band.
    pub(crate) fn set_node_status(&mut self, node_id: NodeId, status: NodeStatus) {
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return;
        };
        let previous = node.status;
        if !node.set_status(status) {
            return;
        }

        let now = Instant::now();
        let ctx = self.storage.encoding_context();
        let effects = match (previous, status) {
            (_, NodeStatus::Asleep) => {
                // Gate the wake-up band before requeueing, so the requeued
                // transactions stay put until the node announces itself
                self.scheduler.set_node_asleep(node_id);
                let reducer = node::node_asleep_reducer(node_id);
                self.scheduler.reduce(&reducer, now, &ctx)
            }
            (NodeStatus::Asleep, NodeStatus::Awake) => {
                self.scheduler.set_node_awake(node_id);
                let reducer = node::node_awake_reducer(node_id);
                self.scheduler.reduce(&reducer, now, &ctx)
            }
            _ => Vec::new(),
        };
        self.run_scheduler_effects(effects);

        self.persist_node(node_id);
        self.emit_event(DriverEvent::NodeStatusChanged(node_id, status));
    }

    /// Interprets scheduler effects, feeding any follow-up effects back in
    pub(crate) fn run_scheduler_effects(&mut self, mut effects: Vec<SchedulerEffect>) {
        while !effects.is_empty() {
            let batch: Vec<SchedulerEffect> = effects.drain(..).collect();
            for effect in batch {
                match effect {
                    SchedulerEffect::Transmit(frame) => {
                        self.transmit(frame);
                    }

                    SchedulerEffect::NodeTimeout(node_id) => {
                        let Some(node) = self.nodes.get(&node_id) else {
                            continue;
                        };
                        let status = node.status_on_timeout();
                        self.set_node_status(node_id, status);
                    }

                    SchedulerEffect::TransactionSettled {
                        node_id,
                        success,
                        tag,
                    } => {
                        let Some(node_id) = node_id else { continue };
                        if tag.as_deref() == Some(SLEEP_TAG) && success {
                            // The node confirmed WakeUpNoMoreInformation
                            self.set_node_status(node_id, NodeStatus::Asleep);
                            continue;
                        }
                        if success {
                            if let Some(node) = self.nodes.get_mut(&node_id) {
                                let now = Instant::now();
                                node.last_transaction_at = Some(now);
                                if node.can_sleep {
                                    node.sleep_debounce_at = Some(now + NODE_SLEEP_DEBOUNCE);
                                }
                            }
                        }
                    }

                    SchedulerEffect::Paused => {}
                }
            }
        }
    }

    /// Writes a frame to the serial channel, logging it on the way
    pub(crate) fn transmit(&mut self, frame: SerialFrame) {
        let raw = match frame {
            SerialFrame::ControlFlow(byte) => {
                self.serial_log().control_flow(byte, Direction::Outbound);
                RawSerialFrame::ControlFlow(byte)
            }
            SerialFrame::Message(raw) => {
                let data = raw.as_bytes();
                self.serial_log().data(&data, Direction::Outbound);
                RawSerialFrame::Data(data)
            }
        };
        if self.serial_out.try_send(raw).is_err() {
            self.driver_log()
                .error(|| "failed to queue a frame for transmission");
        }
    }

    /// Prepares a secure transmission by requesting a nonce (S0) or an
    /// entropy input (S2) from the peer
    fn send_nonce_get(
        &mut self,
        destination: NodeId,
        s2: bool,
        result_tx: oneshot::Sender<TransactionResult>,
    ) {
        let command: CC = if s2 {
            let Some(manager) = &self.security.s2 else {
                let _ = result_tx.send(Err(Error::Encapsulation(
                    EncapsulationError::Security2(S2DecryptError::NotInitialized),
                )));
                return;
            };
            let sequence_number = manager.lock().unwrap().next_sequence_number();
            Security2CCNonceGet { sequence_number }.into()
        } else {
            if self.security.s0.is_none() {
                let _ = result_tx.send(Err(Error::Encapsulation(EncapsulationError::NoSecurity)));
                return;
            }
            SecurityCCNonceGet::default().into()
        };

        let message: Message = SendDataRequest::builder()
            .node_id(destination)
            .command(command)
            .build()
            .into();
        let mut transaction =
            Transaction::with_promise(Priority::PreTransmitHandshake, message, result_tx);
        transaction.change_node_status_on_timeout = true;

        let now = Instant::now();
        let ctx = self.storage.encoding_context();
        let effects = self.scheduler.add(transaction, now, &ctx);
        self.run_scheduler_effects(effects);
    }

    /// Enqueues a reply CC the driver sends on its own behalf (nonce
    /// reports, supervision reports, segment requests). The promise is
    /// intentionally detached.
    pub(crate) fn send_reply_cc(
        &mut self,
        destination: NodeId,
        command: CC,
        priority: Priority,
        tag: Option<&str>,
    ) {
        let message: Message = SendDataRequest::builder()
            .node_id(destination)
            .command(command)
            .build()
            .into();
        let (mut transaction, _rx) = Transaction::new(priority, message);
        transaction.change_node_status_on_timeout = false;
        if let Some(tag) = tag {
            transaction.tag = Some(tag.to_string());
        }

        let now = Instant::now();
        let ctx = self.storage.encoding_context();
        let effects = self.scheduler.add(transaction, now, &ctx);
        self.run_scheduler_effects(effects);
    }

    fn handle_timers(&mut self, now: Instant) {
        let ctx = self.storage.encoding_context();
        let effects = self.scheduler.handle_time(now, &ctx);
        self.run_scheduler_effects(effects);

        // Sleep debounce: nodes that finished their traffic may go to sleep
        let due: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.sleep_debounce_at.is_some_and(|at| at <= now))
            .map(|n| n.node_id)
            .collect();
        for node_id in due {
            let node = self.nodes.get_mut(&node_id).expect("listed above");
            node.sleep_debounce_at = None;
            if node.may_go_to_sleep() && !self.scheduler.has_pending_for_node(node_id) {
                self.send_reply_cc(
                    node_id,
                    WakeUpCCNoMoreInformation::default().into(),
                    Priority::WakeUp,
                    Some(SLEEP_TAG),
                );
            }
        }

        // Transport Service reassembly timers
        self.handle_transport_timers(now);

        // Awaiters whose deadline has passed settle with a timeout
        self.awaited_messages.expire(now);
        self.awaited_ccs.expire(now);

        // Expired S2 nonce report dedup entries
        let window = self.options.timeouts.nonce;
        self.pending_nonce_reports
            .retain(|_, sent_at| now.duration_since(*sent_at) < window);

        // S0 nonces expire on their own schedule
        if let Some(s0) = &self.security.s0 {
            s0.lock().unwrap().expire_nonces();
        }

        if let Some(cache) = &mut self.cache {
            if let Err(e) = cache.flush_if_due(now) {
                self.emit_event(DriverEvent::Error(format!("cache write failed: {}", e)));
            }
        }
    }

    /// On shutdown: cancel the scheduler first, then drain the awaiters,
    /// then flush and close the caches. The serial port is released by the
    /// IO pump when the channels drop.
    fn shutdown(&mut self) {
        let now = Instant::now();
        let ctx = self.storage.encoding_context();
        let reducer: super::transaction::Reducer =
            Box::new(|_t| super::transaction::TransactionReduction::Reject(Error::Destroyed));
        let effects = self.scheduler.reduce(&reducer, now, &ctx);
        // Settlements only; nothing new reaches the wire
        drop(effects);

        // Nobody will observe a matching value anymore
        self.awaited_messages.reject_all(|| Error::Destroyed);
        self.awaited_ccs.reject_all(|| Error::Destroyed);

        if let Some(mut cache) = self.cache.take() {
            if let Err(e) = cache.flush_all() {
                self.driver_log()
                    .error(|| format!("failed to flush the caches: {}", e));
            }
        }
        self.storage.set_ready(false);
        self.driver_log().info(|| "driver shut down");
    }

    pub(crate) fn emit_event(&mut self, event: DriverEvent) {
        let _ = self.event_tx.try_send(event);
    }

    pub(crate) fn driver_log(&self) -> DriverLogger<'_> {
        DriverLogger::new(self)
    }

    pub(crate) fn serial_log(&self) -> SerialLogger<'_> {
        SerialLogger::new(self)
    }

    pub(crate) fn controller_log(&self) -> ControllerLogger<'_> {
        ControllerLogger::new(self)
    }

    pub(crate) fn node_log(&self, node_id: NodeId, endpoint: EndpointIndex) -> NodeLogger<'_> {
        NodeLogger::new(self, node_id, endpoint)
    }
}

/// Whether a CC mutates state on the node, making it eligible for
/// Supervision encapsulation
fn is_set_type(command: &CC) -> bool {
    matches!(
        command,
        CC::BasicCCSet(_) | CC::WakeUpCCIntervalSet(_)
    )
}

impl LocalImmutableLogger for DriverActor {
    fn log(&self, log: LogInfo, level: Loglevel) {
        let _ = self.log_queue.clone().try_send((log, level));
    }

    fn log_level(&self) -> Loglevel {
        Loglevel::Debug
    }

    fn set_log_level(&self, _level: Loglevel) {}
}
