use super::queue::TransactionQueue;
use super::serial_api_machine::{
    SerialApiMachine, SerialApiMachineCondition, SerialApiMachineInput, SerialApiMachineResult,
    SerialApiMachineState,
};
use super::transaction::{Reducer, Transaction, TransactionReduction};
use crate::error::Error;
use crate::options::{Attempts, Timeouts};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use zwh_core::prelude::*;
use zwh_core::state_machine::{StateMachine, StateMachineTransition};
use zwh_core::wrapping_counter::WrappingCounter;
use zwh_serial::prelude::*;

/// ACK-level retries are independent of `attempts.controller`, which bounds
/// response-level retries only
const MAX_ACK_ATTEMPTS: u8 = 3;

/// What the scheduler wants its interpreter to do. Timers are communicated
/// through [SendScheduler::next_wakeup], not through effects.
#[derive(Debug)]
pub enum SchedulerEffect {
    /// Write this frame to the serial port
    Transmit(SerialFrame),
    /// The node exhausted its radio-level retries. The driver decides
    /// whether that means asleep or dead.
    NodeTimeout(NodeId),
    /// A transaction finished; used for wake-up bookkeeping
    TransactionSettled {
        node_id: Option<NodeId>,
        success: bool,
        tag: Option<String>,
    },
    /// The scheduler paused itself after a transaction that requested it
    Paused,
}

struct ActiveTransaction {
    transaction: Transaction,
    machine: SerialApiMachine,
    /// Retries caused by missing/negative ACKs
    ack_attempts: u8,
    /// Retries caused by response timeouts
    controller_attempts: u8,
    /// Radio-level retries of a SendData
    send_data_attempts: u8,
    /// When the current machine state times out
    timeout: Option<Instant>,
    /// When the next retransmission is due
    retry_at: Option<Instant>,
    /// Whether the last attempt ended without a callback, so a SendDataAbort
    /// must precede the retry
    abort_before_retry: bool,
}

impl ActiveTransaction {
    fn is_send_data(&self) -> bool {
        matches!(self.transaction.message, Message::SendDataRequest(_))
    }
}

/// The single consumer of the transaction queue. Owns the serial TX path:
/// exactly one transaction is in flight at any time, driven through the
/// ACK -> Response -> Callback machine with retries and backoff.
///
/// All methods take the current time as a parameter and timers are exposed
/// as data, so tests can drive the scheduler without waiting.
pub struct SendScheduler {
    queue: TransactionQueue,
    active: Option<ActiveTransaction>,
    paused: bool,
    /// Wake-up band transactions for these nodes stay queued until the node
    /// announces itself awake
    asleep_nodes: BTreeSet<NodeId>,
    callback_ids: WrappingCounter<u8>,
    timeouts: Timeouts,
    attempts: Attempts,
}

impl SendScheduler {
    pub fn new(timeouts: Timeouts, attempts: Attempts) -> Self {
        Self {
            queue: TransactionQueue::new(),
            active: None,
            paused: false,
            asleep_nodes: BTreeSet::new(),
            callback_ids: WrappingCounter::new(),
            timeouts,
            attempts,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn has_active_transaction(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether any work for the given node is queued or in flight
    pub fn has_pending_for_node(&self, node_id: NodeId) -> bool {
        if let Some(active) = &self.active {
            if active.transaction.node_id == Some(node_id) {
                return true;
            }
        }
        let mut found = false;
        self.queue.peek_all(&mut |t| {
            if t.node_id == Some(node_id) {
                found = true;
            }
        });
        found
    }

    /// Enqueues a transaction and starts it immediately if the path is free
    pub fn add(
        &mut self,
        transaction: Transaction,
        now: Instant,
        ctx: &MessageEncodingContext,
    ) -> Vec<SchedulerEffect> {
        let mut effects = Vec::new();
        self.queue.push(transaction);
        self.try_execute_next(now, ctx, &mut effects);
        effects
    }

    /// Holds back wake-up band traffic for this node until it wakes up
    pub fn set_node_asleep(&mut self, node_id: NodeId) {
        self.asleep_nodes.insert(node_id);
    }

    /// Releases the node's wake-up band traffic
    pub fn set_node_awake(&mut self, node_id: NodeId) {
        self.asleep_nodes.remove(&node_id);
    }

    /// Completes the current transaction but suspends dequeueing, e.g.
    /// around a soft reset
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn unpause(&mut self, now: Instant, ctx: &MessageEncodingContext) -> Vec<SchedulerEffect> {
        let mut effects = Vec::new();
        self.paused = false;
        self.try_execute_next(now, ctx, &mut effects);
        effects
    }

    /// Applies a reducer to every queued and active transaction.
    /// The active transaction is only touched while it is still pre-ACK;
    /// afterwards it is allowed to drain.
    pub fn reduce(
        &mut self,
        reducer: &Reducer,
        now: Instant,
        ctx: &MessageEncodingContext,
    ) -> Vec<SchedulerEffect> {
        let mut effects = Vec::new();
        self.queue.apply_reducer(reducer);

        let cancel_active = match &self.active {
            Some(active) => matches!(
                active.machine.state(),
                SerialApiMachineState::Initial | SerialApiMachineState::WaitingForACK
            ),
            None => false,
        };
        if cancel_active {
            let active = self.active.as_ref().expect("checked above");
            match reducer(&active.transaction) {
                TransactionReduction::Keep => {}
                TransactionReduction::Drop => {
                    self.settle_active(Err(Error::MessageDropped), &mut effects);
                }
                TransactionReduction::Reject(error) => {
                    self.settle_active(Err(error), &mut effects);
                }
                TransactionReduction::Resolve(message) => {
                    self.settle_active(Ok(message), &mut effects);
                }
                TransactionReduction::Requeue { priority, tag } => {
                    let mut active = self.active.take().expect("checked above");
                    if active.transaction.original_priority.is_none()
                        && priority != active.transaction.priority
                    {
                        active.transaction.original_priority =
                            Some(active.transaction.priority);
                    }
                    active.transaction.priority = priority;
                    if let Some(tag) = tag {
                        active.transaction.tag = Some(tag);
                    }
                    // The active transaction was dequeued first, so it goes
                    // back in front of its new band
                    self.queue.push_front(active.transaction);
                }
            }
        }

        self.try_execute_next(now, ctx, &mut effects);
        effects
    }

    /// Feeds an ACK/NAK/CAN from the controller
    pub fn handle_control_flow(
        &mut self,
        control_flow: ControlFlow,
        now: Instant,
        ctx: &MessageEncodingContext,
    ) -> Vec<SchedulerEffect> {
        let mut effects = Vec::new();
        let waiting_for_ack = self
            .active
            .as_ref()
            .is_some_and(|a| *a.machine.state() == SerialApiMachineState::WaitingForACK);
        if !waiting_for_ack {
            // Stray flow control, e.g. the ACK for an injected SendDataAbort
            return effects;
        }

        let input = match control_flow {
            ControlFlow::ACK => SerialApiMachineInput::ACK,
            ControlFlow::NAK => SerialApiMachineInput::NAK,
            ControlFlow::CAN => SerialApiMachineInput::CAN,
        };
        self.advance_machine(input, now, ctx, &mut effects);
        effects
    }

    /// Offers an inbound message to the active transaction. Returns the
    /// message back when it does not belong to it.
    pub fn handle_message(
        &mut self,
        message: Message,
        now: Instant,
        ctx: &MessageEncodingContext,
    ) -> (Option<Message>, Vec<SchedulerEffect>) {
        let mut effects = Vec::new();

        let input = {
            let Some(active) = &self.active else {
                return (Some(message), effects);
            };
            match active.machine.state() {
                SerialApiMachineState::WaitingForResponse
                    if active.transaction.message.test_response(&message) =>
                {
                    if message.is_ok() {
                        SerialApiMachineInput::Response(message)
                    } else {
                        SerialApiMachineInput::ResponseNOK(message)
                    }
                }
                SerialApiMachineState::WaitingForCallback
                    if active.transaction.message.test_callback(&message) =>
                {
                    if message.is_ok() {
                        SerialApiMachineInput::Callback(message)
                    } else {
                        SerialApiMachineInput::CallbackNOK(message)
                    }
                }
                // A mismatched callback id or unrelated message is not an
                // error; it is simply not ours
                _ => return (Some(message), effects),
            }
        };

        self.advance_machine(input, now, ctx, &mut effects);
        (None, effects)
    }

    /// Drives time forward: queued expirations, retry delays, state timeouts
    pub fn handle_time(
        &mut self,
        now: Instant,
        ctx: &MessageEncodingContext,
    ) -> Vec<SchedulerEffect> {
        let mut effects = Vec::new();

        self.queue.expire(now);

        let retry_due = self
            .active
            .as_ref()
            .and_then(|a| a.retry_at)
            .is_some_and(|at| at <= now);
        if retry_due {
            self.start_transmission(now, ctx, &mut effects);
        } else {
            let timeout_due = self
                .active
                .as_ref()
                .and_then(|a| a.timeout)
                .is_some_and(|at| at <= now);
            if timeout_due {
                self.advance_machine(SerialApiMachineInput::Timeout, now, ctx, &mut effects);
            }
        }

        self.try_execute_next(now, ctx, &mut effects);
        effects
    }

    /// When the scheduler next needs to be driven, if at all
    pub fn next_wakeup(&self) -> Option<Instant> {
        let mut ret = self.queue.next_expiration();
        if let Some(active) = &self.active {
            for deadline in [active.timeout, active.retry_at].into_iter().flatten() {
                ret = Some(match ret {
                    Some(existing) => existing.min(deadline),
                    None => deadline,
                });
            }
        }
        ret
    }

    fn try_execute_next(
        &mut self,
        now: Instant,
        ctx: &MessageEncodingContext,
        effects: &mut Vec<SchedulerEffect>,
    ) {
        if self.paused || self.active.is_some() {
            return;
        }
        let asleep = &self.asleep_nodes;
        let Some(transaction) = self.queue.pop_allowed(now, |t| {
            t.priority != super::transaction::Priority::WakeUp
                || !t.node_id.is_some_and(|node_id| asleep.contains(&node_id))
        }) else {
            return;
        };

        self.active = Some(ActiveTransaction {
            transaction,
            machine: SerialApiMachine::new(),
            ack_attempts: 0,
            controller_attempts: 0,
            send_data_attempts: 0,
            timeout: None,
            retry_at: None,
            abort_before_retry: false,
        });
        self.start_transmission(now, ctx, effects);
    }

    /// (Re)transmits the active transaction's message and restarts the
    /// transaction machine
    fn start_transmission(
        &mut self,
        now: Instant,
        ctx: &MessageEncodingContext,
        effects: &mut Vec<SchedulerEffect>,
    ) {
        // A pending abort is sent first, so the controller frees the
        // transmission path
        let abort = self
            .active
            .as_ref()
            .is_some_and(|active| active.abort_before_retry);
        if abort {
            let abort_msg: Message = SendDataAbortRequest::default().into();
            effects.push(SchedulerEffect::Transmit(SerialFrame::Message(
                abort_msg.as_raw(ctx),
            )));
        }

        let needs_callback_id = self
            .active
            .as_ref()
            .is_some_and(|a| a.transaction.message.needs_callback_id());
        // Each (re)transmission uses a fresh callback id so a stale callback
        // of a previous attempt cannot be mistaken for the new one
        let fresh_callback_id = needs_callback_id.then(|| self.callback_ids.increment());

        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.abort_before_retry = false;
        active.retry_at = None;

        if let Some(callback_id) = fresh_callback_id {
            active.transaction.message.set_callback_id(Some(callback_id));
        }

        let raw = active.transaction.message.as_raw(ctx);
        effects.push(SchedulerEffect::Transmit(SerialFrame::Message(raw)));

        active.machine = SerialApiMachine::new();
        let transition = active
            .machine
            .next(SerialApiMachineInput::Start, |_| false)
            .expect("starting the transaction machine cannot fail");
        active.machine.transition(transition.new_state());
        active.timeout = Some(now + self.timeouts.ack);
    }

    fn advance_machine(
        &mut self,
        input: SerialApiMachineInput,
        now: Instant,
        ctx: &MessageEncodingContext,
        effects: &mut Vec<SchedulerEffect>,
    ) {
        let result = {
            let Some(active) = self.active.as_mut() else {
                return;
            };
            if active.machine.done() {
                return;
            }

            let expects_response = active.transaction.message.expects_response();
            let expects_callback = active.transaction.message.expects_callback();
            let Some(transition) =
                active
                    .machine
                    .next(input, |condition: SerialApiMachineCondition| {
                        match condition {
                            SerialApiMachineCondition::ExpectsResponse => expects_response,
                            SerialApiMachineCondition::ExpectsCallback => expects_callback,
                        }
                    })
            else {
                return;
            };
            active.machine.transition(transition.new_state());

            match active.machine.state() {
                SerialApiMachineState::WaitingForResponse => {
                    active.timeout = Some(now + self.timeouts.response);
                    None
                }
                SerialApiMachineState::WaitingForCallback => {
                    active.timeout = Some(now + self.timeouts.send_data_callback);
                    None
                }
                SerialApiMachineState::Done(result) => Some(result.clone()),
                _ => None,
            }
        };

        if let Some(result) = result {
            self.handle_machine_result(result, now, ctx, effects);
        }
    }

    fn handle_machine_result(
        &mut self,
        result: SerialApiMachineResult,
        now: Instant,
        ctx: &MessageEncodingContext,
        effects: &mut Vec<SchedulerEffect>,
    ) {
        match result {
            SerialApiMachineResult::Success(message) => {
                self.settle_active(Ok(message), effects);
            }

            SerialApiMachineResult::ACKTimeout
            | SerialApiMachineResult::NAK
            | SerialApiMachineResult::CAN => {
                let active = self.active.as_mut().expect("machine result without active");
                active.ack_attempts += 1;
                if active.ack_attempts < MAX_ACK_ATTEMPTS {
                    let attempt = active.ack_attempts;
                    self.schedule_retry(attempt, now);
                } else {
                    let error = match result {
                        SerialApiMachineResult::NAK => Error::Nak,
                        SerialApiMachineResult::CAN => Error::Can,
                        _ => Error::AckTimeout,
                    };
                    self.settle_active(Err(error), effects);
                }
            }

            SerialApiMachineResult::ResponseTimeout => {
                let active = self.active.as_mut().expect("machine result without active");
                active.controller_attempts += 1;
                if active.controller_attempts < self.attempts.controller {
                    let attempt = active.controller_attempts;
                    self.schedule_retry(attempt, now);
                } else {
                    self.settle_active(Err(Error::ResponseTimeout), effects);
                }
            }

            SerialApiMachineResult::ResponseNOK(message) => {
                self.settle_active(Err(Error::ResponseNOK(message)), effects);
            }

            SerialApiMachineResult::CallbackTimeout => {
                self.retry_or_fail_send_data(true, None, now, effects);
            }

            SerialApiMachineResult::CallbackNOK(message) => {
                self.retry_or_fail_send_data(false, Some(message), now, effects);
            }
        }

        self.try_execute_next(now, ctx, effects);
    }

    /// The SendData retry path: refresh the callback id, inject an abort if
    /// the previous callback never arrived, back off, retransmit. Surfaces
    /// [Error::NodeTimeout] once the radio-level attempts are exhausted.
    fn retry_or_fail_send_data(
        &mut self,
        callback_missing: bool,
        callback: Option<Message>,
        now: Instant,
        effects: &mut Vec<SchedulerEffect>,
    ) {
        let active = self.active.as_mut().expect("machine result without active");

        if !active.is_send_data() {
            let error = match (callback_missing, callback) {
                (true, _) => Error::CallbackTimeout,
                (false, Some(message)) => Error::CallbackNOK(message),
                (false, None) => Error::CallbackTimeout,
            };
            self.settle_active(Err(error), effects);
            return;
        }

        active.send_data_attempts += 1;
        if active.send_data_attempts < self.attempts.send_data {
            active.abort_before_retry = callback_missing;
            let attempt = active.send_data_attempts;
            self.schedule_retry(attempt, now);
            return;
        }

        let node_id = active.transaction.node_id.unwrap_or_else(NodeId::unspecified);
        let notify = active.transaction.change_node_status_on_timeout;
        self.settle_active(Err(Error::NodeTimeout(node_id)), effects);
        if notify {
            effects.push(SchedulerEffect::NodeTimeout(node_id));
        }
    }

    fn schedule_retry(&mut self, attempt: u8, now: Instant) {
        let active = self.active.as_mut().expect("retry without active");
        active.timeout = None;
        active.retry_at = Some(now + retry_backoff(attempt));
    }

    fn settle_active(
        &mut self,
        result: super::transaction::TransactionResult,
        effects: &mut Vec<SchedulerEffect>,
    ) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        let success = result.is_ok();
        let node_id = active.transaction.node_id;
        let tag = active.transaction.tag.clone();
        let pause = active.transaction.pause_after_dispatch;
        active.transaction.settle(result);

        effects.push(SchedulerEffect::TransactionSettled {
            node_id,
            success,
            tag,
        });
        if pause {
            self.paused = true;
            effects.push(SchedulerEffect::Paused);
        }
    }
}

/// Delay before retrying a transmission; grows with the attempt count
fn retry_backoff(attempt: u8) -> Duration {
    Duration::from_millis(100 + attempt as u64 * 1000)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::transaction::{Priority, TransactionResult};
    use futures::channel::oneshot;
    use zwh_cc::prelude::*;

    fn scheduler() -> SendScheduler {
        SendScheduler::new(Timeouts::default(), Attempts::default())
    }

    fn send_data(
        scheduler: &mut SendScheduler,
        node_id: u8,
        priority: Priority,
        now: Instant,
        ctx: &MessageEncodingContext,
    ) -> (oneshot::Receiver<TransactionResult>, Vec<SchedulerEffect>) {
        let message: Message = SendDataRequest::builder()
            .node_id(node_id)
            .command(BasicCCSet { target_value: 1 }.into())
            .build()
            .into();
        let (transaction, rx) = Transaction::new(priority, message);
        let effects = scheduler.add(transaction, now, ctx);
        (rx, effects)
    }

    fn host_parse_ctx() -> MessageParsingContext {
        MessageParsingContext::builder()
            .origin(MessageOrigin::Host)
            .build()
    }

    fn transmitted_message(effects: &[SchedulerEffect]) -> Option<Message> {
        effects.iter().find_map(|e| match e {
            SchedulerEffect::Transmit(SerialFrame::Message(raw)) => {
                Message::try_from_raw(raw.clone(), &host_parse_ctx()).ok()
            }
            _ => None,
        })
    }

    fn callback_for(message: &Message, status: TransmitStatus) -> Message {
        let Message::SendDataRequest(request) = message else {
            panic!("expected a SendData request");
        };
        SendDataCallback {
            callback_id: request.callback_id,
            transmit_status: status,
            transmit_report: Default::default(),
        }
        .into()
    }

    /// Walks the active transaction through ACK + OK response
    fn ack_and_respond(
        scheduler: &mut SendScheduler,
        now: Instant,
        ctx: &MessageEncodingContext,
    ) {
        let effects = scheduler.handle_control_flow(ControlFlow::ACK, now, ctx);
        assert!(effects.is_empty());
        let (leftover, _) =
            scheduler.handle_message(SendDataResponse { was_sent: true }.into(), now, ctx);
        assert!(leftover.is_none());
    }

    #[test]
    fn test_at_most_one_in_flight() {
        let mut scheduler = scheduler();
        let ctx = MessageEncodingContext::default();
        let now = Instant::now();

        let (_rx1, effects1) = send_data(&mut scheduler, 2, Priority::Normal, now, &ctx);
        let (_rx2, effects2) = send_data(&mut scheduler, 3, Priority::Normal, now, &ctx);

        // Only the first transaction reached the wire
        assert!(transmitted_message(&effects1).is_some());
        assert!(effects2.is_empty());
        assert!(scheduler.has_active_transaction());
        assert_eq!(scheduler.queue_len(), 1);
    }

    #[test]
    fn test_complete_send_data_exchange() {
        let mut scheduler = scheduler();
        let ctx = MessageEncodingContext::default();
        let now = Instant::now();

        let (mut rx, effects) = send_data(&mut scheduler, 2, Priority::Normal, now, &ctx);
        let sent = transmitted_message(&effects).unwrap();

        ack_and_respond(&mut scheduler, now, &ctx);

        let callback = callback_for(&sent, TransmitStatus::Ok);
        let (leftover, effects) = scheduler.handle_message(callback, now, &ctx);
        assert!(leftover.is_none());
        assert!(effects.iter().any(|e| matches!(
            e,
            SchedulerEffect::TransactionSettled { success: true, .. }
        )));

        let result = rx.try_recv().unwrap().unwrap();
        assert!(matches!(result, Ok(Some(Message::SendDataCallback(_)))));
        assert!(!scheduler.has_active_transaction());
    }

    #[test]
    fn test_mismatched_callback_is_ignored() {
        let mut scheduler = scheduler();
        let ctx = MessageEncodingContext::default();
        let now = Instant::now();

        let (_rx, effects) = send_data(&mut scheduler, 2, Priority::Normal, now, &ctx);
        let sent = transmitted_message(&effects).unwrap();
        ack_and_respond(&mut scheduler, now, &ctx);

        // A callback with a different id must be handed back as unsolicited
        let stray: Message = SendDataCallback {
            callback_id: Some(0xEE),
            transmit_status: TransmitStatus::Ok,
            transmit_report: Default::default(),
        }
        .into();
        let (leftover, _) = scheduler.handle_message(stray, now, &ctx);
        assert!(leftover.is_some());

        // The real callback still settles the transaction
        let callback = callback_for(&sent, TransmitStatus::Ok);
        let (leftover, _) = scheduler.handle_message(callback, now, &ctx);
        assert!(leftover.is_none());
    }

    #[test]
    fn test_no_ack_exhausts_into_node_timeout() {
        let mut scheduler = scheduler();
        let ctx = MessageEncodingContext::default();
        let mut now = Instant::now();

        let (mut rx, effects) = send_data(&mut scheduler, 5, Priority::Normal, now, &ctx);
        let mut sent = transmitted_message(&effects).unwrap();

        // Each attempt: ACK + response, then a NoAck callback
        for attempt in 1..=3 {
            ack_and_respond(&mut scheduler, now, &ctx);
            let callback = callback_for(&sent, TransmitStatus::NoAck);
            let (_, effects) = scheduler.handle_message(callback, now, &ctx);

            if attempt < 3 {
                // A retry is scheduled; drive time past the backoff
                let retry_at = scheduler.next_wakeup().unwrap();
                now = retry_at + Duration::from_millis(1);
                let effects = scheduler.handle_time(now, &ctx);
                sent = transmitted_message(&effects).unwrap();
            } else {
                assert!(effects.iter().any(|e| matches!(
                    e,
                    SchedulerEffect::NodeTimeout(node) if *node == NodeId::new(5u8)
                )));
            }
        }

        let result = rx.try_recv().unwrap().unwrap();
        assert!(matches!(result, Err(Error::NodeTimeout(node)) if node == NodeId::new(5u8)));
    }

    #[test]
    fn test_callback_timeout_injects_abort() {
        let mut scheduler = scheduler();
        let ctx = MessageEncodingContext::default();
        let now = Instant::now();

        let (_rx, _) = send_data(&mut scheduler, 5, Priority::Normal, now, &ctx);
        ack_and_respond(&mut scheduler, now, &ctx);

        // Let the callback time out
        let timeout_at = now + Timeouts::default().send_data_callback + Duration::from_millis(1);
        let effects = scheduler.handle_time(timeout_at, &ctx);
        assert!(effects.is_empty());

        // The retry transmits an abort before the retransmission
        let retry_at = scheduler.next_wakeup().unwrap() + Duration::from_millis(1);
        let effects = scheduler.handle_time(retry_at, &ctx);
        let transmitted: Vec<_> = effects
            .iter()
            .filter_map(|e| match e {
                SchedulerEffect::Transmit(SerialFrame::Message(raw)) => {
                    Message::try_from_raw(raw.clone(), &host_parse_ctx()).ok()
                }
                _ => None,
            })
            .collect();
        assert!(matches!(
            transmitted[0],
            Message::SendDataAbortRequest(_)
        ));
        assert!(matches!(transmitted[1], Message::SendDataRequest(_)));
    }

    #[test]
    fn test_callback_id_refreshed_on_retry() {
        let mut scheduler = scheduler();
        let ctx = MessageEncodingContext::default();
        let now = Instant::now();

        let (_rx, effects) = send_data(&mut scheduler, 5, Priority::Normal, now, &ctx);
        let first = transmitted_message(&effects).unwrap();
        ack_and_respond(&mut scheduler, now, &ctx);

        let callback = callback_for(&first, TransmitStatus::NoAck);
        let _ = scheduler.handle_message(callback, now, &ctx);

        let retry_at = scheduler.next_wakeup().unwrap() + Duration::from_millis(1);
        let effects = scheduler.handle_time(retry_at, &ctx);
        let second = transmitted_message(&effects).unwrap();

        let (Message::SendDataRequest(first), Message::SendDataRequest(second)) =
            (&first, &second)
        else {
            panic!("expected SendData requests");
        };
        assert_ne!(first.callback_id, second.callback_id);
    }

    #[test]
    fn test_asleep_requeue_preserves_order() {
        // Spec scenario: three Normal SendData to a sleeping node; after the
        // first fails, the remaining two move to the WakeUp band in order
        let mut scheduler = scheduler();
        let ctx = MessageEncodingContext::default();
        let mut now = Instant::now();

        let (mut rx1, effects) = send_data(&mut scheduler, 5, Priority::Normal, now, &ctx);
        let (_rx2, _) = send_data(&mut scheduler, 5, Priority::Normal, now, &ctx);
        let (_rx3, _) = send_data(&mut scheduler, 5, Priority::Normal, now, &ctx);
        let mut sent = transmitted_message(&effects).unwrap();

        // Fail the first transaction through all its attempts
        for attempt in 1..=3 {
            ack_and_respond(&mut scheduler, now, &ctx);
            let callback = callback_for(&sent, TransmitStatus::NoAck);
            let (_, effects) = scheduler.handle_message(callback, now, &ctx);
            if attempt < 3 {
                now = scheduler.next_wakeup().unwrap() + Duration::from_millis(1);
                let effects = scheduler.handle_time(now, &ctx);
                sent = transmitted_message(&effects).unwrap();
            } else {
                assert!(
                    effects
                        .iter()
                        .any(|e| matches!(e, SchedulerEffect::NodeTimeout(_)))
                );
            }
        }
        let result = rx1.try_recv().unwrap().unwrap();
        assert!(matches!(result, Err(Error::NodeTimeout(_))));

        // The driver reacts by pausing and requeueing the node's traffic
        scheduler.pause();
        let reducer: Reducer = Box::new(|t: &Transaction| {
            if t.node_id == Some(NodeId::new(5u8)) {
                TransactionReduction::Requeue {
                    priority: Priority::WakeUp,
                    tag: None,
                }
            } else {
                TransactionReduction::Keep
            }
        });
        scheduler.reduce(&reducer, now, &ctx);

        // A wake-up ping for another node arrives later and must not
        // overtake the requeued transactions
        let (_rx4, _) = send_data(&mut scheduler, 6, Priority::WakeUp, now, &ctx);

        let effects = scheduler.unpause(now, &ctx);
        let first = transmitted_message(&effects).unwrap();
        assert_eq!(first.node_id(), Some(NodeId::new(5u8)));
    }

    #[test]
    fn test_expiring_transaction() {
        // Spec scenario: a transaction with a 200 ms expiration queued behind
        // a blocked queue is rejected without reaching the wire
        let mut scheduler = scheduler();
        let ctx = MessageEncodingContext::default();
        let now = Instant::now();

        scheduler.pause();

        let message: Message = SendDataRequest::builder()
            .node_id(7u8)
            .command(BasicCCGet::default().into())
            .build()
            .into();
        let (transaction, mut rx) = Transaction::new(Priority::Normal, message);
        let transaction = transaction.with_expiration(now + Duration::from_millis(200));
        let effects = scheduler.add(transaction, now, &ctx);
        assert!(effects.is_empty());

        assert_eq!(
            scheduler.next_wakeup(),
            Some(now + Duration::from_millis(200))
        );
        let effects = scheduler.handle_time(now + Duration::from_millis(200), &ctx);
        // No bytes were written for it
        assert!(
            !effects
                .iter()
                .any(|e| matches!(e, SchedulerEffect::Transmit(_)))
        );
        let result = rx.try_recv().unwrap().unwrap();
        assert!(matches!(result, Err(Error::MessageExpired)));
    }

    #[test]
    fn test_removal_purge_rejects_everything() {
        let mut scheduler = scheduler();
        let ctx = MessageEncodingContext::default();
        let now = Instant::now();

        let mut receivers = Vec::new();
        let priorities = [
            Priority::Controller,
            Priority::Ping,
            Priority::NodeQuery,
            Priority::Normal,
            Priority::Poll,
            Priority::WakeUp,
        ];
        // The first transaction becomes active, the rest stays queued
        for priority in priorities.iter().cycle().take(12) {
            let (rx, _) = send_data(&mut scheduler, 3, *priority, now, &ctx);
            receivers.push(rx);
        }

        let reducer: Reducer = Box::new(|t: &Transaction| {
            if t.node_id == Some(NodeId::new(3u8)) {
                TransactionReduction::Reject(Error::NodeRemoved(NodeId::new(3u8)))
            } else {
                TransactionReduction::Keep
            }
        });
        scheduler.reduce(&reducer, now, &ctx);

        for mut rx in receivers {
            let result = rx.try_recv().unwrap().unwrap();
            assert!(matches!(result, Err(Error::NodeRemoved(_))));
        }
        assert_eq!(scheduler.queue_len(), 0);
        assert!(!scheduler.has_active_transaction());
    }

    #[test]
    fn test_response_timeout_retries_up_to_controller_attempts() {
        let mut scheduler = scheduler();
        let ctx = MessageEncodingContext::default();
        let mut now = Instant::now();

        let message: Message = GetControllerVersionRequest::default().into();
        let (transaction, mut rx) = Transaction::new(Priority::Controller, message);
        scheduler.add(transaction, now, &ctx);

        for attempt in 1..=3 {
            let _ = scheduler.handle_control_flow(ControlFlow::ACK, now, &ctx);
            // No response arrives
            now += Timeouts::default().response + Duration::from_millis(1);
            let _ = scheduler.handle_time(now, &ctx);
            if attempt < 3 {
                // Drive past the retry backoff, the message is retransmitted
                now = scheduler.next_wakeup().unwrap() + Duration::from_millis(1);
                let effects = scheduler.handle_time(now, &ctx);
                assert!(transmitted_message(&effects).is_some());
            }
        }

        let result = rx.try_recv().unwrap().unwrap();
        assert!(matches!(result, Err(Error::ResponseTimeout)));
    }

    #[test]
    fn test_pause_after_dispatch() {
        let mut scheduler = scheduler();
        let ctx = MessageEncodingContext::default();
        let now = Instant::now();

        let message: Message = SoftResetRequest::default().into();
        let (mut transaction, _rx) = Transaction::new(Priority::Controller, message);
        transaction.pause_after_dispatch = true;
        let effects = scheduler.add(transaction, now, &ctx);
        assert!(transmitted_message(&effects).is_some());

        // Soft reset has no response: the ACK settles it and pauses the queue
        let effects = scheduler.handle_control_flow(ControlFlow::ACK, now, &ctx);
        assert!(effects.iter().any(|e| matches!(e, SchedulerEffect::Paused)));
        assert!(scheduler.is_paused());

        // Nothing is dequeued while paused
        let (_rx2, effects) = send_data(&mut scheduler, 2, Priority::Normal, now, &ctx);
        assert!(effects.is_empty());

        let effects = scheduler.unpause(now, &ctx);
        assert!(transmitted_message(&effects).is_some());
    }
}
