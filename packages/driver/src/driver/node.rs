use super::transaction::{Priority, Reducer, Transaction, TransactionReduction};
use crate::error::Error;
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;
use zwh_cc::prelude::*;
use zwh_core::prelude::*;
use ux::u4;
use zwh_core::wrapping_counter::WrappingCounter;
use zwh_serial::prelude::*;

/// The liveness state of a node as the driver sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Unknown,
    /// A mains powered node that responds
    Alive,
    /// A battery powered node that is currently listening
    Awake,
    /// A battery powered node between wake-ups
    Asleep,
    /// A mains powered node that stopped responding
    Dead,
}

/// One in-flight supervision session: the update callback is invoked for
/// every report until `more_updates_follow` is false
pub struct SupervisionUpdate {
    pub status: SupervisionStatus,
    pub more_updates_follow: bool,
    pub remaining_duration: DurationReport,
}

pub type SupervisionUpdateCallback = Box<dyn FnMut(SupervisionUpdate) + Send>;

/// One Transport Service reassembly in progress
pub struct TransportSession {
    pub rx: TransportServiceRx,
    /// When the missing-segment timer fires, if running
    pub timer: Option<Instant>,
}

/// Everything the driver core tracks about one node. Owned by the driver
/// actor in an arena keyed by node id; the outside only ever holds ids.
pub struct NodeStorage {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub can_sleep: bool,
    pub supports_wake_up: bool,
    pub keep_awake: bool,
    /// Wake up interval in seconds; 0 means the node never wakes on its own
    pub wake_up_interval: u32,
    pub highest_security_class: Option<SecurityClass>,
    pub supports_supervision: bool,
    pub supports_crc16: bool,
    /// The CCs this node requires to arrive securely
    pub secure_ccs: BTreeSet<CommandClasses>,
    pub cc_versions: HashMap<CommandClasses, u8>,

    supervision_sessions: HashMap<u8, SupervisionUpdateCallback>,
    supervision_session_ids: WrappingCounter<u8>,
    pub transport_sessions: HashMap<u8, TransportSession>,
    tx_session_ids: WrappingCounter<u8>,
    /// The last fragmented datagram sent to this node, kept for
    /// retransmission when a Segment Request arrives
    pub last_tx_datagram: Option<(u4, Vec<u8>, usize)>,

    /// When the node last completed a transaction; anchors the sleep debounce
    pub last_transaction_at: Option<Instant>,
    /// When to check whether the node can go back to sleep
    pub sleep_debounce_at: Option<Instant>,
}

/// Supervision session ids are 6 bits wide on the wire
const MAX_SUPERVISION_SESSION_ID: u8 = 0b0011_1111;
/// Transport Service session ids are 4 bits wide on the wire
const MAX_TRANSPORT_SESSION_ID: u8 = 0b0000_1111;

impl NodeStorage {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            status: NodeStatus::Unknown,
            can_sleep: false,
            supports_wake_up: false,
            keep_awake: false,
            wake_up_interval: 0,
            highest_security_class: None,
            supports_supervision: false,
            supports_crc16: false,
            secure_ccs: BTreeSet::new(),
            cc_versions: HashMap::new(),
            supervision_sessions: HashMap::new(),
            supervision_session_ids: WrappingCounter::new_with_max(MAX_SUPERVISION_SESSION_ID),
            transport_sessions: HashMap::new(),
            tx_session_ids: WrappingCounter::new_with_max(MAX_TRANSPORT_SESSION_ID),
            last_tx_datagram: None,
            last_transaction_at: None,
            sleep_debounce_at: None,
        }
    }

    /// Updates the liveness state, returns whether it changed
    pub fn set_status(&mut self, status: NodeStatus) -> bool {
        if self.status == status {
            return false;
        }
        self.status = status;
        true
    }

    /// The state a failed transmission moves this node into
    pub fn status_on_timeout(&self) -> NodeStatus {
        if self.can_sleep {
            NodeStatus::Asleep
        } else {
            NodeStatus::Dead
        }
    }

    /// The state any received traffic moves this node into
    pub fn status_on_traffic(&self) -> NodeStatus {
        if self.can_sleep {
            NodeStatus::Awake
        } else {
            NodeStatus::Alive
        }
    }

    /// Registers a supervision session and returns its id
    pub fn register_supervision_session(&mut self, callback: SupervisionUpdateCallback) -> u8 {
        let session_id = self.supervision_session_ids.increment();
        self.supervision_sessions.insert(session_id, callback);
        session_id
    }

    /// Routes a Supervision Report to its session. The session ends when no
    /// more updates follow. Returns whether a session consumed the report.
    pub fn handle_supervision_report(&mut self, report: &SupervisionCCReport) -> bool {
        let Some(callback) = self.supervision_sessions.get_mut(&report.session_id) else {
            return false;
        };
        callback(SupervisionUpdate {
            status: report.status,
            more_updates_follow: report.more_updates_follow,
            remaining_duration: report.duration,
        });
        if !report.more_updates_follow {
            self.supervision_sessions.remove(&report.session_id);
        }
        true
    }

    pub fn has_supervision_session(&self, session_id: u8) -> bool {
        self.supervision_sessions.contains_key(&session_id)
    }

    /// The session id for the next outgoing fragmented datagram
    pub fn next_transport_session_id(&mut self) -> u4 {
        u4::new(self.tx_session_ids.increment())
    }

    /// Whether the sleep debounce may send a WakeUpNoMoreInformation now
    pub fn may_go_to_sleep(&self) -> bool {
        self.status == NodeStatus::Awake
            && self.supports_wake_up
            && self.wake_up_interval != 0
            && !self.keep_awake
    }
}

fn is_ping(transaction: &Transaction) -> bool {
    if transaction.priority == Priority::Ping {
        return true;
    }
    matches!(
        &transaction.message,
        Message::SendDataRequest(SendDataRequest {
            command: CC::NoOperationCC(_),
            ..
        })
    )
}

fn is_nonce_exchange(transaction: &Transaction) -> bool {
    matches!(
        transaction.priority,
        Priority::Nonce | Priority::Handshake | Priority::PreTransmitHandshake
    )
}

fn is_supervision_reply(transaction: &Transaction) -> bool {
    transaction.priority == Priority::Supervision
}

fn is_no_more_information(transaction: &Transaction) -> bool {
    matches!(
        &transaction.message,
        Message::SendDataRequest(SendDataRequest {
            command: CC::WakeUpCCNoMoreInformation(_),
            ..
        })
    )
}

pub const INTERVIEW_TAG: &str = "interview";

/// The reducer applied when a node transitions Awake -> Asleep:
/// time-critical traffic is dropped, interview traffic is requeued tagged,
/// everything else waits for the next wake-up.
pub fn node_asleep_reducer(node_id: NodeId) -> Reducer {
    Box::new(move |transaction: &Transaction| {
        if transaction.node_id != Some(node_id) {
            return TransactionReduction::Keep;
        }
        if is_ping(transaction)
            || is_nonce_exchange(transaction)
            || is_supervision_reply(transaction)
            || is_no_more_information(transaction)
        {
            // These are only meaningful while the node is listening
            return TransactionReduction::Drop;
        }
        if transaction.priority == Priority::NodeQuery {
            return TransactionReduction::Requeue {
                priority: Priority::WakeUp,
                tag: Some(INTERVIEW_TAG.to_string()),
            };
        }
        TransactionReduction::Requeue {
            priority: Priority::WakeUp,
            tag: None,
        }
    })
}

/// The reducer applied when a node transitions Asleep -> Awake: its queued
/// transactions return to their original priority, jumping ahead of the
/// wake-up band. Stale pings are dropped.
pub fn node_awake_reducer(node_id: NodeId) -> Reducer {
    Box::new(move |transaction: &Transaction| {
        if transaction.node_id != Some(node_id) {
            return TransactionReduction::Keep;
        }
        if is_ping(transaction) {
            return TransactionReduction::Drop;
        }
        if transaction.priority == Priority::WakeUp {
            return TransactionReduction::Requeue {
                priority: transaction.original_priority.unwrap_or(Priority::Normal),
                tag: None,
            };
        }
        TransactionReduction::Keep
    })
}

/// The reducer applied when a node is removed from the network
pub fn node_removed_reducer(node_id: NodeId) -> Reducer {
    Box::new(move |transaction: &Transaction| {
        if transaction.node_id == Some(node_id) {
            TransactionReduction::Reject(Error::NodeRemoved(node_id))
        } else {
            TransactionReduction::Keep
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_supervision_session_lifecycle() {
        let mut node = NodeStorage::new(NodeId::new(5u8));
        let updates = Arc::new(Mutex::new(Vec::new()));

        let updates_clone = updates.clone();
        let session_id = node.register_supervision_session(Box::new(move |update| {
            updates_clone.lock().unwrap().push(update.status);
        }));

        // A report with more updates keeps the session alive
        let report = SupervisionCCReport {
            session_id,
            more_updates_follow: true,
            status: SupervisionStatus::Working,
            duration: DurationReport::Seconds(10),
        };
        assert!(node.handle_supervision_report(&report));
        assert!(node.has_supervision_session(session_id));

        // The final report removes it
        let report = SupervisionCCReport {
            session_id,
            more_updates_follow: false,
            status: SupervisionStatus::Success,
            duration: DurationReport::Seconds(0),
        };
        assert!(node.handle_supervision_report(&report));
        assert!(!node.has_supervision_session(session_id));

        // An unknown session is not consumed
        assert!(!node.handle_supervision_report(&report));

        assert_eq!(
            updates.lock().unwrap().as_slice(),
            &[SupervisionStatus::Working, SupervisionStatus::Success]
        );
    }

    #[test]
    fn test_status_transitions() {
        let mut node = NodeStorage::new(NodeId::new(5u8));
        node.can_sleep = true;
        assert_eq!(node.status_on_timeout(), NodeStatus::Asleep);
        assert_eq!(node.status_on_traffic(), NodeStatus::Awake);

        node.can_sleep = false;
        assert_eq!(node.status_on_timeout(), NodeStatus::Dead);
        assert_eq!(node.status_on_traffic(), NodeStatus::Alive);
    }

    #[test]
    fn test_may_go_to_sleep() {
        let mut node = NodeStorage::new(NodeId::new(5u8));
        node.status = NodeStatus::Awake;
        node.supports_wake_up = true;
        node.wake_up_interval = 3600;
        assert!(node.may_go_to_sleep());

        node.keep_awake = true;
        assert!(!node.may_go_to_sleep());

        node.keep_awake = false;
        node.wake_up_interval = 0;
        assert!(!node.may_go_to_sleep());
    }
}
