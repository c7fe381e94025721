use crate::LogReceiver;
use crate::error::Result;
use crate::options::DriverOptions;
use futures::channel::{mpsc, oneshot};
use std::sync::Arc;
use std::time::Duration;
use zwh_cc::prelude::*;
use zwh_core::prelude::*;
use zwh_core::submodule;
use zwh_serial::prelude::*;

pub mod awaited;
pub mod cache;
pub mod node;
pub mod transaction;

mod queue;
mod scheduler;
mod serial_api_machine;
mod storage;

pub use scheduler::SchedulerEffect;
pub use serial_api_machine::SerialApiMachineResult;
pub use storage::DriverStorage;

submodule!(actor);
submodule!(dispatcher);
submodule!(handle);
submodule!(io);

#[cfg(test)]
mod test;

use awaited::AwaitedRegistry;
use node::NodeStatus;
use transaction::{Priority, TransactionResult};

pub(crate) type DriverInputSender = mpsc::Sender<DriverInput>;
pub(crate) type DriverInputReceiver = mpsc::Receiver<DriverInput>;

pub type DriverEventSender = mpsc::Sender<DriverEvent>;
pub type DriverEventReceiver = mpsc::Receiver<DriverEvent>;

type SerialFrameSender = mpsc::Sender<RawSerialFrame>;
type SerialFrameReceiver = mpsc::Receiver<RawSerialFrame>;

/// A handler for unsolicited requests of one function type. Handlers are
/// invoked in registration order until one returns `true`; one-shot handlers
/// remove themselves after handling a message.
pub type RequestHandler = Box<dyn FnMut(&Message) -> bool + Send>;

/// The externally supplied facts about a node the driver core cannot learn
/// by itself (normally the interview procedure fills these in)
#[derive(Debug, Default, Clone)]
pub struct NodeConfig {
    pub can_sleep: bool,
    pub supports_wake_up: bool,
    pub keep_awake: bool,
    pub wake_up_interval: u32,
    pub security_class: Option<SecurityClass>,
    pub supports_supervision: bool,
    pub supports_crc16: bool,
    pub secure_ccs: Vec<CommandClasses>,
}

/// Per-call options for [Driver::send_message]
#[derive(Clone, Default)]
pub struct SendMessageOptions {
    pub priority: Option<Priority>,
    pub tag: Option<String>,
    pub expires_in: Option<Duration>,
    pub pause_after_dispatch: bool,
    pub change_node_status_on_timeout: bool,
}

/// Per-call options for [Driver::send_command]
#[derive(Clone, Default)]
pub struct SendCommandOptions {
    pub priority: Option<Priority>,
    pub endpoint: EndpointIndex,
    /// Request supervision even if the command is not a known SET-type
    pub use_supervision: bool,
    pub expires_in: Option<Duration>,
}

/// The answer to an encapsulate-and-send request: either the transaction is
/// on its way, or a security handshake must happen first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendCommandStatus {
    Enqueued,
    NeedsS0Nonce,
    NeedsS2Nonce,
}

pub(crate) enum DriverInput {
    /// Enqueue a raw message as a transaction
    EnqueueTransaction {
        message: Message,
        options: SendMessageOptions,
        result_tx: oneshot::Sender<TransactionResult>,
        status_tx: oneshot::Sender<Result<()>>,
    },
    /// Encapsulate a CC per the node's capabilities and enqueue it
    EncapsulateAndSend {
        command: CC,
        destination: NodeId,
        options: SendCommandOptions,
        result_tx: oneshot::Sender<TransactionResult>,
        status_tx: oneshot::Sender<Result<SendCommandStatus>>,
    },
    RegisterRequestHandler {
        function_type: FunctionType,
        handler: RequestHandler,
        once: bool,
    },
    SetupNode {
        node_id: NodeId,
        config: NodeConfig,
    },
    RemoveNode {
        node_id: NodeId,
    },
    InitSecurityManagers,
    /// Open the persistent caches; requires the home id to be known
    OpenCache,
    /// Send a Nonce Get (S0) or S2 Nonce Get to prepare a secure
    /// transmission. The promise settles on radio-level completion.
    SendNonceGet {
        destination: NodeId,
        s2: bool,
        result_tx: oneshot::Sender<TransactionResult>,
    },
    /// Startup finished; mark ready and notify the application
    MarkReady,
    PauseSends,
    ResumeSends,
    Destroy {
        callback: oneshot::Sender<()>,
    },
    Log {
        log: zwh_logging::LogInfo,
        level: zwh_logging::Loglevel,
    },
}

#[derive(Debug)]
pub enum DriverEvent {
    /// The driver finished its startup sequence
    Ready,
    /// A fatal driver error; the application must call destroy
    Error(String),
    NodeAdded(NodeId),
    NodeRemoved(NodeId),
    NodeStatusChanged(NodeId, NodeStatus),
    /// An unsolicited command addressed to the application
    Unsolicited(WithAddress<CC>),
}

/// The cloneable external face of the driver
#[derive(Clone)]
pub struct Driver {
    input_tx: DriverInputSender,
    pub(crate) storage: Arc<DriverStorage>,
    awaited_messages: Arc<AwaitedRegistry<Message>>,
    awaited_ccs: Arc<AwaitedRegistry<WithAddress<CC>>>,
    options: Arc<DriverOptions>,
}

/// Channels connecting the driver to the serial IO pump and the application
pub struct DriverAdapter {
    /// Frames read from the serial port go here
    pub serial_in: SerialFrameSender,
    /// Frames the driver wants written to the serial port
    pub serial_out: SerialFrameReceiver,
    pub logs: LogReceiver,
    pub event_rx: DriverEventReceiver,
}

impl Driver {
    /// Creates the driver, its actor and the adapter channels. The actor
    /// must be run (`actor.run().await`) for anything to happen.
    pub fn new(mut options: DriverOptions) -> Result<(Self, DriverActor, DriverAdapter)> {
        options.apply_env();
        options.validate()?;

        let (serial_in_tx, serial_in_rx) = mpsc::channel(16);
        let (serial_out_tx, serial_out_rx) = mpsc::channel(16);
        let (log_tx, log_rx) = mpsc::channel(64);
        let (input_tx, input_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(16);

        let storage = Arc::new(DriverStorage::new(NodeIdType::NodeId8Bit));
        let awaited_messages = Arc::new(AwaitedRegistry::default());
        let awaited_ccs = Arc::new(AwaitedRegistry::default());
        let options = Arc::new(options);

        let driver = Driver {
            input_tx: input_tx.clone(),
            storage: storage.clone(),
            awaited_messages: awaited_messages.clone(),
            awaited_ccs: awaited_ccs.clone(),
            options: options.clone(),
        };

        let adapter = DriverAdapter {
            serial_in: serial_in_tx,
            serial_out: serial_out_rx,
            logs: log_rx,
            event_rx,
        };

        let actor = DriverActor::new(
            options,
            storage,
            awaited_messages,
            awaited_ccs,
            serial_in_rx,
            serial_out_tx,
            log_tx,
            input_tx,
            input_rx,
            event_tx,
        );

        Ok((driver, actor, adapter))
    }
}
