use thiserror::Error;
use zwh_cc::prelude::EncapsulationError;
use zwh_core::parse::ParseError;
use zwh_core::prelude::*;
use zwh_serial::prelude::*;

#[derive(Error, Debug)]
pub enum Error {
    // Driver lifecycle
    #[error("The driver is not ready")]
    NotReady,
    #[error("The driver was destroyed")]
    Destroyed,
    #[error("Invalid driver options: {0}")]
    InvalidOptions(String),
    #[error("No error handler is attached to the driver")]
    NoErrorHandler,
    #[error("The feature is disabled: {0}")]
    FeatureDisabled(&'static str),
    #[error("The driver failed: {0}")]
    Failed(String),

    // Scheduler
    #[error("The message was dropped")]
    MessageDropped,
    #[error("The message expired before it was sent")]
    MessageExpired,
    #[error("Timeout waiting for an ACK from the controller")]
    AckTimeout,
    #[error("Failed to send the message after repeated CAN")]
    Can,
    #[error("Failed to send the message after repeated NAK")]
    Nak,
    #[error("Timeout waiting for a response from the controller")]
    ResponseTimeout,
    #[error("The controller response indicated an error")]
    ResponseNOK(Message),
    #[error("Timeout waiting for a callback from the controller")]
    CallbackTimeout,
    #[error("The controller callback indicated an error")]
    CallbackNOK(Message),
    #[error("Node {0} did not respond")]
    NodeTimeout(NodeId),
    #[error("Node {0} was removed from the network")]
    NodeRemoved(NodeId),
    #[error("The interview was restarted")]
    InterviewRestarted,

    // Codec. Decode errors of inbound frames never surface here, they are
    // handled on the wire; this covers encoding of outgoing commands.
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Encapsulation(#[from] EncapsulationError),

    // Awaiters
    #[error("The operation timed out")]
    Timeout,
    #[error("Internal error")]
    Internal,
}

pub type Result<T> = std::result::Result<T, Error>;
