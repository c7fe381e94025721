use crate::message_raw::MessageRaw;
use bytes::Bytes;
use enum_dispatch::enum_dispatch;
use typed_builder::TypedBuilder;
use zwh_core::parse::ParseError;
use zwh_core::prelude::*;

mod application;
mod capability;
mod misc;
mod network_mgmt;
mod transport;

pub use application::*;
pub use capability::*;
pub use misc::*;
pub use network_mgmt::*;
pub use transport::*;

#[derive(Default, Clone, Copy, TypedBuilder)]
#[builder(field_defaults(default))]
pub struct MessageEncodingContext {
    pub own_node_id: NodeId,
    pub node_id_type: NodeIdType,
}

#[derive(Default, Clone, Copy, TypedBuilder)]
#[builder(field_defaults(default))]
pub struct MessageParsingContext {
    pub own_node_id: NodeId,
    pub node_id_type: NodeIdType,
    /// Who produced the frame being parsed; inbound traffic comes from the
    /// controller
    pub origin: MessageOrigin,
}

pub trait MessageParsable
where
    Self: Sized + MessageBase,
{
    fn parse(i: &mut Bytes, ctx: &MessageParsingContext) -> ParseResult<Self>;
}

#[enum_dispatch(Message)]
/// Functionality implemented by every message
pub trait MessageBase: std::fmt::Debug + Sync + Send + ToLogPayload {
    /// Whether the message indicates success. Failure responses/callbacks
    /// carry their message as error context.
    fn is_ok(&self) -> bool {
        true
    }

    /// The callback correlation token, if the message carries one
    fn callback_id(&self) -> Option<u8> {
        None
    }
}

#[enum_dispatch(Message)]
/// Identifies a message on the wire
pub trait MessageId: MessageBase {
    fn message_type(&self) -> MessageType;
    fn function_type(&self) -> FunctionType;
    fn origin(&self) -> MessageOrigin;
}

/// Additional behavior of messages the host sends to the controller
pub trait MessageRequest: MessageId {
    /// Whether the controller answers this request with an immediate response
    fn expects_response(&self) -> bool {
        false
    }

    fn test_response(&self, response: &Message) -> bool {
        let _ = response;
        false
    }

    /// Whether the controller sends an asynchronous callback for this request
    fn expects_callback(&self) -> bool {
        false
    }

    fn test_callback(&self, callback: &Message) -> bool {
        let _ = callback;
        false
    }

    /// Whether a callback id must be assigned before transmission
    fn needs_callback_id(&self) -> bool {
        false
    }

    fn set_callback_id(&mut self, callback_id: Option<u8>) {
        let _ = callback_id;
    }
}

/// The typed host <-> controller messages this driver implements
#[enum_dispatch]
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    GetControllerIdRequest(GetControllerIdRequest),
    GetControllerIdResponse(GetControllerIdResponse),
    GetControllerVersionRequest(GetControllerVersionRequest),
    GetControllerVersionResponse(GetControllerVersionResponse),
    SerialApiStartedRequest(SerialApiStartedRequest),
    ApplicationUpdateRequest(ApplicationUpdateRequest),
    SoftResetRequest(SoftResetRequest),
    RequestNodeInfoRequest(RequestNodeInfoRequest),
    RequestNodeInfoResponse(RequestNodeInfoResponse),
    ApplicationCommandRequest(ApplicationCommandRequest),
    BridgeApplicationCommandRequest(BridgeApplicationCommandRequest),
    SendDataRequest(SendDataRequest),
    SendDataResponse(SendDataResponse),
    SendDataCallback(SendDataCallback),
    SendDataAbortRequest(SendDataAbortRequest),
}

macro_rules! dispatch_all {
    ($self:ident, $msg:ident => $body:expr) => {
        match $self {
            Message::GetControllerIdRequest($msg) => $body,
            Message::GetControllerIdResponse($msg) => $body,
            Message::GetControllerVersionRequest($msg) => $body,
            Message::GetControllerVersionResponse($msg) => $body,
            Message::SerialApiStartedRequest($msg) => $body,
            Message::ApplicationUpdateRequest($msg) => $body,
            Message::SoftResetRequest($msg) => $body,
            Message::RequestNodeInfoRequest($msg) => $body,
            Message::RequestNodeInfoResponse($msg) => $body,
            Message::ApplicationCommandRequest($msg) => $body,
            Message::BridgeApplicationCommandRequest($msg) => $body,
            Message::SendDataRequest($msg) => $body,
            Message::SendDataResponse($msg) => $body,
            Message::SendDataCallback($msg) => $body,
            Message::SendDataAbortRequest($msg) => $body,
        }
    };
}

impl ToLogPayload for Message {
    fn to_log_payload(&self) -> LogPayload {
        dispatch_all!(self, msg => msg.to_log_payload())
    }
}

macro_rules! dispatch_request {
    ($self:ident, $msg:ident => $body:expr, $default:expr) => {
        match $self {
            Message::GetControllerIdRequest($msg) => $body,
            Message::GetControllerVersionRequest($msg) => $body,
            Message::SoftResetRequest($msg) => $body,
            Message::RequestNodeInfoRequest($msg) => $body,
            Message::SendDataRequest($msg) => $body,
            Message::SendDataAbortRequest($msg) => $body,
            _ => $default,
        }
    };
}

impl Message {
    pub fn try_from_raw(raw: MessageRaw, ctx: &MessageParsingContext) -> ParseResult<Self> {
        let Some(function_type) = raw.known_function_type() else {
            return Err(ParseError::not_implemented(format!(
                "unknown function type {:#04x}",
                raw.function_type
            )));
        };
        let mut i = raw.payload.clone();

        macro_rules! parse_message {
            ($t:ident) => {
                $t::parse(&mut i, ctx).map(Self::from)
            };
        }

        use FunctionType as F;
        use MessageType as M;
        match (function_type, raw.message_type) {
            (F::GetControllerId, M::Request) => parse_message!(GetControllerIdRequest),
            (F::GetControllerId, M::Response) => parse_message!(GetControllerIdResponse),
            (F::GetControllerVersion, M::Request) => parse_message!(GetControllerVersionRequest),
            (F::GetControllerVersion, M::Response) => parse_message!(GetControllerVersionResponse),
            (F::SerialApiStarted, M::Request) => parse_message!(SerialApiStartedRequest),
            (F::ApplicationUpdate, M::Request) => parse_message!(ApplicationUpdateRequest),
            (F::SoftReset, M::Request) => parse_message!(SoftResetRequest),
            (F::RequestNodeInfo, M::Request) => parse_message!(RequestNodeInfoRequest),
            (F::RequestNodeInfo, M::Response) => parse_message!(RequestNodeInfoResponse),
            (F::ApplicationCommand, M::Request) => parse_message!(ApplicationCommandRequest),
            (F::BridgeApplicationCommand, M::Request) => {
                parse_message!(BridgeApplicationCommandRequest)
            }
            // The SendData request function is ambiguous: the controller
            // sends the transmission callback under the same ids
            (F::SendData, M::Request) => match ctx.origin {
                MessageOrigin::Host => parse_message!(SendDataRequest),
                MessageOrigin::Controller => parse_message!(SendDataCallback),
            },
            (F::SendData, M::Response) => parse_message!(SendDataResponse),
            (F::SendDataAbort, M::Request) => parse_message!(SendDataAbortRequest),
            _ => Err(ParseError::not_implemented(format!(
                "no parser for {:?} {:?}",
                function_type, raw.message_type
            ))),
        }
    }

    pub fn as_raw(&self, ctx: &MessageEncodingContext) -> MessageRaw {
        macro_rules! to_raw {
            ($msg:expr) => {
                MessageRaw::new(
                    $msg.message_type(),
                    $msg.function_type(),
                    SerializableWith::<&MessageEncodingContext>::as_bytes($msg, ctx),
                )
            };
        }

        match self {
            Message::GetControllerIdRequest(msg) => to_raw!(msg),
            Message::GetControllerIdResponse(msg) => to_raw!(msg),
            Message::GetControllerVersionRequest(msg) => to_raw!(msg),
            Message::GetControllerVersionResponse(msg) => to_raw!(msg),
            Message::SerialApiStartedRequest(msg) => to_raw!(msg),
            Message::ApplicationUpdateRequest(msg) => to_raw!(msg),
            Message::SoftResetRequest(msg) => to_raw!(msg),
            Message::RequestNodeInfoRequest(msg) => to_raw!(msg),
            Message::RequestNodeInfoResponse(msg) => to_raw!(msg),
            Message::ApplicationCommandRequest(msg) => to_raw!(msg),
            Message::BridgeApplicationCommandRequest(msg) => to_raw!(msg),
            Message::SendDataRequest(msg) => to_raw!(msg),
            Message::SendDataResponse(msg) => to_raw!(msg),
            Message::SendDataCallback(msg) => to_raw!(msg),
            Message::SendDataAbortRequest(msg) => to_raw!(msg),
        }
    }

    // The request behavior, dispatched to the variants that implement
    // [MessageRequest]. All other variants are never sent as requests.

    pub fn expects_response(&self) -> bool {
        dispatch_request!(self, msg => msg.expects_response(), false)
    }

    pub fn test_response(&self, response: &Message) -> bool {
        dispatch_request!(self, msg => msg.test_response(response), false)
    }

    pub fn expects_callback(&self) -> bool {
        dispatch_request!(self, msg => msg.expects_callback(), false)
    }

    pub fn test_callback(&self, callback: &Message) -> bool {
        dispatch_request!(self, msg => msg.test_callback(callback), false)
    }

    pub fn needs_callback_id(&self) -> bool {
        dispatch_request!(self, msg => msg.needs_callback_id(), false)
    }

    pub fn set_callback_id(&mut self, callback_id: Option<u8>) {
        if let Message::SendDataRequest(msg) = self {
            msg.set_callback_id(callback_id);
        }
    }

    /// The node a message addresses or originates from, if any
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            Message::SendDataRequest(msg) => Some(msg.node_id),
            Message::RequestNodeInfoRequest(msg) => Some(msg.node_id),
            Message::ApplicationCommandRequest(msg) => {
                Some(msg.command.address().source_node_id)
            }
            Message::BridgeApplicationCommandRequest(msg) => {
                Some(msg.command.address().source_node_id)
            }
            _ => None,
        }
    }
}
