use crate::commandclass_raw::CCRaw;
use bytes::Bytes;
use enum_dispatch::enum_dispatch;
use std::ops::{BitOr, BitOrAssign, Deref, DerefMut};
use typed_builder::TypedBuilder;
use zwh_core::cache::CacheValue;
use zwh_core::prelude::*;
use zwh_core::submodule;
use zwh_core::value_id::ValueId;

submodule!(basic);
submodule!(crc16);
submodule!(device_reset_locally);
submodule!(multi_channel);
submodule!(multi_command);
submodule!(no_operation);
submodule!(security);
submodule!(security2);
submodule!(supervision);
submodule!(transport_service);
submodule!(wake_up);

#[derive(Default, Clone, TypedBuilder)]
#[builder(field_defaults(default))]
pub struct CCEncodingContext {
    pub node_id: NodeId,
    pub own_node_id: NodeId,
}

#[derive(Default, Clone, TypedBuilder)]
#[builder(field_defaults(default))]
pub struct CCParsingContext {
    pub source_node_id: NodeId,
    pub own_node_id: NodeId,
    #[builder(default, setter(into))]
    pub frame_addressing: Option<FrameAddressing>,
}

pub trait CCParsable
where
    Self: Sized + CCBase,
{
    fn parse(i: &mut Bytes, ctx: &CCParsingContext) -> ParseResult<Self>;
}

/// Records which wrappers have been applied to (or stripped from) a command,
/// so replies can mirror the encapsulation of the command they answer.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct EncapsulationFlags(u8);

impl EncapsulationFlags {
    pub const NONE: Self = Self(0);
    pub const SUPERVISION: Self = Self(1 << 0);
    pub const SECURITY: Self = Self(1 << 1);
    pub const CRC16: Self = Self(1 << 2);
    pub const MULTI_CHANNEL: Self = Self(1 << 3);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EncapsulationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EncapsulationFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for EncapsulationFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Self::SUPERVISION) {
            parts.push("Supervision");
        }
        if self.contains(Self::SECURITY) {
            parts.push("Security");
        }
        if self.contains(Self::CRC16) {
            parts.push("CRC16");
        }
        if self.contains(Self::MULTI_CHANNEL) {
            parts.push("MultiChannel");
        }
        write!(f, "EncapsulationFlags({})", parts.join(" | "))
    }
}

#[enum_dispatch(CC)]
/// Identifies a command class and its commands
pub trait CCId: CCBase {
    /// The command class identifier
    fn cc_id(&self) -> CommandClasses;

    /// The subcommand identifier, if applicable
    fn cc_command(&self) -> Option<u8>;
}

#[enum_dispatch(CC)]
pub trait CCValues {
    fn to_values(&self) -> Vec<(ValueId, CacheValue)> {
        // CCs which carry values should implement this. For all others, this is a no-op.
        vec![]
    }
}

#[enum_dispatch(CC)]
/// Command-specific functionality that may need to be implemented for each command
pub trait CCBase: CCValues + ToLogPayload + std::fmt::Debug + Sync + Send + Clone {
    /// Whether this CC expects a response
    fn expects_response(&self) -> bool {
        // Unless specified otherwise, assume that the CC doesn't
        false
    }

    /// If this CC expects a response, this function can be used to test whether
    /// the response is the expected one.
    fn test_response(&self, response: &CC) -> bool {
        let _ = response;
        // Unless specified otherwise, assume that the response is no match
        false
    }
}

/// The command classes this driver can represent. Parsing falls back to the
/// [NotImplemented] passthrough for known classes with unknown commands.
#[enum_dispatch]
#[derive(Debug, Clone, PartialEq)]
pub enum CC {
    NoOperationCC(NoOperationCC),
    BasicCCSet(BasicCCSet),
    BasicCCGet(BasicCCGet),
    BasicCCReport(BasicCCReport),
    WakeUpCCIntervalSet(WakeUpCCIntervalSet),
    WakeUpCCWakeUpNotification(WakeUpCCWakeUpNotification),
    WakeUpCCNoMoreInformation(WakeUpCCNoMoreInformation),
    DeviceResetLocallyCCNotification(DeviceResetLocallyCCNotification),
    SupervisionCCGet(SupervisionCCGet),
    SupervisionCCReport(SupervisionCCReport),
    MultiChannelCCCommandEncapsulation(MultiChannelCCCommandEncapsulation),
    MultiCommandCCCommandEncapsulation(MultiCommandCCCommandEncapsulation),
    Crc16CCCommandEncapsulation(Crc16CCCommandEncapsulation),
    SecurityCCNonceGet(SecurityCCNonceGet),
    SecurityCCNonceReport(SecurityCCNonceReport),
    SecurityCCCommandEncapsulation(SecurityCCCommandEncapsulation),
    Security2CCNonceGet(Security2CCNonceGet),
    Security2CCNonceReport(Security2CCNonceReport),
    Security2CCMessageEncapsulation(Security2CCMessageEncapsulation),
    Security2CCKexFail(Security2CCKexFail),
    TransportServiceCCFirstSegment(TransportServiceCCFirstSegment),
    TransportServiceCCSubsequentSegment(TransportServiceCCSubsequentSegment),
    TransportServiceCCSegmentRequest(TransportServiceCCSegmentRequest),
    TransportServiceCCSegmentComplete(TransportServiceCCSegmentComplete),
    TransportServiceCCSegmentWait(TransportServiceCCSegmentWait),
    NotImplemented(NotImplemented),
}

impl CC {
    pub fn try_from_raw(raw: CCRaw, ctx: &CCParsingContext) -> ParseResult<Self> {
        let cc_id = raw.cc_id;
        let cc_command = raw.cc_command;
        let mut i = raw.payload.clone();

        macro_rules! parse_cc {
            ($t:ident) => {
                $t::parse(&mut i, ctx).map(Self::from)
            };
        }

        use CommandClasses as C;
        let ret = match (cc_id, cc_command) {
            (C::NoOperation, None) => parse_cc!(NoOperationCC),
            (C::Basic, Some(c)) if c == BasicCCCommand::Set as u8 => parse_cc!(BasicCCSet),
            (C::Basic, Some(c)) if c == BasicCCCommand::Get as u8 => parse_cc!(BasicCCGet),
            (C::Basic, Some(c)) if c == BasicCCCommand::Report as u8 => parse_cc!(BasicCCReport),
            (C::WakeUp, Some(c)) if c == WakeUpCCCommand::IntervalSet as u8 => {
                parse_cc!(WakeUpCCIntervalSet)
            }
            (C::WakeUp, Some(c)) if c == WakeUpCCCommand::WakeUpNotification as u8 => {
                parse_cc!(WakeUpCCWakeUpNotification)
            }
            (C::WakeUp, Some(c)) if c == WakeUpCCCommand::NoMoreInformation as u8 => {
                parse_cc!(WakeUpCCNoMoreInformation)
            }
            (C::DeviceResetLocally, Some(c))
                if c == DeviceResetLocallyCCCommand::Notification as u8 =>
            {
                parse_cc!(DeviceResetLocallyCCNotification)
            }
            (C::Supervision, Some(c)) if c == SupervisionCCCommand::Get as u8 => {
                parse_cc!(SupervisionCCGet)
            }
            (C::Supervision, Some(c)) if c == SupervisionCCCommand::Report as u8 => {
                parse_cc!(SupervisionCCReport)
            }
            (C::MultiChannel, Some(c))
                if c == MultiChannelCCCommand::CommandEncapsulation as u8 =>
            {
                parse_cc!(MultiChannelCCCommandEncapsulation)
            }
            (C::MultiCommand, Some(c))
                if c == MultiCommandCCCommand::CommandEncapsulation as u8 =>
            {
                parse_cc!(MultiCommandCCCommandEncapsulation)
            }
            (C::CRC16Encapsulation, Some(c))
                if c == Crc16CCCommand::CommandEncapsulation as u8 =>
            {
                parse_cc!(Crc16CCCommandEncapsulation)
            }
            (C::Security, Some(c)) if c == SecurityCCCommand::NonceGet as u8 => {
                parse_cc!(SecurityCCNonceGet)
            }
            (C::Security, Some(c)) if c == SecurityCCCommand::NonceReport as u8 => {
                parse_cc!(SecurityCCNonceReport)
            }
            (C::Security, Some(c)) if c == SecurityCCCommand::CommandEncapsulation as u8 => {
                parse_cc!(SecurityCCCommandEncapsulation)
            }
            (C::Security2, Some(c)) if c == Security2CCCommand::NonceGet as u8 => {
                parse_cc!(Security2CCNonceGet)
            }
            (C::Security2, Some(c)) if c == Security2CCCommand::NonceReport as u8 => {
                parse_cc!(Security2CCNonceReport)
            }
            (C::Security2, Some(c)) if c == Security2CCCommand::MessageEncapsulation as u8 => {
                parse_cc!(Security2CCMessageEncapsulation)
            }
            (C::Security2, Some(c)) if c == Security2CCCommand::KexFail as u8 => {
                parse_cc!(Security2CCKexFail)
            }
            (C::TransportService, Some(c)) => parse_transport_service(c, &mut i, ctx),
            _ => Ok(Self::NotImplemented(NotImplemented {
                cc_id,
                cc_command,
                payload: i.clone(),
            })),
        };

        match ret {
            Ok(cc) => Ok(cc),
            // Unknown commands of known classes are carried as raw payloads
            Err(e) if e.is_not_implemented() => Ok(Self::NotImplemented(NotImplemented {
                cc_id,
                cc_command,
                payload: raw.payload,
            })),
            Err(e) => Err(e),
        }
    }

    pub fn as_raw(&self, ctx: &CCEncodingContext) -> CCRaw {
        macro_rules! to_raw {
            ($cc:expr) => {
                CCRaw {
                    cc_id: $cc.cc_id(),
                    cc_command: $cc.cc_command(),
                    payload: SerializableWith::<&CCEncodingContext>::as_bytes($cc, ctx),
                }
            };
        }

        match self {
            CC::NoOperationCC(cc) => to_raw!(cc),
            CC::BasicCCSet(cc) => to_raw!(cc),
            CC::BasicCCGet(cc) => to_raw!(cc),
            CC::BasicCCReport(cc) => to_raw!(cc),
            CC::WakeUpCCIntervalSet(cc) => to_raw!(cc),
            CC::WakeUpCCWakeUpNotification(cc) => to_raw!(cc),
            CC::WakeUpCCNoMoreInformation(cc) => to_raw!(cc),
            CC::DeviceResetLocallyCCNotification(cc) => to_raw!(cc),
            CC::SupervisionCCGet(cc) => to_raw!(cc),
            CC::SupervisionCCReport(cc) => to_raw!(cc),
            CC::MultiChannelCCCommandEncapsulation(cc) => to_raw!(cc),
            CC::MultiCommandCCCommandEncapsulation(cc) => to_raw!(cc),
            CC::Crc16CCCommandEncapsulation(cc) => to_raw!(cc),
            CC::SecurityCCNonceGet(cc) => to_raw!(cc),
            CC::SecurityCCNonceReport(cc) => to_raw!(cc),
            CC::SecurityCCCommandEncapsulation(cc) => to_raw!(cc),
            CC::Security2CCNonceGet(cc) => to_raw!(cc),
            CC::Security2CCNonceReport(cc) => to_raw!(cc),
            CC::Security2CCMessageEncapsulation(cc) => to_raw!(cc),
            CC::Security2CCKexFail(cc) => to_raw!(cc),
            CC::TransportServiceCCFirstSegment(cc) => to_raw!(cc),
            CC::TransportServiceCCSubsequentSegment(cc) => to_raw!(cc),
            CC::TransportServiceCCSegmentRequest(cc) => to_raw!(cc),
            CC::TransportServiceCCSegmentComplete(cc) => to_raw!(cc),
            CC::TransportServiceCCSegmentWait(cc) => to_raw!(cc),
            CC::NotImplemented(cc) => CCRaw {
                cc_id: cc.cc_id,
                cc_command: cc.cc_command,
                payload: cc.payload.clone(),
            },
        }
    }
}

impl ToLogPayload for CC {
    fn to_log_payload(&self) -> LogPayload {
        macro_rules! dispatch {
            ($($variant:ident),+ $(,)?) => {
                match self {
                    $(CC::$variant(cc) => cc.to_log_payload(),)+
                }
            };
        }
        dispatch!(
            NoOperationCC,
            BasicCCSet,
            BasicCCGet,
            BasicCCReport,
            WakeUpCCIntervalSet,
            WakeUpCCWakeUpNotification,
            WakeUpCCNoMoreInformation,
            DeviceResetLocallyCCNotification,
            SupervisionCCGet,
            SupervisionCCReport,
            MultiChannelCCCommandEncapsulation,
            MultiCommandCCCommandEncapsulation,
            Crc16CCCommandEncapsulation,
            SecurityCCNonceGet,
            SecurityCCNonceReport,
            SecurityCCCommandEncapsulation,
            Security2CCNonceGet,
            Security2CCNonceReport,
            Security2CCMessageEncapsulation,
            Security2CCKexFail,
            TransportServiceCCFirstSegment,
            TransportServiceCCSubsequentSegment,
            TransportServiceCCSegmentRequest,
            TransportServiceCCSegmentComplete,
            TransportServiceCCSegmentWait,
            NotImplemented,
        )
    }
}

/// Indicates that a CC can be split into multiple partial CCs
pub trait CCSession {
    /// If this CC can be split into multiple partial CCs, this function
    /// returns a unique way to identify which CCs are part of one session.
    fn session_id(&self) -> Option<u32>;

    /// If this CC can be split into multiple partial CCs, this function returns
    /// whether the session is complete (`true`) or more CCs are expected (`false`).
    fn is_session_complete(&self, other_ccs: &[CC]) -> bool;

    /// If this CC can be split into multiple partial CCs, this function merges the
    /// current CC with the other CCs of the session into a complete CC.
    fn merge_session(&mut self, ctx: &CCParsingContext, other_ccs: Vec<CC>) -> ParseResult<()>;
}

impl CCSession for CC {
    fn session_id(&self) -> Option<u32> {
        match self {
            CC::SecurityCCCommandEncapsulation(me) => me.session_id(),
            // By default, assume that the CC is not part of a session
            _ => None,
        }
    }

    fn is_session_complete(&self, other_ccs: &[CC]) -> bool {
        match self {
            CC::SecurityCCCommandEncapsulation(me) => me.is_session_complete(other_ccs),
            // By default we assume the CC is not part of a session and therefore the session is always complete
            _ => true,
        }
    }

    fn merge_session(&mut self, ctx: &CCParsingContext, other_ccs: Vec<CC>) -> ParseResult<()> {
        match self {
            CC::SecurityCCCommandEncapsulation(me) => me.merge_session(ctx, other_ccs)?,
            // By default we assume the CC is not part of a session, so it is already complete
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithAddress<T> {
    address: CCAddress,
    flags: EncapsulationFlags,
    command: T,
}

impl<T> WithAddress<T> {
    pub fn address(&self) -> &CCAddress {
        &self.address
    }

    pub fn set_address(&mut self, address: CCAddress) {
        self.address = address;
    }

    pub fn flags(&self) -> EncapsulationFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: EncapsulationFlags) {
        self.flags = flags;
    }

    pub fn or_flag(&mut self, flag: EncapsulationFlags) {
        self.flags |= flag;
    }

    pub fn with_destination(self, destination: Destination) -> Self {
        let mut address = self.address;
        address.destination = destination;

        Self { address, ..self }
    }

    pub fn with_endpoint_index(self, endpoint_index: EndpointIndex) -> Self {
        let mut address = self.address;
        address.endpoint_index = endpoint_index;

        Self { address, ..self }
    }

    pub fn unwrap(self) -> T {
        self.command
    }

    pub fn as_parts(&self) -> (&CCAddress, &T) {
        (&self.address, &self.command)
    }

    pub fn split(self) -> (CCAddress, T) {
        (self.address, self.command)
    }

    /// Replaces the carried command, keeping address and flags
    pub fn map_command<U>(self, command: U) -> WithAddress<U> {
        WithAddress {
            address: self.address,
            flags: self.flags,
            command,
        }
    }
}

impl<T> Deref for WithAddress<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.command
    }
}

impl<T> DerefMut for WithAddress<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.command
    }
}

impl<T> AsRef<T> for WithAddress<T> {
    fn as_ref(&self) -> &T {
        &self.command
    }
}

impl<T> AsMut<T> for WithAddress<T> {
    fn as_mut(&mut self) -> &mut T {
        &mut self.command
    }
}

impl<F> From<WithAddress<F>> for CC
where
    CC: From<F>,
    F: CCBase,
{
    fn from(val: WithAddress<F>) -> Self {
        Self::from(val.command)
    }
}

impl<T> ToLogPayload for WithAddress<T>
where
    T: CCBase,
{
    fn to_log_payload(&self) -> LogPayload {
        self.command.to_log_payload()
    }
}

pub trait CCAddressable {
    fn with_address(self, address: CCAddress) -> WithAddress<Self>
    where
        Self: Sized,
    {
        WithAddress {
            address,
            flags: EncapsulationFlags::NONE,
            command: self,
        }
    }

    fn with_destination(self, destination: Destination) -> WithAddress<Self>
    where
        Self: Sized,
    {
        self.with_address(CCAddress {
            destination,
            ..Default::default()
        })
    }
}

impl<T> CCAddressable for T where T: CCBase {}
impl CCAddressable for CCRaw {}

#[derive(Debug, Clone, PartialEq)]
pub struct CCAddress {
    /// The source node of this CC
    pub source_node_id: NodeId,
    /// The destination node(s) of this CC
    pub destination: Destination,
    /// Which endpoint of the node this CC belongs to
    pub endpoint_index: EndpointIndex,
}

impl Default for CCAddress {
    fn default() -> Self {
        // The default for the CC address is not terribly useful,
        // but it makes working with it less cumbersome
        Self {
            source_node_id: NodeId::unspecified(),
            destination: Destination::Singlecast(NodeId::unspecified()),
            endpoint_index: EndpointIndex::Root,
        }
    }
}

/// Defines the destination of a command class
#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    Singlecast(NodeId),
    Multicast(Vec<NodeId>),
    Broadcast,
}

macro_rules! impl_destination_conversions_for {
    ($t:ty) => {
        impl From<$t> for Destination {
            fn from(val: $t) -> Self {
                Self::Singlecast(val.into())
            }
        }

        impl PartialEq<$t> for Destination {
            fn eq(&self, other: &$t) -> bool {
                self == &Destination::from(*other)
            }
        }
    };
}

impl_destination_conversions_for!(u8);
impl_destination_conversions_for!(u16);
impl_destination_conversions_for!(NodeId);

impl From<&Destination> for FrameAddressing {
    fn from(value: &Destination) -> Self {
        match value {
            Destination::Singlecast(_) => FrameAddressing::Singlecast,
            Destination::Multicast(_) => FrameAddressing::Multicast,
            Destination::Broadcast => FrameAddressing::Broadcast,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotImplemented {
    pub cc_id: CommandClasses,
    pub cc_command: Option<u8>,
    pub payload: Bytes,
}

impl CCBase for NotImplemented {}

impl CCValues for NotImplemented {}

impl CCId for NotImplemented {
    fn cc_id(&self) -> CommandClasses {
        self.cc_id
    }

    fn cc_command(&self) -> Option<u8> {
        self.cc_command
    }
}

impl ToLogPayload for NotImplemented {
    fn to_log_payload(&self) -> LogPayload {
        let mut ret = LogPayloadDict::new().with_entry("command class", self.cc_id.to_string());
        if let Some(cc_command) = self.cc_command {
            ret = ret.with_entry("command", format!("{:#04x}", cc_command));
        }
        ret.with_entry("payload", format!("0x{}", hex::encode(&self.payload)))
            .into()
    }
}
