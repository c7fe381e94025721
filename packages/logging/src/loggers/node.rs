use crate::{Direction, LocalImmutableLogger, LogInfo, Loglevel};
use std::borrow::Cow;
use zwh_core::log::{LogPayload, ToLogPayload};
use zwh_core::prelude::*;

pub struct NodeLogger<'a> {
    inner: &'a dyn LocalImmutableLogger,
    node_id: NodeId,
    endpoint: EndpointIndex,
}

const NODE_LOGLEVEL: Loglevel = Loglevel::Debug;

impl<'a> NodeLogger<'a> {
    pub fn new(inner: &'a dyn LocalImmutableLogger, node_id: NodeId, endpoint: EndpointIndex) -> Self {
        Self {
            inner,
            node_id,
            endpoint,
        }
    }

    fn primary_tags(&self) -> Vec<Cow<'static, str>> {
        let mut ret: Vec<Cow<'static, str>> = vec![format!("Node {}", self.node_id).into()];
        if let EndpointIndex::Endpoint(index) = self.endpoint {
            ret.push(format!("EP {}", index).into());
        }
        ret
    }

    /// Logs a command class exchanged with this node
    pub fn command(&self, cc: &impl ToLogPayload, direction: Direction) {
        if self.inner.log_level() < NODE_LOGLEVEL {
            return;
        }

        let log = LogInfo::builder()
            .label("CNTRLR")
            .direction(direction)
            .primary_tags(self.primary_tags())
            .payload(cc.to_log_payload())
            .build();
        self.inner.log(log, NODE_LOGLEVEL);
    }

    pub fn text<L: Into<Cow<'static, str>>>(&self, message: impl Fn() -> L, level: Loglevel) {
        if self.inner.log_level() < level {
            return;
        }

        let message: Cow<'static, str> = message().into();
        let log = LogInfo::builder()
            .label("CNTRLR")
            .primary_tags(self.primary_tags())
            .payload(LogPayload::Text(message.into()))
            .build();
        self.inner.log(log, level);
    }

    pub fn error<L: Into<Cow<'static, str>>>(&self, message: impl Fn() -> L) {
        self.text(message, Loglevel::Error);
    }

    pub fn warn<L: Into<Cow<'static, str>>>(&self, message: impl Fn() -> L) {
        self.text(message, Loglevel::Warn);
    }

    pub fn info<L: Into<Cow<'static, str>>>(&self, message: impl Fn() -> L) {
        self.text(message, Loglevel::Info);
    }

    pub fn debug<L: Into<Cow<'static, str>>>(&self, message: impl Fn() -> L) {
        self.text(message, Loglevel::Debug);
    }
}
