use crate::{Direction, LocalImmutableLogger, LogInfo, Loglevel};
use std::borrow::Cow;
use zwh_core::prelude::*;
use zwh_serial::prelude::*;

pub struct ControllerLogger<'a> {
    inner: &'a dyn LocalImmutableLogger,
}

const CONTROLLER_LOGLEVEL: Loglevel = Loglevel::Debug;

impl<'a> ControllerLogger<'a> {
    pub fn new(inner: &'a dyn LocalImmutableLogger) -> Self {
        Self { inner }
    }

    /// Logs a message exchanged with the controller
    pub fn message(&self, message: &Message, direction: Direction) {
        if self.inner.log_level() < CONTROLLER_LOGLEVEL {
            return;
        }

        let mut tags: Vec<Cow<'static, str>> =
            vec![format!("{:?}", message.function_type()).into()];
        if let Some(callback_id) = message.callback_id() {
            tags.push(format!("callback {}", callback_id).into());
        }

        let log = LogInfo::builder()
            .label("CNTRLR")
            .direction(direction)
            .primary_tags(tags)
            .payload(message.to_log_payload())
            .build();
        self.inner.log(log, CONTROLLER_LOGLEVEL);
    }

    pub fn text<L: Into<Cow<'static, str>>>(&self, message: impl Fn() -> L, level: Loglevel) {
        if self.inner.log_level() < level {
            return;
        }

        let message: Cow<'static, str> = message().into();
        let log = LogInfo::builder()
            .label("CNTRLR")
            .payload(zwh_core::log::LogPayload::Text(message.into()))
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
}
