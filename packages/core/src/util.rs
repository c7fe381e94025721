use futures_timer::Delay;
use std::borrow::Cow;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use unicode_segmentation::UnicodeSegmentation;

/// A future that sleeps for the given duration, or forever if none is given.
/// Used in select! loops where a timeout may or may not exist.
pub struct MaybeSleep {
    delay: Option<Delay>,
}

impl MaybeSleep {
    pub fn new(duration: Option<Duration>) -> Self {
        Self {
            delay: duration.map(Delay::new),
        }
    }
}

impl Future for MaybeSleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.delay.as_mut() {
            Some(delay) => Pin::new(delay).poll(cx),
            None => Poll::Pending,
        }
    }
}

pub fn str_width(string: &str) -> usize {
    string.graphemes(true).count()
}

pub fn to_lines(text: impl Into<Cow<'static, str>>) -> Vec<Cow<'static, str>> {
    let text = text.into();
    if text.is_empty() {
        // Return at least one empty line
        return vec!["".into()];
    }

    text.lines().map(|line| line.to_owned().into()).collect()
}

#[macro_export]
macro_rules! submodule {
    ($name:ident) => {
        mod $name;
        pub use $name::*;
    };
}

#[macro_export]
macro_rules! hex_bytes {
    ($hex:expr) => {
        bytes::BytesMut::from(hex::decode($hex).unwrap().as_slice()).freeze()
    };
}

#[macro_export]
macro_rules! hex_bytes_mut {
    ($hex:expr) => {
        bytes::BytesMut::from(hex::decode($hex).unwrap().as_slice())
    };
}

#[macro_export]
macro_rules! hex_literal {
    ($hex:expr) => {
        hex::decode($hex).unwrap()
    };
}
