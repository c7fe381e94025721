pub mod binding;
pub mod error;
pub mod frame;
pub mod message;
pub mod message_raw;
pub mod prelude;
