pub use crate::binding::*;
pub use crate::error::{Error as SerialError, Result as SerialResult};
pub use crate::frame::*;
pub use crate::message::*;
pub use crate::message_raw::MessageRaw;
