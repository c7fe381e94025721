pub use crate::definitions::*;
pub use crate::log::{
    LogPayload, LogPayloadDict, LogPayloadDictValue, LogPayloadList, LogPayloadText, ToLogPayload,
};
pub use crate::parse::{Parsable, ParseError, ParseResult, Parser, validate};
pub use crate::serialize::{Serializable, SerializableWith};
