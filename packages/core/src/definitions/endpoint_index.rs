use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Addresses the root device or an individual endpoint of a multi-channel node
#[derive(
    Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum EndpointIndex {
    #[default]
    Root,
    Endpoint(u8),
}

impl EndpointIndex {
    pub fn index(&self) -> u8 {
        match self {
            EndpointIndex::Root => 0,
            EndpointIndex::Endpoint(index) => *index,
        }
    }
}

impl From<u8> for EndpointIndex {
    fn from(val: u8) -> Self {
        match val {
            0 => EndpointIndex::Root,
            index => EndpointIndex::Endpoint(index),
        }
    }
}

impl Display for EndpointIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointIndex::Root => write!(f, "root device"),
            EndpointIndex::Endpoint(index) => write!(f, "endpoint {}", index),
        }
    }
}
