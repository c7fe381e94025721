use crate::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Identifies a single value a command class exposes
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ValueId {
    pub command_class: CommandClasses,
    pub property: u32,
    pub property_key: Option<u32>,
}

impl ValueId {
    pub fn new(command_class: CommandClasses, property: u32) -> Self {
        Self {
            command_class,
            property,
            property_key: None,
        }
    }

    pub fn with_property_key(mut self, property_key: u32) -> Self {
        self.property_key = Some(property_key);
        self
    }
}

/// A [ValueId], qualified with the node and endpoint it belongs to.
/// This is the key of the value and metadata caches.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EndpointValueId {
    pub node_id: NodeId,
    pub endpoint: EndpointIndex,
    pub value_id: ValueId,
}

impl EndpointValueId {
    pub fn new(node_id: NodeId, endpoint: EndpointIndex, value_id: ValueId) -> Self {
        Self {
            node_id,
            endpoint,
            value_id,
        }
    }
}

impl Display for EndpointValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{:?}[{}{}]",
            self.node_id,
            self.endpoint.index(),
            self.value_id.command_class,
            self.value_id.property,
            match self.value_id.property_key {
                Some(key) => format!(", {}", key),
                None => String::new(),
            }
        )
    }
}
