use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use zwh_core::cache::CacheValue;
use zwh_core::prelude::*;
use zwh_core::value_id::EndpointValueId;

/// Internal storage shared between the driver actor and its API handles.
/// The driver is used from application code in several places at once, so
/// interior mutability is required.
pub struct DriverStorage {
    value_cache: RwLock<HashMap<EndpointValueId, CacheValue>>,
    own_node_id: RwLock<NodeId>,
    home_id: RwLock<Option<HomeId>>,
    node_id_type: RwLock<NodeIdType>,
    library_version: RwLock<Option<String>>,
    ready: RwLock<bool>,
}

impl DriverStorage {
    pub fn new(node_id_type: NodeIdType) -> Self {
        Self {
            value_cache: RwLock::new(HashMap::new()),
            own_node_id: RwLock::new(NodeId::unspecified()),
            home_id: RwLock::new(None),
            node_id_type: RwLock::new(node_id_type),
            library_version: RwLock::new(None),
            ready: RwLock::new(false),
        }
    }

    pub fn value_cache(&self) -> RwLockReadGuard<'_, HashMap<EndpointValueId, CacheValue>> {
        self.value_cache.read().unwrap()
    }

    pub fn value_cache_mut(&self) -> RwLockWriteGuard<'_, HashMap<EndpointValueId, CacheValue>> {
        self.value_cache.write().unwrap()
    }

    pub fn own_node_id(&self) -> NodeId {
        *self.own_node_id.read().unwrap()
    }

    pub fn set_own_node_id(&self, own_node_id: NodeId) {
        *self.own_node_id.write().unwrap() = own_node_id;
    }

    pub fn home_id(&self) -> Option<HomeId> {
        *self.home_id.read().unwrap()
    }

    pub fn set_home_id(&self, home_id: HomeId) {
        *self.home_id.write().unwrap() = Some(home_id);
    }

    pub fn node_id_type(&self) -> NodeIdType {
        *self.node_id_type.read().unwrap()
    }

    pub fn set_node_id_type(&self, node_id_type: NodeIdType) {
        *self.node_id_type.write().unwrap() = node_id_type;
    }

    pub fn library_version(&self) -> Option<String> {
        self.library_version.read().unwrap().clone()
    }

    pub fn set_library_version(&self, version: String) {
        *self.library_version.write().unwrap() = Some(version);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.read().unwrap()
    }

    pub fn set_ready(&self, ready: bool) {
        *self.ready.write().unwrap() = ready;
    }

    pub fn encoding_context(&self) -> zwh_serial::prelude::MessageEncodingContext {
        zwh_serial::prelude::MessageEncodingContext::builder()
            .own_node_id(self.own_node_id())
            .node_id_type(self.node_id_type())
            .build()
    }

    pub fn parsing_context(&self) -> zwh_serial::prelude::MessageParsingContext {
        zwh_serial::prelude::MessageParsingContext::builder()
            .own_node_id(self.own_node_id())
            .node_id_type(self.node_id_type())
            .build()
    }
}
