use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// The 32-bit identifier of a Z-Wave network. Used to key the persistent
/// caches on disk.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HomeId(u32);

impl HomeId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl From<u32> for HomeId {
    fn from(val: u32) -> Self {
        Self(val)
    }
}

impl From<HomeId> for u32 {
    fn from(val: HomeId) -> Self {
        val.0
    }
}

impl Debug for HomeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl Display for HomeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}
