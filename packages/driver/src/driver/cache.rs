use super::node::NodeStatus;
use crate::options::StorageThrottle;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use zwh_core::cache::CacheValue;
use zwh_core::prelude::*;
use zwh_core::value_id::EndpointValueId;

/// Bump when the on-disk format changes incompatibly
pub const CACHE_FORMAT: u32 = 1;

const LOCK_FILE_NAME: &str = "zwave-host.lock";

/// One line of the network cache log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "camelCase")]
pub enum NetworkCacheRecord {
    #[serde(rename_all = "camelCase")]
    CacheFormat { version: u32 },
    #[serde(rename_all = "camelCase")]
    Node {
        node_id: NodeId,
        can_sleep: bool,
        supports_wake_up: bool,
        security_class: Option<SecurityClass>,
        /// The serialized liveness state; Unknown is not persisted
        is_asleep: bool,
    },
    #[serde(rename_all = "camelCase")]
    NodeRemoved { node_id: NodeId },
}

/// One line of the value or metadata log. A `None` value tombstones the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueRecord {
    pub key: EndpointValueId,
    pub value: Option<CacheValue>,
}

/// The state of one node as revived from the network cache
#[derive(Debug, Clone, PartialEq)]
pub struct RevivedNode {
    pub node_id: NodeId,
    pub can_sleep: bool,
    pub supports_wake_up: bool,
    pub security_class: Option<SecurityClass>,
    pub status: NodeStatus,
}

/// An append-only JSONL log with write coalescing. Appends are buffered and
/// flushed together once the throttle window has elapsed.
struct JsonlLog<T> {
    path: PathBuf,
    pending: Vec<T>,
    last_flush: Option<Instant>,
}

impl<T: Serialize + DeserializeOwned> JsonlLog<T> {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            pending: Vec::new(),
            last_flush: None,
        }
    }

    fn append(&mut self, record: T) {
        self.pending.push(record);
    }

    fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Reads all records. Corrupt lines are skipped, so a torn write at the
    /// end of the file does not lose the rest of the log.
    fn read_all(&self) -> std::io::Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut ret = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str(&line) {
                ret.push(record);
            }
        }
        Ok(ret)
    }

    fn flush(&mut self, now: Instant) -> std::io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for record in self.pending.drain(..) {
            let line = serde_json::to_string(&record)
                .expect("cache records serialize without errors");
            writeln!(file, "{}", line)?;
        }
        file.flush()?;
        self.last_flush = Some(now);
        Ok(())
    }

    fn flush_due(&self, now: Instant, window: Duration) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        match self.last_flush {
            Some(last) => now.duration_since(last) >= window,
            None => true,
        }
    }

    fn clear(&self) -> std::io::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Guards against two driver instances using the same cache directory
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(dir: &Path) -> std::io::Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Self { path })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// The persistence facade: three append-only JSONL logs under the cache
/// directory, keyed by home id in hex. Writes are coalesced over the
/// configured throttle window; on shutdown everything is flushed before the
/// serial port is released.
pub struct DriverCache {
    network: JsonlLog<NetworkCacheRecord>,
    values: JsonlLog<ValueRecord>,
    metadata: JsonlLog<ValueRecord>,
    window: Duration,
    _lock: LockFile,
}

impl DriverCache {
    pub fn open(
        cache_dir: &Path,
        lock_dir: Option<&Path>,
        home_id: HomeId,
        throttle: StorageThrottle,
        clear: bool,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(cache_dir)?;
        let lock_dir = lock_dir.unwrap_or(cache_dir);
        std::fs::create_dir_all(lock_dir)?;
        let lock = LockFile::acquire(lock_dir)?;

        let mut network = JsonlLog::new(cache_dir.join(format!("{}.jsonl", home_id)));
        let values = JsonlLog::new(cache_dir.join(format!("{}.values.jsonl", home_id)));
        let metadata = JsonlLog::new(cache_dir.join(format!("{}.metadata.jsonl", home_id)));

        if clear {
            network.clear()?;
            values.clear()?;
            metadata.clear()?;
        }

        if !network.path.exists() {
            network.append(NetworkCacheRecord::CacheFormat {
                version: CACHE_FORMAT,
            });
        }

        Ok(Self {
            network,
            values,
            metadata,
            window: throttle.window(),
            _lock: lock,
        })
    }

    pub fn record_node(
        &mut self,
        node_id: NodeId,
        can_sleep: bool,
        supports_wake_up: bool,
        security_class: Option<SecurityClass>,
        status: NodeStatus,
    ) {
        self.network.append(NetworkCacheRecord::Node {
            node_id,
            can_sleep,
            supports_wake_up,
            security_class,
            is_asleep: status == NodeStatus::Asleep,
        });
    }

    pub fn record_node_removed(&mut self, node_id: NodeId) {
        self.network.append(NetworkCacheRecord::NodeRemoved { node_id });
    }

    pub fn record_value(&mut self, key: EndpointValueId, value: Option<CacheValue>) {
        self.values.append(ValueRecord { key, value });
    }

    pub fn record_metadata(&mut self, key: EndpointValueId, value: Option<CacheValue>) {
        self.metadata.append(ValueRecord { key, value });
    }

    /// Revives the node list from the network cache. Later records override
    /// earlier ones, removals drop the node.
    pub fn revive_nodes(&self) -> std::io::Result<Vec<RevivedNode>> {
        let mut nodes: HashMap<NodeId, RevivedNode> = HashMap::new();
        for record in self.network.read_all()? {
            match record {
                NetworkCacheRecord::CacheFormat { version } => {
                    if version != CACHE_FORMAT {
                        // Incompatible cache: start over
                        return Ok(Vec::new());
                    }
                }
                NetworkCacheRecord::Node {
                    node_id,
                    can_sleep,
                    supports_wake_up,
                    security_class,
                    is_asleep,
                } => {
                    nodes.insert(
                        node_id,
                        RevivedNode {
                            node_id,
                            can_sleep,
                            supports_wake_up,
                            security_class,
                            status: if is_asleep {
                                NodeStatus::Asleep
                            } else {
                                NodeStatus::Unknown
                            },
                        },
                    );
                }
                NetworkCacheRecord::NodeRemoved { node_id } => {
                    nodes.remove(&node_id);
                }
            }
        }
        let mut ret: Vec<_> = nodes.into_values().collect();
        ret.sort_by_key(|n| n.node_id);
        Ok(ret)
    }

    /// Revives the value DB. Later records override earlier ones, tombstones
    /// remove the key.
    pub fn revive_values(&self) -> std::io::Result<HashMap<EndpointValueId, CacheValue>> {
        Self::revive_value_log(&self.values)
    }

    pub fn revive_metadata(&self) -> std::io::Result<HashMap<EndpointValueId, CacheValue>> {
        Self::revive_value_log(&self.metadata)
    }

    fn revive_value_log(
        log: &JsonlLog<ValueRecord>,
    ) -> std::io::Result<HashMap<EndpointValueId, CacheValue>> {
        let mut ret = HashMap::new();
        for record in log.read_all()? {
            match record.value {
                Some(value) => {
                    ret.insert(record.key, value);
                }
                None => {
                    ret.remove(&record.key);
                }
            }
        }
        Ok(ret)
    }

    /// Flushes the logs whose throttle window has elapsed
    pub fn flush_if_due(&mut self, now: Instant) -> std::io::Result<()> {
        if self.network.flush_due(now, self.window) {
            self.network.flush(now)?;
        }
        if self.values.flush_due(now, self.window) {
            self.values.flush(now)?;
        }
        if self.metadata.flush_due(now, self.window) {
            self.metadata.flush(now)?;
        }
        Ok(())
    }

    /// The earliest instant a flush becomes due, for timer scheduling
    pub fn next_flush(&self, _now: Instant) -> Option<Instant> {
        let dirty = [
            (&self.network.last_flush, self.network.is_dirty()),
            (&self.values.last_flush, self.values.is_dirty()),
            (&self.metadata.last_flush, self.metadata.is_dirty()),
        ];
        dirty
            .iter()
            .filter(|(_, is_dirty)| *is_dirty)
            .map(|(last_flush, _)| match last_flush {
                Some(last) => *last + self.window,
                None => _now,
            })
            .min()
    }

    /// Flushes everything unconditionally. Called on shutdown before the
    /// serial port closes.
    pub fn flush_all(&mut self) -> std::io::Result<()> {
        let now = Instant::now();
        self.network.flush(now)?;
        self.values.flush(now)?;
        self.metadata.flush(now)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zwh_core::value_id::ValueId;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "zwave-host-cache-test-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_node_revival_roundtrip() {
        let dir = temp_dir("nodes");
        let home_id = HomeId::new(0xc0ffee01);

        {
            let mut cache =
                DriverCache::open(&dir, None, home_id, StorageThrottle::Fast, false).unwrap();
            cache.record_node(
                NodeId::new(5u8),
                true,
                true,
                Some(SecurityClass::S2Authenticated),
                NodeStatus::Asleep,
            );
            cache.record_node(NodeId::new(6u8), false, false, None, NodeStatus::Alive);
            cache.record_node_removed(NodeId::new(6u8));
            cache.flush_all().unwrap();
        }

        let cache = DriverCache::open(&dir, None, home_id, StorageThrottle::Fast, false).unwrap();
        let nodes = cache.revive_nodes().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_id, NodeId::new(5u8));
        assert!(nodes[0].can_sleep);
        assert_eq!(nodes[0].status, NodeStatus::Asleep);
        assert_eq!(
            nodes[0].security_class,
            Some(SecurityClass::S2Authenticated)
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_value_tombstones() {
        let dir = temp_dir("values");
        let home_id = HomeId::new(0xc0ffee02);
        let key = EndpointValueId::new(
            NodeId::new(5u8),
            EndpointIndex::Root,
            ValueId::new(CommandClasses::Basic, 0),
        );
        let other = EndpointValueId::new(
            NodeId::new(5u8),
            EndpointIndex::Root,
            ValueId::new(CommandClasses::Basic, 1),
        );

        {
            let mut cache =
                DriverCache::open(&dir, None, home_id, StorageThrottle::Fast, false).unwrap();
            cache.record_value(key, Some(CacheValue::UInt8(99)));
            cache.record_value(other, Some(CacheValue::Bool(true)));
            cache.record_value(key, None);
            cache.flush_all().unwrap();
        }

        let cache = DriverCache::open(&dir, None, home_id, StorageThrottle::Fast, false).unwrap();
        let values = cache.revive_values().unwrap();
        assert_eq!(values.get(&key), None);
        assert_eq!(values.get(&other), Some(&CacheValue::Bool(true)));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_lock_file_prevents_second_instance() {
        let dir = temp_dir("lock");
        let home_id = HomeId::new(0xc0ffee03);

        let first = DriverCache::open(&dir, None, home_id, StorageThrottle::Fast, false).unwrap();
        let second = DriverCache::open(&dir, None, home_id, StorageThrottle::Fast, false);
        assert!(second.is_err());

        drop(first);
        // The lock is released on drop
        let third = DriverCache::open(&dir, None, home_id, StorageThrottle::Fast, false);
        assert!(third.is_ok());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_throttled_flush() {
        let dir = temp_dir("throttle");
        let home_id = HomeId::new(0xc0ffee04);
        let key = EndpointValueId::new(
            NodeId::new(2u8),
            EndpointIndex::Root,
            ValueId::new(CommandClasses::Basic, 0),
        );

        let mut cache =
            DriverCache::open(&dir, None, home_id, StorageThrottle::Normal, false).unwrap();
        let now = Instant::now();
        cache.flush_all().unwrap();

        cache.record_value(key, Some(CacheValue::UInt8(1)));
        // Within the window nothing is written
        cache.flush_if_due(now + Duration::from_millis(10)).unwrap();
        assert!(cache.values.is_dirty());

        // After the window the pending writes go out
        cache
            .flush_if_due(now + Duration::from_millis(200))
            .unwrap();
        assert!(!cache.values.is_dirty());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
