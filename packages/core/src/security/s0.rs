use super::crypto::encrypt_aes_ecb;
use crate::prelude::*;
use bytes::Bytes;
use getrandom::getrandom;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub const NETWORK_KEY_SIZE: usize = 16;
pub type NetworkKey = Vec<u8>;
pub const S0_HALF_NONCE_SIZE: usize = 8;
pub const S0_MAC_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct S0Nonce {
    nonce: Bytes,
}

impl S0Nonce {
    pub fn new(nonce: Bytes) -> Self {
        assert!(
            nonce.len() == S0_HALF_NONCE_SIZE,
            "S0 nonce must be 8 bytes long, got {}",
            nonce.len()
        );
        Self { nonce }
    }

    pub fn random() -> Self {
        let mut buf = [0u8; S0_HALF_NONCE_SIZE];
        getrandom(&mut buf).unwrap_or_else(|_| panic!("Failed to generate random bytes"));
        Self {
            nonce: Bytes::copy_from_slice(&buf),
        }
    }

    pub fn get(&self) -> &Bytes {
        &self.nonce
    }

    /// The first byte identifies a nonce in NonceReport/CommandEncapsulation exchanges
    pub fn id(&self) -> u8 {
        self.nonce[0]
    }
}

impl std::fmt::Display for S0Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(&self.nonce))
    }
}

const AUTH_KEY_BASE: &[u8; NETWORK_KEY_SIZE] = &[0x55; NETWORK_KEY_SIZE];
const ENC_KEY_BASE: &[u8; NETWORK_KEY_SIZE] = &[0xaa; NETWORK_KEY_SIZE];

#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord)]
struct NonceKey {
    issuer: NodeId,
    nonce_id: u8,
}

struct NonceEntry {
    nonce: S0Nonce,
    receiver: NodeId,
    expires_at: Instant,
}

pub struct S0SecurityManagerOptions {
    pub own_node_id: NodeId,
    pub network_key: NetworkKey,
    /// How long an issued nonce stays usable
    pub nonce_timeout: Duration,
}

#[inline(always)]
fn generate_auth_key(network_key: &NetworkKey) -> NetworkKey {
    encrypt_aes_ecb(AUTH_KEY_BASE, network_key)
}

#[inline(always)]
fn generate_enc_key(network_key: &NetworkKey) -> NetworkKey {
    encrypt_aes_ecb(ENC_KEY_BASE, network_key)
}

/// Owns the S0 network key, the derived auth/encryption keys and the nonce
/// tables. Nonces are indexed both by (issuer, nonce id) and by receiver so
/// a new nonce for the same receiver invalidates the previous one.
pub struct S0SecurityManager {
    own_node_id: NodeId,
    auth_key: NetworkKey,
    enc_key: NetworkKey,
    nonce_timeout: Duration,
    nonce_store: BTreeMap<NonceKey, NonceEntry>,
    free_nonces: BTreeMap<NodeId, NonceKey>,
    receiver_nonces: BTreeMap<NodeId, NonceKey>,
}

impl S0SecurityManager {
    pub fn new(options: S0SecurityManagerOptions) -> Self {
        assert!(
            options.network_key.len() == NETWORK_KEY_SIZE,
            "The network key must be 16 bytes long!"
        );

        let auth_key = generate_auth_key(&options.network_key);
        let enc_key = generate_enc_key(&options.network_key);

        Self {
            own_node_id: options.own_node_id,
            auth_key,
            enc_key,
            nonce_timeout: options.nonce_timeout,
            nonce_store: BTreeMap::new(),
            free_nonces: BTreeMap::new(),
            receiver_nonces: BTreeMap::new(),
        }
    }

    pub fn own_node_id(&self) -> NodeId {
        self.own_node_id
    }

    fn has_nonce(&self, nonce_id: u8) -> bool {
        self.nonce_store.contains_key(&NonceKey {
            issuer: self.own_node_id,
            nonce_id,
        })
    }

    pub fn generate_nonce(&mut self, receiver: NodeId) -> S0Nonce {
        // Generate a nonce until we find one whose ID is not already in use
        let nonce = loop {
            let nonce = S0Nonce::random();
            if !self.has_nonce(nonce.id()) {
                break nonce;
            }
        };

        // Store it
        self.set_nonce(self.own_node_id, receiver, nonce.clone(), false);

        nonce
    }

    pub fn set_nonce(&mut self, issuer: NodeId, receiver: NodeId, nonce: S0Nonce, free: bool) {
        let key = NonceKey {
            issuer,
            nonce_id: nonce.id(),
        };

        // If there is an existing nonce for the same receiver, remove it
        if let Some(existing_key) = self.receiver_nonces.get(&receiver) {
            self.nonce_store.remove(existing_key);
        }

        // Add the new one
        self.nonce_store.insert(
            key,
            NonceEntry {
                receiver,
                nonce,
                expires_at: Instant::now() + self.nonce_timeout,
            },
        );
        self.receiver_nonces.insert(receiver, key);

        // And mark it as free if requested
        if free {
            self.free_nonces.insert(issuer, key);
        }
    }

    /// Deletes a specific nonce if it exists
    pub fn delete_nonce(&mut self, issuer: NodeId, nonce_id: u8) {
        let key = NonceKey { issuer, nonce_id };

        let old = self.nonce_store.remove(&key);

        // Delete the entry for the issuer from free_nonces if the stored key is the
        // expected one
        if self.free_nonces.get(&issuer) == Some(&key) {
            self.free_nonces.remove(&issuer);
        }

        // And delete the entry for the receiver from receiver_nonces
        if let Some(NonceEntry { receiver, .. }) = old {
            self.receiver_nonces.remove(&receiver);
        }
    }

    /// Deletes the nonce stored for a given receiver
    pub fn delete_nonce_for_receiver(&mut self, receiver: NodeId) {
        let key = self.receiver_nonces.remove(&receiver);
        if let Some(NonceKey { issuer, nonce_id }) = key {
            self.delete_nonce(issuer, nonce_id);
        }
    }

    /// Drops all expired nonces from the store
    pub fn expire_nonces(&mut self) {
        let now = Instant::now();
        let expired: Vec<NonceKey> = self
            .nonce_store
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            self.delete_nonce(key.issuer, key.nonce_id);
        }
    }

    /// Tries to retrieve a specific nonce issued by ourselves. The same nonce
    /// can only be retrieved once.
    pub fn try_get_own_nonce(&mut self, nonce_id: u8) -> Option<S0Nonce> {
        self.try_get_nonce(self.own_node_id, nonce_id)
    }

    /// Tries to retrieve a specific nonce by ID for a given node. The same nonce
    /// can only be retrieved once.
    pub fn try_get_nonce(&mut self, issuer: NodeId, nonce_id: u8) -> Option<S0Nonce> {
        let key = NonceKey { issuer, nonce_id };
        // If the nonce was previously free, it no longer is
        self.free_nonces.remove(&issuer);
        let entry = self.nonce_store.remove(&key)?;
        if entry.expires_at <= Instant::now() {
            self.receiver_nonces.remove(&entry.receiver);
            return None;
        }
        Some(entry.nonce)
    }

    /// Tries to claim a nonce that is not reserved for a specific transaction.
    /// If a nonce is found, it is no longer considered free afterwards.
    pub fn try_claim_nonce(&mut self, issuer: NodeId) -> Option<S0Nonce> {
        let key = self.free_nonces.remove(&issuer)?;
        let entry = self.nonce_store.get(&key)?;
        if entry.expires_at <= Instant::now() {
            self.delete_nonce(key.issuer, key.nonce_id);
            return None;
        }
        Some(entry.nonce.clone())
    }

    pub fn auth_key(&self) -> &[u8] {
        &self.auth_key
    }

    pub fn enc_key(&self) -> &[u8] {
        &self.enc_key
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_manager() -> S0SecurityManager {
        S0SecurityManager::new(S0SecurityManagerOptions {
            own_node_id: NodeId::new(1u8),
            network_key: vec![0x01; 16],
            nonce_timeout: Duration::from_millis(5000),
        })
    }

    #[test]
    fn test_nonce_single_use() {
        let mut mgr = test_manager();
        let nonce = mgr.generate_nonce(NodeId::new(5u8));

        let retrieved = mgr.try_get_own_nonce(nonce.id());
        assert_eq!(retrieved, Some(nonce.clone()));

        // The same nonce can only be retrieved once
        assert_eq!(mgr.try_get_own_nonce(nonce.id()), None);
    }

    #[test]
    fn test_new_nonce_replaces_old_for_receiver() {
        let mut mgr = test_manager();
        let receiver = NodeId::new(5u8);

        let first = mgr.generate_nonce(receiver);
        let second = mgr.generate_nonce(receiver);

        // The first nonce was invalidated by the second one
        assert_eq!(mgr.try_get_own_nonce(first.id()), None);
        assert_eq!(mgr.try_get_own_nonce(second.id()), Some(second));
    }

    #[test]
    fn test_free_nonce_claim() {
        let mut mgr = test_manager();
        let issuer = NodeId::new(7u8);
        let nonce = S0Nonce::random();
        mgr.set_nonce(issuer, NodeId::new(1u8), nonce.clone(), true);

        assert_eq!(mgr.try_claim_nonce(issuer), Some(nonce));
        // Claimed nonces are no longer free
        assert_eq!(mgr.try_claim_nonce(issuer), None);
    }
}
