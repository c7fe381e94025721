use super::crypto::{
    compute_nonce_prk, derive_mei, derive_network_keys, encrypt_aes_ecb, increment_slice_mut,
};
use super::ctr_drbg::CtrDrbg;
use crate::prelude::*;
use getrandom::getrandom;
use std::collections::BTreeMap;

pub const S2_NONCE_SIZE: usize = 13;
pub const S2_EI_SIZE: usize = 16;
pub const S2_AUTH_TAG_SIZE: usize = 8;

/// The keys derived from one S2 network key
pub struct S2KeySet {
    pub key_ccm: Vec<u8>,
    pub key_mpan: Vec<u8>,
    pub personalization_string: Vec<u8>,
}

impl From<super::crypto::NetworkKeys> for S2KeySet {
    fn from(keys: super::crypto::NetworkKeys) -> Self {
        Self {
            key_ccm: keys.key_ccm,
            key_mpan: keys.key_mpan,
            personalization_string: keys.personalization_string,
        }
    }
}

/// Singlecast pre-agreed nonce state for one peer
pub enum SpanState {
    /// No SPAN has been established and no entropy input exchanged
    None,
    /// We generated our entropy input and sent it in a Nonce Report,
    /// waiting for the peer to use it
    LocalEI(Vec<u8>),
    /// The peer sent us its entropy input, we have not mixed it yet
    RemoteEI(Vec<u8>),
    /// The SPAN is established and generates AEAD nonces
    Established(CtrDrbg),
}

impl SpanState {
    pub fn is_established(&self) -> bool {
        matches!(self, SpanState::Established(_))
    }
}

/// Multicast pre-agreed nonce state for one multicast group
pub struct MpanState {
    pub group_id: u8,
    inner: [u8; 16],
}

impl MpanState {
    pub fn new(group_id: u8) -> Self {
        let mut inner = [0u8; 16];
        getrandom(&mut inner).unwrap_or_else(|_| panic!("Failed to generate random bytes"));
        Self { group_id, inner }
    }

    pub fn with_inner_state(group_id: u8, inner: [u8; 16]) -> Self {
        Self { group_id, inner }
    }

    /// Produces the next multicast nonce and advances the inner state
    pub fn next_nonce(&mut self, key_mpan: &[u8]) -> [u8; S2_NONCE_SIZE] {
        let out = encrypt_aes_ecb(&self.inner, key_mpan);
        increment_slice_mut(&mut self.inner);

        let mut nonce = [0u8; S2_NONCE_SIZE];
        nonce.copy_from_slice(&out[..S2_NONCE_SIZE]);
        nonce
    }
}

pub struct S2SecurityManagerOptions {
    pub own_node_id: NodeId,
}

/// Owns the S2 network keys (one per security class), the per-peer SPAN
/// table, the MPAN table and the sequence number bookkeeping.
pub struct S2SecurityManager {
    own_node_id: NodeId,
    keys: BTreeMap<SecurityClass, S2KeySet>,
    /// Installed during bootstrap, retired on completion or abort
    temp_key: Option<S2KeySet>,
    span_table: BTreeMap<NodeId, SpanState>,
    mpan_table: BTreeMap<u8, MpanState>,
    own_sequence_number: u8,
    peer_sequence_numbers: BTreeMap<NodeId, u8>,
}

impl S2SecurityManager {
    pub fn new(options: S2SecurityManagerOptions) -> Self {
        let mut own_sequence_number = [0u8; 1];
        let _ = getrandom(&mut own_sequence_number);

        Self {
            own_node_id: options.own_node_id,
            keys: BTreeMap::new(),
            temp_key: None,
            span_table: BTreeMap::new(),
            mpan_table: BTreeMap::new(),
            own_sequence_number: own_sequence_number[0],
            peer_sequence_numbers: BTreeMap::new(),
        }
    }

    pub fn own_node_id(&self) -> NodeId {
        self.own_node_id
    }

    /// Derives and stores the key set for the given security class
    pub fn set_network_key(&mut self, class: SecurityClass, network_key: &[u8]) {
        assert!(
            network_key.len() == 16,
            "The network key must be 16 bytes long!"
        );
        self.keys
            .insert(class, derive_network_keys(network_key).into());
    }

    pub fn has_key(&self, class: &SecurityClass) -> bool {
        self.keys.contains_key(class)
    }

    pub fn key_for_class(&self, class: &SecurityClass) -> Option<&S2KeySet> {
        if *class == SecurityClass::Temporary {
            return self.temp_key.as_ref();
        }
        self.keys.get(class)
    }

    /// Installs the temporary key used while bootstrapping a node
    pub fn install_temp_key(&mut self, network_key: &[u8]) {
        self.temp_key = Some(derive_network_keys(network_key).into());
    }

    /// Retires the temporary bootstrap key
    pub fn retire_temp_key(&mut self) {
        self.temp_key = None;
    }

    pub fn has_temp_key(&self) -> bool {
        self.temp_key.is_some()
    }

    pub fn next_sequence_number(&mut self) -> u8 {
        self.own_sequence_number = self.own_sequence_number.wrapping_add(1);
        self.own_sequence_number
    }

    /// Records the peer's sequence number and reports whether it is a duplicate
    pub fn observe_peer_sequence_number(&mut self, peer: NodeId, sequence_number: u8) -> bool {
        let duplicate = self.peer_sequence_numbers.get(&peer) == Some(&sequence_number);
        self.peer_sequence_numbers.insert(peer, sequence_number);
        duplicate
    }

    pub fn span_state(&self, peer: NodeId) -> &SpanState {
        self.span_table.get(&peer).unwrap_or(&SpanState::None)
    }

    /// Generates a fresh 16-byte entropy input for a Nonce Report
    pub fn generate_ei() -> Vec<u8> {
        let mut ei = [0u8; S2_EI_SIZE];
        getrandom(&mut ei).unwrap_or_else(|_| panic!("Failed to generate random bytes"));
        ei.to_vec()
    }

    /// Remembers that we sent the given entropy input to the peer
    pub fn set_local_ei(&mut self, peer: NodeId, ei: Vec<u8>) {
        self.span_table.insert(peer, SpanState::LocalEI(ei));
    }

    /// Remembers the peer's entropy input from a received Nonce Report
    pub fn set_remote_ei(&mut self, peer: NodeId, ei: Vec<u8>) {
        self.span_table.insert(peer, SpanState::RemoteEI(ei));
    }

    /// Mixes both entropy inputs and instantiates the SPAN for the peer.
    /// `sender_ei` is the EI of the node that sends the next encrypted frame.
    pub fn establish_span(
        &mut self,
        peer: NodeId,
        class: &SecurityClass,
        sender_ei: &[u8],
        receiver_ei: &[u8],
    ) -> bool {
        let Some(key_set) = self.key_for_class(class) else {
            return false;
        };

        let nonce_prk = compute_nonce_prk(sender_ei, receiver_ei);
        let mei = derive_mei(&nonce_prk);

        let mut entropy = [0u8; 32];
        entropy.copy_from_slice(&mei[..32]);
        let drbg = CtrDrbg::new_with_personalization(
            entropy,
            Some(&key_set.personalization_string),
        );

        self.span_table.insert(peer, SpanState::Established(drbg));
        true
    }

    /// Produces the next SPAN nonce for the peer, if a SPAN is established
    pub fn next_span_nonce(&mut self, peer: NodeId) -> Option<[u8; S2_NONCE_SIZE]> {
        match self.span_table.get_mut(&peer) {
            Some(SpanState::Established(drbg)) => {
                let out = drbg.generate(S2_NONCE_SIZE);
                let mut nonce = [0u8; S2_NONCE_SIZE];
                nonce.copy_from_slice(&out);
                Some(nonce)
            }
            _ => None,
        }
    }

    /// Discards the SPAN state for the peer, forcing a resynchronization
    pub fn reset_span(&mut self, peer: NodeId) {
        self.span_table.remove(&peer);
    }

    /// Discards all state associated with the peer
    pub fn remove_peer(&mut self, peer: NodeId) {
        self.span_table.remove(&peer);
        self.peer_sequence_numbers.remove(&peer);
    }

    pub fn mpan_state_mut(&mut self, group_id: u8) -> &mut MpanState {
        self.mpan_table
            .entry(group_id)
            .or_insert_with(|| MpanState::new(group_id))
    }

    pub fn reset_mpan(&mut self, group_id: u8) {
        self.mpan_table.remove(&group_id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn manager_with_key(node_id: u8) -> S2SecurityManager {
        let mut mgr = S2SecurityManager::new(S2SecurityManagerOptions {
            own_node_id: NodeId::new(node_id),
        });
        mgr.set_network_key(SecurityClass::S2Authenticated, &[0x01; 16]);
        mgr
    }

    #[test]
    fn test_span_synchronization() {
        // Both peers mix the same entropy inputs and must produce the same nonces
        let mut ours = manager_with_key(1);
        let mut theirs = manager_with_key(9);

        let sender_ei = S2SecurityManager::generate_ei();
        let receiver_ei = S2SecurityManager::generate_ei();

        assert!(ours.establish_span(
            NodeId::new(9u8),
            &SecurityClass::S2Authenticated,
            &sender_ei,
            &receiver_ei
        ));
        assert!(theirs.establish_span(
            NodeId::new(1u8),
            &SecurityClass::S2Authenticated,
            &sender_ei,
            &receiver_ei
        ));

        for _ in 0..3 {
            let a = ours.next_span_nonce(NodeId::new(9u8)).unwrap();
            let b = theirs.next_span_nonce(NodeId::new(1u8)).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_no_span_without_key() {
        let mut mgr = S2SecurityManager::new(S2SecurityManagerOptions {
            own_node_id: NodeId::new(1u8),
        });
        assert!(!mgr.establish_span(
            NodeId::new(9u8),
            &SecurityClass::S2Authenticated,
            &[0u8; 16],
            &[1u8; 16]
        ));
        assert!(mgr.next_span_nonce(NodeId::new(9u8)).is_none());
    }

    #[test]
    fn test_temp_key_lifecycle() {
        let mut mgr = manager_with_key(1);
        assert!(!mgr.has_temp_key());
        assert!(mgr.key_for_class(&SecurityClass::Temporary).is_none());

        mgr.install_temp_key(&[0x02; 16]);
        assert!(mgr.has_temp_key());
        assert!(mgr.key_for_class(&SecurityClass::Temporary).is_some());

        mgr.retire_temp_key();
        assert!(!mgr.has_temp_key());
    }

    #[test]
    fn test_duplicate_sequence_numbers() {
        let mut mgr = manager_with_key(1);
        let peer = NodeId::new(4u8);
        assert!(!mgr.observe_peer_sequence_number(peer, 10));
        assert!(mgr.observe_peer_sequence_number(peer, 10));
        assert!(!mgr.observe_peer_sequence_number(peer, 11));
    }

    #[test]
    fn test_mpan_advances() {
        let mut mgr = manager_with_key(1);
        let key_mpan = mgr
            .key_for_class(&SecurityClass::S2Authenticated)
            .unwrap()
            .key_mpan
            .clone();
        let mpan = mgr.mpan_state_mut(3);
        let first = mpan.next_nonce(&key_mpan);
        let second = mpan.next_nonce(&key_mpan);
        assert_ne!(first, second);
    }
}
