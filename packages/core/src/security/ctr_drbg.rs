use super::crypto::{encrypt_aes_ecb, increment_slice_mut, xor_slice_mut};

const KEY_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
const SEED_LEN: usize = KEY_LEN + BLOCK_LEN;

// This implementation expects ctr_len to equal BLOCK_LEN.
// See the specification (NIST SP 800-90A) on how to handle other cases.

/// AES-128 CTR_DRBG without derivation function, as required for S2 nonce
/// generation. Deterministic for a given seed, which lets tests drive the
/// SPAN without randomness.
pub struct CtrDrbg {
    v: [u8; BLOCK_LEN],
    key: [u8; KEY_LEN],
    // reseed counter is not used
}

impl CtrDrbg {
    pub fn new(entropy: [u8; SEED_LEN]) -> Self {
        Self::new_with_personalization(entropy, None)
    }

    /// Seeds the DRBG. If a personalization string is given, it is XORed into
    /// the entropy to form the seed material, per NIST SP 800-90A 10.2.1.3.1.
    pub fn new_with_personalization(
        mut entropy: [u8; SEED_LEN],
        personalization: Option<&[u8]>,
    ) -> Self {
        if let Some(ps) = personalization {
            let len = ps.len().min(SEED_LEN);
            xor_slice_mut(&mut entropy[..len], &ps[..len]);
        }

        let mut ret = Self {
            v: [0; BLOCK_LEN],
            key: [0; KEY_LEN],
        };
        ret.update(Some(entropy));
        ret
    }

    fn update(&mut self, provided_data: Option<[u8; SEED_LEN]>) {
        let mut temp: Vec<u8> = Vec::with_capacity(SEED_LEN);
        while temp.len() < SEED_LEN {
            increment_slice_mut(&mut self.v);
            temp.append(&mut encrypt_aes_ecb(&self.v, &self.key));
        }
        temp.truncate(SEED_LEN);

        if let Some(provided_data) = provided_data {
            xor_slice_mut(&mut temp, &provided_data);
        }

        let (key, v) = temp.split_at_mut(KEY_LEN);
        self.key.copy_from_slice(key);
        self.v.copy_from_slice(v);
    }

    pub fn generate(&mut self, bytes: usize) -> Vec<u8> {
        // Additional input is not used
        let num_blocks = bytes / BLOCK_LEN + if bytes % BLOCK_LEN == 0 { 0 } else { 1 };
        let mut temp: Vec<u8> = Vec::with_capacity(num_blocks * BLOCK_LEN);

        while temp.len() < bytes {
            increment_slice_mut(&mut self.v);
            temp.append(&mut encrypt_aes_ecb(&self.v, &self.key));
        }
        temp.truncate(bytes);

        self.update(None);

        temp
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_deterministic() {
        let entropy = [0x42u8; SEED_LEN];
        let mut a = CtrDrbg::new(entropy);
        let mut b = CtrDrbg::new(entropy);

        let out_a = a.generate(13);
        let out_b = b.generate(13);
        assert_eq!(out_a, out_b);
        assert_eq!(out_a.len(), 13);

        // The internal state advances after each generate
        assert_ne!(a.generate(13), out_a);
    }

    #[test]
    fn test_personalization_changes_output() {
        let entropy = [0x42u8; SEED_LEN];
        let mut plain = CtrDrbg::new(entropy);
        let mut personalized =
            CtrDrbg::new_with_personalization(entropy, Some(&[0x11u8; SEED_LEN]));

        assert_ne!(plain.generate(16), personalized.generate(16));
    }
}
