//! Onion circuit cryptography
//!
//! Implements the per-hop crypto used on circuits:
//! - HKDF-SHA256 key derivation from each hop's shared secret
//! - AES-128-CTR layer encryption with a fresh random 16-byte nonce
//! - Truncated HMAC-SHA256 (4 bytes) over nonce || ciphertext per layer
//! - Onion encryption (layered encryption through multiple hops)
//!
//! ## Layer format
//!
//! ```text
//! +-----------+---------+----------------------+
//! | nonce(16) | mac(4)  | ciphertext (n bytes) |
//! +-----------+---------+----------------------+
//! ```
//!
//! Encryption wraps the exit layer first and the guard layer last, so each
//! relay peels exactly one layer in path order (guard first).
//!
//! Security: All key material is zeroized on drop to prevent memory leakage.

use super::cell;
use super::circuit_builder::CircuitHop;
use crate::error::{OnionError, Result};
use aes::Aes128;
use ctr::{cipher::{KeyIvInit, StreamCipher}, Ctr128BE};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;

type HmacSha256 = Hmac<Sha256>;

/// HKDF salt for circuit keys
pub const HKDF_SALT: &[u8] = b"fog-onion-v1";

/// HKDF info for circuit keys
pub const HKDF_INFO: &[u8] = b"circuit-keys";

/// HKDF output length: Kf | Kb | Df | Db
pub const KEY_MATERIAL_LEN: usize = 64;

/// Length of each derived key
pub const KEY_LEN: usize = 16;

/// Per-layer nonce length (AES-CTR initial counter block)
pub const NONCE_LEN: usize = 16;

/// Truncated MAC length per layer
pub const MAC_LEN: usize = 4;

/// Bytes added by each onion layer
pub const LAYER_OVERHEAD: usize = NONCE_LEN + MAC_LEN;

/// Circuit keys for one hop
///
/// Each hop in the circuit has separate keys for:
/// - Forward encryption (client → relay)
/// - Backward encryption (relay → client)
/// - Forward digest (integrity)
/// - Backward digest (integrity)
///
/// SECURITY: Keys are automatically zeroized when dropped to prevent
/// memory leakage of sensitive cryptographic material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CircuitKeys {
    /// Forward encryption key (client → relay)
    pub forward_key: [u8; KEY_LEN],

    /// Backward encryption key (relay → client)
    pub backward_key: [u8; KEY_LEN],

    /// Forward MAC key
    pub forward_digest: [u8; KEY_LEN],

    /// Backward MAC key
    pub backward_digest: [u8; KEY_LEN],
}

impl CircuitKeys {
    /// Derive circuit keys from a hop's shared secret
    ///
    /// ```text
    /// K = HKDF-SHA256(salt = "fog-onion-v1", ikm = secret, info = "circuit-keys", L = 64)
    ///
    /// Kf = K[0..16]  Kb = K[16..32]  Df = K[32..48]  Db = K[48..64]
    /// ```
    pub fn derive_from_secret(shared_secret: &[u8]) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_secret);

        let mut okm = [0u8; KEY_MATERIAL_LEN];
        hkdf.expand(HKDF_INFO, &mut okm)
            .map_err(|_| OnionError::KeyDerivationFailed("HKDF expand failed".into()))?;

        let mut keys = CircuitKeys {
            forward_key: [0u8; KEY_LEN],
            backward_key: [0u8; KEY_LEN],
            forward_digest: [0u8; KEY_LEN],
            backward_digest: [0u8; KEY_LEN],
        };

        keys.forward_key.copy_from_slice(&okm[0..16]);
        keys.backward_key.copy_from_slice(&okm[16..32]);
        keys.forward_digest.copy_from_slice(&okm[32..48]);
        keys.backward_digest.copy_from_slice(&okm[48..64]);

        okm.zeroize();

        Ok(keys)
    }
}

impl std::fmt::Debug for CircuitKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CircuitKeys { .. }")
    }
}

/// Onion Crypto Engine
///
/// Stateless: every call works on the hop keys it is handed, so circuits
/// can be encrypted in parallel without shared state.
pub struct OnionCrypto;

impl OnionCrypto {
    /// Pad `payload` to a cell boundary and wrap one layer per hop
    ///
    /// Applies layers in reverse order (exit first, guard last).
    pub fn encrypt(hops: &[CircuitHop], payload: &[u8]) -> Result<Vec<u8>> {
        if hops.is_empty() {
            return Err(OnionError::InvalidState("circuit has no hops".into()));
        }

        let mut data = cell::pad(payload);
        for hop in hops.iter().rev() {
            data = Self::encrypt_layer(hop.keys(), &data)?;
        }
        Ok(data)
    }

    /// Remove the layer belonging to `hop_index`
    ///
    /// Must be called in ascending hop order, starting from the guard.
    pub fn decrypt(hops: &[CircuitHop], data: &[u8], hop_index: usize) -> Result<Vec<u8>> {
        let hop = hops.get(hop_index).ok_or_else(|| {
            OnionError::InvalidState(format!(
                "hop index {} out of range for {} hops",
                hop_index,
                hops.len()
            ))
        })?;
        Self::decrypt_layer(hop.keys(), data)
    }

    /// Peel every layer in path order and strip the padding
    ///
    /// This is what the chain of relays does collectively.
    pub fn decrypt_all(hops: &[CircuitHop], data: &[u8]) -> Result<Vec<u8>> {
        let mut current = data.to_vec();
        for hop_index in 0..hops.len() {
            current = Self::decrypt(hops, &current, hop_index)?;
        }
        cell::unpad(&current)
    }

    /// Wrap a single layer: nonce(16) | mac(4) | AES-128-CTR(data)
    pub fn encrypt_layer(keys: &CircuitKeys, data: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut ciphertext = data.to_vec();
        Self::apply_keystream(&keys.forward_key, &nonce, &mut ciphertext);

        let mac = Self::compute_mac(&keys.forward_digest, &nonce, &ciphertext)?;

        let mut out = Vec::with_capacity(LAYER_OVERHEAD + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&mac);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Verify and remove a single layer
    pub fn decrypt_layer(keys: &CircuitKeys, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < LAYER_OVERHEAD {
            return Err(OnionError::DataTooShort { len: data.len() });
        }

        let (nonce, rest) = data.split_at(NONCE_LEN);
        let (mac, ciphertext) = rest.split_at(MAC_LEN);

        let expected = Self::compute_mac(&keys.forward_digest, nonce, ciphertext)?;

        // Constant-time comparison
        if !bool::from(expected[..].ct_eq(mac)) {
            return Err(OnionError::IntegrityCheckFailed);
        }

        let nonce: [u8; NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| OnionError::Crypto("nonce length".into()))?;

        let mut plaintext = ciphertext.to_vec();
        Self::apply_keystream(&keys.forward_key, &nonce, &mut plaintext);
        Ok(plaintext)
    }

    /// First 4 bytes of HMAC-SHA256(digest_key, nonce || ciphertext)
    pub fn compute_mac(digest_key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<[u8; MAC_LEN]> {
        let mut mac = HmacSha256::new_from_slice(digest_key)
            .map_err(|_| OnionError::Crypto("HMAC init failed".into()))?;
        mac.update(nonce);
        mac.update(ciphertext);
        let tag = mac.finalize().into_bytes();

        let mut out = [0u8; MAC_LEN];
        out.copy_from_slice(&tag[..MAC_LEN]);
        Ok(out)
    }

    /// AES-128-CTR with the nonce as initial counter block
    ///
    /// Note: CTR mode is symmetric, so encrypt = decrypt
    fn apply_keystream(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], data: &mut [u8]) {
        let mut cipher = Aes128Ctr::new(key.into(), nonce.into());
        cipher.apply_keystream(data);
    }
}
