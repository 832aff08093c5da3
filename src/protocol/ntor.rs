//! Per-hop key agreement
//!
//! Each hop of a circuit gets its own 32-byte shared secret from an X25519
//! exchange between a fresh client ephemeral key and the relay's onion key.
//! The raw Diffie-Hellman output is never used directly: it is bound to the
//! relay identity and both public keys through HMAC-SHA256, as ntor does for
//! its KEY_SEED.
//!
//! Security: the ephemeral secret lives only for one call and the returned
//! secret is wrapped in `Zeroizing`.

use super::relay::RelayNode;
use crate::error::{OnionError, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Length of the per-hop shared secret
pub const SHARED_SECRET_LEN: usize = 32;

/// Key-seed extraction label
const T_KEY: &[u8] = b"fog-onion-v1:key_extract";

/// Shared secret produced by one hop handshake
pub type SharedSecret = Zeroizing<[u8; SHARED_SECRET_LEN]>;

/// Key agreement with one relay
///
/// Implementations that talk to real relays suspend on the network here;
/// the circuit builder bounds every call with a timeout.
#[async_trait]
pub trait HopHandshake: Send + Sync {
    /// Agree on a shared secret with the relay at `position` in the path
    async fn handshake(&self, relay: &RelayNode, position: usize) -> Result<SharedSecret>;
}

/// Client half of an X25519 exchange against the relay's published onion key
#[derive(Debug, Clone, Copy, Default)]
pub struct X25519Handshake;

impl X25519Handshake {
    pub fn new() -> Self {
        Self
    }

    /// Derive the hop secret from an ephemeral key and the relay onion key
    ///
    /// Returns the secret and the client public key the relay needs to
    /// compute the same value.
    pub fn agree(relay: &RelayNode) -> Result<(SharedSecret, PublicKey)> {
        let onion_key = PublicKey::from(relay.onion_public_key()?);

        let client_secret = EphemeralSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_secret);

        let exp = client_secret.diffie_hellman(&onion_key);
        if !exp.was_contributory() {
            return Err(OnionError::HandshakeFailed(format!(
                "{}: onion key is a low-order point",
                relay.short_id()
            )));
        }

        let seed = key_seed(exp.as_bytes(), relay, &onion_key, &client_public)?;
        Ok((seed, client_public))
    }
}

/// KEY_SEED = HMAC-SHA256(t_key, EXP(B,x) | ID | B | X)
pub(crate) fn key_seed(
    exp: &[u8; 32],
    relay: &RelayNode,
    onion_key: &PublicKey,
    client_public: &PublicKey,
) -> Result<SharedSecret> {
    let mut mac = HmacSha256::new_from_slice(T_KEY)
        .map_err(|_| OnionError::Crypto("HMAC init failed".into()))?;
    mac.update(exp);
    mac.update(relay.node_id.as_bytes());
    mac.update(&relay.identity_key);
    mac.update(onion_key.as_bytes());
    mac.update(client_public.as_bytes());

    let mut seed = Zeroizing::new([0u8; SHARED_SECRET_LEN]);
    seed.copy_from_slice(&mac.finalize().into_bytes());
    Ok(seed)
}

#[async_trait]
impl HopHandshake for X25519Handshake {
    async fn handshake(&self, relay: &RelayNode, position: usize) -> Result<SharedSecret> {
        let (secret, _client_public) = Self::agree(relay)?;
        log::trace!("Hop {} handshake with {} complete", position, relay.short_id());
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::relay::RoleSet;
    use x25519_dalek::StaticSecret;

    fn relay_with_key(onion_key: [u8; 32]) -> RelayNode {
        RelayNode::new(
            "relay-under-test",
            "127.0.0.1:9001",
            RoleSet::from_flags("Middle"),
            vec![5u8; 32],
            onion_key.to_vec(),
            true,
        )
    }

    #[test]
    fn test_relay_computes_same_secret() {
        let relay_secret = StaticSecret::random_from_rng(OsRng);
        let relay_public = PublicKey::from(&relay_secret);
        let relay = relay_with_key(*relay_public.as_bytes());

        let (client_seed, client_public) = X25519Handshake::agree(&relay).unwrap();

        // Relay side: EXP(X,b)
        let exp = relay_secret.diffie_hellman(&client_public);
        let relay_seed = key_seed(exp.as_bytes(), &relay, &relay_public, &client_public).unwrap();

        assert_eq!(*client_seed, *relay_seed);
    }

    #[test]
    fn test_fresh_secret_per_handshake() {
        let relay_public = PublicKey::from(&StaticSecret::random_from_rng(OsRng));
        let relay = relay_with_key(*relay_public.as_bytes());

        let (a, _) = X25519Handshake::agree(&relay).unwrap();
        let (b, _) = X25519Handshake::agree(&relay).unwrap();
        assert_ne!(*a, *b);
    }

    #[test]
    fn test_low_order_onion_key_rejected() {
        let relay = relay_with_key([0u8; 32]);
        let err = X25519Handshake::agree(&relay).unwrap_err();
        assert!(matches!(err, OnionError::HandshakeFailed(_)));
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        let mut relay = relay_with_key([1u8; 32]);
        relay.onion_key = vec![1u8; 16];
        assert!(matches!(
            X25519Handshake::agree(&relay),
            Err(OnionError::InvalidRelay(_))
        ));
    }
}
