//! Circuit builder
//!
//! Builds circuits hop by hop: key agreement with each relay of a selected
//! path, then per-hop key derivation. A circuit only leaves the builder once
//! every hop is keyed, so nothing half-built is ever registered.

use super::crypto::{CircuitKeys, OnionCrypto, KEY_LEN};
use super::ntor::{HopHandshake, SHARED_SECRET_LEN};
use super::relay::RelayNode;
use crate::error::{OnionError, Result};
use rand::{rngs::OsRng, RngCore};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a rendezvous cookie
pub const RENDEZVOUS_COOKIE_LEN: usize = 20;

/// Random bytes in a circuit id (hex encoded)
const CIRCUIT_ID_BYTES: usize = 16;

/// Circuit lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CircuitState {
    /// Hops are being keyed
    Building,
    /// Ready to carry data
    Established,
    /// Closed by the owner or by rotation
    Closed,
    /// Build error
    Failed,
}

impl CircuitState {
    /// Closed and Failed circuits never come back
    pub fn is_terminal(&self) -> bool {
        matches!(self, CircuitState::Closed | CircuitState::Failed)
    }
}

/// One hop of a circuit
///
/// The relay descriptor is shared with the directory snapshot it came
/// from. Secret material is zeroized when the circuit closes or drops.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CircuitHop {
    #[zeroize(skip)]
    node: Arc<RelayNode>,

    #[zeroize(skip)]
    position: usize,

    shared_secret: [u8; SHARED_SECRET_LEN],

    keys: CircuitKeys,
}

impl CircuitHop {
    /// Derive this hop's keys from its own shared secret
    pub fn new(node: Arc<RelayNode>, position: usize, shared_secret: &[u8; SHARED_SECRET_LEN]) -> Result<Self> {
        let keys = CircuitKeys::derive_from_secret(shared_secret)?;
        Ok(Self {
            node,
            position,
            shared_secret: *shared_secret,
            keys,
        })
    }

    pub fn node(&self) -> &Arc<RelayNode> {
        &self.node
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn keys(&self) -> &CircuitKeys {
        &self.keys
    }

    pub fn shared_secret(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.shared_secret
    }

    pub fn forward_key(&self) -> &[u8; KEY_LEN] {
        &self.keys.forward_key
    }

    pub fn backward_key(&self) -> &[u8; KEY_LEN] {
        &self.keys.backward_key
    }

    pub fn forward_digest(&self) -> &[u8; KEY_LEN] {
        &self.keys.forward_digest
    }

    pub fn backward_digest(&self) -> &[u8; KEY_LEN] {
        &self.keys.backward_digest
    }
}

impl fmt::Debug for CircuitHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitHop")
            .field("node", &self.node.node_id)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

/// A multi-hop circuit
pub struct OnionCircuit {
    /// Unique id (hex)
    pub circuit_id: String,

    /// What the caller built it for ("general", "rendezvous", ...)
    pub purpose: String,

    state: CircuitState,

    /// Ordered guard first; length fixed at build time
    hops: Vec<CircuitHop>,

    /// When this circuit was created (unix millis)
    pub created_at: u64,

    bytes_sent: u64,

    pub is_hidden_service: bool,

    pub rendezvous_cookie: Option<[u8; RENDEZVOUS_COOKIE_LEN]>,
}

impl OnionCircuit {
    fn new(circuit_id: String, purpose: &str, capacity: usize) -> Self {
        Self {
            circuit_id,
            purpose: purpose.to_string(),
            state: CircuitState::Building,
            hops: Vec::with_capacity(capacity),
            created_at: crate::now_ms(),
            bytes_sent: 0,
            is_hidden_service: false,
            rendezvous_cookie: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == CircuitState::Established
    }

    pub fn hops(&self) -> &[CircuitHop] {
        &self.hops
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// First hop
    pub fn guard(&self) -> Option<&Arc<RelayNode>> {
        self.hops.first().map(|h| h.node())
    }

    /// Relay ids in path order
    pub fn path(&self) -> Vec<&str> {
        self.hops.iter().map(|h| h.node.node_id.as_str()).collect()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Count bytes handed to the transport
    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent = self.bytes_sent.saturating_add(bytes as u64);
    }

    /// Circuit age in milliseconds
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at)
    }

    /// Older than `lifetime`
    pub fn is_expired(&self, lifetime: Duration, now_ms: u64) -> bool {
        u128::from(self.age_ms(now_ms)) > lifetime.as_millis()
    }

    /// Mark as a rendezvous circuit with a fresh random cookie
    pub fn mark_rendezvous(&mut self) -> [u8; RENDEZVOUS_COOKIE_LEN] {
        let mut cookie = [0u8; RENDEZVOUS_COOKIE_LEN];
        OsRng.fill_bytes(&mut cookie);
        self.is_hidden_service = true;
        self.rendezvous_cookie = Some(cookie);
        cookie
    }

    /// Pad and wrap `payload` in one layer per hop (guard layer outermost)
    pub fn onion_encrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        self.ensure_established()?;
        OnionCrypto::encrypt(&self.hops, payload)
    }

    /// Remove the layer of hop `hop_index` (call in ascending hop order)
    pub fn onion_decrypt(&self, data: &[u8], hop_index: usize) -> Result<Vec<u8>> {
        self.ensure_established()?;
        OnionCrypto::decrypt(&self.hops, data, hop_index)
    }

    /// Remove every layer and the padding
    pub fn decrypt_all(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.ensure_established()?;
        OnionCrypto::decrypt_all(&self.hops, data)
    }

    /// Zeroize hop key material and move to `Closed`
    ///
    /// Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.wipe();
        self.state = CircuitState::Closed;
        log::debug!("🔒 Circuit {} closed, keys zeroized", self.short_id());
    }

    fn fail(&mut self) {
        self.wipe();
        self.state = CircuitState::Failed;
    }

    fn wipe(&mut self) {
        for hop in self.hops.iter_mut() {
            hop.zeroize();
        }
        self.rendezvous_cookie = None;
    }

    pub fn short_id(&self) -> &str {
        crate::short_id(&self.circuit_id)
    }

    fn ensure_established(&self) -> Result<()> {
        if self.state != CircuitState::Established {
            return Err(OnionError::CircuitClosed(format!(
                "circuit {} is {:?}",
                self.short_id(),
                self.state
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for OnionCircuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnionCircuit")
            .field("circuit_id", &self.circuit_id)
            .field("purpose", &self.purpose)
            .field("state", &self.state)
            .field("hops", &self.hops)
            .field("created_at", &self.created_at)
            .field("bytes_sent", &self.bytes_sent)
            .field("is_hidden_service", &self.is_hidden_service)
            .finish_non_exhaustive()
    }
}

/// Why a build stopped, and at which hop
#[derive(Debug)]
pub struct HopFailure {
    pub position: usize,
    pub node_id: String,
    pub error: OnionError,
}

impl fmt::Display for HopFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hop {} ({}): {}", self.position, self.node_id, self.error)
    }
}

/// Builds circuits over a selected path
pub struct CircuitBuilder {
    handshake: Arc<dyn HopHandshake>,
    handshake_timeout: Duration,
}

impl CircuitBuilder {
    pub fn new(handshake: Arc<dyn HopHandshake>, handshake_timeout: Duration) -> Self {
        Self {
            handshake,
            handshake_timeout,
        }
    }

    /// Generate a fresh circuit id
    pub fn new_circuit_id() -> String {
        let mut bytes = [0u8; CIRCUIT_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Key every hop of `path` in order and return an established circuit
    ///
    /// Hops are keyed sequentially so hop order always matches `position`.
    /// On failure the partial circuit is dropped (and its keys zeroized).
    pub async fn build(
        &self,
        circuit_id: String,
        purpose: &str,
        path: Vec<Arc<RelayNode>>,
    ) -> std::result::Result<OnionCircuit, HopFailure> {
        let mut circuit = OnionCircuit::new(circuit_id, purpose, path.len());

        log::info!(
            "🔨 Building circuit {} ({} hops, purpose={})",
            circuit.short_id(),
            path.len(),
            purpose
        );

        for (position, node) in path.into_iter().enumerate() {
            match self.key_hop(&node, position).await {
                Ok(hop) => {
                    log::debug!("  ✅ Hop {} keyed: {}", position, node.short_id());
                    circuit.hops.push(hop);
                }
                Err(error) => {
                    circuit.fail();
                    log::warn!(
                        "  ❌ Circuit {} failed at hop {} ({}): {}",
                        circuit.short_id(),
                        position,
                        node.short_id(),
                        error
                    );
                    return Err(HopFailure {
                        position,
                        node_id: node.node_id.clone(),
                        error,
                    });
                }
            }
        }

        circuit.state = CircuitState::Established;
        log::info!("✅ Circuit {} established", circuit.short_id());
        Ok(circuit)
    }

    async fn key_hop(&self, node: &Arc<RelayNode>, position: usize) -> Result<CircuitHop> {
        let secret = tokio::time::timeout(
            self.handshake_timeout,
            self.handshake.handshake(node, position),
        )
        .await
        .map_err(|_| {
            OnionError::Timeout(format!(
                "handshake with {} exceeded {}ms",
                node.short_id(),
                self.handshake_timeout.as_millis()
            ))
        })??;

        CircuitHop::new(Arc::clone(node), position, &secret)
    }
}
