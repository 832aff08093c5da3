//! # fog-onion
//!
//! Onion routing core: builds multi-hop encrypted circuits across a
//! directory of relays so that no single relay learns both who is sending
//! and where the data is going. Hidden services are reachable only
//! through rendezvous circuits.
//!
//! ## Architecture
//!
//! ```text
//! OnionRouter
//!   ↓
//! NodeDirectory (snapshot) → RelaySelector (path)
//!   ↓
//! CircuitBuilder (per-hop x25519 → HKDF keys)
//!   ↓
//! OnionCrypto (pad + AES-128-CTR/HMAC layers)
//!   ↓
//! CellTransport (frame to guard)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! # async fn demo(source: std::sync::Arc<dyn fog_onion::DirectorySource>) -> fog_onion::Result<()> {
//! use fog_onion::{OnionRouter, RouterConfig};
//!
//! let router = OnionRouter::new(RouterConfig::default(), source)?;
//! router.try_fetch_consensus().await?;
//!
//! let circuit = router.try_build_circuit("general", 3).await?;
//! router.try_send_data(circuit.id(), b"hello").await?;
//! router.close_circuit(circuit.id()).await;
//! # Ok(())
//! # }
//! ```
//!
//! The library only logs through the `log` facade; installing a logger
//! is up to the caller.

pub mod config;
pub mod error;
pub mod guards;
pub mod hidden_service;
pub mod protocol;
pub mod router;
pub mod stats;
pub mod transport;

pub use config::{
    CircuitConfig, DirectoryConfig, GuardConfig, HiddenServiceConfig, RouterConfig,
    MIN_PATH_LENGTH,
};
pub use error::{ErrorCode, ErrorInfo, OnionError, Result};
pub use guards::{FailureInfo, GuardState};
pub use hidden_service::{
    HiddenService, HiddenServiceDescriptor, HiddenServiceDirectory, OnionAddress, ONION_SUFFIX,
};
pub use protocol::{
    CircuitHop, CircuitKeys, CircuitState, DirectorySnapshot, DirectorySource, HopHandshake,
    NodeRole, OnionCircuit, OnionCrypto, RelayNode, RoleSet, StaticDirectory, X25519Handshake,
};
pub use router::{CircuitHandle, OnionRouter, RENDEZVOUS_PURPOSE};
pub use stats::RouterStats;
pub use transport::{CellTransport, Frame, MemoryTransport, Overflow};

/// First 8 characters of an id, for logs
pub(crate) fn short_id(id: &str) -> &str {
    id.char_indices().nth(8).map_or(id, |(i, _)| &id[..i])
}

/// Current time in milliseconds since the Unix epoch
pub(crate) fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
