//! Onion routing protocol core
//!
//! This module implements the circuit cryptography, including:
//! - Relay descriptors, roles and path selection
//! - Directory snapshots and fetching
//! - Per-hop key agreement (x25519)
//! - Key derivation and layered encryption
//! - Cell padding
//! - Circuit building

mod cell;
mod circuit_builder;
mod crypto;
mod directory;
mod ntor;
mod relay;

pub use cell::{pad, padded_len, unpad, CELL_SIZE, PADDING_MARKER};
pub use circuit_builder::{
    CircuitBuilder, CircuitHop, CircuitState, HopFailure, OnionCircuit, RENDEZVOUS_COOKIE_LEN,
};
pub use crypto::{
    CircuitKeys, OnionCrypto, HKDF_INFO, HKDF_SALT, KEY_LEN, KEY_MATERIAL_LEN, LAYER_OVERHEAD,
    MAC_LEN, NONCE_LEN,
};
pub use directory::{DirectorySnapshot, DirectorySource, NodeDirectory, StaticDirectory};
pub use ntor::{HopHandshake, SharedSecret, X25519Handshake, SHARED_SECRET_LEN};
pub use relay::{NodeRole, RelayNode, RelaySelector, RoleSet, ONION_KEY_LEN};
