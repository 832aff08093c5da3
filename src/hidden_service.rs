//! Hidden services
//!
//! A hidden service is an ed25519 identity plus a handful of introduction
//! points taken from the relay directory. Clients find it by its `.fog`
//! address and reach it over a rendezvous circuit built by the router.
//!
//! ## Address format
//!
//! ```text
//! base32(pubkey[32] || checksum[2] || version[1]) + ".fog"
//! checksum = SHA3-256(".fog checksum" || pubkey || version)[0..2]
//! ```
//!
//! The checksum catches typos: a mistyped address fails to parse instead of
//! resolving to some other service.

use crate::error::{OnionError, Result};
use crate::protocol::{DirectorySnapshot, RelayNode};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sha3::{Digest, Sha3_256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

/// Address suffix
pub const ONION_SUFFIX: &str = ".fog";

/// Address format version
pub const ADDRESS_VERSION: u8 = 1;

const CHECKSUM_PREFIX: &[u8] = b".fog checksum";
const PUBLIC_KEY_LEN: usize = 32;
const ADDRESS_BYTES: usize = PUBLIC_KEY_LEN + 2 + 1;

const BASE32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// A validated `.fog` address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OnionAddress {
    public_key: [u8; PUBLIC_KEY_LEN],
}

impl OnionAddress {
    pub fn from_public_key(public_key: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self { public_key }
    }

    /// Parse an address (case insensitive, suffix required)
    pub fn parse(address: &str) -> Result<Self> {
        let lowered = address.trim().to_ascii_lowercase();
        let encoded = lowered.strip_suffix(ONION_SUFFIX).ok_or_else(|| {
            OnionError::InvalidAddress(format!("{}: missing {} suffix", address, ONION_SUFFIX))
        })?;

        let decoded = base32_decode(encoded).ok_or_else(|| {
            OnionError::InvalidAddress(format!("{}: invalid base32 encoding", address))
        })?;

        if decoded.len() != ADDRESS_BYTES {
            return Err(OnionError::InvalidAddress(format!(
                "{}: invalid address length {}",
                address,
                decoded.len()
            )));
        }

        let version = decoded[ADDRESS_BYTES - 1];
        if version != ADDRESS_VERSION {
            return Err(OnionError::InvalidAddress(format!(
                "{}: unsupported version {}",
                address, version
            )));
        }

        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        public_key.copy_from_slice(&decoded[..PUBLIC_KEY_LEN]);

        if checksum(&public_key, version) != decoded[PUBLIC_KEY_LEN..PUBLIC_KEY_LEN + 2] {
            return Err(OnionError::InvalidAddress(format!(
                "{}: invalid checksum",
                address
            )));
        }

        Ok(Self { public_key })
    }

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public_key
    }
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bytes = Vec::with_capacity(ADDRESS_BYTES);
        bytes.extend_from_slice(&self.public_key);
        bytes.extend_from_slice(&checksum(&self.public_key, ADDRESS_VERSION));
        bytes.push(ADDRESS_VERSION);

        write!(f, "{}{}", base32_encode(&bytes).to_lowercase(), ONION_SUFFIX)
    }
}

fn checksum(public_key: &[u8; PUBLIC_KEY_LEN], version: u8) -> [u8; 2] {
    let mut hasher = Sha3_256::new();
    hasher.update(CHECKSUM_PREFIX);
    hasher.update(public_key);
    hasher.update([version]);
    let digest = hasher.finalize();
    [digest[0], digest[1]]
}

/// RFC 4648 base32, no padding, uppercase
fn base32_encode(bytes: &[u8]) -> String {
    let mut result = String::with_capacity((bytes.len() * 8 + 4) / 5);
    let mut buffer: u64 = 0;
    let mut bits: u32 = 0;

    for &byte in bytes {
        buffer = (buffer << 8) | byte as u64;
        bits += 8;

        while bits >= 5 {
            bits -= 5;
            result.push(BASE32_ALPHABET[((buffer >> bits) & 0x1F) as usize] as char);
        }
    }

    if bits > 0 {
        buffer <<= 5 - bits;
        result.push(BASE32_ALPHABET[(buffer & 0x1F) as usize] as char);
    }

    result
}

/// Case-insensitive base32 decode; `None` on characters outside the alphabet
fn base32_decode(input: &str) -> Option<Vec<u8>> {
    let mut result = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u64 = 0;
    let mut bits: u32 = 0;

    for c in input.trim_end_matches('=').chars() {
        let value = BASE32_ALPHABET
            .iter()
            .position(|&x| x == c.to_ascii_uppercase() as u8)? as u64;
        buffer = (buffer << 5) | value;
        bits += 5;

        if bits >= 8 {
            bits -= 8;
            result.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    Some(result)
}

/// A hosted hidden service
pub struct HiddenService {
    pub service_id: String,

    pub onion_address: OnionAddress,

    /// Never empty for a registered service
    pub introduction_points: Vec<Arc<RelayNode>>,

    /// Virtual port -> local target port
    pub ports: BTreeMap<u16, u16>,

    /// ed25519 public key
    pub public_key: Vec<u8>,

    private_key: Zeroizing<Vec<u8>>,

    /// Unix millis
    pub created_at: u64,
}

impl HiddenService {
    fn generate(
        ports: BTreeMap<u16, u16>,
        introduction_points: Vec<Arc<RelayNode>>,
    ) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = signing_key.verifying_key().to_bytes();
        let onion_address = OnionAddress::from_public_key(public_key);

        Self {
            service_id: hex::encode(&Sha256::digest(public_key)[..16]),
            onion_address,
            introduction_points,
            ports,
            public_key: public_key.to_vec(),
            private_key: Zeroizing::new(signing_key.to_bytes().to_vec()),
            created_at: crate::now_ms(),
        }
    }

    /// Address as a string (`....fog`)
    pub fn address(&self) -> String {
        self.onion_address.to_string()
    }

    /// Local port for a virtual port
    pub fn map_port(&self, virtual_port: u16) -> Option<u16> {
        self.ports.get(&virtual_port).copied()
    }

    /// Introduction points that are still listed in `snapshot`
    pub fn reachable_intro_points(&self, snapshot: &DirectorySnapshot) -> Vec<Arc<RelayNode>> {
        self.introduction_points
            .iter()
            .filter(|ip| snapshot.contains(&ip.node_id))
            .cloned()
            .collect()
    }

    /// Length of the held ed25519 secret
    pub(crate) fn private_key_len(&self) -> usize {
        self.private_key.len()
    }

    fn signing_key(&self) -> Result<SigningKey> {
        let secret: [u8; 32] = self
            .private_key
            .as_slice()
            .try_into()
            .map_err(|_| OnionError::Crypto("hidden service key has wrong length".into()))?;
        Ok(SigningKey::from_bytes(&secret))
    }

    /// Signed public description of this service
    pub fn descriptor(&self) -> Result<HiddenServiceDescriptor> {
        let mut descriptor = HiddenServiceDescriptor {
            version: ADDRESS_VERSION,
            onion_address: self.address(),
            public_key: hex::encode(&self.public_key),
            introduction_points: self
                .introduction_points
                .iter()
                .map(|ip| ip.node_id.clone())
                .collect(),
            virtual_ports: self.ports.keys().copied().collect(),
            created_at: self.created_at,
            signature: String::new(),
        };

        let signature = self.signing_key()?.sign(&descriptor.signed_bytes());
        descriptor.signature = hex::encode(signature.to_bytes());
        Ok(descriptor)
    }
}

impl fmt::Debug for HiddenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HiddenService")
            .field("service_id", &self.service_id)
            .field("onion_address", &self.address())
            .field("introduction_points", &self.introduction_points.len())
            .field("ports", &self.ports)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Public, signed part of a hidden service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenServiceDescriptor {
    pub version: u8,
    pub onion_address: String,
    /// hex
    pub public_key: String,
    /// Relay node ids
    pub introduction_points: Vec<String>,
    pub virtual_ports: Vec<u16>,
    pub created_at: u64,
    /// hex ed25519 signature over every other field
    pub signature: String,
}

impl HiddenServiceDescriptor {
    fn signed_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.push(self.version);
        bytes.extend_from_slice(self.onion_address.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(self.public_key.as_bytes());
        bytes.push(0);
        for ip in &self.introduction_points {
            bytes.extend_from_slice(ip.as_bytes());
            bytes.push(0);
        }
        for port in &self.virtual_ports {
            bytes.extend_from_slice(&port.to_be_bytes());
        }
        bytes.extend_from_slice(&self.created_at.to_be_bytes());
        bytes
    }

    /// Check the signature and that the key matches the address
    pub fn verify(&self) -> Result<()> {
        let address = OnionAddress::parse(&self.onion_address)?;

        let key_bytes = hex::decode(&self.public_key)
            .map_err(|e| OnionError::Crypto(format!("descriptor key: {}", e)))?;
        if key_bytes.as_slice() != address.public_key() {
            return Err(OnionError::Crypto(
                "descriptor key does not match address".into(),
            ));
        }

        let verifying_key = VerifyingKey::from_bytes(address.public_key())
            .map_err(|e| OnionError::Crypto(format!("descriptor key: {}", e)))?;

        let sig_bytes = hex::decode(&self.signature)
            .map_err(|e| OnionError::Crypto(format!("descriptor signature: {}", e)))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|e| OnionError::Crypto(format!("descriptor signature: {}", e)))?;

        verifying_key
            .verify(&self.signed_bytes(), &signature)
            .map_err(|_| OnionError::Crypto("descriptor signature invalid".into()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| OnionError::InvalidState(format!("Failed to serialize descriptor: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| OnionError::InvalidAddress(format!("Failed to parse descriptor: {}", e)))
    }
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<String, Arc<HiddenService>>,
    /// Canonical address -> service_id
    by_address: HashMap<String, String>,
}

/// Hidden services hosted by one router
#[derive(Default)]
pub struct HiddenServiceDirectory {
    registry: RwLock<Registry>,
}

impl HiddenServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a service with up to `intro_count` random
    /// introduction points taken from the stable relays of `snapshot`
    pub async fn create(
        &self,
        ports: BTreeMap<u16, u16>,
        snapshot: &DirectorySnapshot,
        intro_count: usize,
    ) -> Result<Arc<HiddenService>> {
        if ports.is_empty() {
            return Err(OnionError::Config("hidden service needs at least one port".into()));
        }

        let stable: Vec<&Arc<RelayNode>> = snapshot.relays().filter(|r| r.is_stable).collect();
        let introduction_points: Vec<Arc<RelayNode>> = stable
            .choose_multiple(&mut rand::thread_rng(), intro_count)
            .map(|r| Arc::clone(r))
            .collect();

        if introduction_points.is_empty() {
            return Err(OnionError::NoIntroductionPoints(
                "no stable relays to introduce through".into(),
            ));
        }

        let service = Arc::new(HiddenService::generate(ports, introduction_points));
        if service.private_key_len() != ed25519_dalek::SECRET_KEY_LENGTH {
            return Err(OnionError::Crypto("hidden service key was not generated".into()));
        }

        log::info!(
            "🧅 Hidden service {} at {} ({} intro points)",
            crate::short_id(&service.service_id),
            service.address(),
            service.introduction_points.len()
        );

        let mut registry = self.registry.write().await;
        registry
            .by_address
            .insert(service.address(), service.service_id.clone());
        registry
            .by_id
            .insert(service.service_id.clone(), Arc::clone(&service));

        Ok(service)
    }

    /// Look up a service by address
    pub async fn resolve(&self, address: &str) -> Result<Arc<HiddenService>> {
        let canonical = OnionAddress::parse(address)?.to_string();
        let registry = self.registry.read().await;

        registry
            .by_address
            .get(&canonical)
            .and_then(|id| registry.by_id.get(id))
            .cloned()
            .ok_or(OnionError::UnknownService(canonical))
    }

    pub async fn get(&self, service_id: &str) -> Option<Arc<HiddenService>> {
        self.registry.read().await.by_id.get(service_id).cloned()
    }

    pub async fn remove(&self, service_id: &str) -> bool {
        let mut registry = self.registry.write().await;
        match registry.by_id.remove(service_id) {
            Some(service) => {
                registry.by_address.remove(&service.address());
                log::info!("🗑️ Removed hidden service {}", crate::short_id(service_id));
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.registry.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
