//! Error types for the onion router
//!
//! This module provides the error taxonomy used across the crate:
//! - Integrity failures (truncated frames, MAC mismatches) - attack signals
//! - Topology failures (not enough relays, unknown hidden services)
//! - Network faults (fetch/handshake errors, timeouts) - retryable
//! - Error codes for programmatic handling

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OnionError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Connection errors (1xx)
    ConnectionFailed = 100,
    ConnectionTimeout = 101,

    // Protocol errors (2xx)
    HandshakeFailed = 200,
    TransportFailed = 201,

    // Circuit errors (3xx)
    CircuitBuildFailed = 300,
    CircuitNotFound = 301,
    CircuitClosed = 302,

    // Integrity errors (4xx) - FATAL for the circuit
    DataTooShort = 400,
    IntegrityCheckFailed = 401,
    InvalidPadding = 402,

    // Cryptographic errors (5xx)
    CryptoError = 500,
    KeyDerivationFailed = 501,

    // Directory/topology errors (6xx)
    DirectoryError = 600,
    NoRelaysAvailable = 601,
    InsufficientRelays = 602,

    // Hidden service errors (7xx)
    InvalidAddress = 700,
    UnknownService = 701,
    NoIntroductionPoints = 702,

    // Configuration errors (8xx)
    ConfigError = 800,
    InvalidRelay = 801,

    // Internal errors (9xx)
    InternalError = 900,
    ResourceExhausted = 901,
}

/// Main error type for the onion router
#[derive(Error, Debug, Clone)]
pub enum OnionError {
    // ===== Connection Errors =====
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    // ===== Protocol Errors =====
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    // ===== Circuit Errors =====
    #[error("Circuit build failed: {0}")]
    CircuitBuildFailed(String),

    #[error("Circuit not found: {0}")]
    CircuitNotFound(String),

    #[error("Circuit closed: {0}")]
    CircuitClosed(String),

    // ===== Integrity Errors =====
    #[error("Encrypted data too short: {len} bytes")]
    DataTooShort { len: usize },

    #[error("Integrity check failed")]
    IntegrityCheckFailed,

    #[error("Invalid padding: {0}")]
    InvalidPadding(String),

    // ===== Cryptographic Errors =====
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    // ===== Directory Errors =====
    #[error("Directory error: {0}")]
    Directory(String),

    #[error("No relays available: {0}")]
    NoRelaysAvailable(String),

    #[error("Not enough eligible relays: need {needed}, have {available}")]
    InsufficientRelays { needed: usize, available: usize },

    // ===== Hidden Service Errors =====
    #[error("Invalid onion address: {0}")]
    InvalidAddress(String),

    #[error("Unknown hidden service: {0}")]
    UnknownService(String),

    #[error("No reachable introduction points for {0}")]
    NoIntroductionPoints(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid relay: {0}")]
    InvalidRelay(String),

    // ===== Internal Errors =====
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl OnionError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            OnionError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            OnionError::Timeout(_) => ErrorCode::ConnectionTimeout,

            OnionError::HandshakeFailed(_) => ErrorCode::HandshakeFailed,
            OnionError::Transport(_) => ErrorCode::TransportFailed,

            OnionError::CircuitBuildFailed(_) => ErrorCode::CircuitBuildFailed,
            OnionError::CircuitNotFound(_) => ErrorCode::CircuitNotFound,
            OnionError::CircuitClosed(_) => ErrorCode::CircuitClosed,

            OnionError::DataTooShort { .. } => ErrorCode::DataTooShort,
            OnionError::IntegrityCheckFailed => ErrorCode::IntegrityCheckFailed,
            OnionError::InvalidPadding(_) => ErrorCode::InvalidPadding,

            OnionError::Crypto(_) => ErrorCode::CryptoError,
            OnionError::KeyDerivationFailed(_) => ErrorCode::KeyDerivationFailed,

            OnionError::Directory(_) => ErrorCode::DirectoryError,
            OnionError::NoRelaysAvailable(_) => ErrorCode::NoRelaysAvailable,
            OnionError::InsufficientRelays { .. } => ErrorCode::InsufficientRelays,

            OnionError::InvalidAddress(_) => ErrorCode::InvalidAddress,
            OnionError::UnknownService(_) => ErrorCode::UnknownService,
            OnionError::NoIntroductionPoints(_) => ErrorCode::NoIntroductionPoints,

            OnionError::Config(_) => ErrorCode::ConfigError,
            OnionError::InvalidRelay(_) => ErrorCode::InvalidRelay,

            OnionError::InvalidState(_) => ErrorCode::InternalError,
            OnionError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
        }
    }

    /// Whether this error signals tampering or a malformed frame.
    ///
    /// A relay receiving one of these must drop the circuit, never retry.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            OnionError::DataTooShort { .. }
                | OnionError::IntegrityCheckFailed
                | OnionError::InvalidPadding(_)
        )
    }

    /// Whether this error is fatal for the circuit it occurred on
    pub fn is_fatal(&self) -> bool {
        self.is_integrity_failure()
            || matches!(
                self,
                OnionError::Crypto(_) | OnionError::KeyDerivationFailed(_)
            )
    }

    /// Whether this error can be retried with different relays
    ///
    /// Retryable errors are transient network or relay issues.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OnionError::ConnectionFailed(_)
                | OnionError::Timeout(_)
                | OnionError::HandshakeFailed(_)
                | OnionError::Transport(_)
                | OnionError::CircuitBuildFailed(_)
                | OnionError::Directory(_)
        )
    }

    /// Whether this error reflects the shape of the network rather than a fault.
    ///
    /// The operational interface reports these as "no result" instead of errors.
    pub fn is_topology_failure(&self) -> bool {
        matches!(
            self,
            OnionError::NoRelaysAvailable(_)
                | OnionError::InsufficientRelays { .. }
                | OnionError::UnknownService(_)
                | OnionError::NoIntroductionPoints(_)
        )
    }
}

/// Serializable error summary for collaborators (API layer, telemetry)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: u32,
    pub message: String,
    pub is_fatal: bool,
    pub is_retryable: bool,
}

impl From<&OnionError> for ErrorInfo {
    fn from(err: &OnionError) -> Self {
        ErrorInfo {
            code: err.code() as u32,
            message: err.to_string(),
            is_fatal: err.is_fatal(),
            is_retryable: err.is_retryable(),
        }
    }
}
