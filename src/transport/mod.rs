//! Transport boundary
//!
//! The router never talks to the network itself. Once a payload is wrapped
//! in every hop's layer, the frame is handed to a `CellTransport` addressed
//! to the circuit's guard. Real deployments plug in their own carrier; the
//! in-memory transport records frames for tests and local tooling.

pub mod memory;

pub use memory::{Frame, MemoryTransport, Overflow};

use crate::error::Result;
use crate::protocol::RelayNode;
use async_trait::async_trait;

/// Delivers encrypted frames to a circuit's guard
#[async_trait]
pub trait CellTransport: Send + Sync {
    /// Hand `frame` to `guard` for circuit `circuit_id`
    ///
    /// An error means the frame was not delivered.
    async fn send_cell(&self, circuit_id: &str, guard: &RelayNode, frame: Vec<u8>) -> Result<()>;

    /// Returns the transport type as a string (for logging)
    fn transport_name(&self) -> &'static str {
        "custom"
    }
}
