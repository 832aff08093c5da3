//! In-memory transport
//!
//! Keeps the most recent frames instead of sending them. The default queue
//! is a ring: once full, the oldest frame is evicted so senders never stall.
//! A bounded queue that refuses frames when full is available for callers
//! that want back-pressure to surface as a send failure.

use super::CellTransport;
use crate::error::{OnionError, Result};
use crate::protocol::RelayNode;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::Mutex;

/// Default queue size
pub const DEFAULT_MAX_FRAMES: usize = 1024;

/// What happens when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Evict the oldest frame
    DropOldest,
    /// Refuse the new frame with a transport error
    Reject,
}

/// One frame handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub circuit_id: String,
    pub guard_id: String,
    pub data: Vec<u8>,
}

/// Records frames in a fixed-size queue
pub struct MemoryTransport {
    frames: Mutex<VecDeque<Frame>>,
    max_frames: usize,
    overflow: Overflow,
}

impl MemoryTransport {
    /// Ring of the last `DEFAULT_MAX_FRAMES` frames
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_FRAMES)
    }

    /// Ring of the last `max_frames` frames
    pub fn with_capacity(max_frames: usize) -> Self {
        Self::with_overflow(max_frames, Overflow::DropOldest)
    }

    /// Queue that refuses frames once `max_frames` are held
    pub fn bounded(max_frames: usize) -> Self {
        Self::with_overflow(max_frames, Overflow::Reject)
    }

    fn with_overflow(max_frames: usize, overflow: Overflow) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            max_frames: max_frames.max(1),
            overflow,
        }
    }

    pub fn overflow(&self) -> Overflow {
        self.overflow
    }

    /// Copy of every queued frame, oldest first
    pub async fn frames(&self) -> Vec<Frame> {
        self.frames.lock().await.iter().cloned().collect()
    }

    /// Drain the queue
    pub async fn take_frames(&self) -> Vec<Frame> {
        self.frames.lock().await.drain(..).collect()
    }

    pub async fn frame_count(&self) -> usize {
        self.frames.lock().await.len()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CellTransport for MemoryTransport {
    async fn send_cell(&self, circuit_id: &str, guard: &RelayNode, frame: Vec<u8>) -> Result<()> {
        let mut frames = self.frames.lock().await;
        if frames.len() >= self.max_frames {
            match self.overflow {
                Overflow::Reject => {
                    return Err(OnionError::Transport(format!(
                        "memory transport full ({} frames)",
                        self.max_frames
                    )));
                }
                Overflow::DropOldest => {
                    frames.pop_front();
                }
            }
        }

        log::trace!(
            "📦 Queued {} bytes for {} via {}",
            frame.len(),
            crate::short_id(circuit_id),
            guard.short_id()
        );

        frames.push_back(Frame {
            circuit_id: circuit_id.to_string(),
            guard_id: guard.node_id.clone(),
            data: frame,
        });
        Ok(())
    }

    fn transport_name(&self) -> &'static str {
        "memory"
    }
}
