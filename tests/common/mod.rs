//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use fog_onion::{DirectorySource, OnionRouter, RelayNode, Result, RoleSet, RouterConfig};
use rand::rngs::OsRng;
use std::sync::Arc;
use tokio::sync::Mutex;
use x25519_dalek::{PublicKey, StaticSecret};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A relay with a fresh x25519 onion key
pub fn relay(node_id: &str, flags: &str, is_stable: bool) -> RelayNode {
    let onion_secret = StaticSecret::random_from_rng(OsRng);
    let identity = StaticSecret::random_from_rng(OsRng);

    RelayNode::new(
        node_id,
        format!("198.51.100.{}:9001", node_id.len()),
        RoleSet::from_flags(flags),
        PublicKey::from(&identity).as_bytes().to_vec(),
        PublicKey::from(&onion_secret).as_bytes().to_vec(),
        is_stable,
    )
}

/// `guards` guards, `middles` middles and `exits` exits, all stable
pub fn network(guards: usize, middles: usize, exits: usize) -> Vec<RelayNode> {
    let mut relays = Vec::new();
    for i in 0..guards {
        relays.push(relay(&format!("guard-{:02}", i), "Guard", true));
    }
    for i in 0..middles {
        relays.push(relay(&format!("middle-{:02}", i), "Middle", true));
    }
    for i in 0..exits {
        relays.push(relay(&format!("exit-{:02}", i), "Exit", true));
    }
    relays
}

/// Directory whose contents can be swapped between fetches
#[derive(Default)]
pub struct SwappableDirectory {
    relays: Mutex<Vec<RelayNode>>,
}

impl SwappableDirectory {
    pub fn new(relays: Vec<RelayNode>) -> Self {
        Self {
            relays: Mutex::new(relays),
        }
    }

    pub async fn replace(&self, relays: Vec<RelayNode>) {
        *self.relays.lock().await = relays;
    }
}

#[async_trait]
impl DirectorySource for SwappableDirectory {
    async fn fetch_relays(&self) -> Result<Vec<RelayNode>> {
        Ok(self.relays.lock().await.clone())
    }

    fn name(&self) -> &str {
        "swappable"
    }
}

/// Router over a 3/4/3 network with the directory already fetched
pub async fn ready_router() -> OnionRouter {
    ready_router_with(RouterConfig::default()).await
}

pub async fn ready_router_with(config: RouterConfig) -> OnionRouter {
    init_logging();
    let source = Arc::new(SwappableDirectory::new(network(3, 4, 3)));
    let router = OnionRouter::new(config, source).expect("valid config");
    assert!(router.fetch_consensus().await);
    router
}
