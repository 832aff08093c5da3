//! Node directory
//!
//! Fetches relay descriptors from a [`DirectorySource`] and keeps the
//! current snapshot. A fetch replaces the whole snapshot atomically; hops of
//! circuits built from an older snapshot keep their own `Arc` to the relay.

use super::relay::{NodeRole, RelayNode};
use crate::error::{OnionError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Where relay descriptors come from (directory servers, a bootstrap file...)
#[async_trait]
pub trait DirectorySource: Send + Sync {
    /// Fetch the full list of relay descriptors
    async fn fetch_relays(&self) -> Result<Vec<RelayNode>>;

    /// Name used in logs
    fn name(&self) -> &str {
        "directory"
    }
}

/// Fixed in-memory relay list
///
/// Used for bootstrap lists shipped with the binary and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    relays: Vec<RelayNode>,
}

impl StaticDirectory {
    pub fn new(relays: Vec<RelayNode>) -> Self {
        Self { relays }
    }

    /// Parse a JSON array of relay descriptors
    pub fn from_json(json: &str) -> Result<Self> {
        let relays: Vec<RelayNode> = serde_json::from_str(json)
            .map_err(|e| OnionError::Directory(format!("Failed to parse relay list: {}", e)))?;
        Ok(Self::new(relays))
    }

    pub fn relays(&self) -> &[RelayNode] {
        &self.relays
    }
}

#[async_trait]
impl DirectorySource for StaticDirectory {
    async fn fetch_relays(&self) -> Result<Vec<RelayNode>> {
        Ok(self.relays.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// One immutable view of the network
#[derive(Debug)]
pub struct DirectorySnapshot {
    /// node_id -> relay
    nodes: HashMap<String, Arc<RelayNode>>,

    /// Stable relays holding the Guard role
    guard_nodes: Vec<Arc<RelayNode>>,

    /// When this snapshot was taken (unix millis)
    fetched_at: u64,
}

impl DirectorySnapshot {
    /// Build a snapshot from raw descriptors
    ///
    /// Invalid and duplicate descriptors are skipped. Fails when nothing is
    /// left, when no middle relay exists, or when there is neither a guard
    /// nor an exit.
    pub fn from_relays(relays: Vec<RelayNode>) -> Result<Self> {
        let mut nodes: HashMap<String, Arc<RelayNode>> = HashMap::with_capacity(relays.len());
        let mut skipped = 0usize;

        for relay in relays {
            if let Err(e) = relay.validate() {
                log::warn!("⚠️ Skipping relay descriptor: {}", e);
                skipped += 1;
                continue;
            }
            if nodes.contains_key(&relay.node_id) {
                log::warn!("⚠️ Skipping duplicate relay {}", relay.node_id);
                skipped += 1;
                continue;
            }
            nodes.insert(relay.node_id.clone(), Arc::new(relay));
        }

        if nodes.is_empty() {
            return Err(OnionError::NoRelaysAvailable(format!(
                "directory returned no usable relays ({} skipped)",
                skipped
            )));
        }

        let has_role = |role: NodeRole| nodes.values().any(|r| r.has_role(role));
        if !has_role(NodeRole::Middle) {
            return Err(OnionError::NoRelaysAvailable(
                "directory has no middle relay".into(),
            ));
        }
        if !has_role(NodeRole::Guard) && !has_role(NodeRole::Exit) {
            return Err(OnionError::NoRelaysAvailable(
                "directory has neither guard nor exit relays".into(),
            ));
        }

        let mut guard_nodes: Vec<Arc<RelayNode>> =
            nodes.values().filter(|r| r.is_guard()).cloned().collect();
        guard_nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        Ok(Self {
            nodes,
            guard_nodes,
            fetched_at: crate::now_ms(),
        })
    }

    pub fn get(&self, node_id: &str) -> Option<&Arc<RelayNode>> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn relays(&self) -> impl Iterator<Item = &Arc<RelayNode>> {
        self.nodes.values()
    }

    pub fn guard_nodes(&self) -> &[Arc<RelayNode>] {
        &self.guard_nodes
    }

    /// Relays holding `role`
    pub fn with_role(&self, role: NodeRole) -> Vec<Arc<RelayNode>> {
        self.nodes
            .values()
            .filter(|r| r.has_role(role))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn fetched_at(&self) -> u64 {
        self.fetched_at
    }

    /// Milliseconds since this snapshot was taken
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.fetched_at)
    }
}

/// Directory manager for fetching and holding the current snapshot
pub struct NodeDirectory {
    source: Arc<dyn DirectorySource>,

    /// Current snapshot, replaced wholesale on each successful fetch
    snapshot: RwLock<Option<Arc<DirectorySnapshot>>>,

    fetch_timeout: Duration,
}

impl NodeDirectory {
    pub fn new(source: Arc<dyn DirectorySource>, fetch_timeout: Duration) -> Self {
        Self {
            source,
            snapshot: RwLock::new(None),
            fetch_timeout,
        }
    }

    /// Fetch a new snapshot; `false` on any failure
    pub async fn fetch(&self) -> bool {
        match self.try_fetch().await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("⚠️ Directory fetch failed: {}", e);
                false
            }
        }
    }

    /// Fetch a new snapshot, returning the number of relays it holds
    ///
    /// On failure the previous snapshot stays in place.
    pub async fn try_fetch(&self) -> Result<usize> {
        log::info!("📡 Fetching relay directory from {}...", self.source.name());

        // No lock is held while the source is awaited
        let relays = tokio::time::timeout(self.fetch_timeout, self.source.fetch_relays())
            .await
            .map_err(|_| {
                OnionError::Timeout(format!(
                    "directory fetch exceeded {}ms",
                    self.fetch_timeout.as_millis()
                ))
            })??;

        let snapshot = DirectorySnapshot::from_relays(relays)?;
        let count = snapshot.len();

        log::info!(
            "📊 Directory contains {} relays ({} guards)",
            count,
            snapshot.guard_nodes().len()
        );

        let previous = self.snapshot.write().await.replace(Arc::new(snapshot));
        if let Some(previous) = previous {
            log::debug!(
                "Replaced snapshot taken {}ms earlier",
                previous.age_ms(crate::now_ms())
            );
        }
        Ok(count)
    }

    /// Current snapshot, if a fetch has succeeded
    pub async fn snapshot(&self) -> Option<Arc<DirectorySnapshot>> {
        self.snapshot.read().await.clone()
    }

    /// Current snapshot or a topology error
    pub async fn require_snapshot(&self) -> Result<Arc<DirectorySnapshot>> {
        self.snapshot().await.ok_or_else(|| {
            OnionError::NoRelaysAvailable("directory has not been fetched".into())
        })
    }

    /// Age of the current snapshot, if any
    pub async fn snapshot_age_ms(&self, now_ms: u64) -> Option<u64> {
        self.snapshot().await.map(|s| s.age_ms(now_ms))
    }

    pub async fn relay_count(&self) -> usize {
        self.snapshot().await.map(|s| s.len()).unwrap_or(0)
    }

    pub async fn guard_count(&self) -> usize {
        self.snapshot()
            .await
            .map(|s| s.guard_nodes().len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::relay::RoleSet;

    fn relay(id: &str, flags: &str, stable: bool) -> RelayNode {
        RelayNode::new(
            id,
            "127.0.0.1:9001",
            RoleSet::from_flags(flags),
            vec![7u8; 32],
            vec![3u8; 32],
            stable,
        )
    }

    struct FailingSource;

    #[async_trait]
    impl DirectorySource for FailingSource {
        async fn fetch_relays(&self) -> Result<Vec<RelayNode>> {
            Err(OnionError::ConnectionFailed("unreachable".into()))
        }
    }

    struct SlowSource;

    #[async_trait]
    impl DirectorySource for SlowSource {
        async fn fetch_relays(&self) -> Result<Vec<RelayNode>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_snapshot_guard_list() {
        let snap = DirectorySnapshot::from_relays(vec![
            relay("g1", "Guard", true),
            relay("g2", "Guard Middle", false),
            relay("m1", "Middle", true),
            relay("e1", "Exit", true),
        ])
        .unwrap();

        assert_eq!(snap.len(), 4);
        let guards: Vec<&str> = snap.guard_nodes().iter().map(|g| g.node_id.as_str()).collect();
        assert_eq!(guards, vec!["g1"]);
        assert_eq!(snap.with_role(NodeRole::Middle).len(), 2);
    }

    #[test]
    fn test_snapshot_rejects_empty_and_middleless() {
        assert!(DirectorySnapshot::from_relays(Vec::new()).is_err());
        assert!(DirectorySnapshot::from_relays(vec![relay("g1", "Guard", true)]).is_err());
        assert!(DirectorySnapshot::from_relays(vec![relay("m1", "Middle", true)]).is_err());
    }

    #[test]
    fn test_snapshot_skips_invalid_and_duplicates() {
        let mut broken = relay("broken", "Middle", true);
        broken.onion_key.truncate(5);

        let snap = DirectorySnapshot::from_relays(vec![
            relay("g1", "Guard", true),
            relay("m1", "Middle", true),
            relay("m1", "Exit", true),
            broken,
        ])
        .unwrap();

        assert_eq!(snap.len(), 2);
        assert!(!snap.contains("broken"));
        assert!(snap.get("m1").unwrap().has_role(NodeRole::Middle));
    }

    #[tokio::test]
    async fn test_fetch_replaces_snapshot() {
        let source = Arc::new(StaticDirectory::new(vec![
            relay("g1", "Guard", true),
            relay("m1", "Middle", true),
        ]));
        let directory = NodeDirectory::new(source, Duration::from_secs(1));

        assert!(directory.snapshot().await.is_none());
        assert!(directory.snapshot_age_ms(crate::now_ms()).await.is_none());
        assert!(directory.fetch().await);
        assert_eq!(directory.relay_count().await, 2);
        assert_eq!(directory.guard_count().await, 1);

        let first = directory.snapshot().await.unwrap();
        assert!(first.fetched_at() > 0);
        assert_eq!(first.age_ms(first.fetched_at() + 500), 500);
        assert_eq!(first.age_ms(0), 0);
        assert_eq!(
            directory.snapshot_age_ms(first.fetched_at() + 250).await,
            Some(250)
        );

        assert!(directory.fetch().await);
        let second = directory.snapshot().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.fetched_at() >= first.fetched_at());
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_previous_snapshot() {
        let directory = NodeDirectory::new(Arc::new(FailingSource), Duration::from_secs(1));
        assert!(!directory.fetch().await);
        assert!(directory.require_snapshot().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout() {
        let directory = NodeDirectory::new(Arc::new(SlowSource), Duration::from_millis(50));
        let err = directory.try_fetch().await.unwrap_err();
        assert!(matches!(err, OnionError::Timeout(_)));
    }

    #[test]
    fn test_static_directory_from_json() {
        let json = serde_json::to_string(&vec![relay("g1", "Guard", true)]).unwrap();
        let dir = StaticDirectory::from_json(&json).unwrap();
        assert_eq!(dir.relays().len(), 1);
        assert!(StaticDirectory::from_json("{").is_err());
    }
}
