//! Relay types and selection logic
//!
//! Defines relay descriptors and provides the path selection used when
//! building circuits: guard first, middles in between, exit last.

use crate::error::{OnionError, Result};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use super::directory::DirectorySnapshot;

/// Length of an x25519 onion key
pub const ONION_KEY_LEN: usize = 32;

/// Role a relay can play in a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    /// First hop, sees the originator
    Guard,
    /// Any hop between guard and exit
    Middle,
    /// Last hop, sees the destination
    Exit,
}

impl NodeRole {
    pub const ALL: [NodeRole; 3] = [NodeRole::Guard, NodeRole::Middle, NodeRole::Exit];

    fn bit(self) -> u8 {
        match self {
            NodeRole::Guard => 0b001,
            NodeRole::Middle => 0b010,
            NodeRole::Exit => 0b100,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeRole::Guard => "Guard",
            NodeRole::Middle => "Middle",
            NodeRole::Exit => "Exit",
        };
        f.write_str(name)
    }
}

/// Set of roles held by one relay
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<NodeRole>", into = "Vec<NodeRole>")]
pub struct RoleSet(u8);

impl RoleSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, role: NodeRole) {
        self.0 |= role.bit();
    }

    pub fn with(mut self, role: NodeRole) -> Self {
        self.insert(role);
        self
    }

    pub fn contains(&self, role: NodeRole) -> bool {
        self.0 & role.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeRole> + '_ {
        NodeRole::ALL.into_iter().filter(move |r| self.contains(*r))
    }

    /// Parse a whitespace separated flag list ("Guard Middle Exit")
    ///
    /// Unknown flags are ignored.
    pub fn from_flags(flags: &str) -> Self {
        let mut roles = RoleSet::empty();
        for flag in flags.split_whitespace() {
            match flag {
                "Guard" => roles.insert(NodeRole::Guard),
                "Middle" => roles.insert(NodeRole::Middle),
                "Exit" => roles.insert(NodeRole::Exit),
                _ => {}
            }
        }
        roles
    }
}

impl FromIterator<NodeRole> for RoleSet {
    fn from_iter<I: IntoIterator<Item = NodeRole>>(iter: I) -> Self {
        let mut roles = RoleSet::empty();
        for role in iter {
            roles.insert(role);
        }
        roles
    }
}

impl From<Vec<NodeRole>> for RoleSet {
    fn from(roles: Vec<NodeRole>) -> Self {
        roles.into_iter().collect()
    }
}

impl From<RoleSet> for Vec<NodeRole> {
    fn from(roles: RoleSet) -> Self {
        roles.iter().collect()
    }
}

impl fmt::Debug for RoleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A relay from the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayNode {
    /// Unique relay identifier
    pub node_id: String,

    /// host:port
    pub address: String,

    /// Roles this relay may play
    pub roles: RoleSet,

    /// Long-term identity key (base64 in JSON)
    #[serde(with = "base64_bytes")]
    pub identity_key: Vec<u8>,

    /// x25519 key used for per-circuit key agreement (base64 in JSON)
    #[serde(with = "base64_bytes")]
    pub onion_key: Vec<u8>,

    /// Eligible for guard selection
    pub is_stable: bool,
}

impl RelayNode {
    pub fn new(
        node_id: impl Into<String>,
        address: impl Into<String>,
        roles: RoleSet,
        identity_key: Vec<u8>,
        onion_key: Vec<u8>,
        is_stable: bool,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            roles,
            identity_key,
            onion_key,
            is_stable,
        }
    }

    pub fn has_role(&self, role: NodeRole) -> bool {
        self.roles.contains(role)
    }

    /// Check if this relay can be used as a guard
    pub fn is_guard(&self) -> bool {
        self.has_role(NodeRole::Guard) && self.is_stable
    }

    /// The onion key as a fixed-size x25519 public key
    pub fn onion_public_key(&self) -> Result<[u8; ONION_KEY_LEN]> {
        self.onion_key.as_slice().try_into().map_err(|_| {
            OnionError::InvalidRelay(format!(
                "{}: onion key must be {} bytes, got {}",
                self.node_id,
                ONION_KEY_LEN,
                self.onion_key.len()
            ))
        })
    }

    /// Reject descriptors that can never take part in a circuit
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(OnionError::InvalidRelay("empty node_id".into()));
        }
        if self.address.is_empty() {
            return Err(OnionError::InvalidRelay(format!(
                "{}: empty address",
                self.node_id
            )));
        }
        if self.roles.is_empty() {
            return Err(OnionError::InvalidRelay(format!(
                "{}: no roles",
                self.node_id
            )));
        }
        if self.identity_key.is_empty() {
            return Err(OnionError::InvalidRelay(format!(
                "{}: empty identity key",
                self.node_id
            )));
        }
        self.onion_public_key().map(|_| ())
    }

    /// Shortened id for logs
    pub fn short_id(&self) -> &str {
        crate::short_id(&self.node_id)
    }
}

/// Path selection over one directory snapshot
pub struct RelaySelector<'a> {
    snapshot: &'a DirectorySnapshot,

    /// Guards to skip (currently benched by guard state)
    excluded_guards: HashSet<String>,
}

impl<'a> RelaySelector<'a> {
    pub fn new(snapshot: &'a DirectorySnapshot) -> Self {
        Self {
            snapshot,
            excluded_guards: HashSet::new(),
        }
    }

    /// Skip these guards, unless that leaves no guard at all
    pub fn excluding_guards(mut self, guards: HashSet<String>) -> Self {
        self.excluded_guards = guards;
        self
    }

    /// Select a guard uniformly from the usable guard list
    pub fn select_guard(&self) -> Option<Arc<RelayNode>> {
        let mut rng = rand::thread_rng();
        let guards = self.snapshot.guard_nodes();

        let usable: Vec<&Arc<RelayNode>> = guards
            .iter()
            .filter(|g| !self.excluded_guards.contains(&g.node_id))
            .collect();

        if usable.is_empty() {
            if !guards.is_empty() {
                log::warn!("⚠️ All {} guards are benched, ignoring guard state", guards.len());
            }
            return guards.choose(&mut rng).cloned();
        }

        usable.choose(&mut rng).map(|g| Arc::clone(g))
    }

    /// Select one relay holding `role`, skipping nodes already in the path
    pub fn select_with_role(&self, role: NodeRole, used: &HashSet<String>) -> Option<Arc<RelayNode>> {
        let mut rng = rand::thread_rng();
        let candidates: Vec<&Arc<RelayNode>> = self
            .snapshot
            .relays()
            .filter(|r| r.has_role(role) && !used.contains(&r.node_id))
            .collect();

        candidates.choose(&mut rng).map(|r| Arc::clone(r))
    }

    /// Select `path_length` distinct relays ordered guard first
    ///
    /// The last hop is an exit when one can be spared, otherwise a middle
    /// relay (exit-light networks degrade to guard/middle paths). Guard and
    /// last hop are only taken from relays that still leave enough middles,
    /// so a Middle+Exit relay is not spent on the last hop when it is the
    /// one relay that could fill a middle position.
    pub fn select_path(&self, path_length: usize) -> Result<Vec<Arc<RelayNode>>> {
        if path_length < crate::config::MIN_PATH_LENGTH {
            return Err(OnionError::InvalidState(format!(
                "path length {} is below the minimum of {}",
                path_length,
                crate::config::MIN_PATH_LENGTH
            )));
        }

        let middles_needed = path_length - 2;
        let insufficient = |available: usize| OnionError::InsufficientRelays {
            needed: path_length,
            available,
        };

        let guard = self
            .select_feasible_guard(middles_needed)
            .ok_or_else(|| insufficient(self.longest_available(path_length)))?;
        let mut used: HashSet<String> = HashSet::new();
        used.insert(guard.node_id.clone());

        let last = self
            .select_last_hop(&used, middles_needed)
            .ok_or_else(|| insufficient(1))?;
        used.insert(last.node_id.clone());

        let mut path = Vec::with_capacity(path_length);
        path.push(guard);

        for position in 1..path_length - 1 {
            let middle = self
                .select_with_role(NodeRole::Middle, &used)
                .ok_or_else(|| insufficient(position + 1))?;
            used.insert(middle.node_id.clone());
            path.push(middle);
        }

        path.push(last);

        log::debug!(
            "Selected path: {}",
            path.iter().map(|r| r.short_id()).collect::<Vec<_>>().join(" -> ")
        );

        Ok(path)
    }

    /// Guard (benched ones last) from which a full path can still be built
    fn select_feasible_guard(&self, middles_needed: usize) -> Option<Arc<RelayNode>> {
        let mut rng = rand::thread_rng();
        let feasible: Vec<&Arc<RelayNode>> = self
            .snapshot
            .guard_nodes()
            .iter()
            .filter(|g| {
                let used: HashSet<String> = [g.node_id.clone()].into_iter().collect();
                self.can_complete(&used, middles_needed)
            })
            .collect();

        let usable: Vec<&Arc<RelayNode>> = feasible
            .iter()
            .filter(|g| !self.excluded_guards.contains(&g.node_id))
            .copied()
            .collect();

        if usable.is_empty() && !feasible.is_empty() {
            log::warn!("⚠️ All usable guards are benched, ignoring guard state");
            return feasible.choose(&mut rng).map(|g| Arc::clone(g));
        }

        usable.choose(&mut rng).map(|g| Arc::clone(g))
    }

    /// Exit if one can be spared, else a middle, leaving `middles_needed`
    fn select_last_hop(&self, used: &HashSet<String>, middles_needed: usize) -> Option<Arc<RelayNode>> {
        let mut rng = rand::thread_rng();
        let spare = |r: &&Arc<RelayNode>| {
            !used.contains(&r.node_id)
                && self.free_middles(used) - usize::from(r.has_role(NodeRole::Middle)) >= middles_needed
        };

        let exits: Vec<&Arc<RelayNode>> = self
            .snapshot
            .relays()
            .filter(|r| r.has_role(NodeRole::Exit))
            .filter(spare)
            .collect();
        if let Some(exit) = exits.choose(&mut rng) {
            return Some(Arc::clone(exit));
        }

        let middles: Vec<&Arc<RelayNode>> = self
            .snapshot
            .relays()
            .filter(|r| r.has_role(NodeRole::Middle))
            .filter(spare)
            .collect();
        middles.choose(&mut rng).map(|m| Arc::clone(m))
    }

    /// Middle-capable relays not yet in the path
    fn free_middles(&self, used: &HashSet<String>) -> usize {
        self.snapshot
            .relays()
            .filter(|r| r.has_role(NodeRole::Middle) && !used.contains(&r.node_id))
            .count()
    }

    /// Whether a last hop plus `middles_needed` middles fit after `used`
    fn can_complete(&self, used: &HashSet<String>, middles_needed: usize) -> bool {
        let free = self.free_middles(used);
        if free > middles_needed {
            return true;
        }
        free == middles_needed
            && self.snapshot.relays().any(|r| {
                r.has_role(NodeRole::Exit)
                    && !r.has_role(NodeRole::Middle)
                    && !used.contains(&r.node_id)
            })
    }

    /// Longest path length this snapshot could support (for error reports)
    fn longest_available(&self, path_length: usize) -> usize {
        (crate::config::MIN_PATH_LENGTH..path_length)
            .rev()
            .find(|&len| self.select_feasible_guard(len - 2).is_some())
            .unwrap_or(0)
    }
}

/// Serde helper: raw key bytes as standard base64 strings
mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(id: &str, flags: &str, stable: bool) -> RelayNode {
        RelayNode::new(
            id,
            format!("10.0.0.1:{}", 9000 + id.len()),
            RoleSet::from_flags(flags),
            vec![1u8; 32],
            vec![9u8; 32],
            stable,
        )
    }

    fn snapshot(relays: Vec<RelayNode>) -> DirectorySnapshot {
        DirectorySnapshot::from_relays(relays).unwrap()
    }

    #[test]
    fn test_role_set() {
        let roles = RoleSet::empty().with(NodeRole::Guard).with(NodeRole::Exit);
        assert!(roles.contains(NodeRole::Guard));
        assert!(!roles.contains(NodeRole::Middle));
        assert!(roles.contains(NodeRole::Exit));
        assert_eq!(roles.iter().count(), 2);

        assert_eq!(RoleSet::from_flags("Middle Bogus"), RoleSet::empty().with(NodeRole::Middle));
    }

    #[test]
    fn test_role_set_serde() {
        let roles = RoleSet::from_flags("Guard Middle");
        let json = serde_json::to_string(&roles).unwrap();
        assert_eq!(json, r#"["Guard","Middle"]"#);
        let restored: RoleSet = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, roles);
    }

    #[test]
    fn test_relay_json_keys_are_base64() {
        let node = relay("alpha", "Guard", true);
        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("CQkJCQkJ")); // base64 of 0x09 bytes
        let restored: RelayNode = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, node);
    }

    #[test]
    fn test_guard_requires_stable() {
        assert!(relay("g", "Guard", true).is_guard());
        assert!(!relay("g", "Guard", false).is_guard());
        assert!(!relay("m", "Middle", true).is_guard());
    }

    #[test]
    fn test_validate() {
        assert!(relay("ok", "Middle", true).validate().is_ok());

        let mut bad = relay("short-key", "Middle", true);
        bad.onion_key = vec![1, 2, 3];
        assert!(matches!(bad.validate(), Err(OnionError::InvalidRelay(_))));

        let mut no_roles = relay("none", "", true);
        no_roles.roles = RoleSet::empty();
        assert!(no_roles.validate().is_err());
    }

    #[test]
    fn test_select_path_distinct_and_ordered() {
        let snap = snapshot(vec![
            relay("guard1", "Guard", true),
            relay("guard2", "Guard Middle", true),
            relay("middle1", "Middle", true),
            relay("middle2", "Middle", false),
            relay("exit1", "Exit", true),
        ]);
        let selector = RelaySelector::new(&snap);

        for _ in 0..50 {
            let path = selector.select_path(3).unwrap();
            assert_eq!(path.len(), 3);
            assert!(path[0].is_guard());
            assert_eq!(path[2].node_id, "exit1");

            let ids: HashSet<&str> = path.iter().map(|r| r.node_id.as_str()).collect();
            assert_eq!(ids.len(), 3);
        }
    }

    #[test]
    fn test_exit_light_network_ends_on_middle() {
        let snap = snapshot(vec![
            relay("guard1", "Guard", true),
            relay("middle1", "Middle", true),
            relay("middle2", "Middle", true),
        ]);
        let path = RelaySelector::new(&snap).select_path(3).unwrap();
        assert!(path[2].has_role(NodeRole::Middle));
    }

    #[test]
    fn test_insufficient_relays() {
        let snap = snapshot(vec![
            relay("guard1", "Guard", true),
            relay("middle1", "Middle", true),
            relay("exit1", "Exit", true),
        ]);
        let err = RelaySelector::new(&snap).select_path(4).unwrap_err();
        assert!(matches!(err, OnionError::InsufficientRelays { needed: 4, .. }));
        assert!(RelaySelector::new(&snap).select_path(1).is_err());
    }

    #[test]
    fn test_excluded_guards_are_skipped() {
        let snap = snapshot(vec![
            relay("guard1", "Guard", true),
            relay("guard2", "Guard", true),
            relay("middle1", "Middle", true),
        ]);
        let benched: HashSet<String> = ["guard1".to_string()].into_iter().collect();
        let selector = RelaySelector::new(&snap).excluding_guards(benched);
        for _ in 0..20 {
            assert_eq!(selector.select_guard().unwrap().node_id, "guard2");
        }

        // Every guard benched: fall back rather than fail
        let all: HashSet<String> = ["guard1", "guard2"].iter().map(|s| s.to_string()).collect();
        let selector = RelaySelector::new(&snap).excluding_guards(all);
        assert!(selector.select_guard().is_some());
    }

    #[test]
    fn test_middle_exit_relay_fills_the_middle() {
        let snap = snapshot(vec![
            relay("g", "Guard", true),
            relay("x", "Exit", true),
            relay("mx", "Middle Exit", true),
        ]);
        let selector = RelaySelector::new(&snap);

        for _ in 0..100 {
            let path = selector.select_path(3).unwrap();
            let ids: Vec<&str> = path.iter().map(|r| r.node_id.as_str()).collect();
            assert_eq!(ids, vec!["g", "mx", "x"]);
        }
    }

    #[test]
    fn test_guard_middle_relay_kept_for_the_middle() {
        // Only "gm" can serve as a middle, so "g" must be the guard
        let snap = snapshot(vec![
            relay("g", "Guard", true),
            relay("gm", "Guard Middle", true),
            relay("x", "Exit", true),
        ]);
        let selector = RelaySelector::new(&snap);

        for _ in 0..100 {
            let path = selector.select_path(3).unwrap();
            let ids: Vec<&str> = path.iter().map(|r| r.node_id.as_str()).collect();
            assert_eq!(ids, vec!["g", "gm", "x"]);
        }
    }

    #[test]
    fn test_non_ascii_relay_ids() {
        let node = relay("guard-xé", "Guard", true);
        assert_eq!(node.short_id(), "guard-xé");

        let snap = snapshot(vec![
            node,
            relay("ééééééééémiddle", "Middle", true),
            relay("exit-é", "Exit", true),
        ]);
        let path = RelaySelector::new(&snap).select_path(3).unwrap();
        assert_eq!(path[1].short_id(), "éééééééé");
    }
}
