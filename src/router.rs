//! Onion router
//!
//! `OnionRouter` is the one context object a caller owns. It ties the
//! directory, the circuit builder, guard state, the transport and the
//! hidden-service directory together and keeps the table of live circuits.
//!
//! ## Locking
//!
//! - The circuit table lock is held only to insert, remove or look up a
//!   handle, never across a handshake, a transport send or any crypto
//! - Each circuit has its own mutex, so work on different circuits runs
//!   in parallel
//! - The directory snapshot is an `Arc` swapped after a fetch completes
//!
//! ## Two error channels
//!
//! The plain operations (`build_circuit`, `send_data`, ...) answer with
//! `Option`/`bool` for expected absence. Each has a `try_*` twin that
//! returns the `OnionError` describing what went wrong.

use crate::config::{RouterConfig, MIN_PATH_LENGTH};
use crate::error::{OnionError, Result};
use crate::guards::GuardState;
use crate::hidden_service::{HiddenService, HiddenServiceDirectory};
use crate::protocol::{
    CircuitBuilder, CircuitState, DirectorySource, HopHandshake, NodeDirectory, OnionCircuit,
    RelaySelector, X25519Handshake,
};
use crate::stats::{RouterCounters, RouterStats};
use crate::transport::{CellTransport, MemoryTransport};
use futures::future::join_all;
use rand::{rngs::OsRng, RngCore};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};

/// Purpose given to circuits built for hidden-service connections
pub const RENDEZVOUS_PURPOSE: &str = "rendezvous";

/// Shared handle to a registered circuit
///
/// Cloning is cheap; every clone points at the same circuit.
#[derive(Clone)]
pub struct CircuitHandle {
    id: String,
    inner: Arc<Mutex<OnionCircuit>>,
}

impl CircuitHandle {
    fn new(circuit: OnionCircuit) -> Self {
        Self {
            id: circuit.circuit_id.clone(),
            inner: Arc::new(Mutex::new(circuit)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Exclusive access to the circuit
    pub async fn lock(&self) -> MutexGuard<'_, OnionCircuit> {
        self.inner.lock().await
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state()
    }
}

impl std::fmt::Debug for CircuitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitHandle").field("id", &self.id).finish()
    }
}

/// The onion routing engine
pub struct OnionRouter {
    config: RouterConfig,
    node_id: String,
    directory: NodeDirectory,
    guards: Mutex<GuardState>,
    builder: CircuitBuilder,
    transport: Arc<dyn CellTransport>,
    circuits: RwLock<HashMap<String, CircuitHandle>>,
    services: HiddenServiceDirectory,
    counters: RouterCounters,
}

impl OnionRouter {
    /// Create a router reading relays from `source`
    ///
    /// Uses x25519 key agreement and an in-memory ring transport that never
    /// refuses a frame, until replaced with
    /// [`with_handshake`](Self::with_handshake) and
    /// [`with_transport`](Self::with_transport).
    pub fn new(config: RouterConfig, source: Arc<dyn DirectorySource>) -> Result<Self> {
        config.validate()?;

        let node_id = config.node_id.clone().unwrap_or_else(|| {
            let mut bytes = [0u8; 8];
            OsRng.fill_bytes(&mut bytes);
            hex::encode(bytes)
        });

        log::info!("🧅 Onion router {} starting", node_id);

        Ok(Self {
            directory: NodeDirectory::new(source, config.directory.fetch_timeout()),
            guards: Mutex::new(GuardState::new(config.guards.clone())),
            builder: CircuitBuilder::new(
                Arc::new(X25519Handshake::new()),
                config.circuit.handshake_timeout(),
            ),
            transport: Arc::new(MemoryTransport::new()),
            circuits: RwLock::new(HashMap::new()),
            services: HiddenServiceDirectory::new(),
            counters: RouterCounters::default(),
            node_id,
            config,
        })
    }

    /// Replace the per-hop key agreement
    pub fn with_handshake(mut self, handshake: Arc<dyn HopHandshake>) -> Self {
        self.builder = CircuitBuilder::new(handshake, self.config.circuit.handshake_timeout());
        self
    }

    /// Replace the frame transport
    pub fn with_transport(mut self, transport: Arc<dyn CellTransport>) -> Self {
        log::debug!("Using {} transport", transport.transport_name());
        self.transport = transport;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn directory(&self) -> &NodeDirectory {
        &self.directory
    }

    /// Copy of the current guard failure state
    pub async fn guard_state(&self) -> GuardState {
        self.guards.lock().await.clone()
    }

    // ---- Directory ----

    /// Fetch the relay directory; `false` leaves the previous snapshot
    pub async fn fetch_consensus(&self) -> bool {
        match self.try_fetch_consensus().await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("⚠️ Consensus fetch failed: {}", e);
                false
            }
        }
    }

    /// Fetch the relay directory, returning how many relays it holds
    pub async fn try_fetch_consensus(&self) -> Result<usize> {
        let count = self.directory.try_fetch().await?;
        self.guards.lock().await.cleanup(crate::now_ms());
        Ok(count)
    }

    // ---- Circuits ----

    /// Build and register a circuit of `path_length` hops
    pub async fn build_circuit(&self, purpose: &str, path_length: usize) -> Option<CircuitHandle> {
        match self.try_build_circuit(purpose, path_length).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("⚠️ Circuit build failed: {}", e);
                None
            }
        }
    }

    pub async fn try_build_circuit(&self, purpose: &str, path_length: usize) -> Result<CircuitHandle> {
        let circuit = self.build_unregistered(purpose, path_length).await?;
        self.register(circuit).await
    }

    /// Build a circuit without registering it, retrying with fresh paths
    async fn build_unregistered(&self, purpose: &str, path_length: usize) -> Result<OnionCircuit> {
        let max_path = self.config.circuit.max_path_length;
        if path_length < MIN_PATH_LENGTH || path_length > max_path {
            return Err(OnionError::InvalidState(format!(
                "path length {} outside {}..={}",
                path_length, MIN_PATH_LENGTH, max_path
            )));
        }

        self.ensure_capacity().await?;
        let snapshot = self.directory.require_snapshot().await?;

        let attempts = self.config.circuit.max_build_attempts;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let benched = self.guards.lock().await.bad_guards(crate::now_ms());

            let path = match RelaySelector::new(&snapshot)
                .excluding_guards(benched)
                .select_path(path_length)
            {
                Ok(path) => path,
                Err(e) => {
                    self.counters.circuit_failed();
                    return Err(e);
                }
            };
            let guard_id = path[0].node_id.clone();

            match self
                .builder
                .build(CircuitBuilder::new_circuit_id(), purpose, path)
                .await
            {
                Ok(circuit) => {
                    self.guards.lock().await.record_success(&guard_id);
                    return Ok(circuit);
                }
                Err(failure) => {
                    self.counters.circuit_failed();

                    if failure.position == 0 {
                        self.guards.lock().await.record_failure(
                            &failure.node_id,
                            &failure.error.to_string(),
                            crate::now_ms(),
                        );
                    }

                    log::warn!(
                        "⚠️ Build attempt {}/{} failed at {}",
                        attempt,
                        attempts,
                        failure
                    );

                    if !failure.error.is_retryable() {
                        return Err(failure.error);
                    }
                    last_error = Some(failure.error);
                }
            }
        }

        Err(OnionError::CircuitBuildFailed(format!(
            "gave up after {} attempts: {}",
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn ensure_capacity(&self) -> Result<()> {
        let active = self.circuits.read().await.len();
        if active >= self.config.circuit.max_circuits {
            return Err(OnionError::ResourceExhausted(format!(
                "circuit table full ({} circuits)",
                active
            )));
        }
        Ok(())
    }

    async fn register(&self, circuit: OnionCircuit) -> Result<CircuitHandle> {
        let handle = CircuitHandle::new(circuit);

        {
            let mut circuits = self.circuits.write().await;
            if circuits.len() < self.config.circuit.max_circuits {
                circuits.insert(handle.id.clone(), handle.clone());
                self.counters.circuit_built();
                return Ok(handle);
            }
        }

        // Lost a race for the last slot
        handle.lock().await.close();
        Err(OnionError::ResourceExhausted(
            "circuit table filled during build".into(),
        ))
    }

    /// Registered circuit by id
    pub async fn circuit(&self, circuit_id: &str) -> Option<CircuitHandle> {
        self.circuits.read().await.get(circuit_id).cloned()
    }

    pub async fn circuit_ids(&self) -> Vec<String> {
        self.circuits.read().await.keys().cloned().collect()
    }

    /// Encrypt `payload` for every hop and hand the frame to the transport
    pub async fn send_data(&self, circuit_id: &str, payload: &[u8]) -> bool {
        match self.try_send_data(circuit_id, payload).await {
            Ok(_) => true,
            Err(e) => {
                log::debug!("send on {} failed: {}", crate::short_id(circuit_id), e);
                false
            }
        }
    }

    /// Like [`send_data`](Self::send_data), returning the encrypted length
    pub async fn try_send_data(&self, circuit_id: &str, payload: &[u8]) -> Result<usize> {
        let handle = self
            .circuit(circuit_id)
            .await
            .ok_or_else(|| OnionError::CircuitNotFound(circuit_id.to_string()))?;

        let (frame, guard) = {
            let circuit = handle.lock().await;
            let frame = circuit.onion_encrypt(payload)?;
            let guard = circuit
                .guard()
                .cloned()
                .ok_or_else(|| OnionError::InvalidState("circuit has no hops".into()))?;
            (frame, guard)
        };

        let len = frame.len();
        self.transport.send_cell(circuit_id, &guard, frame).await?;

        handle.lock().await.record_sent(len);
        self.counters.add_bytes_sent(len);

        Ok(len)
    }

    /// Remove a circuit and zeroize its keys; `false` if unknown
    pub async fn close_circuit(&self, circuit_id: &str) -> bool {
        let removed = self.circuits.write().await.remove(circuit_id);

        match removed {
            Some(handle) => {
                handle.lock().await.close();
                self.counters.circuit_closed();
                log::info!("🔒 Closed circuit {}", crate::short_id(circuit_id));
                true
            }
            None => false,
        }
    }

    /// Close every circuit older than the configured lifetime
    pub async fn rotate_circuits(&self) -> usize {
        let handles: Vec<CircuitHandle> = self.circuits.read().await.values().cloned().collect();

        let lifetime = self.config.circuit.lifetime();
        let now = crate::now_ms();

        let mut expired = Vec::new();
        for handle in handles {
            if handle.lock().await.is_expired(lifetime, now) {
                expired.push(handle.id);
            }
        }

        let mut closed = 0;
        for id in expired {
            if self.close_circuit(&id).await {
                closed += 1;
            }
        }

        if closed > 0 {
            self.counters.circuits_rotated(closed);
            log::info!("🔄 Rotated {} expired circuits", closed);
        }

        closed
    }

    /// Close every registered circuit
    pub async fn close_all(&self) -> usize {
        let ids = self.circuit_ids().await;
        let results = join_all(ids.iter().map(|id| self.close_circuit(id))).await;
        results.into_iter().filter(|closed| *closed).count()
    }

    // ---- Hidden services ----

    /// Create a hidden service for `ports` (virtual -> local)
    pub async fn create_hidden_service(&self, ports: BTreeMap<u16, u16>) -> Option<Arc<HiddenService>> {
        match self.try_create_hidden_service(ports).await {
            Ok(service) => Some(service),
            Err(e) => {
                log::warn!("⚠️ Hidden service creation failed: {}", e);
                None
            }
        }
    }

    pub async fn try_create_hidden_service(
        &self,
        ports: BTreeMap<u16, u16>,
    ) -> Result<Arc<HiddenService>> {
        let snapshot = self.directory.require_snapshot().await?;
        self.services
            .create(ports, &snapshot, self.config.hidden_service.intro_points)
            .await
    }

    /// Build a rendezvous circuit toward a hidden service
    pub async fn connect_to_hidden_service(&self, onion_address: &str) -> Option<CircuitHandle> {
        match self.try_connect_to_hidden_service(onion_address).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("⚠️ Hidden service connection failed: {}", e);
                None
            }
        }
    }

    pub async fn try_connect_to_hidden_service(&self, onion_address: &str) -> Result<CircuitHandle> {
        let service = self.services.resolve(onion_address).await?;
        let snapshot = self.directory.require_snapshot().await?;

        let reachable = service.reachable_intro_points(&snapshot);
        if reachable.is_empty() {
            return Err(OnionError::NoIntroductionPoints(format!(
                "none of {} introduction points for {} are listed",
                service.introduction_points.len(),
                onion_address
            )));
        }

        log::info!(
            "🧅 Connecting to {} ({} intro points reachable)",
            service.address(),
            reachable.len()
        );

        let mut circuit = self
            .build_unregistered(RENDEZVOUS_PURPOSE, self.config.circuit.default_path_length)
            .await?;
        circuit.mark_rendezvous();

        self.register(circuit).await
    }

    pub async fn remove_hidden_service(&self, service_id: &str) -> bool {
        self.services.remove(service_id).await
    }

    pub async fn hidden_service(&self, service_id: &str) -> Option<Arc<HiddenService>> {
        self.services.get(service_id).await
    }

    pub async fn hidden_service_count(&self) -> usize {
        self.services.len().await
    }

    // ---- Stats ----

    pub async fn get_stats(&self) -> RouterStats {
        let mut stats = RouterStats {
            node_id: self.node_id.clone(),
            active_circuits: self.circuits.read().await.len(),
            relays_known: self.directory.relay_count().await,
            guards_known: self.directory.guard_count().await,
            hidden_services: self.services.len().await,
            ..Default::default()
        };
        self.counters.fill(&mut stats);
        stats
    }
}
