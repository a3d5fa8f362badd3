//! The process-wide identity manager.
//!
//! The manager owns the single in-memory [`IdentityRecord`], its durable
//! mirror and at most one acquisition cycle. Remote calls run as tasks on a
//! tokio runtime; the retry loop itself runs on a dedicated driver thread
//! that blocks only on per-attempt gates.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::runtime::{Handle, Runtime};
use visitor_client::{HttpIdentityService, IdentityService};
use visitor_core::{
    AuthState, IdentityRecord, ServiceError, ServiceResult, VisitorConfig, VisitorError,
    VisitorResult,
};
use visitor_storage::{FileIdentityStore, IdentityStore, MemoryIdentityStore};

use crate::gate::Gate;
use crate::pipeline::{LinkCallback, Origin, ResponsePipeline};

const WORKER_THREAD_NAME: &str = "visitor-id-worker";
const DRIVER_THREAD_NAME: &str = "visitor-id-acquire";

static INSTANCE: OnceCell<IdentityManager> = OnceCell::new();

// ============================================================================
// ACQUISITION CYCLE
// ============================================================================

/// Snapshot of an in-flight acquisition cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionState {
    pub attempts_remaining: u32,
    pub in_flight: bool,
}

pub(crate) struct AcquisitionCycle {
    generation: u64,
    max_attempts: u32,
    /// Consumers wait here. Sized to the attempt budget and force-drained
    /// as soon as a record is present.
    gate: Gate,
    attempts_remaining: AtomicU32,
    in_flight: AtomicBool,
    cancelled: AtomicBool,
    attempt_gate: Mutex<Option<Arc<Gate>>>,
}

impl AcquisitionCycle {
    fn new(generation: u64, max_attempts: u32) -> Self {
        Self {
            generation,
            max_attempts,
            gate: Gate::new(max_attempts),
            attempts_remaining: AtomicU32::new(max_attempts),
            in_flight: AtomicBool::new(true),
            cancelled: AtomicBool::new(false),
            attempt_gate: Mutex::new(None),
        }
    }

    fn attempt_slot(&self) -> MutexGuard<'_, Option<Arc<Gate>>> {
        self.attempt_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> Option<AcquisitionState> {
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        in_flight.then(|| AcquisitionState {
            attempts_remaining: self.attempts_remaining.load(Ordering::SeqCst),
            in_flight,
        })
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn begin_attempt(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::new(1));
        *self.attempt_slot() = Some(Arc::clone(&gate));
        gate
    }

    fn end_attempt(&self) {
        let _ = self
            .attempts_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            });
        self.gate.signal_one();
    }

    /// Release everything waiting on this cycle without ending it.
    fn release_waiters(&self) {
        if let Some(gate) = self.attempt_slot().as_ref() {
            gate.drain_all();
        }
        self.gate.drain_all();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.attempts_remaining.store(0, Ordering::SeqCst);
        self.release_waiters();
    }

    fn finish(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
        self.attempt_slot().take();
        self.gate.drain_all();
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

/// State shared between the manager handles, the driver thread and the
/// remote call tasks. Lock order is `persist`, then `record`, then `cycle`.
pub(crate) struct Shared {
    config: VisitorConfig,
    service: Arc<dyn IdentityService>,
    store: Arc<dyn IdentityStore>,
    /// Serializes store writes. The record lock is never held across I/O.
    persist: Mutex<()>,
    record: RwLock<Option<IdentityRecord>>,
    cycle: Mutex<Option<Arc<AcquisitionCycle>>>,
    generation: AtomicU64,
    refreshing: AtomicBool,
}

impl Shared {
    pub(crate) fn new(
        config: VisitorConfig,
        service: Arc<dyn IdentityService>,
        store: Arc<dyn IdentityStore>,
    ) -> Self {
        Self {
            config,
            service,
            store,
            persist: Mutex::new(()),
            record: RwLock::new(None),
            cycle: Mutex::new(None),
            generation: AtomicU64::new(0),
            refreshing: AtomicBool::new(false),
        }
    }

    // Records are swapped whole, so a poisoned lock never guards a torn value.
    fn read_record(&self) -> RwLockReadGuard<'_, Option<IdentityRecord>> {
        self.record.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_record(&self) -> RwLockWriteGuard<'_, Option<IdentityRecord>> {
        self.record.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist_lock(&self) -> MutexGuard<'_, ()> {
        self.persist.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cycle_slot(&self) -> MutexGuard<'_, Option<Arc<AcquisitionCycle>>> {
        self.cycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn current_record(&self) -> Option<IdentityRecord> {
        self.read_record().clone()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Replace and persist the record if `generation` is still current.
    ///
    /// Readers only wait for the swap. The save runs under the persist lock,
    /// which `reset` also takes, so a superseded save never lands after a
    /// clear.
    pub(crate) fn replace_record(&self, generation: u64, record: &IdentityRecord) -> bool {
        let _persist = self.persist_lock();
        {
            let mut slot = self.write_record();
            if self.generation() != generation {
                return false;
            }
            *slot = Some(record.clone());
        }
        if let Err(e) = self.store.save(record) {
            tracing::warn!(error = %e, "Failed to persist visitor identity");
        }
        true
    }

    /// Release consumers of the cycle belonging to `generation`.
    pub(crate) fn drain_cycle(&self, generation: u64) {
        if let Some(cycle) = self.cycle_slot().as_ref() {
            if cycle.generation == generation {
                cycle.release_waiters();
            }
        }
    }
}

/// Clears the refresh flag when the refresh task ends or is dropped.
struct RefreshGuard(Arc<Shared>);

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.0.refreshing.store(false, Ordering::SeqCst);
    }
}

/// Runtime created by the manager itself.
struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        // shutdown_background does not block, so the last handle may be
        // dropped from inside another runtime.
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Assembles an [`IdentityManager`].
///
/// Without an explicit service the manager talks HTTP to
/// `config.service_url`. Without an explicit store it persists to
/// `config.storage_path` when set and keeps the record in memory otherwise.
/// Without a runtime handle it owns a single-worker runtime.
pub struct IdentityManagerBuilder {
    config: VisitorConfig,
    service: Option<Arc<dyn IdentityService>>,
    store: Option<Arc<dyn IdentityStore>>,
    runtime: Option<Handle>,
}

impl IdentityManagerBuilder {
    pub fn new(config: VisitorConfig) -> Self {
        Self {
            config,
            service: None,
            store: None,
            runtime: None,
        }
    }

    pub fn service(mut self, service: Arc<dyn IdentityService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn store(mut self, store: Arc<dyn IdentityStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run remote calls on an existing runtime instead of an owned one.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    fn assemble(self) -> VisitorResult<IdentityManager> {
        self.config.validate()?;

        let service: Arc<dyn IdentityService> = match self.service {
            Some(service) => service,
            None => Arc::new(HttpIdentityService::from_config(&self.config)?),
        };
        let store: Arc<dyn IdentityStore> = match (self.store, &self.config.storage_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(FileIdentityStore::new(path)),
            (None, None) => Arc::new(MemoryIdentityStore::new()),
        };
        let (handle, runtime) = match self.runtime {
            Some(handle) => (handle, None),
            None => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name(WORKER_THREAD_NAME)
                    .enable_all()
                    .build()
                    .map_err(|e| VisitorError::Runtime {
                        reason: format!("Failed to start worker runtime: {}", e),
                    })?;
                let handle = runtime.handle().clone();
                (handle, Some(Arc::new(OwnedRuntime(Some(runtime)))))
            }
        };

        Ok(IdentityManager {
            shared: Arc::new(Shared::new(self.config, service, store)),
            handle,
            _runtime: runtime,
        })
    }

    /// Build a standalone manager and run its startup sequence.
    pub fn build(self) -> VisitorResult<IdentityManager> {
        let manager = self.assemble()?;
        manager.start();
        Ok(manager)
    }

    /// Build the process-wide manager. The first successful caller wins;
    /// later calls return the existing instance and ignore their arguments.
    pub fn initialize(self) -> VisitorResult<&'static IdentityManager> {
        INSTANCE.get_or_try_init(|| self.build())
    }
}

// ============================================================================
// MANAGER
// ============================================================================

/// Owner of the process-wide visitor identity.
///
/// Cloning is cheap; clones share the same record, store and cycle.
#[derive(Clone)]
pub struct IdentityManager {
    shared: Arc<Shared>,
    handle: Handle,
    _runtime: Option<Arc<OwnedRuntime>>,
}

impl IdentityManager {
    pub fn builder(config: VisitorConfig) -> IdentityManagerBuilder {
        IdentityManagerBuilder::new(config)
    }

    /// Initialize the process-wide manager with explicit collaborators.
    pub fn initialize(
        config: VisitorConfig,
        service: Arc<dyn IdentityService>,
        store: Arc<dyn IdentityStore>,
    ) -> VisitorResult<&'static IdentityManager> {
        Self::builder(config).service(service).store(store).initialize()
    }

    /// The process-wide manager, if initialized.
    pub fn global() -> Option<&'static IdentityManager> {
        INSTANCE.get()
    }

    pub fn config(&self) -> &VisitorConfig {
        &self.shared.config
    }

    pub fn org_id(&self) -> &str {
        &self.shared.config.org_id
    }

    /// Snapshot of the current record. Never blocks on acquisition.
    pub fn current_record(&self) -> Option<IdentityRecord> {
        self.shared.current_record()
    }

    /// State of the acquisition cycle, if one is in flight.
    pub fn acquisition_state(&self) -> Option<AcquisitionState> {
        self.shared.cycle_slot().as_ref().and_then(|cycle| cycle.state())
    }

    fn start(&self) {
        let config = &self.shared.config;

        let record = match config.existing_id() {
            Some(id) => {
                tracing::info!("Using configured visitor id");
                let record = IdentityRecord::from_override(id);
                self.shared.replace_record(self.shared.generation(), &record);
                Some(record)
            }
            None => {
                let persisted = self.shared.store.load().unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Failed to load persisted visitor identity");
                    None
                });
                if let Some(record) = &persisted {
                    *self.shared.write_record() = Some(record.clone());
                }
                persisted
            }
        };

        match record {
            Some(record) => {
                if let Some(link) = config.link_params() {
                    self.link_to_known_identifier(
                        link.known_id,
                        link.data_provider_id,
                        link.auth_state,
                        None,
                    );
                } else if record.is_stale() {
                    self.spawn_refresh(record);
                }
            }
            None => {
                if let Some(cycle) = self.ensure_cycle() {
                    let wait = cycle.gate.wait(config.consumer_wait());
                    tracing::debug!(
                        completed = wait.completed,
                        "Initial visitor identity acquisition settled"
                    );
                }
            }
        }
    }

    /// Return the current record, starting or joining an acquisition cycle
    /// and waiting up to `max_wait` when none is present.
    pub fn resolve_record(&self, max_wait: Duration) -> Option<IdentityRecord> {
        if let Some(record) = self.current_record() {
            return Some(record);
        }
        if let Some(cycle) = self.ensure_cycle() {
            if cycle.gate.wait(max_wait).expired {
                tracing::debug!(?max_wait, "Gave up waiting for visitor identity");
            }
        }
        self.current_record()
    }

    pub async fn resolve_record_async(&self, max_wait: Duration) -> Option<IdentityRecord> {
        if let Some(record) = self.current_record() {
            return Some(record);
        }
        if let Some(cycle) = self.ensure_cycle() {
            if cycle.gate.wait_async(max_wait).await.expired {
                tracing::debug!(?max_wait, "Gave up waiting for visitor identity");
            }
        }
        self.current_record()
    }

    /// Link `known_id` to the current identity.
    ///
    /// Returns `false` without calling the service when no identity is
    /// present. Otherwise the outcome updates the record on success and is
    /// passed to `callback` either way.
    pub fn link_to_known_identifier(
        &self,
        known_id: impl Into<String>,
        data_provider_id: i64,
        auth_state: Option<AuthState>,
        callback: Option<LinkCallback>,
    ) -> bool {
        let Some(current) = self.current_record() else {
            tracing::debug!("Ignoring link request without a visitor identity");
            return false;
        };

        let known_id = known_id.into();
        let shared = Arc::clone(&self.shared);
        let generation = shared.generation();
        self.handle.spawn(async move {
            let result = shared
                .service
                .link_known_identifier(&known_id, &current.id, data_provider_id, auth_state)
                .await;
            ResponsePipeline::new(&shared, generation, Origin::Link)
                .with_data_provider(Some(data_provider_id))
                .with_callback(callback)
                .run(result);
        });
        true
    }

    /// Async form of [`IdentityManager::link_to_known_identifier`]. `None`
    /// means no identity was present to link.
    pub async fn link_to_known_identifier_async(
        &self,
        known_id: impl Into<String>,
        data_provider_id: i64,
        auth_state: Option<AuthState>,
    ) -> Option<ServiceResult<IdentityRecord>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let callback: LinkCallback = Box::new(move |result| {
            let _ = tx.send(result.clone());
        });
        if !self.link_to_known_identifier(known_id, data_provider_id, auth_state, Some(callback)) {
            return None;
        }
        Some(rx.await.unwrap_or_else(|_| {
            Err(ServiceError::RequestFailed {
                status: 0,
                message: "link request was dropped before completing".to_string(),
            })
        }))
    }

    /// Start a background refresh if the current record is stale.
    pub fn refresh_if_stale(&self) -> bool {
        match self.current_record() {
            Some(record) if record.is_stale() => self.spawn_refresh(record),
            _ => false,
        }
    }

    fn spawn_refresh(&self, current: IdentityRecord) -> bool {
        if self.shared.refreshing.swap(true, Ordering::SeqCst) {
            return false;
        }
        let guard = RefreshGuard(Arc::clone(&self.shared));
        let generation = self.shared.generation();
        tracing::debug!(generation, "Refreshing stale visitor identity");

        self.handle.spawn(async move {
            let shared = &guard.0;
            let result = shared.service.refresh_existing(&current.id).await;
            ResponsePipeline::new(shared, generation, Origin::Refresh)
                .with_data_provider(current.data_provider_id)
                .run(result);
        });
        true
    }

    /// Clear the record and its durable copy and stop any running cycle.
    ///
    /// Completions of calls issued before the reset are discarded.
    pub fn reset(&self) {
        let _persist = self.shared.persist_lock();
        let generation = {
            let mut record = self.shared.write_record();
            let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *record = None;
            if let Some(cycle) = self.shared.cycle_slot().take() {
                cycle.cancel();
            }
            generation
        };
        if let Err(e) = self.shared.store.clear() {
            tracing::warn!(error = %e, "Failed to clear persisted visitor identity");
        }
        tracing::info!(generation, "Visitor identity reset");
    }

    /// Stop retrying. Whatever record exists is kept and waiters are
    /// released. A cancelled cycle is not restarted until [`reset`].
    ///
    /// [`reset`]: IdentityManager::reset
    pub fn cancel_acquisition(&self) -> bool {
        match self.shared.cycle_slot().as_ref() {
            Some(cycle) if cycle.state().is_some() => {
                cycle.cancel();
                tracing::info!(generation = cycle.generation, "Visitor identity acquisition cancelled");
                true
            }
            _ => false,
        }
    }

    /// The cycle for the current generation, starting one if none exists.
    /// A terminated cycle is returned as is and not restarted.
    fn ensure_cycle(&self) -> Option<Arc<AcquisitionCycle>> {
        let max_attempts = self.shared.config.attempt_budget();
        if max_attempts == 0 {
            return None;
        }

        let mut slot = self.shared.cycle_slot();
        if let Some(cycle) = slot.as_ref() {
            return Some(Arc::clone(cycle));
        }
        let cycle = Arc::new(AcquisitionCycle::new(self.shared.generation(), max_attempts));
        *slot = Some(Arc::clone(&cycle));
        drop(slot);

        let shared = Arc::clone(&self.shared);
        let handle = self.handle.clone();
        let driven = Arc::clone(&cycle);
        let spawned = std::thread::Builder::new()
            .name(DRIVER_THREAD_NAME.to_string())
            .spawn(move || drive(shared, handle, driven));
        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to start visitor identity acquisition");
            cycle.finish();
        }
        Some(cycle)
    }
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityManager")
            .field("org_id", &self.shared.config.org_id)
            .field("service", &self.shared.service.name())
            .field("generation", &self.shared.generation())
            .field("record_present", &self.shared.read_record().is_some())
            .finish()
    }
}

/// The retry loop. Runs on its own thread for the lifetime of one cycle.
fn drive(shared: Arc<Shared>, handle: Handle, cycle: Arc<AcquisitionCycle>) {
    let timeout = shared.config.request_timeout();
    let link = shared.config.link_params();

    for attempt in 1..=cycle.max_attempts {
        if cycle.is_cancelled() || shared.generation() != cycle.generation {
            break;
        }

        let attempt_gate = cycle.begin_attempt();
        tracing::debug!(
            attempt,
            max_retries = cycle.max_attempts,
            generation = cycle.generation,
            "Requesting visitor identity"
        );

        let task_shared = Arc::clone(&shared);
        let task_gate = Arc::clone(&attempt_gate);
        let task_link = link.clone();
        let generation = cycle.generation;
        handle.spawn(async move {
            let (result, data_provider_id) = match &task_link {
                Some(link) => (
                    task_shared
                        .service
                        .request_new_and_link(&link.known_id, link.data_provider_id, link.auth_state)
                        .await,
                    Some(link.data_provider_id),
                ),
                None => (task_shared.service.request_new().await, None),
            };
            ResponsePipeline::new(&task_shared, generation, Origin::Acquisition)
                .with_data_provider(data_provider_id)
                .with_attempt_gate(task_gate)
                .run(result);
        });

        if attempt_gate.wait(timeout).expired {
            tracing::debug!(attempt, ?timeout, "Visitor identity request did not settle in time");
        }
        cycle.end_attempt();

        if shared.current_record().is_some() {
            break;
        }
    }

    cycle.finish();
    if shared.current_record().is_some() {
        tracing::info!(generation = cycle.generation, "Visitor identity acquired");
    } else {
        tracing::warn!(
            generation = cycle.generation,
            max_retries = cycle.max_attempts,
            "Visitor identity acquisition ended without a record"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_end_attempt_counts_down() {
        let cycle = AcquisitionCycle::new(0, 2);
        assert_eq!(
            cycle.state(),
            Some(AcquisitionState {
                attempts_remaining: 2,
                in_flight: true
            })
        );

        cycle.end_attempt();
        assert_eq!(cycle.state().map(|s| s.attempts_remaining), Some(1));
        assert!(!cycle.gate.is_open());

        cycle.end_attempt();
        assert!(cycle.gate.is_open());
        cycle.end_attempt();
        assert_eq!(cycle.state().map(|s| s.attempts_remaining), Some(0));
    }

    #[test]
    fn test_cycle_cancel_releases_attempt_and_consumers() {
        let cycle = AcquisitionCycle::new(0, 5);
        let attempt = cycle.begin_attempt();

        cycle.cancel();

        assert!(attempt.is_open());
        assert!(cycle.gate.is_open());
        assert!(cycle.is_cancelled());
        assert_eq!(cycle.state().map(|s| s.attempts_remaining), Some(0));
    }

    #[test]
    fn test_finished_cycle_reports_no_state() {
        let cycle = AcquisitionCycle::new(3, 1);
        cycle.finish();
        assert_eq!(cycle.state(), None);
        assert!(cycle.gate.is_open());
    }
}
