//! The authority: per-document state registry and the version gate.
//!
//! Architecture:
//! ```text
//!  GetDocument ─┐
//!  PushEvents  ─┼──► slot(doc_name) ──► Mutex<Instance> ──► DocumentState
//!  PullEvents  ─┘        │                   │
//!                        │                   ├── version gate (push/pull)
//!                        │                   └── on_new_version hook
//!                        │
//!              RwLock<HashMap<doc_name, Slot>>
//!                        │
//!        sweep_idle ─────┴──► InstanceDeleteGuard ──► evict
//! ```
//!
//! Each document name owns one slot behind an async mutex. Every request for
//! that name, including the first load from storage, runs while holding the
//! slot, so two pushes can never both observe the same "current version" and
//! concurrent first accesses share a single load. Different names only meet
//! at the registry lock, which is never held across I/O.
//!
//! Lock order is always slot → registry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock, Timestamp};
use crate::error::Result;
use crate::guard::{GuardConfig, InstanceDeleteGuard};
use crate::model::DocumentModel;
use crate::protocol::{
    CollabResponse, Empty, FailKind, GetDocumentRequest, GetDocumentResponse, PullEventsRequest,
    PullEventsResponse, PushEventsRequest,
};
use crate::state::StateOf;
use crate::storage::DocumentStorage;

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Identity requests must name to be accepted
    pub manager_id: String,
    /// A document untouched for this long becomes eligible for eviction
    pub idle_timeout: Duration,
    /// How often the background sweeper looks for idle documents
    pub sweep_interval: Duration,
    /// Eviction timers
    pub guard: GuardConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            manager_id: format!("manager-{}", Uuid::new_v4()),
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            guard: GuardConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Short timers and a fixed id.
    pub fn for_testing(manager_id: impl Into<String>) -> Self {
        Self {
            manager_id: manager_id.into(),
            idle_timeout: Duration::from_millis(200),
            sweep_interval: Duration::from_millis(50),
            guard: GuardConfig::for_testing(),
        }
    }
}

/// Called once per accepted push with the document name and new version.
pub type NewVersionHook = Arc<dyn Fn(&str, u64) + Send + Sync>;

/// Manager statistics.
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    pub loads: u64,
    pub pushes_accepted: u64,
    pub pushes_rejected: u64,
    pub pulls: u64,
    pub evictions: u64,
    pub live_documents: usize,
}

#[derive(Default)]
struct AtomicManagerStats {
    loads: AtomicU64,
    pushes_accepted: AtomicU64,
    pushes_rejected: AtomicU64,
    pulls: AtomicU64,
    evictions: AtomicU64,
}

/// In-memory record for one document name.
struct ManagerRecord<M: DocumentModel> {
    state: StateOf<M>,
    active_user_ids: HashSet<String>,
    last_access_time: Timestamp,
}

impl<M: DocumentModel> ManagerRecord<M> {
    fn new(state: StateOf<M>, now: Timestamp) -> Self {
        Self {
            state,
            active_user_ids: HashSet::new(),
            last_access_time: now,
        }
    }

    fn accept(self, model: &M, steps: Vec<M::Step>, client_id: &str, user_id: &str) -> Self {
        let Self {
            state,
            mut active_user_ids,
            last_access_time,
        } = self;
        active_user_ids.insert(user_id.to_string());
        Self {
            state: state.apply_accepted(model, steps, client_id),
            active_user_ids,
            last_access_time,
        }
    }
}

enum Instance<M: DocumentModel> {
    /// Registered, nothing loaded yet
    Empty,
    Live(ManagerRecord<M>),
    /// Storage had nothing; callers already queued on this slot share that
    /// answer instead of loading again
    Missing,
    /// Detached from the registry; holders of this slot must look again
    Evicted,
}

type Slot<M> = Arc<AsyncMutex<Instance<M>>>;
type Registry<M> = Arc<RwLock<HashMap<String, Slot<M>>>>;

/// Removes `slot` from the registry if it is still the one registered.
async fn unregister<M: DocumentModel>(instances: &Registry<M>, doc_name: &str, slot: &Slot<M>) {
    let mut map = instances.write().await;
    if map.get(doc_name).is_some_and(|s| Arc::ptr_eq(s, slot)) {
        map.remove(doc_name);
    }
}

fn version_matches(requested: i64, current: u64) -> bool {
    u64::try_from(requested).is_ok_and(|v| v == current)
}

fn version_reachable(requested: i64, current: u64) -> bool {
    u64::try_from(requested).is_ok_and(|v| v <= current)
}

/// Owns every live document and enforces the version gate.
pub struct CollabManager<M: DocumentModel> {
    config: ManagerConfig,
    model: Arc<M>,
    storage: Arc<dyn DocumentStorage<M>>,
    clock: Arc<dyn Clock>,
    guard: Arc<InstanceDeleteGuard>,
    instances: Registry<M>,
    on_new_version: Option<NewVersionHook>,
    sweeper: Mutex<Option<CancellationToken>>,
    stats: Arc<AtomicManagerStats>,
}

impl<M: DocumentModel> CollabManager<M> {
    /// Fails only if `config.guard` is invalid.
    pub fn new(config: ManagerConfig, model: M, storage: Arc<dyn DocumentStorage<M>>) -> Result<Self> {
        Self::with_clock(config, model, storage, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: ManagerConfig,
        model: M,
        storage: Arc<dyn DocumentStorage<M>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let guard = InstanceDeleteGuard::new(config.guard.clone(), clock.clone())?;
        log::info!("Collab manager {} created", config.manager_id);
        Ok(Self {
            config,
            model: Arc::new(model),
            storage,
            clock,
            guard: Arc::new(guard),
            instances: Arc::new(RwLock::new(HashMap::new())),
            on_new_version: None,
            sweeper: Mutex::new(None),
            stats: Arc::new(AtomicManagerStats::default()),
        })
    }

    /// Registers the observer notified after every accepted push.
    pub fn on_new_version<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, u64) + Send + Sync + 'static,
    {
        self.on_new_version = Some(Arc::new(hook));
        self
    }

    pub fn manager_id(&self) -> &str {
        &self.config.manager_id
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn guard(&self) -> &InstanceDeleteGuard {
        &self.guard
    }

    // ───────────────────────────────────────────────────────────────
    // Operations
    // ───────────────────────────────────────────────────────────────

    /// Loads (once) and returns the current document for `doc_name`,
    /// registering the user as active.
    pub async fn get_document(&self, req: &GetDocumentRequest) -> CollabResponse<GetDocumentResponse<M::Doc>> {
        let mut entry = self.live_instance(&req.doc_name).await?;
        let Instance::Live(record) = &mut *entry else {
            return Err(FailKind::DocumentNotFound);
        };
        self.touch(&req.doc_name, record, req.client_created_at);
        record.active_user_ids.insert(req.user_id.clone());

        log::debug!(
            "GetDocument {} by {} at version {}",
            req.doc_name,
            req.user_id,
            record.state.version()
        );

        Ok(GetDocumentResponse {
            doc: record.state.doc().clone(),
            version: record.state.version(),
            users: record.active_user_ids.len(),
            manager_id: self.config.manager_id.clone(),
        })
    }

    /// Appends `req.steps` if and only if `req.version` is exactly current.
    pub async fn push_events(&self, req: PushEventsRequest<M::Step>) -> CollabResponse<Empty> {
        if req.manager_id != self.config.manager_id {
            self.stats.pushes_rejected.fetch_add(1, Ordering::Relaxed);
            log::debug!("PushEvents for {} addressed to {}", req.doc_name, req.manager_id);
            return Err(FailKind::IncorrectManager);
        }

        let mut entry = self.live_instance(&req.doc_name).await?;
        let Instance::Live(record) = &mut *entry else {
            return Err(FailKind::DocumentNotFound);
        };
        self.touch(&req.doc_name, record, req.client_created_at);

        let current = record.state.version();
        if !version_matches(req.version, current) {
            self.stats.pushes_rejected.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "PushEvents for {} rejected: version {} != {current}",
                req.doc_name,
                req.version
            );
            return Err(FailKind::InvalidVersion);
        }

        let PushEventsRequest {
            doc_name,
            steps,
            client_id,
            user_id,
            ..
        } = req;
        let count = steps.len();

        let Instance::Live(record) = std::mem::replace(&mut *entry, Instance::Evicted) else {
            return Err(FailKind::DocumentNotFound);
        };
        let mut record = record.accept(&self.model, steps, &client_id, &user_id);
        // A write always counts as activity, so a pending eviction can never
        // discard an acknowledged step.
        record.last_access_time = self.clock.now_millis();
        let version = record.state.version();
        *entry = Instance::Live(record);

        self.stats.pushes_accepted.fetch_add(1, Ordering::Relaxed);
        log::debug!("PushEvents for {doc_name}: {count} step(s) from {client_id}, now version {version}");

        // Still holding the slot, so notifications for one document are
        // emitted in version order.
        if let Some(hook) = &self.on_new_version {
            hook(&doc_name, version);
        }

        Ok(Empty)
    }

    /// Returns every step accepted after `req.version`.
    pub async fn pull_events(&self, req: &PullEventsRequest) -> CollabResponse<PullEventsResponse<M::Step>> {
        if req.manager_id != self.config.manager_id {
            log::debug!("PullEvents for {} addressed to {}", req.doc_name, req.manager_id);
            return Err(FailKind::IncorrectManager);
        }

        let mut entry = self.live_instance(&req.doc_name).await?;
        let Instance::Live(record) = &mut *entry else {
            return Err(FailKind::DocumentNotFound);
        };
        self.touch(&req.doc_name, record, req.client_created_at);

        let current = record.state.version();
        if !version_reachable(req.version, current) {
            log::debug!(
                "PullEvents for {} rejected: version {} ahead of {current}",
                req.doc_name,
                req.version
            );
            return Err(FailKind::InvalidVersion);
        }

        self.stats.pulls.fetch_add(1, Ordering::Relaxed);
        let since = record.state.steps_since(req.version as u64);
        Ok(PullEventsResponse {
            steps: since.iter().map(|r| r.step.clone()).collect(),
            client_ids: since.iter().map(|r| r.client_id.clone()).collect(),
            version: current,
            users: record.active_user_ids.len(),
        })
    }

    /// Snapshot of the live state for `doc_name`, without loading or
    /// touching it.
    pub async fn get_collab_state(&self, doc_name: &str) -> Option<StateOf<M>> {
        let slot = self.instances.read().await.get(doc_name).cloned()?;
        let entry = slot.lock().await;
        match &*entry {
            Instance::Live(record) => Some(record.state.clone()),
            _ => None,
        }
    }

    /// Names of all loaded documents.
    pub async fn live_documents(&self) -> Vec<String> {
        let slots: Vec<(String, Slot<M>)> = self
            .instances
            .read()
            .await
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect();

        let mut names = Vec::with_capacity(slots.len());
        for (name, slot) in slots {
            if matches!(&*slot.lock().await, Instance::Live(_)) {
                names.push(name);
            }
        }
        names.sort();
        names
    }

    /// Active-user count for `doc_name`, if loaded.
    pub async fn user_count(&self, doc_name: &str) -> Option<usize> {
        let slot = self.instances.read().await.get(doc_name).cloned()?;
        let entry = slot.lock().await;
        match &*entry {
            Instance::Live(record) => Some(record.active_user_ids.len()),
            _ => None,
        }
    }

    pub async fn stats(&self) -> ManagerStats {
        ManagerStats {
            loads: self.stats.loads.load(Ordering::Relaxed),
            pushes_accepted: self.stats.pushes_accepted.load(Ordering::Relaxed),
            pushes_rejected: self.stats.pushes_rejected.load(Ordering::Relaxed),
            pulls: self.stats.pulls.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            live_documents: self.live_documents().await.len(),
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Eviction
    // ───────────────────────────────────────────────────────────────

    /// Schedules a pending delete for every document idle for at least
    /// `idle_timeout`. Returns how many were scheduled.
    pub async fn sweep_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let idle = u64::try_from(self.config.idle_timeout.as_millis()).unwrap_or(u64::MAX);
        let slots: Vec<(String, Slot<M>)> = self
            .instances
            .read()
            .await
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect();

        let mut scheduled = 0;
        for (name, slot) in slots {
            // A busy slot is in use right now, hence not idle.
            let Ok(entry) = slot.try_lock() else {
                continue;
            };
            let Instance::Live(record) = &*entry else {
                continue;
            };
            if now.saturating_sub(record.last_access_time) < idle || self.guard.is_pending(&name) {
                continue;
            }
            drop(entry);

            self.schedule_eviction(&name);
            scheduled += 1;
        }

        if scheduled > 0 {
            log::debug!("Idle sweep scheduled {scheduled} eviction(s)");
        }
        scheduled
    }

    fn schedule_eviction(&self, doc_name: &str) {
        let scheduled_at = self.clock.now_millis();
        let instances: Weak<RwLock<HashMap<String, Slot<M>>>> = Arc::downgrade(&self.instances);
        let stats = Arc::clone(&self.stats);
        let name = doc_name.to_string();

        self.guard.add_pending_delete(doc_name, move || {
            tokio::spawn(async move {
                let Some(instances) = instances.upgrade() else {
                    return;
                };
                let Some(slot) = instances.read().await.get(&name).cloned() else {
                    return;
                };

                let mut entry = slot.lock().await;
                match &*entry {
                    Instance::Live(record) if record.last_access_time < scheduled_at => {}
                    Instance::Live(_) => {
                        log::debug!("Eviction of {name} skipped: accessed since scheduling");
                        return;
                    }
                    _ => return,
                }

                *entry = Instance::Evicted;
                unregister(&instances, &name, &slot).await;
                stats.evictions.fetch_add(1, Ordering::Relaxed);
                log::info!("Evicted idle document {name}");
            });
        });
    }

    /// Runs [`sweep_idle`](Self::sweep_idle) every `sweep_interval` until
    /// [`destroy`](Self::destroy) or the manager is dropped.
    pub fn spawn_idle_sweeper(self: &Arc<Self>) {
        let token = CancellationToken::new();
        {
            let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = sweeper.replace(token.clone()) {
                previous.cancel();
            }
        }

        let manager = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.sweep_idle().await;
                    }
                }
            }
            log::debug!("Idle sweeper stopped");
        });
    }

    /// Stops the sweeper, cancels pending deletes, and drops every record.
    pub async fn destroy(&self) {
        if let Some(token) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
        self.guard.destroy();

        let slots: Vec<Slot<M>> = self.instances.write().await.drain().map(|(_, s)| s).collect();
        for slot in slots {
            *slot.lock().await = Instance::Evicted;
        }
        log::info!("Collab manager {} destroyed", self.config.manager_id);
    }

    // ───────────────────────────────────────────────────────────────
    // Internals
    // ───────────────────────────────────────────────────────────────

    /// Get or create the registry slot for `doc_name`.
    async fn slot(&self, doc_name: &str) -> Slot<M> {
        // Fast path: read lock
        {
            let map = self.instances.read().await;
            if let Some(slot) = map.get(doc_name) {
                return slot.clone();
            }
        }

        // Slow path: write lock, double-check
        let mut map = self.instances.write().await;
        map.entry(doc_name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(Instance::Empty)))
            .clone()
    }

    /// Locks the slot for `doc_name`, loading it from storage if needed.
    async fn live_instance(&self, doc_name: &str) -> CollabResponse<OwnedMutexGuard<Instance<M>>> {
        loop {
            let slot = self.slot(doc_name).await;
            let mut entry = slot.clone().lock_owned().await;

            if matches!(*entry, Instance::Live(_)) {
                return Ok(entry);
            }
            if matches!(*entry, Instance::Missing) {
                return Err(FailKind::DocumentNotFound);
            }
            if matches!(*entry, Instance::Evicted) {
                drop(entry);
                unregister(&self.instances, doc_name, &slot).await;
                continue;
            }

            self.stats.loads.fetch_add(1, Ordering::Relaxed);
            return match self.storage.get_initial_state(doc_name).await {
                Some(state) => {
                    log::info!("Loaded {doc_name} at version {}", state.version());
                    *entry = Instance::Live(ManagerRecord::new(state, self.clock.now_millis()));
                    Ok(entry)
                }
                None => {
                    *entry = Instance::Missing;
                    unregister(&self.instances, doc_name, &slot).await;
                    log::debug!("Document {doc_name} not found in storage");
                    Err(FailKind::DocumentNotFound)
                }
            };
        }
    }

    /// Runs the delete guard's access check. Only accesses it grants count
    /// as activity; an older client does not keep a doomed instance alive.
    fn touch(&self, doc_name: &str, record: &mut ManagerRecord<M>, client_created_at: Timestamp) {
        if self.guard.check_access(doc_name, client_created_at) {
            record.last_access_time = self.clock.now_millis();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::InMemoryStorage;
    use crate::text::{PlainText, TextStep};
    use std::sync::atomic::AtomicUsize;

    const MANAGER: &str = "manager-1";

    fn storage() -> Arc<InMemoryStorage<PlainText>> {
        Arc::new(InMemoryStorage::<PlainText>::new().with_document("doc", "hello world!".to_string()))
    }

    fn manager() -> CollabManager<PlainText> {
        CollabManager::new(ManagerConfig::for_testing(MANAGER), PlainText, storage()).unwrap()
    }

    fn get(doc: &str, user: &str) -> GetDocumentRequest {
        GetDocumentRequest {
            doc_name: doc.into(),
            user_id: user.into(),
            client_created_at: 0,
        }
    }

    fn push(version: i64, steps: Vec<TextStep>, client: &str) -> PushEventsRequest<TextStep> {
        PushEventsRequest {
            doc_name: "doc".into(),
            version,
            steps,
            client_id: client.into(),
            user_id: format!("user-{client}"),
            manager_id: MANAGER.into(),
            client_created_at: 0,
        }
    }

    fn pull(version: i64) -> PullEventsRequest {
        PullEventsRequest {
            doc_name: "doc".into(),
            version,
            user_id: "u".into(),
            manager_id: MANAGER.into(),
            client_created_at: 0,
        }
    }

    #[test]
    fn test_manager_config_default() {
        let config = ManagerConfig::default();
        assert!(config.manager_id.starts_with("manager-"));
        assert!(config.idle_timeout > config.sweep_interval);
        assert!(config.guard.validate().is_ok());
    }

    #[test]
    fn test_invalid_guard_config_rejected() {
        let mut config = ManagerConfig::for_testing(MANAGER);
        config.guard.delete_wait_time = config.guard.max_duration_to_keep_record;
        assert!(CollabManager::new(config, PlainText, storage()).is_err());
    }

    #[tokio::test]
    async fn test_get_document_loads_and_registers_user() {
        let m = manager();
        let res = m.get_document(&get("doc", "alice")).await.unwrap();

        assert_eq!(res.doc, "hello world!");
        assert_eq!(res.version, 0);
        assert_eq!(res.users, 1);
        assert_eq!(res.manager_id, MANAGER);

        let res = m.get_document(&get("doc", "bob")).await.unwrap();
        assert_eq!(res.users, 2);
        // Same user twice is still one user.
        let res = m.get_document(&get("doc", "bob")).await.unwrap();
        assert_eq!(res.users, 2);
    }

    #[tokio::test]
    async fn test_get_document_not_found_creates_no_record() {
        let m = manager();
        let res = m.get_document(&get("missing", "alice")).await;
        assert_eq!(res, Err(FailKind::DocumentNotFound));
        assert!(m.get_collab_state("missing").await.is_none());
        assert!(m.instances.read().await.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_push_accepts_exact_version() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let f = fired.clone();
        let m = manager().on_new_version(move |doc, v| f.lock().unwrap().push((doc.to_string(), v)));

        m.get_document(&get("doc", "alice")).await.unwrap();
        let res = m
            .push_events(push(0, vec![TextStep::insert(0, "lovely ")], "client-1"))
            .await;
        assert_eq!(res, Ok(Empty));

        let state = m.get_collab_state("doc").await.unwrap();
        assert_eq!(state.version(), 1);
        assert_eq!(state.doc(), "lovely hello world!");
        assert_eq!(state.steps()[0].client_id, "client-1");
        assert_eq!(*fired.lock().unwrap(), vec![("doc".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_push_multiple_steps_advances_by_len() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let m = manager().on_new_version(move |_, v| {
            assert_eq!(v, 3);
            f.fetch_add(1, Ordering::SeqCst);
        });

        let steps = vec![
            TextStep::insert(0, "a"),
            TextStep::insert(0, "b"),
            TextStep::insert(0, "c"),
        ];
        m.push_events(push(0, steps, "c1")).await.unwrap();

        assert_eq!(m.get_collab_state("doc").await.unwrap().version(), 3);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_push_rejects_wrong_versions_without_mutation() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let m = manager().on_new_version(move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        for version in [-1, 1, 7] {
            let res = m.push_events(push(version, vec![TextStep::insert(0, "x")], "c1")).await;
            assert_eq!(res, Err(FailKind::InvalidVersion));
        }

        let state = m.get_collab_state("doc").await.unwrap();
        assert_eq!(state.version(), 0);
        assert_eq!(state.doc(), "hello world!");
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(m.stats().await.pushes_rejected, 3);
    }

    #[tokio::test]
    async fn test_wrong_manager_checked_first() {
        let m = manager();
        let mut req = push(99, vec![TextStep::insert(0, "x")], "c1");
        req.manager_id = "someone-else".into();
        req.doc_name = "missing".into();
        assert_eq!(m.push_events(req).await, Err(FailKind::IncorrectManager));

        let mut req = pull(99);
        req.manager_id = "someone-else".into();
        req.doc_name = "missing".into();
        assert_eq!(m.pull_events(&req).await, Err(FailKind::IncorrectManager));

        // Nothing was loaded on the way.
        assert!(m.live_documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_pull_returns_steps_after_version() {
        let m = manager();
        m.push_events(push(0, vec![TextStep::insert(0, "a")], "c1")).await.unwrap();
        m.push_events(push(1, vec![TextStep::insert(0, "b")], "c2")).await.unwrap();
        m.push_events(push(2, vec![TextStep::insert(0, "c")], "c1")).await.unwrap();

        let res = m.pull_events(&pull(0)).await.unwrap();
        assert_eq!(res.version, 3);
        assert_eq!(
            res.steps,
            vec![TextStep::insert(0, "a"), TextStep::insert(0, "b"), TextStep::insert(0, "c")]
        );
        assert_eq!(res.client_ids, vec!["c1", "c2", "c1"]);

        let res = m.pull_events(&pull(2)).await.unwrap();
        assert_eq!(res.steps, vec![TextStep::insert(0, "c")]);
        assert_eq!(res.client_ids, vec!["c1"]);

        let res = m.pull_events(&pull(3)).await.unwrap();
        assert!(res.steps.is_empty());
        assert_eq!(res.version, 3);
    }

    #[tokio::test]
    async fn test_pull_rejects_future_and_negative_versions() {
        let m = manager();
        assert_eq!(m.pull_events(&pull(1)).await, Err(FailKind::InvalidVersion));
        assert_eq!(m.pull_events(&pull(-1)).await, Err(FailKind::InvalidVersion));
        assert_eq!(m.get_collab_state("doc").await.unwrap().version(), 0);
    }

    #[tokio::test]
    async fn test_push_to_missing_document() {
        let m = manager();
        let mut req = push(0, vec![TextStep::insert(0, "x")], "c1");
        req.doc_name = "missing".into();
        assert_eq!(m.push_events(req).await, Err(FailKind::DocumentNotFound));
    }

    #[tokio::test]
    async fn test_concurrent_pushes_same_version_only_one_wins() {
        let m = Arc::new(manager());
        m.get_document(&get("doc", "alice")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let m = m.clone();
            handles.push(tokio::spawn(async move {
                m.push_events(push(0, vec![TextStep::insert(0, "x")], &format!("c{i}")))
                    .await
            }));
        }

        let mut accepted = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(m.get_collab_state("doc").await.unwrap().version(), 1);
    }

    #[tokio::test]
    async fn test_documents_are_independent() {
        let storage = Arc::new(
            InMemoryStorage::<PlainText>::new()
                .with_document("a", "A".to_string())
                .with_document("b", "B".to_string()),
        );
        let m = CollabManager::new(ManagerConfig::for_testing(MANAGER), PlainText, storage).unwrap();

        let mut req = push(0, vec![TextStep::insert(1, "!")], "c1");
        req.doc_name = "a".into();
        m.push_events(req).await.unwrap();

        assert_eq!(m.get_collab_state("a").await.unwrap().version(), 1);
        assert_eq!(m.get_collab_state("b").await, None);
        let b = m.get_document(&get("b", "u")).await.unwrap();
        assert_eq!(b.version, 0);
        assert_eq!(m.live_documents().await, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_document_evicted() {
        let clock = Arc::new(ManualClock::new(10_000));
        let storage = storage();
        let m = CollabManager::with_clock(
            ManagerConfig::for_testing(MANAGER),
            PlainText,
            storage.clone(),
            clock.clone(),
        )
        .unwrap();

        m.get_document(&get("doc", "alice")).await.unwrap();
        assert_eq!(m.sweep_idle().await, 0);

        clock.advance(250);
        assert_eq!(m.sweep_idle().await, 1);
        assert!(m.guard().is_pending("doc"));
        // Already pending: not scheduled twice.
        assert_eq!(m.sweep_idle().await, 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert!(m.get_collab_state("doc").await.is_none());
        assert_eq!(m.stats().await.evictions, 1);

        // Next access reloads from storage.
        m.get_document(&get("doc", "alice")).await.unwrap();
        assert_eq!(storage.load_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_client_rescues_pending_eviction() {
        let clock = Arc::new(ManualClock::new(10_000));
        let m = CollabManager::with_clock(
            ManagerConfig::for_testing(MANAGER),
            PlainText,
            storage(),
            clock.clone(),
        )
        .unwrap();

        m.get_document(&get("doc", "alice")).await.unwrap();
        clock.advance(250);
        m.sweep_idle().await;
        let scheduled = m.guard().scheduled_at("doc").unwrap();

        clock.advance(10);
        let mut req = get("doc", "bob");
        req.client_created_at = scheduled + 5;
        m.get_document(&req).await.unwrap();
        assert!(!m.guard().is_pending("doc"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(m.get_collab_state("doc").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_client_does_not_rescue() {
        let clock = Arc::new(ManualClock::new(10_000));
        let m = CollabManager::with_clock(
            ManagerConfig::for_testing(MANAGER),
            PlainText,
            storage(),
            clock.clone(),
        )
        .unwrap();

        m.get_document(&get("doc", "alice")).await.unwrap();
        clock.advance(250);
        m.sweep_idle().await;

        clock.advance(10);
        // Created long before the delete was scheduled.
        m.pull_events(&pull(0)).await.unwrap();
        assert!(m.guard().is_pending("doc"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(m.get_collab_state("doc").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_from_older_client_survives_pending_eviction() {
        let clock = Arc::new(ManualClock::new(10_000));
        let m = CollabManager::with_clock(
            ManagerConfig::for_testing(MANAGER),
            PlainText,
            storage(),
            clock.clone(),
        )
        .unwrap();

        m.get_document(&get("doc", "alice")).await.unwrap();
        clock.advance(250);
        assert_eq!(m.sweep_idle().await, 1);

        clock.advance(10);
        // client_created_at = 0 predates the scheduled delete.
        let res = m.push_events(push(0, vec![TextStep::insert(0, "kept ")], "c1")).await;
        assert_eq!(res, Ok(Empty));

        tokio::time::sleep(Duration::from_millis(150)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        let state = m.get_collab_state("doc").await.unwrap();
        assert_eq!(state.version(), 1);
        assert_eq!(state.doc(), "kept hello world!");
        assert_eq!(m.stats().await.evictions, 0);
    }

    #[tokio::test]
    async fn test_concurrent_missing_document_loads_once() {
        let storage = Arc::new(InMemoryStorage::<PlainText>::new().with_latency(Duration::from_millis(50)));
        let m = Arc::new(
            CollabManager::new(ManagerConfig::for_testing(MANAGER), PlainText, storage.clone()).unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..5 {
            let m = m.clone();
            handles.push(tokio::spawn(async move {
                m.get_document(&get("missing", &format!("user-{i}"))).await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Err(FailKind::DocumentNotFound));
        }

        assert_eq!(storage.load_count(), 1);
        assert!(m.instances.read().await.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_huge_idle_timeout_never_sweeps() {
        let clock = Arc::new(ManualClock::new(0));
        let mut config = ManagerConfig::for_testing(MANAGER);
        // Just over u64::MAX milliseconds.
        config.idle_timeout = Duration::from_secs(18_446_744_073_709_552);
        let m = CollabManager::with_clock(config, PlainText, storage(), clock.clone()).unwrap();

        m.get_document(&get("doc", "alice")).await.unwrap();
        clock.advance(1_000);
        assert_eq!(m.sweep_idle().await, 0);
    }

    #[tokio::test]
    async fn test_destroy_clears_everything() {
        let m = manager();
        m.get_document(&get("doc", "alice")).await.unwrap();
        m.destroy().await;
        assert!(m.live_documents().await.is_empty());
        assert_eq!(m.guard().pending_count(), 0);
    }
}
