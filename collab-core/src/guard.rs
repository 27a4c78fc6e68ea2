//! Debounced, race-tolerant eviction of idle document instances.
//!
//! ```text
//!            add_pending_delete
//!   NONE ─────────────────────────► PENDING ──── timer fires ────► FIRED ──► NONE
//!                                     │  ▲
//!            check_access(newer) ◄────┤  │ add_pending_delete (restart)
//!                 CANCELED ◄──────────┘  │
//!                                     │──┘
//!            contain_size ────────────┴────────► PRUNED ──► NONE
//! ```
//!
//! Every pending record owns a [`CancellationToken`]. The timer task only
//! runs its callback if, at the moment it fires, its record is still the
//! current one for that name; anything that cancels or replaces a record also
//! removes it, so a stale timer can never fire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock, Timestamp};
use crate::error::{CollabError, Result};

/// Guard configuration.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// How long a scheduled delete waits before running.
    pub delete_wait_time: Duration,
    /// Records older than this are dropped without firing.
    pub max_duration_to_keep_record: Duration,
    /// Maximum number of pending records kept after pruning.
    pub max_records: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            delete_wait_time: Duration::from_secs(30),
            max_duration_to_keep_record: Duration::from_secs(5 * 60),
            max_records: 100,
        }
    }
}

impl GuardConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            delete_wait_time: Duration::from_millis(100),
            max_duration_to_keep_record: Duration::from_secs(1),
            max_records: 100,
        }
    }

    /// A record pruned for age before its own timer fires would silently
    /// cancel a delete that was supposed to happen.
    pub fn validate(&self) -> Result<()> {
        if self.delete_wait_time >= self.max_duration_to_keep_record {
            return Err(CollabError::InvalidConfig(format!(
                "delete_wait_time ({:?}) must be less than max_duration_to_keep_record ({:?})",
                self.delete_wait_time, self.max_duration_to_keep_record
            )));
        }
        Ok(())
    }
}

struct PendingDelete {
    delete_scheduled_at: Timestamp,
    generation: u64,
    token: CancellationToken,
}

type Records = Arc<Mutex<HashMap<String, PendingDelete>>>;

fn lock(records: &Records) -> MutexGuard<'_, HashMap<String, PendingDelete>> {
    records.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decides when an idle instance may really be removed.
pub struct InstanceDeleteGuard {
    config: GuardConfig,
    clock: Arc<dyn Clock>,
    records: Records,
    next_generation: AtomicU64,
}

impl InstanceDeleteGuard {
    /// Fails with [`CollabError::InvalidConfig`] when
    /// `delete_wait_time >= max_duration_to_keep_record`.
    pub fn new(config: GuardConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            records: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(GuardConfig::default(), Arc::new(SystemClock))
    }

    /// Schedules `callback` to run after `delete_wait_time`.
    ///
    /// Any delete already pending for `doc_name` is cancelled first, so the
    /// newest call wins and `delete_scheduled_at` moves forward. Must be
    /// called from within a tokio runtime.
    pub fn add_pending_delete<F>(&self, doc_name: &str, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let delete_scheduled_at = self.clock.now_millis();

        {
            let mut records = lock(&self.records);
            let previous = records.insert(
                doc_name.to_string(),
                PendingDelete {
                    delete_scheduled_at,
                    generation,
                    token: token.clone(),
                },
            );
            if let Some(previous) = previous {
                previous.token.cancel();
                log::debug!("Rescheduled pending delete for {doc_name}");
            } else {
                log::debug!("Scheduled pending delete for {doc_name}");
            }
        }

        let records = Arc::clone(&self.records);
        let wait = self.config.delete_wait_time;
        let name = doc_name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    log::trace!("Pending delete for {name} cancelled");
                }
                _ = tokio::time::sleep(wait) => {
                    let still_current = {
                        let mut records = lock(&records);
                        match records.get(&name) {
                            Some(pending) if pending.generation == generation => {
                                records.remove(&name);
                                true
                            }
                            _ => false,
                        }
                    };
                    if still_current {
                        log::debug!("Pending delete for {name} fired");
                        callback();
                    }
                }
            }
        });

        self.contain_size();
    }

    /// Returns whether a client created at `client_created_at` may keep using
    /// the instance for `doc_name`.
    ///
    /// With nothing pending the answer is always yes. A client created after
    /// the delete was scheduled proves the instance is still wanted: the
    /// pending delete is cancelled. Older clients get `false` and the record
    /// stays, still guarding against other old clients.
    pub fn check_access(&self, doc_name: &str, client_created_at: Timestamp) -> bool {
        let mut records = lock(&self.records);
        let Some(pending) = records.get(doc_name) else {
            return true;
        };

        if client_created_at > pending.delete_scheduled_at {
            if let Some(pending) = records.remove(doc_name) {
                pending.token.cancel();
            }
            log::debug!("Access to {doc_name} cancelled its pending delete");
            true
        } else {
            log::debug!(
                "Access to {doc_name} from client created at {client_created_at} predates pending delete"
            );
            false
        }
    }

    /// Drops records that are too old, then all but the newest
    /// `max_records`. Dropped records never fire.
    pub fn contain_size(&self) {
        let now = self.clock.now_millis();
        let max_age = u64::try_from(self.config.max_duration_to_keep_record.as_millis()).unwrap_or(u64::MAX);
        let mut records = lock(&self.records);

        records.retain(|name, pending| {
            let keep = now.saturating_sub(pending.delete_scheduled_at) <= max_age;
            if !keep {
                pending.token.cancel();
                log::debug!("Pruned stale pending delete for {name}");
            }
            keep
        });

        if records.len() <= self.config.max_records {
            return;
        }

        let mut order: Vec<(Timestamp, u64, String)> = records
            .iter()
            .map(|(name, p)| (p.delete_scheduled_at, p.generation, name.clone()))
            .collect();
        // Newest first.
        order.sort_unstable_by(|a, b| b.cmp(a));

        let excess = order.split_off(self.config.max_records);
        for (_, _, name) in &excess {
            if let Some(pending) = records.remove(name) {
                pending.token.cancel();
            }
        }
        log::debug!("Pruned {} pending deletes over capacity", excess.len());
    }

    /// Cancels every timer and forgets every record.
    pub fn destroy(&self) {
        let mut records = lock(&self.records);
        for (_, pending) in records.drain() {
            pending.token.cancel();
        }
    }

    pub fn is_pending(&self, doc_name: &str) -> bool {
        lock(&self.records).contains_key(doc_name)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.records).len()
    }

    /// When the pending delete for `doc_name` was scheduled, if any.
    pub fn scheduled_at(&self, doc_name: &str) -> Option<Timestamp> {
        lock(&self.records)
            .get(doc_name)
            .map(|p| p.delete_scheduled_at)
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }
}

impl Drop for InstanceDeleteGuard {
    fn drop(&mut self) {
        self.destroy();
    }
}
