//! Manager endpoint: binds a [`CollabManager`] to a [`MessageBus`].
//!
//! Architecture:
//! ```text
//! Client A ──┐                                   ┌──► reply to A (same uid)
//!             ├── bus channel = manager_id ──► CollabServer ──► CollabManager
//! Client B ──┘                                   │
//!                                                └──► NewVersion ──► BROADCAST_CHANNEL
//!                                                                     │
//!                                                          ┌──────────┼──────────┐
//!                                                          ▼          ▼          ▼
//!                                                       Client A   Client B   Client C
//! ```
//!
//! Each incoming envelope is handled on its own task; per-document ordering
//! is the manager's job, not the endpoint's.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::bus::{MessageBus, MessageHandler, Subscription, BROADCAST_CHANNEL};
use crate::error::{CollabError, Result};
use crate::manager::{CollabManager, ManagerConfig};
use crate::model::DocumentModel;
use crate::protocol::{
    Envelope, GetDocumentRequest, MessageType, NewVersion, PullEventsRequest, PushEventsRequest,
};
use crate::storage::DocumentStorage;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub requests_handled: u64,
    pub requests_failed: u64,
    pub notifications_sent: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    requests_handled: AtomicU64,
    requests_failed: AtomicU64,
    notifications_sent: AtomicU64,
}

/// `on_new_version` hook that announces every accepted push on
/// [`BROADCAST_CHANNEL`].
pub fn broadcast_new_versions(
    bus: Arc<dyn MessageBus>,
    manager_id: String,
) -> impl Fn(&str, u64) + Send + Sync + 'static {
    move |doc_name, version| {
        let note = NewVersion {
            doc_name: doc_name.to_string(),
            version,
        };
        match Envelope::new_version(manager_id.as_str(), BROADCAST_CHANNEL, &note) {
            Ok(envelope) => bus.transmit(envelope),
            Err(e) => log::error!("Failed to encode NewVersion for {doc_name}: {e}"),
        }
    }
}

/// The manager's presence on the bus.
pub struct CollabServer<M: DocumentModel> {
    manager: Arc<CollabManager<M>>,
    bus: Arc<dyn MessageBus>,
    subscription: Mutex<Option<Subscription>>,
    stats: Arc<AtomicServerStats>,
}

impl<M: DocumentModel> CollabServer<M> {
    /// Builds a manager whose accepted pushes are broadcast on `bus`.
    pub fn new(
        config: ManagerConfig,
        model: M,
        storage: Arc<dyn DocumentStorage<M>>,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Self> {
        let stats = Arc::new(AtomicServerStats::default());
        let notify = broadcast_new_versions(bus.clone(), config.manager_id.clone());
        let counter = stats.clone();
        let manager = CollabManager::new(config, model, storage)?.on_new_version(move |doc, version| {
            counter.notifications_sent.fetch_add(1, Ordering::Relaxed);
            notify(doc, version);
        });
        Ok(Self::with_manager(Arc::new(manager), bus, stats))
    }

    fn with_manager(
        manager: Arc<CollabManager<M>>,
        bus: Arc<dyn MessageBus>,
        stats: Arc<AtomicServerStats>,
    ) -> Self {
        Self {
            manager,
            bus,
            subscription: Mutex::new(None),
            stats,
        }
    }

    /// Starts answering requests addressed to the manager id, and starts the
    /// idle sweeper. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let manager = self.manager.clone();
        let bus = self.bus.clone();
        let stats = self.stats.clone();

        let handler: MessageHandler = Arc::new(move |envelope: Envelope| {
            let manager = manager.clone();
            let bus = bus.clone();
            let stats = stats.clone();
            tokio::spawn(async move {
                match Self::handle_envelope(&manager, &envelope).await {
                    Ok(reply) => {
                        stats.requests_handled.fetch_add(1, Ordering::Relaxed);
                        bus.transmit(reply);
                    }
                    Err(e) => {
                        stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "Dropping {:?} {} from {}: {e}",
                            envelope.msg_type,
                            envelope.uid,
                            envelope.from
                        );
                    }
                }
            });
        });

        let subscription = self.bus.receive_messages(self.manager.manager_id(), handler);
        *self.subscription.lock().unwrap_or_else(PoisonError::into_inner) = Some(subscription);
        self.manager.spawn_idle_sweeper();
        log::info!("Collab server listening as {}", self.manager.manager_id());
    }

    /// Decodes a request, runs it, and builds the reply envelope.
    ///
    /// Protocol failures come back as `Ok` replies carrying a
    /// [`FailKind`](crate::protocol::FailKind); `Err` means the envelope itself
    /// was unusable.
    pub async fn handle_envelope(manager: &CollabManager<M>, envelope: &Envelope) -> Result<Envelope> {
        log::debug!(
            "Handling {:?} {} from {}",
            envelope.msg_type,
            envelope.uid,
            envelope.from
        );
        match envelope.msg_type {
            MessageType::GetDocument => {
                let req: GetDocumentRequest = envelope.body_as()?;
                envelope.reply(&manager.get_document(&req).await)
            }
            MessageType::PushEvents => {
                let req: PushEventsRequest<M::Step> = envelope.body_as()?;
                envelope.reply(&manager.push_events(req).await)
            }
            MessageType::PullEvents => {
                let req: PullEventsRequest = envelope.body_as()?;
                envelope.reply(&manager.pull_events(&req).await)
            }
            MessageType::NewVersion => Err(CollabError::UnexpectedMessage(format!(
                "{:?} is not a request",
                envelope.msg_type
            ))),
        }
    }

    /// Stops listening, then destroys the manager.
    pub async fn shutdown(&self) {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.manager.destroy().await;
        log::info!("Collab server {} shut down", self.manager.manager_id());
    }

    pub fn is_listening(&self) -> bool {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(Subscription::is_active)
    }

    pub fn manager(&self) -> &Arc<CollabManager<M>> {
        &self.manager
    }

    pub fn manager_id(&self) -> &str {
        self.manager.manager_id()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            requests_handled: self.stats.requests_handled.load(Ordering::Relaxed),
            requests_failed: self.stats.requests_failed.load(Ordering::Relaxed),
            notifications_sent: self.stats.notifications_sent.load(Ordering::Relaxed),
        }
    }
}
