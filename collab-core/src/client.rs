//! Client-side protocol wrapper.
//!
//! Provides:
//! - Request/response correlation by `uid` over any [`MessageBus`]
//! - Cancellation and per-request timeouts
//! - Manager rediscovery through `GetDocument`
//! - `NewVersion` watches for a single document
//!
//! Every request subscribes to the client's own channel before sending and
//! drops that subscription as soon as it has an outcome, whatever it is.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{MessageBus, MessageHandler, Subscription, BROADCAST_CHANNEL};
use crate::clock::{Clock, SystemClock, Timestamp};
use crate::error::{CollabError, Result};
use crate::model::DocumentModel;
use crate::protocol::{
    CollabResponse, Empty, Envelope, GetDocumentRequest, GetDocumentResponse, MessageType,
    NewVersion, PullEventsRequest, PullEventsResponse, PushEventsRequest,
};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bus channel responses are addressed to; also tags pushed steps
    pub client_id: String,
    pub user_id: String,
    /// Manager to address until a `GetDocument` names another
    pub manager_id: String,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: format!("client-{}", Uuid::new_v4()),
            user_id: "anonymous".to_string(),
            manager_id: String::new(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn for_testing(client_id: impl Into<String>, manager_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        Self {
            user_id: format!("user-{client_id}"),
            client_id,
            manager_id: manager_id.into(),
            request_timeout: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(CollabError::InvalidConfig("client_id is empty".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(CollabError::InvalidConfig("request_timeout is zero".into()));
        }
        Ok(())
    }
}

/// One client instance's view of the protocol.
pub struct ClientCommunication<M: DocumentModel> {
    config: ClientConfig,
    manager_id: Mutex<String>,
    bus: Arc<dyn MessageBus>,
    created_at: Timestamp,
    _model: PhantomData<fn() -> M>,
}

impl<M: DocumentModel> ClientCommunication<M> {
    pub fn new(config: ClientConfig, bus: Arc<dyn MessageBus>) -> Result<Self> {
        Self::with_clock(config, bus, &SystemClock)
    }

    /// `clock` only stamps the creation time sent with every request.
    pub fn with_clock(config: ClientConfig, bus: Arc<dyn MessageBus>, clock: &dyn Clock) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            manager_id: Mutex::new(config.manager_id.clone()),
            config,
            bus,
            created_at: clock.now_millis(),
            _model: PhantomData,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn manager_id(&self) -> String {
        self.manager_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_manager_id(&self, manager_id: impl Into<String>) {
        *self.manager_id.lock().unwrap_or_else(PoisonError::into_inner) = manager_id.into();
    }

    /// Fetches the document. A successful answer also tells us which manager
    /// owns it; later pushes and pulls are addressed there.
    pub async fn get_document(
        &self,
        doc_name: &str,
        cancel: &CancellationToken,
    ) -> Result<CollabResponse<GetDocumentResponse<M::Doc>>> {
        let req = GetDocumentRequest {
            doc_name: doc_name.to_string(),
            user_id: self.config.user_id.clone(),
            client_created_at: self.created_at,
        };
        let response: CollabResponse<GetDocumentResponse<M::Doc>> =
            self.request(MessageType::GetDocument, &req, cancel).await?;

        if let Ok(doc) = &response {
            if doc.manager_id != self.manager_id() {
                log::debug!("{} now talking to manager {}", self.config.client_id, doc.manager_id);
                self.set_manager_id(doc.manager_id.clone());
            }
        }
        Ok(response)
    }

    pub async fn push_events(
        &self,
        doc_name: &str,
        version: i64,
        steps: Vec<M::Step>,
        cancel: &CancellationToken,
    ) -> Result<CollabResponse<Empty>> {
        let req = PushEventsRequest {
            doc_name: doc_name.to_string(),
            version,
            steps,
            client_id: self.config.client_id.clone(),
            user_id: self.config.user_id.clone(),
            manager_id: self.manager_id(),
            client_created_at: self.created_at,
        };
        self.request(MessageType::PushEvents, &req, cancel).await
    }

    pub async fn pull_events(
        &self,
        doc_name: &str,
        version: i64,
        cancel: &CancellationToken,
    ) -> Result<CollabResponse<PullEventsResponse<M::Step>>> {
        let req = PullEventsRequest {
            doc_name: doc_name.to_string(),
            version,
            user_id: self.config.user_id.clone(),
            manager_id: self.manager_id(),
            client_created_at: self.created_at,
        };
        self.request(MessageType::PullEvents, &req, cancel).await
    }

    /// Calls `handler` for every `NewVersion` about `doc_name` until the
    /// subscription is dropped.
    pub fn watch<F>(&self, doc_name: &str, handler: F) -> Subscription
    where
        F: Fn(NewVersion) + Send + Sync + 'static,
    {
        let doc_name = doc_name.to_string();
        let on_message: MessageHandler = Arc::new(move |envelope: Envelope| {
            if envelope.msg_type != MessageType::NewVersion {
                return;
            }
            match envelope.body_as::<NewVersion>() {
                Ok(note) if note.doc_name == doc_name => handler(note),
                Ok(_) => {}
                Err(e) => log::warn!("Undecodable NewVersion {}: {e}", envelope.uid),
            }
        });
        self.bus.receive_messages(BROADCAST_CHANNEL, on_message)
    }

    async fn request<Req, Resp>(
        &self,
        msg_type: MessageType,
        body: &Req,
        cancel: &CancellationToken,
    ) -> Result<CollabResponse<Resp>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let envelope = Envelope::request(
            self.config.client_id.as_str(),
            self.manager_id(),
            msg_type,
            body,
        )?;
        let uid = envelope.uid.clone();
        if cancel.is_cancelled() {
            return Err(CollabError::Cancelled { uid });
        }

        let (tx, rx) = oneshot::channel::<Envelope>();
        let tx = Mutex::new(Some(tx));
        let expected = uid.clone();
        let on_reply: MessageHandler = Arc::new(move |reply: Envelope| {
            if reply.uid != expected || reply.msg_type != msg_type {
                return;
            }
            if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(reply);
            }
        });

        // Subscribe before sending so the reply cannot slip past us.
        let subscription = self.bus.receive_messages(&self.config.client_id, on_reply);
        log::debug!("{} sent {msg_type:?} {uid}", self.config.client_id);
        self.bus.transmit(envelope);

        let timeout = self.config.request_timeout;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("{msg_type:?} {uid} cancelled");
                Err(CollabError::Cancelled { uid: uid.clone() })
            }
            reply = rx => match reply {
                Ok(reply) => reply.body_as::<CollabResponse<Resp>>(),
                Err(_) => Err(CollabError::UnexpectedMessage(format!("reply channel for {uid} closed"))),
            },
            _ = tokio::time::sleep(timeout) => {
                log::warn!("{msg_type:?} {uid} timed out after {timeout:?}");
                Err(CollabError::Timeout { uid: uid.clone(), timeout })
            }
        };

        drop(subscription);
        outcome
    }
}
