//! Storage collaborator: where initial document states come from.
//!
//! The authority asks for a document the first time a name is touched (and
//! again only after that name has been evicted). Durable storage is out of
//! scope here; [`InMemoryStorage`] serves seeded documents for demos and
//! tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::model::DocumentModel;
use crate::state::{DocumentState, StateOf};

#[async_trait]
pub trait DocumentStorage<M: DocumentModel>: Send + Sync + 'static {
    /// Loads the starting state for `doc_name`, or `None` if there is no
    /// such document.
    async fn get_initial_state(&self, doc_name: &str) -> Option<StateOf<M>>;
}

/// Seeded, in-process storage.
pub struct InMemoryStorage<M: DocumentModel> {
    docs: RwLock<HashMap<String, M::Doc>>,
    latency: Option<Duration>,
    loads: AtomicU64,
}

impl<M: DocumentModel> Default for InMemoryStorage<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: DocumentModel> InMemoryStorage<M> {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            latency: None,
            loads: AtomicU64::new(0),
        }
    }

    /// Delay every load by `latency` (simulates slow I/O).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Seed a document before the storage is shared.
    pub fn with_document(mut self, doc_name: impl Into<String>, doc: M::Doc) -> Self {
        self.docs.get_mut().insert(doc_name.into(), doc);
        self
    }

    pub async fn insert(&self, doc_name: impl Into<String>, doc: M::Doc) {
        self.docs.write().await.insert(doc_name.into(), doc);
    }

    pub async fn remove(&self, doc_name: &str) -> Option<M::Doc> {
        self.docs.write().await.remove(doc_name)
    }

    /// Number of `get_initial_state` calls served so far.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<M: DocumentModel> DocumentStorage<M> for InMemoryStorage<M> {
    async fn get_initial_state(&self, doc_name: &str) -> Option<StateOf<M>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let doc = self.docs.read().await.get(doc_name).cloned()?;
        log::debug!("Loaded initial state for {doc_name}");
        Some(DocumentState::new(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::PlainText;

    #[tokio::test]
    async fn test_seeded_document_loads() {
        let storage = InMemoryStorage::<PlainText>::new().with_document("a", "hello".to_string());
        let state = storage.get_initial_state("a").await.unwrap();
        assert_eq!(state.doc(), "hello");
        assert_eq!(state.version(), 0);
        assert_eq!(storage.load_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_document_is_none() {
        let storage = InMemoryStorage::<PlainText>::new();
        assert!(storage.get_initial_state("nope").await.is_none());
        assert_eq!(storage.load_count(), 1);
    }

    #[tokio::test]
    async fn test_insert_and_remove() {
        let storage = InMemoryStorage::<PlainText>::new();
        storage.insert("b", "x".to_string()).await;
        assert!(storage.get_initial_state("b").await.is_some());
        assert_eq!(storage.remove("b").await.as_deref(), Some("x"));
        assert!(storage.get_initial_state("b").await.is_none());
    }
}
