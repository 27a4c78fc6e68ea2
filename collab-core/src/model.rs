//! The document-apply collaborator.
//!
//! The authority never looks inside documents or steps. Everything it needs
//! to know about them is captured by [`DocumentModel`]: the two opaque types
//! and a pure `apply`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Opaque, serializable value that can cross the message bus.
pub trait WireValue: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> WireValue for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Bundles a document type, a step type, and how to apply one to the other.
///
/// `apply` must be deterministic: every replica folding the same steps over
/// the same starting document must end up with equal documents. The
/// authority only calls it for steps that already passed the version gate,
/// so it has no error channel.
pub trait DocumentModel: Send + Sync + 'static {
    type Doc: WireValue;
    type Step: WireValue;

    fn apply(&self, doc: &Self::Doc, step: &Self::Step) -> Self::Doc;
}
