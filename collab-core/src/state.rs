//! Immutable per-document snapshot: document, step history, version.
//!
//! ```text
//! version 0          version 1              version 2
//! ┌──────────┐ push  ┌──────────────┐ push  ┌──────────────────┐
//! │ doc₀     │ ────► │ doc₀ ∘ s₁    │ ────► │ doc₀ ∘ s₁ ∘ s₂   │
//! │ steps [] │       │ steps [s₁]   │       │ steps [s₁, s₂]   │
//! └──────────┘       └──────────────┘       └──────────────────┘
//! ```
//!
//! A state is never edited in place. [`DocumentState::apply_accepted`]
//! consumes the old value and returns its successor, so the invariant
//! `version == steps.len()` holds for every value that exists.

use serde::{Deserialize, Serialize};

use crate::model::DocumentModel;

/// A step together with the client that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord<S> {
    pub step: S,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentState<D, S> {
    doc: D,
    steps: Vec<StepRecord<S>>,
    version: u64,
}

/// The state type for a given model.
pub type StateOf<M> = DocumentState<<M as DocumentModel>::Doc, <M as DocumentModel>::Step>;

impl<D, S> DocumentState<D, S> {
    /// A freshly loaded document with no history.
    pub fn new(doc: D) -> Self {
        Self {
            doc,
            steps: Vec::new(),
            version: 0,
        }
    }

    pub fn doc(&self) -> &D {
        &self.doc
    }

    pub fn steps(&self) -> &[StepRecord<S>] {
        &self.steps
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Steps accepted after `version`, oldest first.
    ///
    /// Returns an empty slice when `version` is at or past the current one.
    pub fn steps_since(&self, version: u64) -> &[StepRecord<S>] {
        let start = usize::try_from(version).unwrap_or(usize::MAX).min(self.steps.len());
        &self.steps[start..]
    }

    /// Appends `steps` (all tagged with `client_id`) and folds them onto the
    /// document.
    ///
    /// The caller has already checked the version gate.
    pub fn apply_accepted<M>(self, model: &M, steps: Vec<S>, client_id: &str) -> Self
    where
        M: DocumentModel<Doc = D, Step = S> + ?Sized,
    {
        let Self {
            mut doc,
            steps: mut history,
            ..
        } = self;

        history.reserve(steps.len());
        for step in steps {
            doc = model.apply(&doc, &step);
            history.push(StepRecord {
                step,
                client_id: client_id.to_string(),
            });
        }

        let version = history.len() as u64;
        Self {
            doc,
            steps: history,
            version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::{PlainText, TextStep};

    fn hello() -> StateOf<PlainText> {
        DocumentState::new("hello world!".to_string())
    }

    #[test]
    fn test_new_state_is_version_zero() {
        let state = hello();
        assert_eq!(state.version(), 0);
        assert!(state.steps().is_empty());
        assert_eq!(state.doc(), "hello world!");
    }

    #[test]
    fn test_apply_accepted_appends_and_folds() {
        let state = hello()
            .apply_accepted(&PlainText, vec![TextStep::insert(0, "lovely ")], "client-1")
            .apply_accepted(
                &PlainText,
                vec![TextStep::insert(0, "a "), TextStep::insert(2, "very ")],
                "client-2",
            );

        assert_eq!(state.version(), 3);
        assert_eq!(state.steps().len(), 3);
        assert_eq!(state.doc(), "a very lovely hello world!");

        let clients: Vec<&str> = state.steps().iter().map(|r| r.client_id.as_str()).collect();
        assert_eq!(clients, vec!["client-1", "client-2", "client-2"]);
    }

    #[test]
    fn test_apply_empty_batch_keeps_version() {
        let state = hello().apply_accepted(&PlainText, Vec::new(), "client-1");
        assert_eq!(state.version(), 0);
        assert_eq!(state.doc(), "hello world!");
    }

    #[test]
    fn test_older_snapshot_unchanged() {
        let before = hello();
        let snapshot = before.clone();
        let after = before.apply_accepted(&PlainText, vec![TextStep::insert(0, "x")], "c");

        assert_eq!(snapshot.version(), 0);
        assert_eq!(snapshot.doc(), "hello world!");
        assert_eq!(after.version(), 1);
    }

    #[test]
    fn test_steps_since() {
        let state = hello().apply_accepted(
            &PlainText,
            vec![
                TextStep::insert(0, "1"),
                TextStep::insert(0, "2"),
                TextStep::insert(0, "3"),
            ],
            "c",
        );

        assert_eq!(state.steps_since(0).len(), 3);
        assert_eq!(state.steps_since(1)[0].step, TextStep::insert(0, "2"));
        assert!(state.steps_since(3).is_empty());
        assert!(state.steps_since(42).is_empty());
    }
}
