//! Plain-text document model.
//!
//! A minimal [`DocumentModel`] over `String` with character-offset steps.
//! Used by the demo, the benchmarks, and the tests; real editors plug in
//! their own model.

use serde::{Deserialize, Serialize};

use crate::model::DocumentModel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextStep {
    /// Insert `text` before the character at `pos`.
    Insert { pos: usize, text: String },
    /// Remove characters in `from..to`.
    Delete { from: usize, to: usize },
}

impl TextStep {
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Self::Insert {
            pos,
            text: text.into(),
        }
    }

    pub fn delete(from: usize, to: usize) -> Self {
        Self::Delete { from, to }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlainText;

/// Byte index of character `pos`, clamped to the end of `s`.
fn byte_offset(s: &str, pos: usize) -> usize {
    s.char_indices().nth(pos).map_or(s.len(), |(i, _)| i)
}

impl DocumentModel for PlainText {
    type Doc = String;
    type Step = TextStep;

    fn apply(&self, doc: &String, step: &TextStep) -> String {
        let mut out = doc.clone();
        match step {
            TextStep::Insert { pos, text } => {
                let at = byte_offset(&out, *pos);
                out.insert_str(at, text);
            }
            TextStep::Delete { from, to } => {
                let start = byte_offset(&out, *from);
                let end = byte_offset(&out, (*to).max(*from));
                out.replace_range(start..end, "");
            }
        }
        out
    }
}
