//! Addressed request/response protocol between clients and a manager.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┬──────────────────────┐
//! │ uid      │ from     │ to       │ msg_type │ body                 │
//! │ string   │ string   │ string   │ 1 byte   │ bincode(request or   │
//! │          │          │          │          │ CollabResponse<T>)   │
//! └──────────┴──────────┴──────────┴──────────┴──────────────────────┘
//! ```
//!
//! `uid` correlates a response with its request; `from`/`to` address a
//! specific client or manager. The bus never looks at `body`.
//!
//! Failures are values: a response body is a `CollabResponse<T>`, i.e.
//! `Result<T, FailKind>`, so a rejected push crosses the bus like any other
//! answer.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Timestamp;
use crate::error::{CollabError, Result};

/// Request types, plus the out-of-band version notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    GetDocument = 1,
    PushEvents = 2,
    PullEvents = 3,
    /// Broadcast after an accepted push
    NewVersion = 4,
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailKind {
    /// Storage had nothing for this name. Not retryable as-is.
    DocumentNotFound,
    /// Request reached a manager other than the one it named. Rediscover the
    /// manager with a fresh GetDocument.
    IncorrectManager,
    /// Version did not match. Pull, rebase, resubmit.
    InvalidVersion,
}

impl std::fmt::Display for FailKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DocumentNotFound => write!(f, "DocumentNotFound"),
            Self::IncorrectManager => write!(f, "IncorrectManager"),
            Self::InvalidVersion => write!(f, "InvalidVersion"),
        }
    }
}

pub type CollabResponse<T> = std::result::Result<T, FailKind>;

// ───────────────────────────────────────────────────────────────────
// Bodies
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetDocumentRequest {
    pub doc_name: String,
    pub user_id: String,
    /// When the requesting client instance was created.
    pub client_created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetDocumentResponse<D> {
    pub doc: D,
    pub version: u64,
    pub users: usize,
    pub manager_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEventsRequest<S> {
    pub doc_name: String,
    /// Signed so that nonsense versions reach the version gate intact.
    pub version: i64,
    pub steps: Vec<S>,
    pub client_id: String,
    pub user_id: String,
    pub manager_id: String,
    pub client_created_at: Timestamp,
}

/// Successful push carries nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullEventsRequest {
    pub doc_name: String,
    pub version: i64,
    pub user_id: String,
    pub manager_id: String,
    pub client_created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullEventsResponse<S> {
    pub steps: Vec<S>,
    pub client_ids: Vec<String>,
    pub version: u64,
    pub users: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewVersion {
    pub doc_name: String,
    pub version: u64,
}

// ───────────────────────────────────────────────────────────────────
// Envelope
// ───────────────────────────────────────────────────────────────────

/// Addressed, correlated message. `body` is opaque to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub uid: String,
    pub from: String,
    pub to: String,
    pub msg_type: MessageType,
    pub body: Vec<u8>,
}

pub fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CollabError::Serialization(e.to_string()))
}

pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| CollabError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl Envelope {
    /// A new request with a fresh `uid`.
    pub fn request<T: Serialize>(
        from: impl Into<String>,
        to: impl Into<String>,
        msg_type: MessageType,
        body: &T,
    ) -> Result<Self> {
        Ok(Self {
            uid: Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            msg_type,
            body: encode_body(body)?,
        })
    }

    /// The response to this envelope: same `uid` and type, addresses swapped.
    pub fn reply<T: Serialize>(&self, response: &CollabResponse<T>) -> Result<Self> {
        Ok(Self {
            uid: self.uid.clone(),
            from: self.to.clone(),
            to: self.from.clone(),
            msg_type: self.msg_type,
            body: encode_body(response)?,
        })
    }

    pub fn new_version(from: impl Into<String>, to: impl Into<String>, note: &NewVersion) -> Result<Self> {
        Self::request(from, to, MessageType::NewVersion, note)
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        decode_body(&self.body)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_body(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_body(bytes)
    }
}
