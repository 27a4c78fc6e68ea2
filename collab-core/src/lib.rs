//! # collab-core: version-gated collaborative document authority
//!
//! A central authority owns the canonical state of every open document.
//! Clients submit steps against the version they last saw; the authority
//! accepts them only if that version is still current, so every client
//! converges on one totally ordered step history.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐                      ┌─────────────────────┐
//! │ ClientCommunication │   Envelope (uid,     │ CollabServer        │
//! │ (per client)        │ ◄──────────────────► │ (manager endpoint)  │
//! └─────────────────────┘   from, to, body)    └──────────┬──────────┘
//!           ▲                                            │
//!           │ NewVersion                                 ▼
//!   ┌───────┴────────┐                        ┌─────────────────────┐
//!   │ MessageBus     │ ◄───────────────────── │ CollabManager       │
//!   │ (LocalBus)     │   accepted pushes      │ version gate        │
//!   └────────────────┘                        └───┬─────────────┬───┘
//!                                                 │             │
//!                                                 ▼             ▼
//!                                    ┌──────────────────┐ ┌─────────────────────┐
//!                                    │ DocumentState    │ │ InstanceDeleteGuard │
//!                                    │ (doc, steps, v)  │ │ (eviction timers)   │
//!                                    └──────────────────┘ └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: The document/step collaborator trait
//! - [`text`]: Plain-text model used by the demo and tests
//! - [`state`]: Immutable document snapshots
//! - [`guard`]: Delayed, cancelable eviction of idle documents
//! - [`manager`]: The authority and its registry
//! - [`protocol`]: Envelope and request/response bodies
//! - [`bus`]: Addressed pub/sub transport
//! - [`server`]: Manager endpoint on the bus
//! - [`client`]: Client-side request correlation
//! - [`storage`]: Initial-state loading

pub mod bus;
pub mod client;
pub mod clock;
pub mod error;
pub mod guard;
pub mod manager;
pub mod model;
pub mod protocol;
pub mod server;
pub mod state;
pub mod storage;
pub mod text;

// Re-exports for convenience
pub use bus::{BusStats, LocalBus, MessageBus, MessageHandler, Subscription, BROADCAST_CHANNEL};
pub use client::{ClientCommunication, ClientConfig};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use error::{CollabError, Result};
pub use guard::{GuardConfig, InstanceDeleteGuard};
pub use manager::{CollabManager, ManagerConfig, ManagerStats};
pub use model::DocumentModel;
pub use protocol::{
    CollabResponse, Empty, Envelope, FailKind, GetDocumentRequest, GetDocumentResponse,
    MessageType, NewVersion, PullEventsRequest, PullEventsResponse, PushEventsRequest,
};
pub use server::{CollabServer, ServerStats};
pub use state::{DocumentState, StateOf, StepRecord};
pub use storage::{DocumentStorage, InMemoryStorage};
pub use text::{PlainText, TextStep};
