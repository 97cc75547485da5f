//! Signaling and session orchestration core for a real-time call client.
//!
//! This crate manages conversation-scoped call sessions and the peer media
//! flows inside them, reconciling two independently ordered channels: a
//! request/response command channel (flow posts, metrics) and a pushed event
//! stream (flow add/delete/activate, ICE candidates, SDP). Events may arrive
//! before the entities they reference exist, and responses may arrive after
//! those entities are gone; the core queues, replays, correlates and cancels
//! so neither channel can leak or dangle.
//!
//! # Architecture
//!
//! - [`MediaSystem`]: process-scoped negotiation prerequisites (secure
//!   transport context, codec sets, network binding)
//! - [`FlowManager`]: orchestrator owning the calls, the outstanding-request
//!   tracker, the pending-event queue and the config-readiness gate
//! - [`Call`] & [`Flow`]: per-conversation session state and per-peer
//!   negotiation state
//! - [`FlowDelegate`]: the host-implemented command channel and callback set
//! - [`event`]: schema-validated decoding of the wire events
//!
//! The actual transports (HTTP/WebSocket, DTLS/SRTP) and the media engine
//! are external collaborators reached only through [`FlowDelegate`] and
//! [`MediaSystem`].

pub mod call;
pub mod delegate;
pub mod error;
pub mod event;
pub mod manager;
pub mod media_system;
pub mod metrics;
pub mod request;


pub use call::{Call, Flow, GhostFlowEntry, UserFlow};
pub use delegate::{FlowDelegate, OutboundRequest};
pub use error::FlowError;
pub use event::{
    CONTENT_TYPE_JSON, EventKind, EventPayload, FlowDescriptor, IceCandidate, SignalEvent,
};
pub use manager::{AcquireOutcome, CallConfig, FlowManager, FlowManagerConfig, IceServer};
pub use media_system::{AudioCodec, MediaSystem, MediaSystemConfig, SecureContext, VideoCodec};
pub use metrics::{CallStats, LogEntry};
pub use request::STATUS_CANCELLED;
