//! Wire-event decoding for the signaling event stream.
//!
//! Events arrive as JSON with a `type`, a required `conversation` id and an
//! optional `flow` id. Decoding is schema-validated up front: a payload that
//! is missing a required field never reaches the routing layer, it fails here
//! with [`FlowError::Protocol`].

use crate::error::FlowError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// The only content type the event channel accepts.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// The recognized signaling event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    FlowAdd,
    FlowDelete,
    FlowActive,
    CandidatesAdd,
    CandidatesUpdate,
    RemoteSdp,
}

impl EventKind {
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "call.flow-add" => Some(Self::FlowAdd),
            "call.flow-delete" => Some(Self::FlowDelete),
            "call.flow-active" => Some(Self::FlowActive),
            "call.remote-candidates-add" => Some(Self::CandidatesAdd),
            "call.remote-candidates-update" => Some(Self::CandidatesUpdate),
            "call.remote-sdp" => Some(Self::RemoteSdp),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::FlowAdd => "call.flow-add",
            Self::FlowDelete => "call.flow-delete",
            Self::FlowActive => "call.flow-active",
            Self::CandidatesAdd => "call.remote-candidates-add",
            Self::CandidatesUpdate => "call.remote-candidates-update",
            Self::RemoteSdp => "call.remote-sdp",
        }
    }

    /// Whether the event kind is meaningless without a `flow` id.
    fn requires_flow(&self) -> bool {
        !matches!(self, Self::FlowAdd)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// One remote ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub sdp: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u32>,
}

/// One flow descriptor from a flow-add event or a flow-post response.
///
/// `creator` is tri-state on the wire: absent, explicit `null`, or a user id.
/// Absent and `null` both mean this side created the flow; a user id means
/// the flow was created by whoever that id names.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowDescriptor {
    pub id: String,
    #[serde(default)]
    pub remote_user: Option<String>,
    pub active: bool,
    #[serde(default)]
    pub sdp_step: Option<String>,
    #[serde(default, deserialize_with = "deserialize_nullable")]
    pub creator: Option<Option<String>>,
}

/// Keeps `null` distinguishable from an absent field: absent stays `None`
/// (via `default`), `null` becomes `Some(None)`.
fn deserialize_nullable<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

impl FlowDescriptor {
    /// Resolves `(is_creator, has_creator)` for this descriptor.
    ///
    /// An absent or null `creator` attributes the flow to the local side. A
    /// declared creator id is compared against the flow's `remote_user`: a
    /// differing id means the local side created it. When no remote user is
    /// declared the batch context decides (`batch_is_creator` is true for
    /// flows returned by our own flow post, false for flow-add events).
    pub fn resolve_attribution(&self, batch_is_creator: bool) -> (bool, bool) {
        match &self.creator {
            None => (true, false),
            Some(None) => (true, true),
            Some(Some(creator)) => match &self.remote_user {
                Some(remote) => (creator != remote, true),
                None => (batch_is_creator, true),
            },
        }
    }

    /// A flow whose SDP exchange has progressed past "pending" is stale with
    /// respect to the add that is delivering it.
    pub fn is_stale(&self) -> bool {
        self.sdp_step.as_deref().is_some_and(|s| s != "pending")
    }
}

/// Type-specific payload of a decoded event.
#[derive(Debug, Clone)]
pub enum EventPayload {
    FlowAdd { flows: Vec<FlowDescriptor> },
    FlowDelete,
    FlowActive { active: bool },
    Candidates { candidates: Vec<IceCandidate> },
    RemoteSdp { sdp: String, state: Option<String> },
}

/// A fully decoded signaling event.
#[derive(Debug, Clone)]
pub struct SignalEvent {
    pub kind: EventKind,
    pub conversation: String,
    pub flow: Option<String>,
    pub payload: EventPayload,
    /// The decoded JSON object, passed through to the host event callback.
    pub raw: Value,
}

#[derive(Debug, Deserialize)]
struct FlowAddBody {
    flows: Vec<FlowDescriptor>,
}

#[derive(Debug, Deserialize)]
struct FlowActiveBody {
    active: bool,
}

#[derive(Debug, Deserialize)]
struct CandidatesBody {
    candidates: Vec<IceCandidate>,
}

#[derive(Debug, Deserialize)]
struct RemoteSdpBody {
    sdp: String,
    #[serde(default)]
    state: Option<String>,
}

/// Decodes an inbound event.
///
/// Returns `Ok(None)` for a syntactically valid event of an unrecognized
/// type; such events are reported as unhandled, not as errors.
pub fn decode(content_type: &str, payload: &str) -> Result<Option<SignalEvent>, FlowError> {
    if content_type != CONTENT_TYPE_JSON {
        return Err(FlowError::Protocol(format!(
            "unsupported event content type: {content_type}"
        )));
    }

    let raw: Value = serde_json::from_str(payload)
        .map_err(|e| FlowError::Protocol(format!("event JSON: {e}")))?;

    let kind = match raw.get("type").and_then(Value::as_str) {
        Some(name) => match EventKind::from_wire(name) {
            Some(kind) => kind,
            None => return Ok(None),
        },
        None => return Err(FlowError::Protocol("event has no type".into())),
    };

    let conversation = raw
        .get("conversation")
        .and_then(Value::as_str)
        .ok_or_else(|| FlowError::Protocol("event has no conversation".into()))?
        .to_string();

    let flow = raw
        .get("flow")
        .and_then(Value::as_str)
        .map(str::to_string);
    if kind.requires_flow() && flow.is_none() {
        return Err(FlowError::Protocol(format!("{kind} event has no flow")));
    }

    let body = |err: serde_json::Error| FlowError::Protocol(format!("{kind} payload: {err}"));
    let payload = match kind {
        EventKind::FlowAdd => {
            let b: FlowAddBody = serde_json::from_value(raw.clone()).map_err(body)?;
            EventPayload::FlowAdd { flows: b.flows }
        }
        EventKind::FlowDelete => EventPayload::FlowDelete,
        EventKind::FlowActive => {
            let b: FlowActiveBody = serde_json::from_value(raw.clone()).map_err(body)?;
            EventPayload::FlowActive { active: b.active }
        }
        EventKind::CandidatesAdd | EventKind::CandidatesUpdate => {
            let b: CandidatesBody = serde_json::from_value(raw.clone()).map_err(body)?;
            EventPayload::Candidates {
                candidates: b.candidates,
            }
        }
        EventKind::RemoteSdp => {
            let b: RemoteSdpBody = serde_json::from_value(raw.clone()).map_err(body)?;
            EventPayload::RemoteSdp {
                sdp: b.sdp,
                state: b.state,
            }
        }
    };

    Ok(Some(SignalEvent {
        kind,
        conversation,
        flow,
        payload,
        raw,
    }))
}

/// An event whose target did not exist when it arrived, held for replay.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub content_type: String,
    pub payload: String,
}
