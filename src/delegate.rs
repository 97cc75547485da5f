//! Host integration surface.
//!
//! The host application implements [`FlowDelegate`] to give the core its
//! command channel and to receive its callbacks. Only `send_request` is
//! mandatory; every notification has a no-op default so hosts subscribe to
//! what they need.

use crate::error::FlowError;
use crate::event::EventKind;
use async_trait::async_trait;
use serde_json::Value;

/// A command the core wants sent over the host's request channel.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Correlation handle to echo back through `deliver_response`. `None`
    /// for fire-and-forget commands (metrics posts).
    pub handle: Option<String>,
    /// Conversation the command belongs to, when there is one.
    pub conversation: Option<String>,
    pub method: &'static str,
    pub path: String,
    pub content_type: Option<&'static str>,
    pub body: Option<Value>,
}

/// Callback set a host registers with a [`FlowManager`](crate::FlowManager).
///
/// All methods are invoked from the manager's event loop after its internal
/// state has been updated; implementations must not block, and they may call
/// straight back into the manager.
#[async_trait]
pub trait FlowDelegate: Send + Sync {
    /// Sends a command over the request channel. The response, if any, is
    /// handed back through `deliver_response` with the request's handle.
    async fn send_request(&self, request: OutboundRequest) -> Result<(), FlowError>;

    /// The manager entered the config-pending state and needs the call
    /// config (ICE servers etc.) fetched; the host completes the handshake
    /// by calling `config_ready`.
    async fn fetch_config(&self) {}

    /// A condition the core could not resolve locally.
    async fn on_error(&self, _error: &FlowError, _conversation_id: Option<&str>) {}

    /// A recognized signaling event was dispatched. `payload` is the decoded
    /// event object as received.
    async fn on_event(
        &self,
        _kind: EventKind,
        _conversation_id: &str,
        _flow_id: Option<&str>,
        _payload: &Value,
    ) {
    }

    /// A flow in the conversation reached the established state.
    async fn on_media_established(&self, _conversation_id: &str, _user_id: Option<&str>) {}

    /// Streamed protocol-log line (only when log forwarding is enabled).
    async fn on_log_message(&self, _message: &str) {}

    /// Buffered protocol log flushed on call release.
    async fn on_log_upload(&self, _session_id: &str, _body: String) {}

    /// Final metrics computed for a conversation.
    async fn on_metrics(&self, _conversation_id: &str, _metrics: &Value) {}

    /// Resolves a user id to a display name, if the host knows one.
    async fn resolve_username(&self, _user_id: &str) -> Option<String> {
        None
    }
}
