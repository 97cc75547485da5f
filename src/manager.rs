//! Flow manager: session orchestration over the command and event channels.
//!
//! The manager reconciles two independently ordered channels: command
//! responses correlated by request handle, and pushed signaling events.
//! Events that reference flows which do not exist yet are queued and replayed
//! once their target appears; stale "ghost" flow descriptors are deleted
//! instead of instantiated; flow posting is gated on the call-config
//! handshake.
//!
//! All state mutation happens synchronously under one lock. Host-visible side
//! effects (commands, callbacks) accumulate as [`Effect`] values and run
//! after the lock is released, so a delegate may call straight back into the
//! manager without deadlocking and the event loop is never blocked.

use crate::call::{Call, Flow, GhostFlowEntry};
use crate::delegate::{FlowDelegate, OutboundRequest};
use crate::error::FlowError;
use crate::event::{
    self, CONTENT_TYPE_JSON, EventKind, EventPayload, FlowDescriptor, PendingEvent,
};
use crate::media_system::MediaSystem;
use crate::metrics::{LogEntry, format_log};
use crate::request::{RequestPurpose, RequestTracker, STATUS_CANCELLED};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

fn flows_path(conversation_id: &str) -> String {
    format!("/conversations/{conversation_id}/call/flows")
}

fn flow_path(conversation_id: &str, flow_id: &str) -> String {
    format!("/conversations/{conversation_id}/call/flows/{flow_id}")
}

fn state_path(conversation_id: &str) -> String {
    format!("/conversations/{conversation_id}/call/state")
}

/// Result of a flow acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The flow post was issued.
    Posted,
    /// The call config is still pending; the post happens when it is ready.
    Deferred,
}

/// One ICE server from the call config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Call configuration delivered by the external handshake.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallConfig {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

/// Tunables for a manager instance.
#[derive(Debug, Clone)]
pub struct FlowManagerConfig {
    /// Post final metrics when a call is released.
    pub use_metrics: bool,
    /// Keep a protocol log for each call.
    pub use_logging: bool,
    /// Stream log lines to the delegate instead of buffering for upload.
    pub forward_logs: bool,
    /// Extra event tracing through the `log` crate (0 = off).
    pub trace: u8,
}

impl Default for FlowManagerConfig {
    fn default() -> Self {
        Self {
            use_metrics: true,
            use_logging: false,
            forward_logs: false,
            trace: 0,
        }
    }
}

#[derive(Debug, Default)]
struct ConfigState {
    pending: bool,
    ready: bool,
    params: Option<CallConfig>,
}

/// Host-visible side effect produced under the state lock, executed after it
/// is released.
enum Effect {
    Send {
        purpose: Option<RequestPurpose>,
        conversation: Option<String>,
        method: &'static str,
        path: String,
        content_type: Option<&'static str>,
        body: Option<Value>,
    },
    Error {
        error: FlowError,
        conversation: Option<String>,
    },
    Event {
        kind: EventKind,
        conversation: String,
        flow: Option<String>,
        payload: Value,
    },
    MediaEstablished {
        conversation: String,
        user: Option<String>,
    },
    Metrics {
        conversation: String,
        payload: Value,
    },
    LogMessage(String),
    LogUpload {
        session_id: String,
        body: String,
    },
}

struct ManagerState {
    calls: HashMap<String, Call>,
    pending_events: VecDeque<PendingEvent>,
    postponed: VecDeque<String>,
    config: ConfigState,
    log: Vec<LogEntry>,
    self_user_id: Option<String>,
    settings: FlowManagerConfig,
}

impl ManagerState {
    fn new(settings: FlowManagerConfig) -> Self {
        Self {
            calls: HashMap::new(),
            pending_events: VecDeque::new(),
            postponed: VecDeque::new(),
            config: ConfigState::default(),
            log: Vec::new(),
            self_user_id: None,
            settings,
        }
    }

    /// Creates the call if it does not exist. Returns true when it did not.
    fn ensure_call(&mut self, conversation_id: &str) -> bool {
        if self.calls.contains_key(conversation_id) {
            return false;
        }
        self.calls
            .insert(conversation_id.to_string(), Call::new(conversation_id));
        true
    }

    fn append_log(&mut self, conversation_id: Option<&str>, message: String, fx: &mut Vec<Effect>) {
        if !self.settings.use_logging {
            return;
        }
        if self.settings.forward_logs {
            fx.push(Effect::LogMessage(message));
            return;
        }
        let entry = LogEntry::new(message);
        match conversation_id.and_then(|c| self.calls.get_mut(c)) {
            Some(call) => call.push_log(entry),
            None => self.log.push(entry),
        }
    }

    fn post_flows(&mut self, conversation_id: &str, fx: &mut Vec<Effect>) {
        let path = flows_path(conversation_id);
        self.append_log(Some(conversation_id), format!("HTTP POST {path}"), fx);
        fx.push(Effect::Send {
            purpose: Some(RequestPurpose::PostFlows {
                conversation_id: conversation_id.to_string(),
            }),
            conversation: Some(conversation_id.to_string()),
            method: "POST",
            path,
            content_type: None,
            body: None,
        });
    }

    fn delete_flow(&mut self, conversation_id: &str, flow_id: &str, ghost: bool, fx: &mut Vec<Effect>) {
        let path = flow_path(conversation_id, flow_id);
        self.append_log(Some(conversation_id), format!("HTTP POST {path}"), fx);
        fx.push(Effect::Send {
            purpose: Some(RequestPurpose::DeleteFlow {
                conversation_id: conversation_id.to_string(),
                flow_id: flow_id.to_string(),
                ghost,
            }),
            conversation: Some(conversation_id.to_string()),
            method: "POST",
            path,
            content_type: None,
            body: None,
        });
    }

    /// Routes one event through classification, queueing and dispatch.
    /// Returns whether the event type was recognized.
    fn route_event(
        &mut self,
        content_type: &str,
        payload: &str,
        replayed: bool,
        fx: &mut Vec<Effect>,
    ) -> Result<bool, FlowError> {
        let ev = match event::decode(content_type, payload)? {
            Some(ev) => ev,
            None => return Ok(false),
        };

        let conversation = ev.conversation.clone();
        let have_call = self.calls.contains_key(&conversation);
        self.append_log(
            have_call.then_some(conversation.as_str()),
            format!("EVENT {} ({} bytes)", ev.kind, payload.len()),
            fx,
        );
        if self.settings.trace > 0 {
            debug!("event {}{}", ev.kind, if replayed { " (replay)" } else { "" });
        }

        if let Some(flow_id) = &ev.flow {
            let flow_known = have_call
                && self
                    .calls
                    .get(&conversation)
                    .is_some_and(|c| c.flow(flow_id).is_some());
            if !flow_known {
                if ev.kind == EventKind::FlowDelete {
                    // Delete is idempotent: the flow (or the whole call) is
                    // already gone.
                    info!("flow {flow_id} already deleted in {conversation}");
                    return Ok(true);
                }
                if have_call {
                    debug!(
                        "no flow {flow_id} in {conversation} yet, queueing {}",
                        ev.kind
                    );
                    self.pending_events.push_back(PendingEvent {
                        content_type: content_type.to_string(),
                        payload: payload.to_string(),
                    });
                    return Ok(true);
                }
                if ev.kind != EventKind::FlowAdd {
                    return Err(FlowError::not_found("conversation", conversation));
                }
            }
        }

        fx.push(Effect::Event {
            kind: ev.kind,
            conversation: conversation.clone(),
            flow: ev.flow.clone(),
            payload: ev.raw.clone(),
        });

        self.dispatch(ev, fx)
    }

    fn dispatch(&mut self, ev: event::SignalEvent, fx: &mut Vec<Effect>) -> Result<bool, FlowError> {
        let conversation = ev.conversation;
        match ev.payload {
            EventPayload::FlowAdd { flows } => {
                if self.ensure_call(&conversation) {
                    debug!("created call for {conversation}");
                }
                self.add_flow_batch(&conversation, flows, false, fx);
                if let Some(call) = self.calls.get(&conversation) {
                    info!("add flows -- {} flows in {conversation}", call.flow_count());
                }
            }
            EventPayload::FlowDelete => {
                let Some(flow_id) = ev.flow else {
                    return Err(FlowError::Protocol("flow-delete without flow".into()));
                };
                let mut empty = false;
                if let Some(call) = self.calls.get_mut(&conversation) {
                    call.remove_flow(&flow_id);
                    empty = call.flow_count() == 0;
                }
                debug!("deleted flow {flow_id} in {conversation}");
                if empty {
                    self.calls.remove(&conversation);
                    self.postponed.retain(|c| c != &conversation);
                    info!("last flow removed, releasing call {conversation}");
                }
            }
            EventPayload::FlowActive { active } => {
                let Some(flow_id) = ev.flow else {
                    return Err(FlowError::Protocol("flow-active without flow".into()));
                };
                if let Some(established_user) = self.with_flow(&conversation, &flow_id, |flow| {
                    flow.set_active(active);
                    flow.poll_established().then(|| flow.remote_user.clone())
                })? {
                    fx.push(Effect::MediaEstablished {
                        conversation,
                        user: established_user,
                    });
                }
            }
            EventPayload::Candidates { candidates } => {
                let Some(flow_id) = ev.flow else {
                    return Err(FlowError::Protocol("candidate event without flow".into()));
                };
                let update = ev.kind == EventKind::CandidatesUpdate;
                self.with_flow(&conversation, &flow_id, |flow| {
                    flow.apply_candidates(&candidates, update);
                })?;
            }
            EventPayload::RemoteSdp { sdp, state } => {
                let Some(flow_id) = ev.flow else {
                    return Err(FlowError::Protocol("remote-sdp without flow".into()));
                };
                if let Some(established_user) = self.with_flow(&conversation, &flow_id, |flow| {
                    flow.apply_remote_sdp(&sdp, state.as_deref());
                    flow.poll_established().then(|| flow.remote_user.clone())
                })? {
                    fx.push(Effect::MediaEstablished {
                        conversation,
                        user: established_user,
                    });
                }
            }
        }
        Ok(true)
    }

    fn with_flow<T>(
        &mut self,
        conversation_id: &str,
        flow_id: &str,
        f: impl FnOnce(&mut Flow) -> T,
    ) -> Result<T, FlowError> {
        let call = self
            .calls
            .get_mut(conversation_id)
            .ok_or_else(|| FlowError::not_found("conversation", conversation_id))?;
        let flow = call
            .flow_mut(flow_id)
            .ok_or_else(|| FlowError::not_found("flow", flow_id))?;
        Ok(f(flow))
    }

    /// Classifies a batch of flow descriptors and adds the survivors.
    ///
    /// Ghosts (stale and inactive) are recorded on the call and their delete
    /// commands issued before any survivor is added; a stale but active flow
    /// is added with its creator attribution cleared. Any additions trigger
    /// one replay pass over the pending-event queue.
    fn add_flow_batch(
        &mut self,
        conversation_id: &str,
        descriptors: Vec<FlowDescriptor>,
        batch_is_creator: bool,
        fx: &mut Vec<Effect>,
    ) -> usize {
        let mut additions: Vec<(FlowDescriptor, bool, bool)> = Vec::new();
        let mut ghosts: Vec<String> = Vec::new();
        {
            let Some(call) = self.calls.get_mut(conversation_id) else {
                return 0;
            };
            for desc in descriptors {
                if call.flow(&desc.id).is_some() {
                    info!("flow {} already exists in {conversation_id}", desc.id);
                    continue;
                }
                if desc.is_stale() {
                    if desc.active {
                        // Progressed on the peer side while our post was in
                        // flight; take it, but drop its creator attribution.
                        additions.push((desc, false, false));
                    } else {
                        info!(
                            "ghost flow {} (sdp_step={}) in {conversation_id} -- deleting",
                            desc.id,
                            desc.sdp_step.as_deref().unwrap_or("")
                        );
                        call.push_ghost(GhostFlowEntry {
                            flow_id: desc.id.clone(),
                            sdp_step: desc.sdp_step.clone().unwrap_or_default(),
                            remote_user: desc.remote_user.clone(),
                        });
                        ghosts.push(desc.id);
                    }
                } else {
                    let (is_creator, has_creator) = desc.resolve_attribution(batch_is_creator);
                    additions.push((desc, is_creator, has_creator));
                }
            }
        }

        for flow_id in &ghosts {
            self.delete_flow(conversation_id, flow_id, true, fx);
        }

        let mut added = 0;
        if let Some(call) = self.calls.get_mut(conversation_id) {
            for (desc, is_creator, has_creator) in additions {
                call.add_flow(Flow::new(
                    &desc.id,
                    desc.remote_user.clone(),
                    is_creator,
                    has_creator,
                    desc.active,
                ));
                added += 1;
            }
        }

        if added > 0 {
            self.drain_pending(fx);
        }
        added
    }

    /// Replays queued events once. The drain is bounded by the queue length
    /// at entry; entries that still cannot resolve re-enqueue at the tail in
    /// their original order.
    fn drain_pending(&mut self, fx: &mut Vec<Effect>) {
        let bound = self.pending_events.len();
        if bound == 0 {
            return;
        }
        info!("event replay (count={bound})");
        for _ in 0..bound {
            let Some(pending) = self.pending_events.pop_front() else {
                break;
            };
            if let Err(e) = self.route_event(&pending.content_type, &pending.payload, true, fx) {
                warn!("queued event dropped on replay: {e}");
            }
        }
    }

    /// Runs the typed completion for a consumed request handle.
    fn complete_request(
        &mut self,
        purpose: RequestPurpose,
        status: u16,
        payload: Option<&Value>,
        fx: &mut Vec<Effect>,
    ) {
        match purpose {
            RequestPurpose::PostFlows { conversation_id } => {
                if status == STATUS_CANCELLED {
                    debug!("flow post for {conversation_id} cancelled");
                    return;
                }
                if !(200..300).contains(&status) {
                    warn!("flow post for {conversation_id} failed: status {status}");
                    fx.push(Effect::Error {
                        error: FlowError::Protocol(format!(
                            "flow post failed with status {status}"
                        )),
                        conversation: Some(conversation_id),
                    });
                    return;
                }
                if !self.calls.contains_key(&conversation_id) {
                    info!("flow post response for released call {conversation_id}");
                    return;
                }
                let descriptors = payload
                    .and_then(|v| v.get("flows"))
                    .cloned()
                    .map(serde_json::from_value::<Vec<FlowDescriptor>>);
                let descriptors = match descriptors {
                    Some(Ok(descriptors)) => descriptors,
                    Some(Err(e)) => {
                        fx.push(Effect::Error {
                            error: FlowError::Protocol(format!("flow post response: {e}")),
                            conversation: Some(conversation_id),
                        });
                        return;
                    }
                    None => {
                        fx.push(Effect::Error {
                            error: FlowError::Protocol(
                                "flow post response has no flows".into(),
                            ),
                            conversation: Some(conversation_id),
                        });
                        return;
                    }
                };
                self.add_flow_batch(&conversation_id, descriptors, true, fx);
                if let Some(call) = self.calls.get_mut(&conversation_id) {
                    call.purge_users();
                    info!(
                        "post flows -- {} flows in {conversation_id}",
                        call.flow_count()
                    );
                }
            }
            RequestPurpose::DeleteFlow {
                conversation_id,
                flow_id,
                ghost,
            } => {
                if status == STATUS_CANCELLED {
                    debug!("flow delete {flow_id} in {conversation_id} cancelled");
                    return;
                }
                if !(200..300).contains(&status) {
                    warn!(
                        "flow delete {flow_id} in {conversation_id} failed: status {status}"
                    );
                    self.append_log(
                        Some(&conversation_id),
                        format!("flow delete {flow_id} failed: {status}"),
                        fx,
                    );
                    return;
                }
                if ghost
                    && let Some(call) = self.calls.get_mut(&conversation_id)
                {
                    call.remove_ghost(&flow_id);
                }
            }
        }
    }

    fn send_metrics(
        &mut self,
        conversation_id: &str,
        path_suffix: Option<&str>,
        fx: &mut Vec<Effect>,
    ) -> bool {
        let Some(call) = self.calls.get(conversation_id) else {
            return false;
        };
        let payload = call.stats().to_json();
        let mut path = state_path(conversation_id);
        if let Some(suffix) = path_suffix {
            path.push('/');
            path.push_str(suffix);
        }
        fx.push(Effect::Metrics {
            conversation: conversation_id.to_string(),
            payload: payload.clone(),
        });
        self.append_log(Some(conversation_id), format!("HTTP POST {path}"), fx);
        // Metrics are fire-and-forget: no handle, so the response takes the
        // no-matching-request path.
        fx.push(Effect::Send {
            purpose: None,
            conversation: Some(conversation_id.to_string()),
            method: "POST",
            path,
            content_type: Some(CONTENT_TYPE_JSON),
            body: Some(payload),
        });
        true
    }

    /// Releases one call: final metrics, log upload, removal from the
    /// postponed queue and the call table. Returns whether it existed.
    fn release_call(&mut self, conversation_id: &str, fx: &mut Vec<Effect>) -> bool {
        let have_call = self.calls.contains_key(conversation_id);
        self.append_log(
            have_call.then_some(conversation_id),
            format!("release_flows: convid={conversation_id}"),
            fx,
        );
        if !have_call {
            info!("release_flows: no call for {conversation_id}");
            return false;
        }

        if let Some(call) = self.calls.get_mut(conversation_id) {
            call.set_active(false);
        }

        if self.settings.use_metrics {
            self.send_metrics(conversation_id, Some("complete"), fx);
        }

        if self.settings.use_logging
            && !self.settings.forward_logs
            && let Some(call) = self.calls.get_mut(conversation_id)
        {
            let session_id = call.session_id().unwrap_or(conversation_id).to_string();
            let mut entries = call.drain_log();
            entries.append(&mut self.log);
            if !entries.is_empty() {
                fx.push(Effect::LogUpload {
                    session_id,
                    body: format_log(&entries),
                });
            }
        }

        self.postponed.retain(|c| c != conversation_id);
        self.calls.remove(conversation_id);
        true
    }
}

/// Session orchestrator for one signaling connection.
///
/// Owns the call collection, the outstanding-request tracker, the
/// pending-event queue and the config-readiness gate. All operations execute
/// on the caller's task and never block.
pub struct FlowManager {
    media: Arc<MediaSystem>,
    delegate: Arc<dyn FlowDelegate>,
    requests: RequestTracker,
    state: Mutex<ManagerState>,
    registration: AtomicU64,
}

impl FlowManager {
    pub async fn new(
        media: Arc<MediaSystem>,
        delegate: Arc<dyn FlowDelegate>,
        config: FlowManagerConfig,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            media: media.clone(),
            delegate,
            requests: RequestTracker::new(),
            state: Mutex::new(ManagerState::new(config)),
            registration: AtomicU64::new(0),
        });
        let id = media.register_manager(&manager);
        manager.registration.store(id, Ordering::Relaxed);
        if media.is_started() {
            manager.begin_config_refresh().await;
        }
        manager
    }

    /// Enters the config-pending state and asks the host to fetch the call
    /// config. Used at startup and whenever an access-token refresh
    /// invalidates the previous config.
    pub(crate) async fn begin_config_refresh(&self) {
        {
            let mut state = self.state.lock().await;
            state.config.pending = true;
        }
        self.delegate.fetch_config().await;
    }

    /// Resolves or creates the call and posts its flows, or postpones the
    /// post while the call config is pending.
    pub async fn acquire_flows(
        &self,
        conversation_id: &str,
        session_id: Option<&str>,
    ) -> Result<AcquireOutcome, FlowError> {
        if conversation_id.is_empty() {
            return Err(FlowError::InvalidArgument("conversation id is empty"));
        }
        debug!("acquire_flows: convid={conversation_id}");

        let mut fx = Vec::new();
        let outcome = {
            let mut state = self.state.lock().await;
            if state.ensure_call(conversation_id) {
                debug!("acquire_flows: created call {conversation_id}");
            }
            if let Some(call) = state.calls.get_mut(conversation_id) {
                call.mark_started();
                if let Some(session_id) = session_id {
                    call.set_session_id(session_id);
                }
                call.set_active(true);
            }
            state.append_log(
                Some(conversation_id),
                format!("acquire_flows: convid={conversation_id} sessid={session_id:?}"),
                &mut fx,
            );

            if state.config.pending {
                info!("acquire_flows: config pending, postponing {conversation_id}");
                if !state.postponed.contains(&conversation_id.to_string()) {
                    state.postponed.push_back(conversation_id.to_string());
                }
                AcquireOutcome::Deferred
            } else {
                state.post_flows(conversation_id, &mut fx);
                AcquireOutcome::Posted
            }
        };
        self.run_effects(fx).await;
        Ok(outcome)
    }

    /// Releases a call and cancels its outstanding commands. Releasing an
    /// unknown conversation is a logged no-op.
    pub async fn release_flows(&self, conversation_id: &str) -> Result<(), FlowError> {
        debug!("release_flows: convid={conversation_id}");
        let mut fx = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.release_call(conversation_id, &mut fx);
            for (id, request) in self.requests.take_for_conversation(conversation_id) {
                debug!("cancelling request {id} ({})", request.debug_label);
                state.complete_request(request.purpose, STATUS_CANCELLED, None, &mut fx);
            }
        }
        self.run_effects(fx).await;
        Ok(())
    }

    /// Entry point for the event-stream channel. Returns whether the event
    /// type was recognized.
    pub async fn process_event(
        &self,
        content_type: &str,
        payload: &str,
    ) -> Result<bool, FlowError> {
        let mut fx = Vec::new();
        let result = {
            let mut state = self.state.lock().await;
            state.route_event(content_type, payload, false, &mut fx)
        };
        self.run_effects(fx).await;
        result
    }

    /// Entry point for command-channel responses.
    ///
    /// A response with no matching handle (including no handle at all) is
    /// logged, discarded and reported as [`FlowError::StaleCorrelation`] —
    /// expected under teardown races. A matched handle is consumed exactly
    /// once; an undecodable body still resolves the completion (with no
    /// payload) and reports [`FlowError::Protocol`].
    pub async fn deliver_response(
        &self,
        handle: Option<&str>,
        status: u16,
        content_type: Option<&str>,
        body: Option<&str>,
    ) -> Result<(), FlowError> {
        let Some(request) = handle.and_then(|h| self.requests.take(h)) else {
            if let Some(h) = handle {
                warn!("response for unknown request {h} (status {status}), discarding");
            } else {
                debug!("response without handle (status {status}), discarding");
            }
            let mut fx = Vec::new();
            {
                let mut state = self.state.lock().await;
                state.append_log(None, format!("HTTP RESP {status} (unmatched)"), &mut fx);
            }
            self.run_effects(fx).await;
            return Err(FlowError::StaleCorrelation(handle.map(str::to_string)));
        };

        let mut protocol_error = None;
        let payload: Option<Value> = match (content_type, body) {
            (Some(ct), _) if ct != CONTENT_TYPE_JSON => {
                protocol_error = Some(FlowError::Protocol(format!(
                    "invalid response content type: {ct}"
                )));
                None
            }
            (Some(_), Some(body)) if !body.is_empty() => match serde_json::from_str(body) {
                Ok(v) => Some(v),
                Err(e) => {
                    protocol_error = Some(FlowError::Protocol(format!("response JSON: {e}")));
                    None
                }
            },
            _ => None,
        };

        let mut fx = Vec::new();
        {
            let mut state = self.state.lock().await;
            let conversation_id = request.purpose.conversation_id().to_string();
            state.append_log(
                Some(&conversation_id),
                format!("HTTP RESP {status} ({})", request.debug_label),
                &mut fx,
            );
            state.complete_request(request.purpose, status, payload.as_ref(), &mut fx);
        }
        self.run_effects(fx).await;

        match protocol_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Completes the config handshake and drains postponed calls in the
    /// order they were postponed.
    pub async fn config_ready(&self, config: CallConfig) {
        info!("call config ready ({} ice servers)", config.ice_servers.len());
        let mut fx = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.config.pending = false;
            state.config.ready = true;
            state.config.params = Some(config);
            let drained: Vec<String> = state.postponed.drain(..).collect();
            for conversation_id in drained {
                let active = state
                    .calls
                    .get(&conversation_id)
                    .is_some_and(Call::is_active);
                if active {
                    state.post_flows(&conversation_id, &mut fx);
                } else {
                    debug!("postponed call {conversation_id} released, skipping post");
                }
            }
        }
        self.run_effects(fx).await;
    }

    /// An access-token refresh invalidates the previous call config; the
    /// token itself lives with the host transport.
    pub async fn refresh_access_token(&self, _token: &str, token_type: &str) {
        info!("access token refreshed (type {token_type}), refetching call config");
        self.begin_config_refresh().await;
    }

    /// Restarts flow negotiation on every call after a network path change.
    pub async fn network_changed(&self) {
        let mut fx = Vec::new();
        {
            let mut state = self.state.lock().await;
            info!("network changed, restarting {} calls", state.calls.len());
            let calls: Vec<(String, bool)> = state
                .calls
                .iter()
                .map(|(id, call)| (id.clone(), call.is_active()))
                .collect();
            for (conversation_id, active) in calls {
                if let Some(call) = state.calls.get_mut(&conversation_id) {
                    for flow in call.flows_mut() {
                        flow.restart();
                    }
                }
                state.append_log(
                    Some(&conversation_id),
                    "network changed: restarting flows".to_string(),
                    &mut fx,
                );
                if active {
                    if state.config.pending {
                        if !state.postponed.contains(&conversation_id) {
                            state.postponed.push_back(conversation_id);
                        }
                    } else {
                        state.post_flows(&conversation_id, &mut fx);
                    }
                }
            }
        }
        self.run_effects(fx).await;
    }

    /// Posts current metrics for a conversation.
    pub async fn send_metrics(
        &self,
        conversation_id: &str,
        path: Option<&str>,
    ) -> Result<(), FlowError> {
        let mut fx = Vec::new();
        let found = {
            let mut state = self.state.lock().await;
            state.send_metrics(conversation_id, path, &mut fx)
        };
        self.run_effects(fx).await;
        if found {
            Ok(())
        } else {
            Err(FlowError::not_found("conversation", conversation_id))
        }
    }

    /// Announces a participant; the display name is resolved through the
    /// delegate when not supplied.
    pub async fn add_user(
        &self,
        conversation_id: &str,
        user_id: &str,
        username: Option<&str>,
    ) -> Result<(), FlowError> {
        if conversation_id.is_empty() || user_id.is_empty() {
            return Err(FlowError::InvalidArgument("empty conversation or user id"));
        }
        info!("user_add: convid={conversation_id} userid={user_id}");
        {
            let mut state = self.state.lock().await;
            state.ensure_call(conversation_id);
            if let Some(call) = state.calls.get_mut(conversation_id) {
                call.add_user(user_id, username);
            }
        }
        if username.is_none()
            && let Some(name) = self.delegate.resolve_username(user_id).await
        {
            let mut state = self.state.lock().await;
            if let Some(call) = state.calls.get_mut(conversation_id) {
                call.set_user_name(user_id, &name);
            }
        }
        Ok(())
    }

    pub async fn users_count(&self, conversation_id: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(conversation_id)
            .map_or(0, Call::users_count)
    }

    /// Sets the session id, creating the call if needed.
    pub async fn set_session_id(&self, conversation_id: &str, session_id: &str) {
        let mut fx = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.ensure_call(conversation_id);
            if let Some(call) = state.calls.get_mut(conversation_id) {
                call.set_session_id(session_id);
            }
            state.append_log(
                Some(conversation_id),
                format!("set_sessid: convid={conversation_id} sessid={session_id}"),
                &mut fx,
            );
        }
        self.run_effects(fx).await;
    }

    /// Appends a host-supplied line to the conversation's protocol log.
    pub async fn append_conv_log(&self, conversation_id: &str, message: &str) {
        let mut fx = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.append_log(Some(conversation_id), message.to_string(), &mut fx);
        }
        self.run_effects(fx).await;
    }

    pub async fn has_active(&self) -> bool {
        self.state
            .lock()
            .await
            .calls
            .values()
            .any(Call::is_active)
    }

    pub async fn has_media(&self, conversation_id: &str) -> bool {
        self.state
            .lock()
            .await
            .calls
            .get(conversation_id)
            .is_some_and(Call::has_media)
    }

    pub async fn is_ready(&self) -> bool {
        self.state.lock().await.config.ready
    }

    /// The call config delivered by the last completed handshake.
    pub async fn call_config(&self) -> Option<CallConfig> {
        self.state.lock().await.config.params.clone()
    }

    pub async fn set_self_user_id(&self, user_id: &str) {
        info!("setting self user id to {user_id}");
        self.state.lock().await.self_user_id = Some(user_id.to_string());
    }

    pub async fn self_user_id(&self) -> Option<String> {
        self.state.lock().await.self_user_id.clone()
    }

    pub async fn enable_metrics(&self, enable: bool) {
        self.state.lock().await.settings.use_metrics = enable;
    }

    pub async fn enable_logging(&self, enable: bool) {
        self.state.lock().await.settings.use_logging = enable;
    }

    pub async fn enable_trace(&self, level: u8) {
        self.state.lock().await.settings.trace = level;
    }

    /// Number of requests awaiting a response or cancellation.
    pub fn outstanding_requests(&self) -> usize {
        self.requests.outstanding()
    }

    /// Destruction cascade: cancels every outstanding request with the
    /// cancellation status, releases every call, flushes the queues and
    /// unregisters from the media system.
    pub async fn shutdown(&self) {
        debug!("shutting down flow manager");
        let mut fx = Vec::new();
        {
            let mut state = self.state.lock().await;
            for (id, request) in self.requests.drain() {
                debug!("cancelling request {id} ({})", request.debug_label);
                state.complete_request(request.purpose, STATUS_CANCELLED, None, &mut fx);
            }
            let calls: Vec<String> = state.calls.keys().cloned().collect();
            for conversation_id in calls {
                state.release_call(&conversation_id, &mut fx);
            }
            state.pending_events.clear();
            state.postponed.clear();
        }
        self.run_effects(fx).await;
        self.media
            .unregister_manager(self.registration.load(Ordering::Relaxed));
    }

    async fn run_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send {
                    purpose,
                    conversation,
                    method,
                    path,
                    content_type,
                    body,
                } => {
                    let label = format!("{method} {path}");
                    let handle =
                        purpose.map(|p| self.requests.register(p, label.clone()));
                    let request = OutboundRequest {
                        handle: handle.clone(),
                        conversation: conversation.clone(),
                        method,
                        path,
                        content_type,
                        body,
                    };
                    if let Err(e) = self.delegate.send_request(request).await {
                        warn!("send_request failed for {label}: {e}");
                        if let Some(handle) = &handle {
                            self.requests.withdraw(handle);
                        }
                        self.delegate.on_error(&e, conversation.as_deref()).await;
                    }
                }
                Effect::Error {
                    error,
                    conversation,
                } => {
                    self.delegate
                        .on_error(&error, conversation.as_deref())
                        .await;
                }
                Effect::Event {
                    kind,
                    conversation,
                    flow,
                    payload,
                } => {
                    self.delegate
                        .on_event(kind, &conversation, flow.as_deref(), &payload)
                        .await;
                }
                Effect::MediaEstablished { conversation, user } => {
                    self.delegate
                        .on_media_established(&conversation, user.as_deref())
                        .await;
                }
                Effect::Metrics {
                    conversation,
                    payload,
                } => {
                    self.delegate.on_metrics(&conversation, &payload).await;
                }
                Effect::LogMessage(message) => {
                    self.delegate.on_log_message(&message).await;
                }
                Effect::LogUpload { session_id, body } => {
                    self.delegate.on_log_upload(&session_id, body).await;
                }
            }
        }
    }
}

#[cfg(test)]
impl FlowManager {
    pub(crate) async fn pending_events_len(&self) -> usize {
        self.state.lock().await.pending_events.len()
    }

    pub(crate) async fn postponed_len(&self) -> usize {
        self.state.lock().await.postponed.len()
    }

    pub(crate) async fn has_call(&self, conversation_id: &str) -> bool {
        self.state.lock().await.calls.contains_key(conversation_id)
    }

    pub(crate) async fn flow_snapshot(
        &self,
        conversation_id: &str,
        flow_id: &str,
    ) -> Option<Flow> {
        self.state
            .lock()
            .await
            .calls
            .get(conversation_id)
            .and_then(|c| c.flow(flow_id))
            .cloned()
    }

    pub(crate) async fn ghost_count(&self, conversation_id: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(conversation_id)
            .map_or(0, |c| c.ghost_flows().len())
    }

    pub(crate) async fn user_display_name(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Option<String> {
        self.state
            .lock()
            .await
            .calls
            .get(conversation_id)
            .and_then(|c| c.user(user_id))
            .and_then(|u| u.display_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ManagerState {
        ManagerState::new(FlowManagerConfig::default())
    }

    fn flow_add(conversation: &str, flows: &str) -> String {
        format!(r#"{{"type":"call.flow-add","conversation":"{conversation}","flows":{flows}}}"#)
    }

    fn route(st: &mut ManagerState, payload: &str) -> Result<bool, FlowError> {
        let mut fx = Vec::new();
        st.route_event(CONTENT_TYPE_JSON, payload, false, &mut fx)
    }

    #[test]
    fn test_unrecognized_event_not_queued() {
        let mut st = state();
        let handled = route(
            &mut st,
            r#"{"type":"call.something","conversation":"c1","flow":"f1"}"#,
        )
        .unwrap();
        assert!(!handled);
        assert!(st.pending_events.is_empty());
    }

    #[test]
    fn test_event_for_unknown_conversation_is_not_found() {
        let mut st = state();
        let err = route(
            &mut st,
            r#"{"type":"call.flow-active","conversation":"c1","flow":"f1","active":true}"#,
        )
        .unwrap_err();
        assert!(matches!(err, FlowError::NotFound { kind: "conversation", .. }));
        assert!(st.pending_events.is_empty());
    }

    #[test]
    fn test_queued_event_survives_unrelated_add() {
        let mut st = state();
        st.ensure_call("c1");

        // Queue a candidate event for a flow that never shows up.
        let handled = route(
            &mut st,
            r#"{"type":"call.remote-candidates-add","conversation":"c1","flow":"f9",
                "candidates":[{"sdp":"candidate:1"}]}"#,
        )
        .unwrap();
        assert!(handled);
        assert_eq!(st.pending_events.len(), 1);

        // An unrelated add triggers one bounded replay; the entry re-queues.
        route(&mut st, &flow_add("c1", r#"[{"id":"f1","active":true}]"#)).unwrap();
        assert_eq!(st.pending_events.len(), 1);
        assert!(st.calls["c1"].flow("f9").is_none());
    }

    #[test]
    fn test_ghost_delete_issued_before_additions() {
        let mut st = state();
        st.ensure_call("c1");

        let mut fx = Vec::new();
        st.route_event(
            CONTENT_TYPE_JSON,
            &flow_add(
                "c1",
                r#"[{"id":"ghost","active":false,"sdp_step":"completed"},
                    {"id":"live","active":true}]"#,
            ),
            false,
            &mut fx,
        )
        .unwrap();

        let sends: Vec<&Effect> = fx
            .iter()
            .filter(|e| matches!(e, Effect::Send { .. }))
            .collect();
        assert_eq!(sends.len(), 1);
        match sends[0] {
            Effect::Send { purpose, path, .. } => {
                assert_eq!(
                    purpose,
                    &Some(RequestPurpose::DeleteFlow {
                        conversation_id: "c1".into(),
                        flow_id: "ghost".into(),
                        ghost: true,
                    })
                );
                assert_eq!(path, "/conversations/c1/call/flows/ghost");
            }
            _ => unreachable!(),
        }

        let call = &st.calls["c1"];
        assert!(call.flow("ghost").is_none());
        assert!(call.flow("live").is_some());
        assert_eq!(call.ghost_flows().len(), 1);
    }

    #[test]
    fn test_stale_active_flow_attribution_override() {
        let mut st = state();
        st.ensure_call("c1");
        route(
            &mut st,
            &flow_add(
                "c1",
                r#"[{"id":"f1","active":true,"sdp_step":"completed"}]"#,
            ),
        )
        .unwrap();

        let flow = st.calls["c1"].flow("f1").unwrap();
        assert!(!flow.is_creator, "override beats the absent-creator rule");
        assert!(!flow.has_creator);
    }

    #[test]
    fn test_existing_flow_not_reclassified() {
        let mut st = state();
        st.ensure_call("c1");
        route(&mut st, &flow_add("c1", r#"[{"id":"f1","active":true}]"#)).unwrap();
        assert!(st.calls["c1"].flow("f1").unwrap().is_creator);

        // Same id arriving again, now looking like a ghost: skipped, not
        // reclassified.
        let mut fx = Vec::new();
        st.route_event(
            CONTENT_TYPE_JSON,
            &flow_add(
                "c1",
                r#"[{"id":"f1","active":false,"sdp_step":"completed"}]"#,
            ),
            false,
            &mut fx,
        )
        .unwrap();
        assert!(st.calls["c1"].flow("f1").unwrap().is_creator);
        assert!(!fx.iter().any(|e| matches!(e, Effect::Send { .. })));
    }

    #[test]
    fn test_delete_last_flow_removes_call_and_postponement() {
        let mut st = state();
        st.ensure_call("c1");
        st.postponed.push_back("c1".into());
        route(&mut st, &flow_add("c1", r#"[{"id":"f1","active":true}]"#)).unwrap();

        route(
            &mut st,
            r#"{"type":"call.flow-delete","conversation":"c1","flow":"f1"}"#,
        )
        .unwrap();
        assert!(!st.calls.contains_key("c1"));
        assert!(st.postponed.is_empty());
    }

    #[test]
    fn test_post_flows_response_queues_nothing_on_failure_status() {
        let mut st = state();
        st.ensure_call("c1");
        let mut fx = Vec::new();
        st.complete_request(
            RequestPurpose::PostFlows {
                conversation_id: "c1".into(),
            },
            500,
            None,
            &mut fx,
        );
        assert!(fx.iter().any(|e| matches!(e, Effect::Error { .. })));
        assert_eq!(st.calls["c1"].flow_count(), 0);
    }

    #[test]
    fn test_cancelled_completion_is_silent() {
        let mut st = state();
        let mut fx = Vec::new();
        st.complete_request(
            RequestPurpose::PostFlows {
                conversation_id: "gone".into(),
            },
            STATUS_CANCELLED,
            None,
            &mut fx,
        );
        assert!(fx.is_empty());
    }

    #[test]
    fn test_release_call_emits_metrics_command_without_handle() {
        let mut st = state();
        st.ensure_call("c1");
        st.calls.get_mut("c1").unwrap().set_active(true);

        let mut fx = Vec::new();
        assert!(st.release_call("c1", &mut fx));
        let send = fx.iter().find_map(|e| match e {
            Effect::Send { purpose, path, .. } => Some((purpose, path)),
            _ => None,
        });
        let (purpose, path) = send.expect("metrics post");
        assert!(purpose.is_none());
        assert_eq!(path, "/conversations/c1/call/state/complete");
        assert!(fx.iter().any(|e| matches!(e, Effect::Metrics { .. })));
    }

    #[test]
    fn test_release_unknown_call_is_noop() {
        let mut st = state();
        let mut fx = Vec::new();
        assert!(!st.release_call("missing", &mut fx));
        assert!(fx.is_empty());
    }
}
