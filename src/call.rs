//! Per-conversation call state: flows, users, ghosts and the protocol log.

use crate::event::IceCandidate;
use crate::metrics::{CallStats, LogEntry};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// One peer media flow's negotiation state within a call.
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: String,
    pub remote_user: Option<String>,
    pub is_creator: bool,
    pub has_creator: bool,
    pub active: bool,
    pub sdp_step: Option<String>,
    pub remote_sdp: Option<String>,
    pub candidates: Vec<IceCandidate>,
    pub established: bool,
}

impl Flow {
    pub fn new(
        id: &str,
        remote_user: Option<String>,
        is_creator: bool,
        has_creator: bool,
        active: bool,
    ) -> Self {
        Self {
            id: id.to_string(),
            remote_user,
            is_creator,
            has_creator,
            active,
            sdp_step: None,
            remote_sdp: None,
            candidates: Vec::new(),
            established: false,
        }
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Applies a batch of remote candidates. An update replaces candidates
    /// with the same m-line coordinates; an add appends.
    pub fn apply_candidates(&mut self, candidates: &[IceCandidate], update: bool) {
        for cand in candidates {
            if update {
                if let Some(existing) = self.candidates.iter_mut().find(|c| {
                    c.sdp_mid == cand.sdp_mid && c.sdp_mline_index == cand.sdp_mline_index
                }) {
                    *existing = cand.clone();
                    continue;
                }
            }
            self.candidates.push(cand.clone());
        }
    }

    pub fn apply_remote_sdp(&mut self, sdp: &str, state: Option<&str>) {
        self.remote_sdp = Some(sdp.to_string());
        if let Some(state) = state {
            self.sdp_step = Some(state.to_string());
        }
    }

    /// Transitions to established once the flow is active with a remote SDP
    /// applied. Returns true only on the transition.
    pub fn poll_established(&mut self) -> bool {
        if !self.established && self.active && self.remote_sdp.is_some() {
            self.established = true;
            return true;
        }
        false
    }

    /// Resets negotiation progress so the flow can be re-offered after a
    /// network change.
    pub fn restart(&mut self) {
        self.candidates.clear();
        self.remote_sdp = None;
        self.sdp_step = None;
        self.established = false;
    }
}

/// A participant the host announced for this conversation.
#[derive(Debug, Clone)]
pub struct UserFlow {
    pub user_id: String,
    pub display_name: Option<String>,
    pub flow_id: Option<String>,
}

/// A stale flow descriptor awaiting its delete-command response. Never
/// promoted to a live [`Flow`].
#[derive(Debug, Clone)]
pub struct GhostFlowEntry {
    pub flow_id: String,
    pub sdp_step: String,
    pub remote_user: Option<String>,
}

/// Aggregate for one conversation's call session.
#[derive(Debug)]
pub struct Call {
    conversation_id: String,
    session_id: Option<String>,
    active: bool,
    started_at: DateTime<Utc>,
    flows: HashMap<String, Flow>,
    users: HashMap<String, UserFlow>,
    ghost_flows: Vec<GhostFlowEntry>,
    log: Vec<LogEntry>,
}

impl Call {
    pub fn new(conversation_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            session_id: None,
            active: false,
            started_at: Utc::now(),
            flows: HashMap::new(),
            users: HashMap::new(),
            ghost_flows: Vec::new(),
            log: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn set_session_id(&mut self, session_id: &str) {
        self.session_id = Some(session_id.to_string());
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn mark_started(&mut self) {
        self.started_at = Utc::now();
    }

    pub fn flow(&self, flow_id: &str) -> Option<&Flow> {
        self.flows.get(flow_id)
    }

    pub fn flow_mut(&mut self, flow_id: &str) -> Option<&mut Flow> {
        self.flows.get_mut(flow_id)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn flow_ids(&self) -> Vec<String> {
        self.flows.keys().cloned().collect()
    }

    pub fn flows_mut(&mut self) -> impl Iterator<Item = &mut Flow> {
        self.flows.values_mut()
    }

    /// Inserts a flow and links it to the matching announced user, if any.
    pub fn add_flow(&mut self, flow: Flow) {
        if let Some(remote) = &flow.remote_user
            && let Some(user) = self.users.get_mut(remote)
        {
            user.flow_id = Some(flow.id.clone());
        }
        self.flows.insert(flow.id.clone(), flow);
    }

    pub fn remove_flow(&mut self, flow_id: &str) -> Option<Flow> {
        for user in self.users.values_mut() {
            if user.flow_id.as_deref() == Some(flow_id) {
                user.flow_id = None;
            }
        }
        self.flows.remove(flow_id)
    }

    pub fn add_user(&mut self, user_id: &str, display_name: Option<&str>) {
        let flow_id = self
            .flows
            .values()
            .find(|f| f.remote_user.as_deref() == Some(user_id))
            .map(|f| f.id.clone());
        self.users
            .entry(user_id.to_string())
            .and_modify(|u| {
                if display_name.is_some() {
                    u.display_name = display_name.map(str::to_string);
                }
            })
            .or_insert_with(|| UserFlow {
                user_id: user_id.to_string(),
                display_name: display_name.map(str::to_string),
                flow_id,
            });
    }

    pub fn set_user_name(&mut self, user_id: &str, display_name: &str) {
        if let Some(user) = self.users.get_mut(user_id) {
            user.display_name = Some(display_name.to_string());
        }
    }

    pub fn user(&self, user_id: &str) -> Option<&UserFlow> {
        self.users.get(user_id)
    }

    pub fn users_count(&self) -> usize {
        self.users.len()
    }

    /// Drops announced users that ended up without a live flow.
    pub fn purge_users(&mut self) {
        let flows = &self.flows;
        self.users
            .retain(|_, user| user.flow_id.as_deref().is_some_and(|f| flows.contains_key(f)));
    }

    pub fn push_ghost(&mut self, entry: GhostFlowEntry) {
        self.ghost_flows.push(entry);
    }

    pub fn remove_ghost(&mut self, flow_id: &str) {
        self.ghost_flows.retain(|g| g.flow_id != flow_id);
    }

    pub fn ghost_flows(&self) -> &[GhostFlowEntry] {
        &self.ghost_flows
    }

    pub fn has_media(&self) -> bool {
        self.flows.values().any(|f| f.established)
    }

    pub fn push_log(&mut self, entry: LogEntry) {
        self.log.push(entry);
    }

    pub fn drain_log(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.log)
    }

    pub fn stats(&self) -> CallStats {
        CallStats {
            started_at: self.started_at,
            duration_ms: Utc::now()
                .signed_duration_since(self.started_at)
                .num_milliseconds(),
            flows: self.flows.len(),
            established: self.has_media(),
        }
    }
}
