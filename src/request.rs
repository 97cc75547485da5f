//! Outstanding-request tracking for the command channel.
//!
//! Every command sent through the host's request callback is registered here
//! with a generated opaque handle before the send returns. A handle is
//! consumed exactly once: by the matching response, by per-call cancellation
//! on release, or by the teardown sweep — whichever comes first.

use dashmap::DashMap;
use log::warn;
use std::sync::atomic::{AtomicU64, Ordering};

/// Synthetic status used when an outstanding request is cancelled instead of
/// answered (HTTP 499 equivalent).
pub const STATUS_CANCELLED: u16 = 499;

/// Typed completion behavior for a tracked command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RequestPurpose {
    /// `POST /conversations/{conv}/call/flows` — the response carries the
    /// flow descriptors to classify and add.
    PostFlows { conversation_id: String },
    /// `POST /conversations/{conv}/call/flows/{flow}` — delete one flow;
    /// `ghost` marks deletions issued by ghost classification.
    DeleteFlow {
        conversation_id: String,
        flow_id: String,
        ghost: bool,
    },
}

impl RequestPurpose {
    pub(crate) fn conversation_id(&self) -> &str {
        match self {
            Self::PostFlows { conversation_id } => conversation_id,
            Self::DeleteFlow {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

#[derive(Debug)]
pub(crate) struct OutstandingRequest {
    pub debug_label: String,
    pub purpose: RequestPurpose,
}

/// Correlates command-channel responses with the requests that caused them.
pub(crate) struct RequestTracker {
    requests: DashMap<String, OutstandingRequest>,
    prefix: String,
    counter: AtomicU64,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            requests: DashMap::new(),
            prefix: format!("{:08x}", rand::random::<u32>()),
            counter: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> String {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, count)
    }

    /// Registers a command and returns its opaque handle.
    pub fn register(&self, purpose: RequestPurpose, debug_label: String) -> String {
        let id = self.next_id();
        self.requests.insert(
            id.clone(),
            OutstandingRequest {
                debug_label,
                purpose,
            },
        );
        id
    }

    /// Consumes a handle. Returns `None` when it was never registered or has
    /// already been resolved.
    pub fn take(&self, id: &str) -> Option<OutstandingRequest> {
        self.requests.remove(id).map(|(_, req)| req)
    }

    /// Withdraws a registration whose send failed; the request never became
    /// outstanding, so no completion runs for it.
    pub fn withdraw(&self, id: &str) {
        if self.requests.remove(id).is_none() {
            warn!(target: "callflow/request", "withdraw of unknown request {id}");
        }
    }

    /// Removes and returns every outstanding request owned by a conversation.
    pub fn take_for_conversation(&self, conversation_id: &str) -> Vec<(String, OutstandingRequest)> {
        let ids: Vec<String> = self
            .requests
            .iter()
            .filter(|entry| entry.value().purpose.conversation_id() == conversation_id)
            .map(|entry| entry.key().clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.requests.remove(&id))
            .collect()
    }

    /// Removes and returns everything; used by the teardown sweep.
    pub fn drain(&self) -> Vec<(String, OutstandingRequest)> {
        let ids: Vec<String> = self.requests.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter_map(|id| self.requests.remove(&id))
            .collect()
    }

    pub fn outstanding(&self) -> usize {
        self.requests.len()
    }
}
