//! Process-scoped media context shared by flow managers.
//!
//! One [`MediaSystem`] is created per process and passed to every
//! [`FlowManager`](crate::FlowManager). It holds what flow negotiation needs
//! before any call exists: the secure-transport context, the registered codec
//! sets and the network binding. It owns no per-call state and stays off the
//! per-call hot path; the only shared mutation is manager registration, which
//! sits behind one exclusive section.

use crate::error::FlowError;
use crate::manager::FlowManager;
use log::info;
use std::sync::{Arc, Mutex, Weak};

/// SRTP protection profile requested from the secure-transport provider.
const SRTP_PROFILE: &str = "SRTP_AES128_CM_SHA1_80";

#[derive(Debug, Clone)]
pub struct MediaSystemConfig {
    /// Media back-end to initialize ("dummy" or "native").
    pub backend: String,
    /// DTLS certificate material; a self-signed certificate is requested
    /// from the transport provider when absent.
    pub certificate: Option<Vec<u8>>,
    /// Base URL for protocol-log uploads, if the host uses them.
    pub log_url: Option<String>,
}

impl Default for MediaSystemConfig {
    fn default() -> Self {
        Self {
            backend: "dummy".to_string(),
            certificate: None,
            log_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioCodec {
    pub name: &'static str,
    pub clock_rate: u32,
    pub channels: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoCodec {
    pub name: &'static str,
}

/// Opaque handle to the secure-transport provider's context.
#[derive(Debug, Clone)]
pub struct SecureContext {
    certificate: Option<Vec<u8>>,
    srtp_profile: &'static str,
}

impl SecureContext {
    fn new(certificate: Option<Vec<u8>>) -> Self {
        if let Some(cert) = &certificate {
            info!("media: using provided certificate ({} bytes)", cert.len());
        } else {
            info!("media: requesting self-signed certificate");
        }
        Self {
            certificate,
            srtp_profile: SRTP_PROFILE,
        }
    }

    pub fn is_self_signed(&self) -> bool {
        self.certificate.is_none()
    }

    pub fn srtp_profile(&self) -> &'static str {
        self.srtp_profile
    }
}

struct SystemState {
    started: bool,
    backend: String,
    secure: Option<SecureContext>,
    interface_name: String,
    dual_stack: bool,
    audio_codecs: Vec<AudioCodec>,
    video_codecs: Vec<VideoCodec>,
    log_url: Option<String>,
    managers: Vec<(u64, Weak<FlowManager>)>,
    next_manager_id: u64,
}

/// Process-wide negotiation prerequisites.
///
/// The single-instance lifecycle is a contract, not an enforced global:
/// create one at startup, pass it around explicitly, tear it down at exit.
pub struct MediaSystem {
    inner: Mutex<SystemState>,
}

impl MediaSystem {
    fn state(&self) -> std::sync::MutexGuard<'_, SystemState> {
        self.inner.lock().expect("media system lock poisoned")
    }

    /// Initializes the media system, validating the back-end name and
    /// registering its codec sets.
    pub fn init(config: MediaSystemConfig) -> Result<Arc<Self>, FlowError> {
        let (audio_codecs, video_codecs) = match config.backend.as_str() {
            "dummy" => (
                vec![AudioCodec {
                    name: "opus",
                    clock_rate: 48_000,
                    channels: 2,
                }],
                Vec::new(),
            ),
            "native" => (
                vec![
                    AudioCodec {
                        name: "opus",
                        clock_rate: 48_000,
                        channels: 2,
                    },
                    AudioCodec {
                        name: "PCMU",
                        clock_rate: 8_000,
                        channels: 1,
                    },
                ],
                vec![VideoCodec { name: "VP8" }],
            ),
            other => return Err(FlowError::BackendUnavailable(other.to_string())),
        };

        info!("media: initialized back-end '{}'", config.backend);

        Ok(Arc::new(Self {
            inner: Mutex::new(SystemState {
                started: false,
                backend: config.backend,
                secure: Some(SecureContext::new(config.certificate)),
                interface_name: String::new(),
                dual_stack: false,
                audio_codecs,
                video_codecs,
                log_url: config.log_url,
                managers: Vec::new(),
                next_manager_id: 1,
            }),
        }))
    }

    /// Marks the system started and kicks every registered manager into the
    /// config-pending state.
    pub async fn start(&self) {
        let managers = {
            let mut state = self.state();
            state.started = true;
            state
                .managers
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect::<Vec<_>>()
        };
        info!("media: started ({} managers)", managers.len());
        for manager in managers {
            manager.begin_config_refresh().await;
        }
    }

    pub fn is_started(&self) -> bool {
        self.state().started
    }

    pub fn backend(&self) -> String {
        self.state().backend.clone()
    }

    /// Binds negotiation to a specific network interface.
    pub fn set_interface(&self, name: &str) {
        info!("media: binding to network interface '{name}'");
        self.state().interface_name = name.to_string();
    }

    pub fn interface_name(&self) -> String {
        self.state().interface_name.clone()
    }

    pub fn enable_dual_stack(&self, enable: bool) {
        self.state().dual_stack = enable;
    }

    pub fn dual_stack(&self) -> bool {
        self.state().dual_stack
    }

    pub fn audio_codecs(&self) -> Vec<AudioCodec> {
        self.state().audio_codecs.clone()
    }

    pub fn video_codecs(&self) -> Vec<VideoCodec> {
        self.state().video_codecs.clone()
    }

    pub fn secure_context(&self) -> Option<SecureContext> {
        self.state().secure.clone()
    }

    pub fn log_url(&self) -> Option<String> {
        self.state().log_url.clone()
    }

    pub(crate) fn register_manager(&self, manager: &Arc<FlowManager>) -> u64 {
        let mut state = self.state();
        let id = state.next_manager_id;
        state.next_manager_id += 1;
        state.managers.push((id, Arc::downgrade(manager)));
        id
    }

    pub(crate) fn unregister_manager(&self, id: u64) {
        let mut state = self.state();
        state.managers.retain(|(mid, _)| *mid != id);
    }

    /// True while any registered manager has an active call.
    pub async fn has_active_calls(&self) -> bool {
        let managers: Vec<Arc<FlowManager>> = {
            let state = self.state();
            state
                .managers
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        for manager in managers {
            if manager.has_active().await {
                return true;
            }
        }
        false
    }

    /// Releases the secure context and codec sets. Fails while any manager
    /// is still registered; shut managers down first.
    pub fn shutdown(&self) -> Result<(), FlowError> {
        let mut state = self.state();
        state.managers.retain(|(_, weak)| weak.strong_count() > 0);
        if !state.managers.is_empty() {
            return Err(FlowError::Busy(state.managers.len()));
        }
        state.secure = None;
        state.audio_codecs.clear();
        state.video_codecs.clear();
        state.started = false;
        info!("media: shut down");
        Ok(())
    }
}
