use crate::error::{ControllerError, Result};
use crate::liveness::{LivenessProber, ProbeTarget};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Scripted answer for one probe call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockProbe {
    /// The command ran; `true` means exit status 0
    Exit(bool),
    /// The connection failed with this message
    Unreachable(String),
}

/// Liveness prober for tests
///
/// Answers from a script first, then falls back to a fixed default. Every
/// target it is asked about is recorded.
#[derive(Clone)]
pub struct MockProber {
    script: Arc<Mutex<VecDeque<MockProbe>>>,
    default: MockProbe,
    calls: Arc<Mutex<Vec<ProbeTarget>>>,
}

impl MockProber {
    /// A prober whose commands always succeed
    pub fn healthy() -> Self {
        Self::with_default(MockProbe::Exit(true))
    }

    /// A prober whose hosts are never reachable
    pub fn unreachable() -> Self {
        Self::with_default(MockProbe::Unreachable("connection refused".to_string()))
    }

    pub fn with_default(default: MockProbe) -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            default,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue answers consumed before the default applies
    pub async fn push(&self, responses: impl IntoIterator<Item = MockProbe>) {
        self.script.lock().await.extend(responses);
    }

    pub async fn calls(&self) -> Vec<ProbeTarget> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl LivenessProber for MockProber {
    async fn probe(&self, target: &ProbeTarget) -> Result<bool> {
        self.calls.lock().await.push(target.clone());
        let response = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        debug!("Mock: probe {} -> {:?}", target.address, response);
        match response {
            MockProbe::Exit(ok) => Ok(ok),
            MockProbe::Unreachable(message) => {
                Err(ControllerError::liveness_failed(&target.address, message))
            }
        }
    }
}
