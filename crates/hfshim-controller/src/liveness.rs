use crate::error::{ControllerError, Result};
use async_trait::async_trait;
use russh::client;
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Remote shell port every provider exposes
pub const SSH_PORT: u16 = 22;

/// One liveness check: log in and run `command`
#[derive(Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    /// `host:port`
    pub address: String,
    pub username: String,
    /// OpenSSH-encoded private key
    pub private_key: String,
    pub command: String,
}

impl ProbeTarget {
    pub fn new(host: &str, username: &str, private_key: &str, command: &str) -> Self {
        Self {
            address: format!("{}:{}", host, SSH_PORT),
            username: username.to_string(),
            private_key: private_key.to_string(),
            command: command.to_string(),
        }
    }
}

// Keep the key out of logs
impl fmt::Debug for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeTarget")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

/// Checks that a provisioned instance accepts remote shell sessions
#[async_trait]
pub trait LivenessProber: Send + Sync {
    /// `Ok(true)` when the command exited 0, `Ok(false)` for any other exit status.
    /// Connection and authentication failures are returned as errors.
    async fn probe(&self, target: &ProbeTarget) -> Result<bool>;
}

/// russh-backed prober
pub struct SshProber {
    timeout: Duration,
    config: Arc<client::Config>,
}

impl SshProber {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            config: Arc::new(client::Config::default()),
        }
    }

    async fn session(&self, target: &ProbeTarget) -> Result<bool> {
        let key = decode_secret_key(&target.private_key, None)
            .map_err(|e| ControllerError::key_error(format!("failed to decode private key: {}", e)))?;

        let mut session = client::connect(self.config.clone(), target.address.as_str(), AcceptAnyHostKey)
            .await
            .map_err(|e| ControllerError::liveness_failed(&target.address, e.to_string()))?;

        let auth = session
            .authenticate_publickey(
                target.username.as_str(),
                PrivateKeyWithHashAlg::new(Arc::new(key), None),
            )
            .await
            .map_err(|e| ControllerError::liveness_failed(&target.address, e.to_string()))?;
        if !auth.success() {
            return Err(ControllerError::liveness_failed(
                &target.address,
                format!("public key authentication rejected for user {}", target.username),
            ));
        }

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ControllerError::liveness_failed(&target.address, e.to_string()))?;
        channel
            .exec(true, target.command.as_str())
            .await
            .map_err(|e| ControllerError::liveness_failed(&target.address, e.to_string()))?;

        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            if let ChannelMsg::ExitStatus { exit_status: code } = msg {
                exit_status = Some(code);
            }
        }

        if let Err(e) = session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("Ignoring disconnect error from {}: {}", target.address, e);
        }

        debug!(
            "Liveness command '{}' on {} exited with {:?}",
            target.command, target.address, exit_status
        );
        Ok(exit_status == Some(0))
    }
}

#[async_trait]
impl LivenessProber for SshProber {
    async fn probe(&self, target: &ProbeTarget) -> Result<bool> {
        match tokio::time::timeout(self.timeout, self.session(target)).await {
            Ok(result) => result,
            Err(_) => Err(ControllerError::liveness_failed(
                &target.address,
                format!("timed out after {}s", self.timeout.as_secs()),
            )),
        }
    }
}

/// Instances are freshly created, so there is no known host key to pin
struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}
