//! Outbound SSH client to the real target node

use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::PublicKey;
use russh::Channel;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use crate::vnet::provider::{UserCredential, UserSshConfig};

/// A forwarded-tcpip channel the target opened for a remote port forward
pub struct ForwardedChannel {
    pub channel: Channel<client::Msg>,
    pub connected_address: String,
    pub connected_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

/// Client handler for the target connection
///
/// - Accepts the target's host key: the stream was opened by the cluster proxy
///   over mTLS, which already pins the node.
/// - Hands forwarded-tcpip channels to the bridge.
/// - Fires `closed_tx` when russh drops it, which happens when the session ends.
pub struct TargetClientHandler {
    hostname: String,
    forwarded_tx: mpsc::UnboundedSender<ForwardedChannel>,
    closed_tx: Option<oneshot::Sender<()>>,
}

impl TargetClientHandler {
    pub fn new(
        hostname: String,
        forwarded_tx: mpsc::UnboundedSender<ForwardedChannel>,
        closed_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            hostname,
            forwarded_tx,
            closed_tx: Some(closed_tx),
        }
    }
}

impl Drop for TargetClientHandler {
    fn drop(&mut self) {
        if let Some(tx) = self.closed_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl client::Handler for TargetClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            hostname = %self.hostname,
            algorithm = %server_public_key.algorithm().as_str(),
            "Target host key presented"
        );
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Target opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );
        let forwarded = ForwardedChannel {
            channel,
            connected_address: connected_address.to_string(),
            connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        };
        if self.forwarded_tx.send(forwarded).is_err() {
            // Bridge is gone, dropping the channel closes it on the target
            warn!("No bridge for forwarded-tcpip channel, dropping it");
        }
        Ok(())
    }
}

/// Established and authenticated target session
pub struct TargetConnection {
    pub controller: HandleController,
    pub forwarded_rx: mpsc::UnboundedReceiver<ForwardedChannel>,
}

/// Client config for target connections
pub fn target_client_config(keepalive_interval: Option<Duration>, keepalive_max: usize) -> client::Config {
    client::Config {
        inactivity_timeout: None, // Liveness comes from keepalives and the inbound side
        keepalive_interval,
        keepalive_max,
        ..Default::default()
    }
}

/// SSH handshake and certificate authentication over an already dialed stream
pub async fn connect_target<S>(
    config: Arc<client::Config>,
    stream: S,
    hostname: &str,
    user_config: &UserSshConfig,
    timeout: Duration,
) -> Result<TargetConnection, SshError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (forwarded_tx, forwarded_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = oneshot::channel();
    let handler = TargetClientHandler::new(hostname.to_string(), forwarded_tx, closed_tx);

    let mut handle = tokio::time::timeout(timeout, client::connect_stream(config, stream, handler))
        .await
        .map_err(|_| SshError::Timeout(format!("SSH handshake with {hostname} timed out")))?
        .map_err(|e| SshError::HandshakeFailed(format!("{hostname}: {e}")))?;

    debug!(hostname = %hostname, "Target SSH handshake completed");

    let auth = tokio::time::timeout(timeout, authenticate(&mut handle, user_config))
        .await
        .map_err(|_| SshError::Timeout(format!("authentication to {hostname} timed out")))??;

    if !auth.success() {
        return Err(SshError::AuthenticationFailed(format!(
            "{hostname} rejected the certificate for {}",
            user_config.username
        )));
    }

    info!(hostname = %hostname, username = %user_config.username, "Authenticated to target SSH node");

    let controller = spawn_handle_owner_task(handle, closed_rx, hostname.to_string());
    Ok(TargetConnection {
        controller,
        forwarded_rx,
    })
}

async fn authenticate(
    handle: &mut client::Handle<TargetClientHandler>,
    user_config: &UserSshConfig,
) -> Result<client::AuthResult, SshError> {
    match &user_config.credential {
        UserCredential::Key(key) => handle
            .authenticate_openssh_cert(
                &user_config.username,
                key.clone(),
                user_config.certificate.clone(),
            )
            .await
            .map_err(|e| SshError::AuthenticationFailed(format!("Certificate authentication failed: {e}"))),
        UserCredential::Remote(signer) => {
            // TODO: offer the certificate once russh can pair one with an external Signer; 0.54 only signs plain keys this way.
            let mut signer = signer.clone();
            let public_key = signer.public_key().clone();
            let hash_alg = signer.hash_alg();
            handle
                .authenticate_publickey_with(&user_config.username, public_key, hash_alg, &mut signer)
                .await
                .map_err(|e| SshError::AuthenticationFailed(format!("Remote-signed authentication failed: {e}")))
        }
    }
}
