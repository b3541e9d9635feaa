//! SSH connection handler for one resolved target
//!
//! A VNet TCP connection to `host.cluster:22` is terminated here by an SSH
//! server using the resolver's ephemeral host key. The handler dials the real
//! node through the cluster proxy before the local handshake starts. The first
//! successful public-key authentication by the local client triggers the
//! outbound SSH handshake as that username; once it succeeds both sessions are
//! bridged until either side goes away.
//!
//! Per-username client configs are cached on the handler. A failed outbound
//! handshake invalidates the cached config and retries once with a freshly
//! issued certificate over a freshly dialed connection.

use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, server, Disconnect};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use super::credential_cache::UserConfigCache;
use super::dialer::{BoxedStream, ProxyTransport, TargetDialer};
use super::error::{ResultExt, VnetError};
use super::provider::{SshProvider, UserSshConfig};
use super::types::SshInfo;
use crate::config::VnetSshConfig;
use crate::ssh::{
    connect_target, new_channel_registry, spawn_channel_bridge, target_client_config,
    ChannelRegistry, ForwardedChannel, HandleController, InboundEvent, InboundHandler,
    TargetConnection, TargetConnector,
};

/// The only local port SSH targets are served on
pub const SSH_PORT: u16 = 22;

pub struct SshHandler {
    ssh_info: Arc<SshInfo>,
    provider: Arc<dyn SshProvider>,
    dialer: TargetDialer,
    server_config: Arc<server::Config>,
    client_config: Arc<client::Config>,
    credentials: UserConfigCache,
    config: VnetSshConfig,
    span: Span,
}

impl SshHandler {
    pub fn new(
        ssh_info: SshInfo,
        provider: Arc<dyn SshProvider>,
        transport: Arc<dyn ProxyTransport>,
        server_config: Arc<server::Config>,
        config: VnetSshConfig,
        span: Span,
    ) -> Self {
        let ssh_info = Arc::new(ssh_info);
        let dialer = TargetDialer::new(
            ssh_info.clone(),
            provider.clone(),
            transport,
            config.dial_timeout(),
        );
        let client_config = Arc::new(target_client_config(
            config.keepalive_interval(),
            config.keepalive_max,
        ));
        Self {
            ssh_info,
            provider,
            dialer,
            server_config,
            client_config,
            credentials: UserConfigCache::new(),
            config,
            span,
        }
    }

    pub fn ssh_info(&self) -> &SshInfo {
        &self.ssh_info
    }

    pub fn server_config(&self) -> &Arc<server::Config> {
        &self.server_config
    }

    /// Serve one intercepted connection to the target.
    ///
    /// `connector` yields the local end of the VNet connection. It is only
    /// called once the target has been dialed, and not at all for a port other
    /// than 22. Returns when the bridged sessions end, or with the reason the
    /// connection was never bridged.
    pub async fn handle_tcp_connector<S, F>(
        self: &Arc<Self>,
        local_port: u16,
        connector: F,
    ) -> Result<(), VnetError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: FnOnce() -> Result<S, VnetError> + Send,
    {
        let span = info_span!(
            parent: &self.span,
            "vnet.ssh_conn",
            conn_id = %Uuid::new_v4(),
            local_port,
            hostname = %self.ssh_info.hostname(),
        );
        self.handle_connection(local_port, connector)
            .instrument(span)
            .await
    }

    async fn handle_connection<S, F>(
        self: &Arc<Self>,
        local_port: u16,
        connector: F,
    ) -> Result<(), VnetError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: FnOnce() -> Result<S, VnetError> + Send,
    {
        if local_port != SSH_PORT {
            if let Err(e) = self
                .provider
                .on_invalid_local_port(&self.ssh_info, local_port)
                .await
            {
                debug!(error = %e, "Failed to notify user about invalid local port");
            }
            return Err(VnetError::BadParameter(format!(
                "SSH is only handled on port {SSH_PORT}, got {local_port}"
            )));
        }

        let target_tcp = self
            .dial_target_tcp()
            .await
            .with_context(|| format!("dialing SSH host {}", self.ssh_info.hostname()))?;
        // From here on, an early return drops (closes) the target stream.
        let local = connector().context("unwrapping local VNet TCP conn")?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = new_channel_registry();
        let inbound = InboundHandler::new(
            self.clone(),
            target_tcp,
            events_tx,
            registry.clone(),
            self.config.auth_failure_delay(),
        );

        let session = server::run_stream(self.server_config.clone(), local, inbound)
            .await
            .context("accepting incoming SSH conn")?;
        self.bridge(session, events_rx, registry).await
    }

    /// Drive the inbound session and relay target-initiated events into it.
    async fn bridge(
        &self,
        session: server::RunningSession<InboundHandler>,
        mut events_rx: mpsc::UnboundedReceiver<InboundEvent>,
        registry: ChannelRegistry,
    ) -> Result<(), VnetError> {
        let server_handle = session.handle();
        tokio::pin!(session);

        let mut state = BridgeState::default();

        let session_result = loop {
            tokio::select! {
                result = &mut session => break result,

                Some(event) = events_rx.recv() => {
                    if let Some(message) = state.record(event) {
                        if self.config.banner_on_failure {
                            let _ = server_handle
                                .disconnect(
                                    Disconnect::NoMoreAuthMethodsAvailable,
                                    message,
                                    "en".to_string(),
                                )
                                .await;
                        }
                    }
                },

                forwarded = next_forwarded(&mut state.forwarded_rx) => match forwarded {
                    Some(forwarded) => relay_forwarded(forwarded, &server_handle, &registry),
                    None => state.forwarded_rx = None,
                },

                _ = target_closed(&state.controller) => {
                    info!("Target SSH session ended, closing local session");
                    state.controller = None;
                    let _ = server_handle
                        .disconnect(
                            Disconnect::ByApplication,
                            "target connection closed".to_string(),
                            "en".to_string(),
                        )
                        .await;
                }
            }
        };

        // The session can end before the loop saw its last events
        state.drain(&mut events_rx);

        if let Some(controller) = state.controller.take() {
            controller.disconnect("local SSH session closed").await;
        }
        state.outcome(session_result)
    }

    async fn dial_target_tcp(&self) -> Result<BoxedStream, VnetError> {
        self.dialer.dial().await
    }

    /// Outbound SSH session as `username`, over `tcp` when the caller has one.
    async fn dial_target_ssh(
        &self,
        tcp: Option<BoxedStream>,
        username: &str,
    ) -> Result<TargetConnection, VnetError> {
        let user_config = self
            .user_ssh_config(username)
            .await
            .context("getting user SSH client config")?;

        let tcp = match tcp {
            Some(tcp) => tcp,
            None => self
                .dial_target_tcp()
                .await
                .context("dialing target for new authentication attempt")?,
        };

        match self.handshake(tcp, &user_config).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                // The failed stream is gone with the attempt; the retry dials its own.
                info!(
                    username = %username,
                    error = %e,
                    "Failed to dial target SSH node with cached user cert, retrying with a fresh cert"
                );
                self.retry_dial_target_ssh(username).await
            }
        }
    }

    async fn retry_dial_target_ssh(&self, username: &str) -> Result<TargetConnection, VnetError> {
        self.credentials.invalidate(username);
        let user_config = self
            .user_ssh_config(username)
            .await
            .context("getting fresh SSH client config")?;
        let tcp = self
            .dial_target_tcp()
            .await
            .context("redialing target with fresh SSH cert")?;
        self.handshake(tcp, &user_config)
            .await
            .context("dialing target SSH node with fresh user cert")
    }

    async fn handshake(
        &self,
        tcp: BoxedStream,
        user_config: &UserSshConfig,
    ) -> Result<TargetConnection, VnetError> {
        Ok(connect_target(
            self.client_config.clone(),
            tcp,
            self.ssh_info.hostname(),
            user_config,
            self.config.dial_timeout(),
        )
        .await?)
    }

    /// Cached config for `username`, issued at most once at a time.
    async fn user_ssh_config(&self, username: &str) -> Result<Arc<UserSshConfig>, VnetError> {
        let provider = self.provider.clone();
        let ssh_info = self.ssh_info.clone();
        let owned_username = username.to_string();
        self.credentials
            .get_or_issue(username, move || async move {
                provider.user_ssh_config(&ssh_info, &owned_username).await
            })
            .await
    }
}

#[async_trait]
impl TargetConnector for SshHandler {
    async fn connect(
        &self,
        stream: Option<BoxedStream>,
        username: &str,
    ) -> Result<TargetConnection, VnetError> {
        self.dial_target_ssh(stream, username).await
    }
}

/// What the inbound handler reported about the target session
#[derive(Default)]
struct BridgeState {
    controller: Option<HandleController>,
    forwarded_rx: Option<mpsc::UnboundedReceiver<ForwardedChannel>>,
    established: bool,
    last_rejection: Option<String>,
}

impl BridgeState {
    /// Returns the error text when the event is a rejection.
    fn record(&mut self, event: InboundEvent) -> Option<String> {
        match event {
            InboundEvent::TargetConnected(connection) => {
                info!("Target SSH session established, bridging");
                self.established = true;
                self.controller = Some(connection.controller);
                self.forwarded_rx = Some(connection.forwarded_rx);
                None
            }
            InboundEvent::AuthRejected { username, message } => {
                debug!(username = %username, "Local authentication rejected");
                self.last_rejection = Some(message.clone());
                Some(message)
            }
        }
    }

    fn drain(&mut self, events_rx: &mut mpsc::UnboundedReceiver<InboundEvent>) {
        while let Ok(event) = events_rx.try_recv() {
            self.record(event);
        }
    }

    fn outcome(&self, session_result: Result<(), VnetError>) -> Result<(), VnetError> {
        if self.established {
            if let Err(e) = session_result {
                debug!(error = %e, "Bridged SSH session ended with error");
            }
            info!("SSH connection closed");
            return Ok(());
        }
        if let Some(message) = &self.last_rejection {
            return Err(VnetError::AuthRejected(message.clone()));
        }
        match session_result {
            Err(e) => Err(VnetError::Handshake(e.to_string())),
            Ok(()) => Err(VnetError::Handshake(
                "local client disconnected before authenticating".to_string(),
            )),
        }
    }
}

async fn next_forwarded(
    rx: &mut Option<mpsc::UnboundedReceiver<ForwardedChannel>>,
) -> Option<ForwardedChannel> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn target_closed(controller: &Option<HandleController>) {
    match controller {
        Some(controller) => controller.closed().await,
        None => std::future::pending().await,
    }
}

/// Open the matching forwarded-tcpip channel towards the local client and bridge the two.
fn relay_forwarded(forwarded: ForwardedChannel, server_handle: &server::Handle, registry: &ChannelRegistry) {
    let server_handle = server_handle.clone();
    let registry = registry.clone();
    tokio::spawn(
        async move {
            let ForwardedChannel {
                channel,
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } = forwarded;
            match server_handle
                .channel_open_forwarded_tcpip(
                    connected_address.clone(),
                    connected_port,
                    originator_address,
                    originator_port,
                )
                .await
            {
                Ok(inbound) => {
                    spawn_channel_bridge(inbound, channel, server_handle, registry);
                }
                Err(e) => {
                    warn!(
                        "Local client refused forwarded-tcpip channel for {}:{}: {:?}",
                        connected_address, connected_port, e
                    );
                    let _ = channel.close().await;
                }
            }
        }
        .in_current_span(),
    );
}
