//! Inbound SSH server side of the bridge
//!
//! The local client authenticates against [`InboundHandler`]. A verified
//! public key (or certificate) is only an identity claim: the handler dials the
//! real target as that username and accepts exactly when the target accepted
//! the issued credentials. After that, every channel the local client opens is
//! opened on the target too and handed to a bridge pump.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::{Certificate, PublicKey};
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, Pty, Sig};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::bridge::{spawn_channel_bridge, ChannelRegistry, ChannelRequest};
use super::client::TargetConnection;
use super::handle_owner::HandleController;
use crate::vnet::dialer::BoxedStream;
use crate::vnet::error::VnetError;

/// Establishes the authenticated target session for a username.
///
/// `stream` is the connection dialed before the local handshake started. It is
/// only available to the first attempt.
#[async_trait]
pub trait TargetConnector: Send + Sync {
    async fn connect(
        &self,
        stream: Option<BoxedStream>,
        username: &str,
    ) -> Result<TargetConnection, VnetError>;
}

/// Reported by the server handler to the task driving the connection
pub enum InboundEvent {
    TargetConnected(TargetConnection),
    AuthRejected { username: String, message: String },
}

pub struct InboundHandler {
    connector: Arc<dyn TargetConnector>,
    initial_stream: Option<BoxedStream>,
    /// Username the target session was established for, and its controller
    target: Option<(String, HandleController)>,
    events_tx: mpsc::UnboundedSender<InboundEvent>,
    registry: ChannelRegistry,
    auth_failure_delay: Duration,
}

impl InboundHandler {
    pub fn new(
        connector: Arc<dyn TargetConnector>,
        initial_stream: BoxedStream,
        events_tx: mpsc::UnboundedSender<InboundEvent>,
        registry: ChannelRegistry,
        auth_failure_delay: Duration,
    ) -> Self {
        Self {
            connector,
            initial_stream: Some(initial_stream),
            target: None,
            events_tx,
            registry,
            auth_failure_delay,
        }
    }

    fn rejected() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    fn controller(&self) -> Option<&HandleController> {
        self.target.as_ref().map(|(_, controller)| controller)
    }

    /// Accept `username` if the target accepts it.
    async fn authorize(&mut self, username: &str) -> Auth {
        if let Some((connected_as, _)) = &self.target {
            if connected_as == username {
                return Auth::Accept;
            }
            warn!(
                username = %username,
                connected_as = %connected_as,
                "Target session already established for another user"
            );
            return Self::rejected();
        }

        let stream = self.initial_stream.take();
        match self.connector.connect(stream, username).await {
            Ok(connection) => {
                self.target = Some((username.to_string(), connection.controller.clone()));
                let _ = self.events_tx.send(InboundEvent::TargetConnected(connection));
                Auth::Accept
            }
            Err(e) => {
                let e = e.context("dialing target node");
                warn!(username = %username, error = %e, "Rejecting local SSH authentication");
                tokio::time::sleep(self.auth_failure_delay).await;
                let _ = self.events_tx.send(InboundEvent::AuthRejected {
                    username: username.to_string(),
                    message: e.to_string(),
                });
                Self::rejected()
            }
        }
    }

    /// Queue a request for the channel's pump, or refuse it if there is none.
    fn forward(&self, channel: ChannelId, request: ChannelRequest, session: &mut Session) {
        let queued = self
            .registry
            .get(&channel)
            .is_some_and(|tx| tx.send(request).is_ok());
        if !queued {
            debug!(channel = ?channel, "Request for a channel with no bridge");
            let _ = session.channel_failure(channel);
        }
    }
}

impl server::Handler for InboundHandler {
    type Error = VnetError;

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Let the client prove possession first, the target decides afterwards
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!(
            username = %user,
            algorithm = %public_key.algorithm().as_str(),
            "Local client presented public key"
        );
        Ok(self.authorize(user).await)
    }

    async fn auth_openssh_certificate(
        &mut self,
        user: &str,
        certificate: &Certificate,
    ) -> Result<Auth, Self::Error> {
        debug!(username = %user, key_id = %certificate.key_id(), "Local client presented certificate");
        Ok(self.authorize(user).await)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(controller) = self.controller() else {
            return Ok(false);
        };
        match controller.open_session_channel().await {
            Ok(target) => {
                spawn_channel_bridge(channel, target, session.handle(), self.registry.clone());
                Ok(true)
            }
            Err(e) => {
                warn!("Target refused session channel: {}", e);
                Ok(false)
            }
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(controller) = self.controller() else {
            return Ok(false);
        };
        debug!(
            "direct-tcpip {}:{} from {}:{}",
            host_to_connect, port_to_connect, originator_address, originator_port
        );
        match controller
            .open_direct_tcpip(host_to_connect, port_to_connect, originator_address, originator_port)
            .await
        {
            Ok(target) => {
                spawn_channel_bridge(channel, target, session.handle(), self.registry.clone());
                Ok(true)
            }
            Err(e) => {
                warn!(
                    "Target refused direct-tcpip to {}:{}: {}",
                    host_to_connect, port_to_connect, e
                );
                Ok(false)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Pty {
            term: term.to_string(),
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes: modes.to_vec(),
        };
        self.forward(channel, request, session);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelRequest::Shell, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelRequest::Exec(data.to_vec()), session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelRequest::Subsystem(name.to_string()), session);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.forward(channel, request, session);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        };
        self.forward(channel, request, session);
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelRequest::Signal(signal), session);
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(controller) = self.controller() else {
            return Ok(false);
        };
        match controller.tcpip_forward(address, *port).await {
            Ok(bound_port) => {
                // The target only reports a port when it picked one
                if bound_port != 0 {
                    *port = bound_port;
                }
                info!("Remote forward {}:{} bound on the target", address, *port);
                Ok(true)
            }
            Err(e) => {
                warn!("Target refused remote forward {}:{}: {}", address, *port, e);
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(controller) = self.controller() else {
            return Ok(false);
        };
        match controller.cancel_tcpip_forward(address, port).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Failed to cancel remote forward {}:{}: {}", address, port, e);
                Ok(false)
            }
        }
    }
}
