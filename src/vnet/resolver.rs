//! Entry point for the VNet interception layer
//!
//! [`SshResolver::resolve_tcp_handler`] decides whether a name is an SSH target
//! this process can reach and hands back the handler that serves connections
//! to it. The resolver owns the ephemeral host key all handlers present to
//! local clients.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, PrivateKey};
use russh::server;
use russh::{MethodKind, MethodSet};
use tracing::{debug, info_span, Instrument, Span};

use super::dialer::ProxyTransport;
use super::error::{ResultExt, VnetError};
use super::handler::SshHandler;
use super::provider::SshProvider;
use super::types::{SshInfo, SshKey};
use crate::config::VnetSshConfig;

/// What the interception layer needs to route and serve a resolved name
pub struct TcpHandlerSpec {
    pub ipv4_cidr_range: String,
    pub tcp_handler: Arc<SshHandler>,
}

pub struct SshResolver {
    provider: Arc<dyn SshProvider>,
    transport: Arc<dyn ProxyTransport>,
    server_config: Arc<server::Config>,
    config: VnetSshConfig,
    handlers: DashMap<SshKey, Arc<SshHandler>>,
    span: Span,
}

impl SshResolver {
    /// Generates the host key, so this is the only fallible step of setting
    /// up SSH interception.
    pub fn new(
        provider: Arc<dyn SshProvider>,
        transport: Arc<dyn ProxyTransport>,
        config: VnetSshConfig,
        span: Span,
    ) -> Result<Self, VnetError> {
        let host_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .context("generating SSH host key")?;
        Ok(Self {
            provider,
            transport,
            server_config: Arc::new(inbound_server_config(host_key)),
            config,
            handlers: DashMap::new(),
            span,
        })
    }

    /// Handler for `fqdn`. Provider errors are returned unwrapped, so a name no
    /// cluster claims yields the bare [`VnetError::NoTcpHandler`].
    pub async fn resolve_tcp_handler(&self, fqdn: &str) -> Result<TcpHandlerSpec, VnetError> {
        let ssh_info = self
            .provider
            .resolve_ssh_info(fqdn)
            .instrument(self.span.clone())
            .await?;
        let tcp_handler = self.handler_for(ssh_info);
        Ok(TcpHandlerSpec {
            ipv4_cidr_range: tcp_handler.ssh_info().ipv4_cidr_range.clone(),
            tcp_handler,
        })
    }

    /// Reuse the handler (and its credential cache) while the target resolves
    /// to the same info.
    fn handler_for(&self, ssh_info: SshInfo) -> Arc<SshHandler> {
        let entry = self.handlers.entry(ssh_info.ssh_key.clone());
        if let Entry::Occupied(existing) = &entry {
            if existing.get().ssh_info() == &ssh_info {
                return existing.get().clone();
            }
            debug!(hostname = %ssh_info.hostname(), "SSH info changed, replacing handler");
        }

        let span = info_span!(
            parent: &self.span,
            "vnet.ssh_handler",
            profile = %ssh_info.profile(),
            hostname = %ssh_info.hostname(),
        );
        let handler = Arc::new(SshHandler::new(
            ssh_info,
            self.provider.clone(),
            self.transport.clone(),
            self.server_config.clone(),
            self.config.clone(),
            span,
        ));
        entry.insert(handler.clone());
        handler
    }
}

fn inbound_server_config(host_key: PrivateKey) -> server::Config {
    server::Config {
        keys: vec![host_key],
        methods: MethodSet::from([MethodKind::PublicKey].as_slice()),
        // Rejections are delayed by the handler itself, and only for failed target dials
        auth_rejection_time: Duration::ZERO,
        auth_rejection_time_initial: Some(Duration::ZERO),
        inactivity_timeout: None,
        ..Default::default()
    }
}
