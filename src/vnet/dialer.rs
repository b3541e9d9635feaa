//! Outbound network path to the target host through the cluster's web proxy
//!
//! The proxy client itself (TLS, ALPN upgrade, the proxy's dial protocol) is a
//! collaborator behind [`ProxyTransport`]. This module builds its config from
//! the resolved [`SshInfo`] and asks it for a stream to `hostname:0`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::error::{ResultExt, VnetError};
use super::provider::{ClientTlsConfig, SshProvider};
use super::types::SshInfo;

/// Byte stream to the target's SSH port
pub trait TargetStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> TargetStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn TargetStream>;

/// Produces the mTLS config for a cluster name, on demand.
pub type TlsConfigFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<ClientTlsConfig, VnetError>> + Send + Sync>;

#[derive(Clone)]
pub struct ProxyClientConfig {
    pub proxy_address: String,
    pub tls_config: TlsConfigFn,
    pub insecure_skip_verify: bool,
    pub alpn_conn_upgrade_required: bool,
}

impl std::fmt::Debug for ProxyClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClientConfig")
            .field("proxy_address", &self.proxy_address)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("alpn_conn_upgrade_required", &self.alpn_conn_upgrade_required)
            .finish_non_exhaustive()
    }
}

/// Details the proxy reports about the cluster it dialed into
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterDetails {
    pub fips: bool,
}

#[async_trait]
pub trait ProxyTransport: Send + Sync {
    async fn new_client(&self, config: ProxyClientConfig) -> Result<Box<dyn ProxyClient>, VnetError>;
}

#[async_trait]
pub trait ProxyClient: Send + Sync {
    async fn dial_host(
        &self,
        target_addr: &str,
        cluster: &str,
    ) -> Result<(BoxedStream, ClusterDetails), VnetError>;
}

/// Dials one resolved target
pub struct TargetDialer {
    ssh_info: Arc<SshInfo>,
    provider: Arc<dyn SshProvider>,
    transport: Arc<dyn ProxyTransport>,
    timeout: Duration,
}

impl TargetDialer {
    pub fn new(
        ssh_info: Arc<SshInfo>,
        provider: Arc<dyn SshProvider>,
        transport: Arc<dyn ProxyTransport>,
        timeout: Duration,
    ) -> Self {
        Self {
            ssh_info,
            provider,
            transport,
            timeout,
        }
    }

    fn proxy_client_config(&self) -> ProxyClientConfig {
        let provider = self.provider.clone();
        let profile = self.ssh_info.ssh_key.profile.clone();
        let tls_config: TlsConfigFn = Arc::new(move |cluster: String| {
            let provider = provider.clone();
            let profile = profile.clone();
            async move { provider.teleport_client_tls_config(&profile, &cluster).await }.boxed()
        });

        ProxyClientConfig {
            proxy_address: self.ssh_info.dial_options.web_proxy_addr.clone(),
            tls_config,
            insecure_skip_verify: self.ssh_info.dial_options.insecure_skip_verify,
            alpn_conn_upgrade_required: self.ssh_info.dial_options.alpn_conn_upgrade_required,
        }
    }

    /// Fresh TCP-equivalent stream to the target's SSH service.
    pub async fn dial(&self) -> Result<BoxedStream, VnetError> {
        let client = self
            .transport
            .new_client(self.proxy_client_config())
            .await
            .context("creating proxy client")?;

        // Port 0: the proxy routes to the node's registered SSH service.
        let target = format!("{}:0", self.ssh_info.ssh_key.hostname);
        debug!(target = %target, cluster = %self.ssh_info.cluster, "Dialing target host");

        let (stream, details) = tokio::time::timeout(
            self.timeout,
            client.dial_host(&target, &self.ssh_info.cluster),
        )
        .await
        .map_err(|_| VnetError::DialFailed(format!("dialing {target} timed out")))??;
        debug!(target = %target, fips = details.fips, "Dialed target host");
        Ok(stream)
    }
}
