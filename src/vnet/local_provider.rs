//! SSH provider backed by the profiles saved in this process

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn, Instrument, Span};

use super::client_application::{ClientApplication, ClusterClient};
use super::cluster_config::ClusterConfigCache;
use super::error::{ResultExt, VnetError};
use super::fqdn::{fully_qualify, is_descendant_subdomain, strip_ssh_suffix};
use super::provider::{parse_ssh_certificate, ClientTlsConfig, SshProvider, UserSshConfig};
use super::types::{SshInfo, SshKey};

pub struct LocalSshProvider {
    app: Arc<dyn ClientApplication>,
    cluster_configs: ClusterConfigCache,
    span: Span,
}

impl LocalSshProvider {
    pub fn new(app: Arc<dyn ClientApplication>, cluster_config_ttl: Duration, span: Span) -> Self {
        Self {
            app,
            cluster_configs: ClusterConfigCache::new(cluster_config_ttl),
            span,
        }
    }

    async fn resolve(&self, fqdn: &str) -> Result<SshInfo, VnetError> {
        let fqdn = fully_qualify(fqdn);
        let profiles = self.app.list_profiles().context("listing profiles")?;

        for profile in profiles {
            let client = match self.cluster_client_for_fqdn(&profile, &fqdn).await {
                Ok(Some(client)) => client,
                Ok(None) => continue,
                Err(e) => {
                    // Possibly logged out of this one cluster. Keep going so the
                    // name is forwarded upstream instead of failing resolution.
                    error!(profile = %profile, error = %e, "Failed to get cluster client");
                    continue;
                }
            };

            let cluster_name = client.cluster_name();
            let leaf_cluster = if !cluster_name.is_empty() && cluster_name != client.root_cluster_name() {
                cluster_name.to_string()
            } else {
                String::new()
            };
            return self
                .resolve_for_cluster(client.as_ref(), &profile, &leaf_cluster, &fqdn)
                .await;
        }
        Err(VnetError::NoTcpHandler)
    }

    /// Client for the cluster whose zone contains `fqdn`. Leaf zones are tried
    /// before the root zone they are nested in.
    async fn cluster_client_for_fqdn(
        &self,
        profile: &str,
        fqdn: &str,
    ) -> Result<Option<Arc<dyn ClusterClient>>, VnetError> {
        let root = match self.app.get_cached_client(profile, "").await {
            Ok(root) => root,
            Err(e) => {
                error!(
                    profile = %profile,
                    error = %e,
                    "Failed to get root cluster client, SSH nodes in this cluster will not be resolved"
                );
                return Ok(None);
            }
        };
        let root_name = root.cluster_name().to_string();
        if !is_descendant_subdomain(fqdn, &root_name) {
            return Ok(None);
        }

        let leaves = match root.leaf_clusters().await {
            Ok(leaves) => leaves,
            Err(e) => {
                warn!(
                    profile = %profile,
                    error = %e,
                    "Failed to list leaf clusters, matching against the root cluster only"
                );
                Vec::new()
            }
        };
        for leaf in leaves {
            if is_descendant_subdomain(fqdn, &format!("{leaf}.{root_name}")) {
                let client = self
                    .app
                    .get_cached_client(profile, &leaf)
                    .await
                    .with_context(|| format!("getting client for leaf cluster {leaf}"))?;
                return Ok(Some(client));
            }
        }
        Ok(Some(root))
    }

    async fn resolve_for_cluster(
        &self,
        client: &dyn ClusterClient,
        profile: &str,
        leaf_cluster: &str,
        fqdn: &str,
    ) -> Result<SshInfo, VnetError> {
        let hostname = strip_ssh_suffix(fqdn, leaf_cluster, client.root_cluster_name());
        debug!(
            profile = %profile,
            leaf_cluster = %leaf_cluster,
            fqdn = %fqdn,
            target = %hostname,
            "Resolving SSH info"
        );

        let cluster_config = self.cluster_configs.get(client).await.map_err(|e| {
            error!(error = %e, "Failed to get cluster VNet config for matching SSH node");
            e.context("getting cached cluster VNet config for matching SSH node")
        })?;
        let dial_options = self.app.get_dial_options(profile).await.map_err(|e| {
            error!(error = %e, "Failed to get cluster dial options");
            e.context("getting dial options for matching SSH node")
        })?;

        Ok(SshInfo {
            ssh_key: SshKey {
                profile: profile.to_string(),
                leaf_cluster: leaf_cluster.to_string(),
                hostname,
            },
            cluster: client.cluster_name().to_string(),
            ipv4_cidr_range: cluster_config.ipv4_cidr_range,
            dial_options,
        })
    }
}

#[async_trait]
impl SshProvider for LocalSshProvider {
    async fn resolve_ssh_info(&self, fqdn: &str) -> Result<SshInfo, VnetError> {
        self.resolve(fqdn).instrument(self.span.clone()).await
    }

    async fn teleport_client_tls_config(
        &self,
        profile: &str,
        cluster: &str,
    ) -> Result<ClientTlsConfig, VnetError> {
        self.app.teleport_client_tls_config(profile, cluster).await
    }

    async fn user_ssh_config(
        &self,
        ssh_info: &SshInfo,
        username: &str,
    ) -> Result<UserSshConfig, VnetError> {
        let cert = self
            .app
            .session_ssh_cert(ssh_info, username)
            .await
            .context("issuing session SSH certificate")?;
        let certificate = parse_ssh_certificate(&cert.certificate).context("parsing SSH certificate")?;
        Ok(UserSshConfig::with_key(username, certificate, cert.private_key))
    }

    async fn on_invalid_local_port(
        &self,
        ssh_info: &SshInfo,
        local_port: u16,
    ) -> Result<(), VnetError> {
        self.app.on_invalid_local_port(ssh_info, local_port).await
    }
}
