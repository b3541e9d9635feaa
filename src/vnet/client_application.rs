//! Collaborators that hold the user's cluster credentials in this process
//!
//! The bridge never talks to a cluster directly. Profile enumeration, cached
//! cluster clients, dial options and certificate issuance all come from the
//! surrounding application through these traits.

use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::PrivateKey;

use super::error::VnetError;
use super::provider::ClientTlsConfig;
use super::types::{ClusterConfig, DialOptions, SshInfo};

/// A freshly issued SSH session certificate and the key it certifies
pub struct SessionSshCert {
    /// OpenSSH authorized-keys encoding of the certificate
    pub certificate: Vec<u8>,
    pub private_key: PrivateKey,
}

impl std::fmt::Debug for SessionSshCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSshCert")
            .field("certificate_len", &self.certificate.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ClientApplication: Send + Sync {
    /// Names of all saved profiles
    fn list_profiles(&self) -> Result<Vec<String>, VnetError>;

    /// Cached client for a profile's root cluster (`leaf_cluster` empty) or one of its leaves
    async fn get_cached_client(
        &self,
        profile: &str,
        leaf_cluster: &str,
    ) -> Result<Arc<dyn ClusterClient>, VnetError>;

    async fn get_dial_options(&self, profile: &str) -> Result<DialOptions, VnetError>;

    /// mTLS config for talking to `cluster` through the profile's proxy
    async fn teleport_client_tls_config(
        &self,
        profile: &str,
        cluster: &str,
    ) -> Result<ClientTlsConfig, VnetError>;

    async fn session_ssh_cert(
        &self,
        ssh_info: &SshInfo,
        username: &str,
    ) -> Result<SessionSshCert, VnetError>;

    /// Tell the user a connection arrived on a port the target does not serve
    async fn on_invalid_local_port(&self, ssh_info: &SshInfo, local_port: u16)
        -> Result<(), VnetError>;
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    fn cluster_name(&self) -> &str;

    fn root_cluster_name(&self) -> &str;

    /// Names of the leaf clusters trusted by this (root) cluster
    async fn leaf_clusters(&self) -> Result<Vec<String>, VnetError>;

    async fn vnet_config(&self) -> Result<ClusterConfig, VnetError>;
}
