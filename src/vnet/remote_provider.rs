//! SSH provider that forwards every call to the privileged client application process
//!
//! This process never holds user keys: certificates arrive over RPC and each
//! signature is requested from the key holder.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use russh::keys::ssh_key;
use tracing::{debug, Instrument, Span};

use super::error::{ResultExt, VnetError};
use super::provider::{parse_ssh_certificate, ClientTlsConfig, SshProvider, UserSshConfig};
use super::remote_signer::{RemoteSigner, RemoteSshSigner, SignFn};
use super::types::{SignRequest, SshInfo, SshKey};

/// RPC surface of the client application service
#[async_trait]
pub trait ClientApplicationService: Send + Sync {
    async fn resolve_ssh_info(&self, fqdn: &str) -> Result<SshInfo, VnetError>;

    /// OpenSSH authorized-keys encoding of a fresh certificate for `username`
    async fn reissue_ssh_cert(&self, ssh_info: &SshInfo, username: &str)
        -> Result<Vec<u8>, VnetError>;

    async fn sign_for_ssh(
        &self,
        ssh_key: &SshKey,
        username: &str,
        request: SignRequest,
    ) -> Result<Vec<u8>, VnetError>;

    /// DER encoded mTLS certificate for the profile
    async fn user_mtls_cert(&self, profile: &str) -> Result<Vec<u8>, VnetError>;

    async fn sign_for_user_mtls(&self, profile: &str, request: SignRequest)
        -> Result<Vec<u8>, VnetError>;

    async fn on_invalid_local_port(&self, ssh_info: &SshInfo, local_port: u16)
        -> Result<(), VnetError>;
}

pub struct RemoteSshProvider {
    clt: Arc<dyn ClientApplicationService>,
    span: Span,
}

impl RemoteSshProvider {
    pub fn new(clt: Arc<dyn ClientApplicationService>, span: Span) -> Self {
        Self { clt, span }
    }
}

#[async_trait]
impl SshProvider for RemoteSshProvider {
    async fn resolve_ssh_info(&self, fqdn: &str) -> Result<SshInfo, VnetError> {
        // Unwrapped: the service's not-found sentinel must reach the caller as is.
        self.clt.resolve_ssh_info(fqdn).await
    }

    async fn teleport_client_tls_config(
        &self,
        profile: &str,
        cluster: &str,
    ) -> Result<ClientTlsConfig, VnetError> {
        let certificate_der = self
            .clt
            .user_mtls_cert(profile)
            .instrument(self.span.clone())
            .await
            .with_context(|| format!("fetching user mTLS cert for profile {profile}"))?;
        debug!(parent: &self.span, profile = %profile, cluster = %cluster, "Fetched user mTLS cert");

        let clt = self.clt.clone();
        let profile = profile.to_string();
        let send_request: SignFn = Arc::new(move |request| {
            let clt = clt.clone();
            let profile = profile.clone();
            async move { clt.sign_for_user_mtls(&profile, request).await }.boxed()
        });

        Ok(ClientTlsConfig {
            certificate_der,
            signer: Arc::new(RemoteSigner::new(send_request)),
            server_name: None,
            insecure_skip_verify: true,
            root_cas_pem: Vec::new(),
        })
    }

    async fn user_ssh_config(
        &self,
        ssh_info: &SshInfo,
        username: &str,
    ) -> Result<UserSshConfig, VnetError> {
        let cert = self
            .clt
            .reissue_ssh_cert(ssh_info, username)
            .instrument(self.span.clone())
            .await?;
        let certificate = parse_ssh_certificate(&cert).context("parsing SSH certificate")?;
        let public_key = ssh_key::PublicKey::from(certificate.public_key().clone());

        let clt = self.clt.clone();
        let ssh_key = ssh_info.ssh_key.clone();
        let user = username.to_string();
        let send_request: SignFn = Arc::new(move |request| {
            let clt = clt.clone();
            let ssh_key = ssh_key.clone();
            let user = user.clone();
            async move { clt.sign_for_ssh(&ssh_key, &user, request).await }.boxed()
        });

        Ok(UserSshConfig::with_remote_signer(
            username,
            certificate,
            RemoteSshSigner::new(public_key, send_request),
        ))
    }

    async fn on_invalid_local_port(
        &self,
        ssh_info: &SshInfo,
        local_port: u16,
    ) -> Result<(), VnetError> {
        self.clt.on_invalid_local_port(ssh_info, local_port).await
    }
}
