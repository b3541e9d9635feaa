//! Credential source seen by the SSH bridge
//!
//! [`SshProvider`] separates "resolve the target and mint credentials" from
//! "bridge the connection". [`super::LocalSshProvider`] does the work in this
//! process; [`super::RemoteSshProvider`] forwards every call to a separate
//! privileged process.

use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::{Certificate, PrivateKey};

use super::error::VnetError;
use super::remote_signer::RemoteSshSigner;
use super::types::{SignOptions, SshInfo};

#[async_trait]
pub trait SshProvider: Send + Sync {
    /// Map a VNet name to its target. Returns the bare [`VnetError::NoTcpHandler`]
    /// when no cluster claims the name.
    async fn resolve_ssh_info(&self, fqdn: &str) -> Result<SshInfo, VnetError>;

    async fn teleport_client_tls_config(
        &self,
        profile: &str,
        cluster: &str,
    ) -> Result<ClientTlsConfig, VnetError>;

    /// Issue a short-lived certificate for `username` on the target and wrap it for the SSH client.
    async fn user_ssh_config(
        &self,
        ssh_info: &SshInfo,
        username: &str,
    ) -> Result<UserSshConfig, VnetError>;

    async fn on_invalid_local_port(&self, ssh_info: &SshInfo, local_port: u16)
        -> Result<(), VnetError>;
}

/// Signs TLS handshake digests with a key that may live elsewhere
#[async_trait]
pub trait DigestSigner: Send + Sync {
    async fn sign(&self, digest: &[u8], opts: SignOptions) -> Result<Vec<u8>, VnetError>;
}

/// Client certificate and signer for the proxy's mTLS endpoint
#[derive(Clone)]
pub struct ClientTlsConfig {
    /// DER encoded leaf certificate
    pub certificate_der: Vec<u8>,
    pub signer: Arc<dyn DigestSigner>,
    pub server_name: Option<String>,
    pub insecure_skip_verify: bool,
    /// PEM bundle of trusted CAs, empty for the system pool
    pub root_cas_pem: Vec<u8>,
}

impl std::fmt::Debug for ClientTlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTlsConfig")
            .field("certificate_len", &self.certificate_der.len())
            .field("server_name", &self.server_name)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .finish_non_exhaustive()
    }
}

/// How the outbound client proves possession of the certified key
#[derive(Clone)]
pub enum UserCredential {
    /// Private key held in this process
    Key(Arc<PrivateKey>),
    /// Key held by another process, signatures requested over RPC
    Remote(RemoteSshSigner),
}

/// SSH client authentication for one username on one target
#[derive(Clone)]
pub struct UserSshConfig {
    pub username: String,
    pub certificate: Certificate,
    pub credential: UserCredential,
}

impl UserSshConfig {
    pub fn with_key(username: impl Into<String>, certificate: Certificate, key: PrivateKey) -> Self {
        Self {
            username: username.into(),
            certificate,
            credential: UserCredential::Key(Arc::new(key)),
        }
    }

    pub fn with_remote_signer(
        username: impl Into<String>,
        certificate: Certificate,
        signer: RemoteSshSigner,
    ) -> Self {
        Self {
            username: username.into(),
            certificate,
            credential: UserCredential::Remote(signer),
        }
    }
}

impl std::fmt::Debug for UserSshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let credential = match self.credential {
            UserCredential::Key(_) => "key",
            UserCredential::Remote(_) => "remote",
        };
        f.debug_struct("UserSshConfig")
            .field("username", &self.username)
            .field("key_id", &self.certificate.key_id())
            .field("credential", &credential)
            .finish()
    }
}

/// Parse an OpenSSH certificate as delivered by the issuer (authorized-keys line).
pub fn parse_ssh_certificate(bytes: &[u8]) -> Result<Certificate, VnetError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| VnetError::BadParameter(format!("SSH certificate is not UTF-8: {e}")))?;
    Ok(Certificate::from_openssh(text.trim())?)
}
