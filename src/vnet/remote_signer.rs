//! Signers whose private key lives in another process
//!
//! Only digests cross the process boundary: the request carries the digest,
//! the hash that produced it and an optional PSS salt length, and the reply is
//! the raw signature.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use russh::keys::ssh_encoding::Encode;
use russh::keys::ssh_key::{self, Algorithm, HashAlg, Signature};
use russh::{AgentAuthError, CryptoVec, Signer};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::error::VnetError;
use super::provider::DigestSigner;
use super::types::{SignHash, SignOptions, SignRequest};

/// Sends one sign request to the key holder and returns the raw signature.
pub type SignFn =
    Arc<dyn Fn(SignRequest) -> BoxFuture<'static, Result<Vec<u8>, VnetError>> + Send + Sync>;

/// TLS-side signer for the user's mTLS certificate
#[derive(Clone)]
pub struct RemoteSigner {
    send_request: SignFn,
}

impl RemoteSigner {
    pub fn new(send_request: SignFn) -> Self {
        Self { send_request }
    }
}

#[async_trait]
impl DigestSigner for RemoteSigner {
    async fn sign(&self, digest: &[u8], opts: SignOptions) -> Result<Vec<u8>, VnetError> {
        let request = SignRequest {
            digest: digest.to_vec(),
            hash: opts.hash,
            pss_salt_length: opts.pss_salt_length,
        };
        (self.send_request)(request).await
    }
}

/// SSH user-auth signer for a certificate whose key is held remotely
///
/// Implements russh's [`Signer`] so it can drive certificate authentication
/// directly. Ed25519 messages are signed as is; RSA uses `rsa-sha2-256`.
#[derive(Clone)]
pub struct RemoteSshSigner {
    public_key: ssh_key::PublicKey,
    send_request: SignFn,
}

impl RemoteSshSigner {
    pub fn new(public_key: ssh_key::PublicKey, send_request: SignFn) -> Self {
        Self {
            public_key,
            send_request,
        }
    }

    pub fn public_key(&self) -> &ssh_key::PublicKey {
        &self.public_key
    }

    /// Hash algorithm to request from the server for this key
    pub fn hash_alg(&self) -> Option<HashAlg> {
        match self.public_key.algorithm() {
            Algorithm::Rsa { .. } => Some(HashAlg::Sha256),
            _ => None,
        }
    }
}

/// Build the request for signing `data` with a key of `algorithm`.
///
/// Returns the signature algorithm alongside the request.
pub fn ssh_sign_request(
    algorithm: &Algorithm,
    hash_alg: Option<HashAlg>,
    data: &[u8],
) -> Result<(Algorithm, SignRequest), VnetError> {
    match algorithm {
        Algorithm::Ed25519 => Ok((
            Algorithm::Ed25519,
            SignRequest {
                digest: data.to_vec(),
                hash: SignHash::None,
                pss_salt_length: None,
            },
        )),
        Algorithm::Rsa { .. } => match hash_alg {
            Some(HashAlg::Sha256) => Ok((
                Algorithm::Rsa {
                    hash: Some(HashAlg::Sha256),
                },
                SignRequest {
                    digest: Sha256::digest(data).to_vec(),
                    hash: SignHash::Sha256,
                    pss_salt_length: None,
                },
            )),
            other => Err(VnetError::BadParameter(format!(
                "unsupported RSA signature hash {other:?}"
            ))),
        },
        other => Err(VnetError::BadParameter(format!(
            "unsupported remote signer key algorithm {other:?}"
        ))),
    }
}

fn to_agent_error(err: VnetError) -> AgentAuthError {
    russh::keys::Error::from(std::io::Error::other(err.to_string())).into()
}

impl Signer for RemoteSshSigner {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        _key: &ssh_key::PublicKey,
        hash_alg: Option<HashAlg>,
        mut to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let prepared = ssh_sign_request(&self.public_key.algorithm(), hash_alg, &to_sign);
        let send_request = self.send_request.clone();
        async move {
            let (algorithm, request) = prepared.map_err(to_agent_error)?;
            debug!(algorithm = %algorithm.as_str(), "Requesting remote SSH signature");
            let raw = send_request(request).await.map_err(to_agent_error)?;

            // Rejects a reply of the wrong size for the algorithm
            let signature = Signature::new(algorithm, raw).map_err(russh::keys::Error::from)?;
            signature
                .encode_prefixed(&mut to_sign)
                .map_err(russh::keys::Error::from)?;
            Ok(to_sign)
        }
    }
}
