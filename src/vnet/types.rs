//! Routing descriptors and signing requests exchanged with the credential source

use serde::{Deserialize, Serialize};

/// Identifies one SSH target: which profile and cluster it was resolved through
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SshKey {
    pub profile: String,
    /// Empty for the root cluster
    #[serde(default)]
    pub leaf_cluster: String,
    /// Bare hostname with the cluster suffix stripped
    pub hostname: String,
}

/// How to reach the cluster's web proxy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialOptions {
    pub web_proxy_addr: String,
    #[serde(default)]
    pub alpn_conn_upgrade_required: bool,
    #[serde(default)]
    pub sni: String,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// PEM bundle of the root cluster CAs, empty when the system pool is used
    #[serde(default)]
    pub root_cluster_ca_cert_pool: Vec<u8>,
}

/// Resolved routing descriptor for a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshInfo {
    pub ssh_key: SshKey,
    /// Name of the cluster the target lives in (root or leaf)
    pub cluster: String,
    /// Range VNet should route for the target's cluster
    pub ipv4_cidr_range: String,
    pub dial_options: DialOptions,
}

impl SshInfo {
    pub fn hostname(&self) -> &str {
        &self.ssh_key.hostname
    }

    pub fn profile(&self) -> &str {
        &self.ssh_key.profile
    }
}

/// Per-cluster VNet settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_name: String,
    pub ipv4_cidr_range: String,
    #[serde(default)]
    pub dns_zones: Vec<String>,
}

/// Hash applied to a digest before it was handed to the signer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignHash {
    /// Message signed as is (Ed25519)
    None,
    Sha256,
}

/// A digest to be signed by the process holding the private key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    pub digest: Vec<u8>,
    pub hash: SignHash,
    /// Present only for RSA-PSS signatures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pss_salt_length: Option<i32>,
}

/// Options for a TLS-side digest signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignOptions {
    pub hash: SignHash,
    pub pss_salt_length: Option<i32>,
}

impl SignOptions {
    pub fn new(hash: SignHash) -> Self {
        Self {
            hash,
            pss_salt_length: None,
        }
    }

    pub fn pss(hash: SignHash, salt_length: i32) -> Self {
        Self {
            hash,
            pss_salt_length: Some(salt_length),
        }
    }
}
