//! VNet SSH - serves SSH targets on virtual network addresses
//!
//! A connection to `host.cluster` on the virtual network is answered by a
//! local SSH server, authenticated by dialing the real node with a short-lived
//! certificate for the same username, then bridged to that node.
//!
//! [`SshResolver`] maps names to [`SshHandler`]s. Credentials and routing come
//! from an [`SshProvider`]: [`LocalSshProvider`] when this process holds the
//! user's profiles, [`RemoteSshProvider`] when a separate process does.

pub mod client_application;
pub mod cluster_config;
pub mod credential_cache;
pub mod dialer;
pub mod error;
pub mod fqdn;
pub mod handler;
pub mod local_provider;
pub mod provider;
pub mod remote_provider;
pub mod remote_signer;
pub mod resolver;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use client_application::{ClientApplication, ClusterClient, SessionSshCert};
pub use cluster_config::ClusterConfigCache;
pub use credential_cache::UserConfigCache;
pub use dialer::{
    BoxedStream, ClusterDetails, ProxyClient, ProxyClientConfig, ProxyTransport, TargetDialer,
    TargetStream,
};
pub use error::{ResultExt, VnetError};
pub use handler::{SshHandler, SSH_PORT};
pub use local_provider::LocalSshProvider;
pub use provider::{ClientTlsConfig, DigestSigner, SshProvider, UserCredential, UserSshConfig};
pub use remote_provider::{ClientApplicationService, RemoteSshProvider};
pub use remote_signer::{RemoteSigner, RemoteSshSigner};
pub use resolver::{SshResolver, TcpHandlerSpec};
pub use types::{ClusterConfig, DialOptions, SignHash, SignOptions, SignRequest, SshInfo, SshKey};
