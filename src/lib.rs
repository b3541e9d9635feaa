//! vnet-ssh - SSH access to cluster nodes over a virtual network
//!
//! Connections to `host.cluster:22` are terminated by a local SSH server and
//! bridged to the real node, authenticated with short-lived per-user
//! certificates. See [`vnet`] for the entry points.

pub mod config;
pub mod ssh;
pub mod vnet;

pub use config::{ConfigStorage, VnetSshConfig};
pub use vnet::{
    LocalSshProvider, RemoteSshProvider, SshHandler, SshProvider, SshResolver, TcpHandlerSpec,
    VnetError,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
///
/// Honors `RUST_LOG`, defaulting to `info`. Does nothing if the host
/// application already installed a subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
