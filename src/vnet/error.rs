//! VNet SSH error taxonomy
//!
//! Errors are wrapped with a short operation description each time they cross
//! a component boundary. [`VnetError::NoTcpHandler`] is the exception: it tells
//! the interception layer "this name is not ours" and must reach it unwrapped,
//! so [`VnetError::context`] leaves it untouched.

use std::sync::Arc;

use thiserror::Error;

use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum VnetError {
    /// The name does not belong to any cluster this process can reach.
    #[error("no TCP handler for address")]
    NoTcpHandler,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("inbound SSH handshake failed: {0}")]
    Handshake(String),

    #[error("credential issuance failed: {0}")]
    CredentialIssuance(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::config::StorageError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<VnetError>,
    },

    /// One failure observed by every caller that joined the same in-flight
    /// credential issuance.
    #[error(transparent)]
    Shared(Arc<VnetError>),
}

impl VnetError {
    /// Wrap with an operation description. The no-handler sentinel is returned as is.
    pub fn context(self, context: impl Into<String>) -> Self {
        match self {
            VnetError::NoTcpHandler => VnetError::NoTcpHandler,
            other => VnetError::Context {
                context: context.into(),
                source: Box::new(other),
            },
        }
    }

    /// True only for the bare sentinel, never for a wrapped one.
    pub fn is_no_tcp_handler(&self) -> bool {
        matches!(self, VnetError::NoTcpHandler)
    }

    /// Innermost error, looking through context and shared wrappers.
    pub fn root_cause(&self) -> &VnetError {
        match self {
            VnetError::Context { source, .. } => source.root_cause(),
            VnetError::Shared(inner) => inner.root_cause(),
            other => other,
        }
    }
}

impl From<russh::Error> for VnetError {
    fn from(err: russh::Error) -> Self {
        VnetError::Ssh(SshError::from(err))
    }
}

impl From<russh::keys::ssh_key::Error> for VnetError {
    fn from(err: russh::keys::ssh_key::Error) -> Self {
        VnetError::Ssh(SshError::from(err))
    }
}

/// `.context(..)` on results, mirroring [`VnetError::context`].
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T, VnetError>;

    fn with_context<F, S>(self, f: F) -> Result<T, VnetError>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<VnetError>,
{
    fn context(self, context: impl Into<String>) -> Result<T, VnetError> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T, VnetError>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}
