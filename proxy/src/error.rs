//! Error taxonomy for the proxy core.
//!
//! Each stage of the pipeline gets its own error enum rather than one big
//! catch-all, so callers can match on the kind that actually matters to
//! them (a dial failure closes one client; a config error aborts startup).

use std::fmt;

use thiserror::Error;

use crate::instance_id::InstanceId;

/// Failure resolving or refreshing credentials/endpoint info for an instance.
#[derive(Debug, Error, Clone)]
pub enum ResolveError {
    #[error("not authorized to connect to {0}")]
    NotAuthorized(InstanceId),

    #[error("instance {0} not found")]
    NotFound(InstanceId),

    #[error("transient error resolving {instance}: {message}")]
    Transient { instance: InstanceId, message: String },

    #[error("permanent error resolving {instance}: {message}")]
    Permanent { instance: InstanceId, message: String },
}

impl ResolveError {
    /// Transient resolver errors are worth retrying on the next refresh tick
    /// or lazy access; everything else propagates to the caller as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolveError::Transient { .. })
    }
}

/// Failure dialing an instance after a `ConnectionInfo` was obtained.
#[derive(Debug, Error)]
pub enum DialError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("dial to {instance} timed out after {timeout:?}")]
    Timeout {
        instance: InstanceId,
        timeout: std::time::Duration,
    },

    #[error("tcp connect to {instance} ({addr}) failed: {source}")]
    Connect {
        instance: InstanceId,
        addr: std::net::IpAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("tls handshake with {instance} failed: {source}")]
    Tls {
        instance: InstanceId,
        #[source]
        source: std::io::Error,
    },
}

/// Fatal, startup-time configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid instance identifier {0:?}: does not match the expected grammar")]
    InvalidInstanceId(String),

    #[error("invalid short-form identifier {0:?}")]
    InvalidShortId(String),

    #[error("binding for {instance} sets both address/port and unix-socket directory")]
    ConflictingListenSpec { instance: InstanceId },

    #[error("malformed query-string override {query:?} on {instance}: {reason}")]
    MalformedOverride {
        instance: InstanceId,
        query: String,
        reason: String,
    },

    #[error("duplicate key {key:?} in override query string for {instance}")]
    DuplicateOverrideKey { instance: InstanceId, key: String },

    #[error("two listeners would both bind {0}")]
    DuplicateListenAddress(String),

    #[error("more than one credential source configured; exactly one is required")]
    MultipleCredentialSources,

    #[error("impersonation chain must contain at least one service account")]
    EmptyImpersonationChain,

    #[error("invalid URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// Failure constructing a `SocketMount`.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("failed to bind tcp listener on {addr}: {source}")]
    Tcp {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind unix listener at {path}: {source}")]
    Unix {
        path: camino::Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("FUSE mounts are not supported on this platform")]
    FuseUnsupported,

    #[error("fuse mount failed: {0}")]
    Fuse(String),
}

/// Reported when graceful shutdown's wait-on-close deadline elapses with
/// connections still open.
#[derive(Debug, Error)]
#[error("{remaining} connection(s) still open after {waited:?}")]
pub struct ShutdownTimeout {
    pub remaining: u64,
    pub waited: std::time::Duration,
}

/// Fatal error constructing the Connection Manager: either the
/// configuration itself is invalid, or a Socket Mount failed to bind.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Mount(#[from] MountError),
}

/// An ordered collection of errors, displayed comma-joined.
/// Used when more than one independent failure can
/// occur in the same operation (shutdown, `check_connections`) and none
/// should be allowed to mask the others.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Box<dyn std::error::Error + Send + Sync>>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<E: std::error::Error + Send + Sync + 'static>(&mut self, err: E) {
        self.errors.push(Box::new(err));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns `Err(self)` if any errors were collected, `Ok(())` otherwise.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{joined}")
    }
}

impl std::error::Error for MultiError {}
