use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::config::Mode;

/// Errors surfaced by resolvers and transports.
///
/// Cloneable so one singleflight leader can hand the same failure to every waiter.
#[derive(Debug, Clone, Error)]
pub enum DnsError {
    #[error("lookup {name}: no such host")]
    NotFound { name: String },
    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("resolver {name} is not initialized")]
    Uninitialized { name: String },
    #[error("{host} is blocked by rule")]
    Blocked { host: String },
    #[error("no dialer for mode {mode}")]
    NoDialer { mode: Mode },
    #[error("dns protocol error: {0}")]
    Protocol(String),
    #[error("request canceled")]
    Canceled,
    #[error("{}", JoinedErrors(.0))]
    Multiple(Vec<DnsError>),
}

impl DnsError {
    pub fn not_found(name: impl Into<String>) -> Self {
        DnsError::NotFound { name: name.into() }
    }

    pub fn transport(context: impl Into<String>, source: io::Error) -> Self {
        DnsError::Transport {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    pub fn timeout(context: impl Into<String>) -> Self {
        Self::transport(context, io::Error::new(io::ErrorKind::TimedOut, "timed out"))
    }

    /// Walks aggregated errors and reports whether any leaf satisfies `pred`.
    pub fn matches<F>(&self, pred: F) -> bool
    where
        F: Fn(&DnsError) -> bool + Copy,
    {
        match self {
            DnsError::Multiple(errs) => errs.iter().any(|e| e.matches(pred)),
            other => pred(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.matches(|e| matches!(e, DnsError::NotFound { .. }))
    }

    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            DnsError::Transport { source, .. } => Some(source.kind()),
            _ => None,
        }
    }

    /// Merges two failures, flattening nested aggregates.
    pub fn join(a: DnsError, b: DnsError) -> DnsError {
        let mut all = Vec::new();
        for e in [a, b] {
            match e {
                DnsError::Multiple(inner) => all.extend(inner),
                other => all.push(other),
            }
        }
        DnsError::Multiple(all)
    }
}

impl From<hickory_proto::error::ProtoError> for DnsError {
    fn from(err: hickory_proto::error::ProtoError) -> Self {
        DnsError::Protocol(err.to_string())
    }
}

impl From<DnsError> for io::Error {
    fn from(err: DnsError) -> Self {
        match err {
            DnsError::Transport { ref source, .. } => io::Error::new(source.kind(), err),
            other => io::Error::other(other),
        }
    }
}

struct JoinedErrors<'a>(&'a [DnsError]);

impl fmt::Display for JoinedErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("dial {host} failed (mode {mode}): {source}")]
    Dial {
        host: String,
        mode: Mode,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Dns(#[from] DnsError),
}
