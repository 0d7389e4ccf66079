use std::io;
use std::path::PathBuf;
use std::time::Duration;

use hickory_proto::ProtoError;
use thiserror::Error;

/// Errors refused at configuration/build time. The host process is expected
/// to treat any of these as fatal for startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("`from` must name at least one domain, file or URL")]
    EmptyFrom,

    #[error("`.` cannot be combined with other `from` entries")]
    MixedMatchAny,

    #[error("missing mandatory property `to`")]
    NoUpstreams,

    #[error("{0:?} is not a valid domain name")]
    InvalidDomain(String),

    #[error("invalid upstream endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("{0:?} protocol isn't supported")]
    UnsupportedScheme(String),

    #[error("TLS server name on non-TLS endpoint {0:?}")]
    ServerNameWithoutTls(String),

    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),

    #[error("unknown policy {0:?}")]
    UnknownPolicy(String),

    #[error("inline domain {0:?} conflicts with `except`")]
    InlineConflict(String),

    #[error("{directive}: minimal interval is {min:?}")]
    IntervalTooShort {
        directive: &'static str,
        min: Duration,
    },

    #[error("invalid URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("failed to read TLS material from {path:?}")]
    TlsFile { path: PathBuf, source: io::Error },

    #[error("no private key found in {path:?}")]
    TlsMissingKey { path: PathBuf },

    #[error("bad TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// Errors produced on the exchange path. `CachedConnClosed` is the one kind
/// the dispatcher silently retries on a fresh connection; everything else
/// makes the query fall through to the host framework.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("cached connection was closed by peer")]
    CachedConnClosed,

    #[error("out-of-order response: sent id {want}, got id {got}")]
    IdMismatch { want: u16, got: u16 },

    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ExchangeError {
    /// True for end-of-stream I/O failures, the signature of a pooled
    /// connection the peer tore down while it sat in the cache.
    pub(crate) fn is_eof(&self) -> bool {
        matches!(self, ExchangeError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}
