/// Error types for the routing proxy
use std::net::SocketAddr;
use thiserror::Error;

/// Main error type for proxy operations
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The proxy list produced no usable upstream entries
    #[error("No valid proxies found. Please enter at least one proxy.")]
    NoValidProxies,

    /// Every upstream entry failed to claim a local port
    #[error("Failed to start any proxy server ({attempted} attempted)")]
    NoListenerStarted { attempted: usize },

    /// Local listener errors
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    /// Upstream proxy errors
    #[error("Upstream proxy error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Rule pattern errors
    #[error("Rule pattern error: {0}")]
    Pattern(#[from] PatternError),

    /// Request target could not be determined
    #[error("Invalid request target: {0}")]
    InvalidTarget(String),

    /// Network I/O errors
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local listener errors
#[derive(Error, Debug)]
pub enum ListenerError {
    /// The local port is already taken by another socket
    #[error("Address already in use: {addr}")]
    AddrInUse { addr: SocketAddr },

    /// Any other bind failure
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Bind address could not be parsed
    #[error("Invalid bind address: {address}")]
    InvalidAddress { address: String },
}

impl ListenerError {
    /// Classify a bind failure, separating port conflicts from everything else.
    pub fn from_bind(addr: SocketAddr, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::AddrInUse {
            Self::AddrInUse { addr }
        } else {
            Self::Bind { addr, source }
        }
    }

    /// Whether retrying on the next port can help.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, Self::AddrInUse { .. })
    }
}

/// Upstream proxy errors
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// TCP connection to the upstream (or origin) failed
    #[error("Failed to connect to {upstream}: {reason}")]
    ConnectionFailed { upstream: String, reason: String },

    /// Forwarded HTTP request failed after connecting
    #[error("Request via {upstream} failed: {reason}")]
    RequestFailed { upstream: String, reason: String },

    /// Upstream answered CONNECT with something other than 200
    #[error("Upstream {upstream} rejected CONNECT: {status_line}")]
    HandshakeRejected {
        upstream: String,
        status_line: String,
    },

    /// Upstream closed before completing its CONNECT response
    #[error("Upstream {upstream} closed during CONNECT handshake")]
    HandshakeClosed { upstream: String },

    /// Upstream CONNECT response header block exceeded the limit
    #[error("Upstream {upstream} sent an oversized CONNECT response header")]
    HeaderTooLarge { upstream: String },

    /// I/O failure during the handshake
    #[error("Upstream {upstream} I/O error: {source}")]
    Io {
        upstream: String,
        #[source]
        source: std::io::Error,
    },
}

/// Rule pattern errors
#[derive(Error, Debug)]
pub enum PatternError {
    /// No non-empty sub-pattern present
    #[error("Pattern cannot be empty")]
    Empty,

    /// A sub-pattern failed to compile
    #[error("Invalid pattern '{pattern}': {reason}")]
    Invalid { pattern: String, reason: String },
}

/// Result type alias for convenience
pub type ProxyResult<T> = Result<T, ProxyError>;
