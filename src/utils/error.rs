use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Most variants are recorded on a pool or forwarder and logged at their
/// point of occurrence rather than bubbled all the way to a caller; only
/// `Config` is fatal at startup.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("rule {id} rejected: {reason}")]
    RuleValidation { id: i64, reason: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to dial upstream {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("socket error on {addr}: {source}")]
    Socket {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("waiter queue timed out acquiring a connection to {addr}")]
    AcquireTimeout { addr: String },

    #[error("udp send to {addr} failed: {source}")]
    UdpSend {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ProxyError>;
