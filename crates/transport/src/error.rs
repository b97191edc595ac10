use std::io;
use std::path::PathBuf;

/// Errors raised while establishing or using a transport connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// TCP connection establishment failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// The address dialled.
        addr: String,
        /// The underlying I/O error.
        source: io::Error,
    },
    /// The TLS handshake failed after the TCP connection was up.
    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake {
        /// The address dialled.
        addr: String,
        /// The underlying I/O error.
        source: io::Error,
    },
    /// Certificate or key material could not be loaded.
    #[error("invalid TLS material in '{path}': {detail}")]
    TlsConfig {
        /// The file that failed to load.
        path: PathBuf,
        /// What went wrong.
        detail: String,
    },
    /// The configured server name is not a valid SNI host name.
    #[error("invalid TLS server name '{0}'")]
    ServerName(String),
    /// The configured DSCP class name is not recognised.
    #[error("unknown DSCP class '{0}'")]
    UnknownDscp(String),
    /// A protocol violation during the health-check exchange.
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),
    /// Plain I/O failure on an established connection.
    #[error("transport I/O failed: {0}")]
    Io(#[from] io::Error),
}
