//! Connection factory seam between the engine and the TLS stack.

use crate::{Connection, TransportError};

/// Dials a fresh connection to the storage server.
///
/// The session layer implements this over the configured TLS client; tests
/// implement it over loopback TCP. Every reconnect path in the engine goes
/// through this trait, so resume behaviour is exercised without real
/// certificates.
pub trait Dialer: Send + Sync {
    /// Establishes a new connection.
    fn dial(&self) -> Result<Connection, TransportError>;
}

impl<F> Dialer for F
where
    F: Fn() -> Result<Connection, TransportError> + Send + Sync,
{
    fn dial(&self) -> Result<Connection, TransportError> {
        self()
    }
}
