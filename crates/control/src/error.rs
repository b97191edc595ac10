use protocol::ProtocolError;
use transport::TransportError;

/// Errors raised by the control channel.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// An operation needed a live connection and there was none.
    #[error("control channel is not connected")]
    NotConnected,
    /// The server aborted the session.
    #[error("session aborted by server (code {0})")]
    Aborted(u32),
    /// Admission was not granted within the caller's deadline.
    #[error("timed out waiting for session admission")]
    AdmissionTimeout,
    /// Wire-format failure on the channel.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Transport failure on the channel.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
