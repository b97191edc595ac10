use buffer::BufferError;
use protocol::{HandshakeStatus, ParallelJoinStatus, ProtocolError, ResumeStatus};
use transport::TransportError;

/// Errors raised by the data-path engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Round-robin found no stream that is active and alive.
    #[error("all parallel streams are dead")]
    AllStreamsDead,
    /// A stream exhausted its reconnect budget.
    #[error("stream {index} exceeded {attempts} reconnect attempts")]
    MaxRetriesExceeded {
        /// The stream that gave up.
        index: u8,
        /// Attempts consumed.
        attempts: u32,
    },
    /// The server's resume offset is no longer covered by the ring buffer.
    #[error("resume offset {offset} is no longer buffered (tail {tail})")]
    ResumeOffsetExpired {
        /// The offset the server asked to resume from.
        offset: u64,
        /// The oldest offset still retained.
        tail: u64,
    },
    /// The bytes at the resumed position do not parse as a chunk header.
    #[error("resume offset {offset} does not align with a chunk boundary")]
    ResumeDesync {
        /// The ring-buffer offset that failed validation.
        offset: u64,
    },
    /// The stream is permanently dead.
    #[error("stream {index} is dead")]
    StreamDead {
        /// The dead stream's index.
        index: u8,
    },
    /// The server rejected the session handshake.
    #[error("server rejected handshake: {status:?} ({message})")]
    HandshakeRejected {
        /// Rejection status.
        status: HandshakeStatus,
        /// Server-provided detail.
        message: String,
    },
    /// The server rejected a resume request.
    #[error("server rejected resume: {status:?}")]
    ResumeRejected {
        /// Rejection status.
        status: ResumeStatus,
    },
    /// The server rejected a parallel join.
    #[error("server rejected stream {index} join: {status:?}")]
    JoinRejected {
        /// The stream that tried to join.
        index: u8,
        /// Rejection status.
        status: ParallelJoinStatus,
    },
    /// The server reported a checksum mismatch after the trailer.
    #[error("server checksum mismatch")]
    ChecksumMismatch,
    /// The server failed to persist the stream.
    #[error("server write error")]
    ServerWriteError,
    /// The session was cancelled.
    #[error("session cancelled")]
    Cancelled,
    /// `wait_all_senders` hit its deadline before the streams drained.
    #[error("deadline exceeded while draining senders")]
    DeadlineExceeded,
    /// Ring-buffer failure.
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// Wire-format failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl EngineError {
    /// Returns `true` for errors that reconnect-and-resume may recover:
    /// connection establishment failures and mid-frame transport drops.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(
                TransportError::Connect { .. }
                    | TransportError::Handshake { .. }
                    | TransportError::Io(_)
            ) | Self::Protocol(ProtocolError::Io(_) | ProtocolError::Truncated(_))
        )
    }
}
