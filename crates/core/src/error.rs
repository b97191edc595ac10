use control::ControlError;
use engine::EngineError;
use filters::FilterError;
use pipeline::PipelineError;
use protocol::ProtocolError;
use transport::TransportError;
use walk::WalkError;

/// Terminal error of one backup run, preserving the first underlying
/// cause.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Configuration rejected before any connection was attempted.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Data-path engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Archive pipeline failure.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    /// Filesystem walk failure.
    #[error(transparent)]
    Walk(#[from] WalkError),
    /// Exclude pattern compilation failure.
    #[error(transparent)]
    Filter(#[from] FilterError),
    /// Transport failure outside the engine's retry loops.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Wire-format failure on the session connection.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Control channel failure that aborts the session.
    #[error(transparent)]
    Control(#[from] ControlError),
    /// The run was cancelled before completing.
    #[error("backup cancelled")]
    Cancelled,
}

impl BackupError {
    /// Returns `true` when the run ended by cancellation rather than
    /// failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Engine(EngineError::Cancelled)
        )
    }
}
