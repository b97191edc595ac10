//! Status bytes and the negotiated compression variant.

use crate::ProtocolError;

/// Server verdict on a session handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Session accepted.
    Ok,
    /// Server is at capacity.
    Full,
    /// Server is temporarily busy.
    Busy,
    /// Server rejected the agent outright.
    Rejected,
    /// The named storage does not exist on the server.
    UnknownStorage,
}

impl HandshakeStatus {
    /// Parses the wire byte.
    pub fn from_wire(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Full),
            2 => Ok(Self::Busy),
            3 => Ok(Self::Rejected),
            4 => Ok(Self::UnknownStorage),
            _ => Err(ProtocolError::InvalidStatus {
                field: "handshake",
                value,
            }),
        }
    }

    /// Returns the wire byte for this status.
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Full => 1,
            Self::Busy => 2,
            Self::Rejected => 3,
            Self::UnknownStorage => 4,
        }
    }
}

/// Server verdict on a resume request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeStatus {
    /// Resume accepted; the carried offset is authoritative.
    Ok,
    /// The session is unknown or already reaped.
    SessionNotFound,
}

impl ResumeStatus {
    /// Parses the wire byte.
    pub fn from_wire(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::SessionNotFound),
            _ => Err(ProtocolError::InvalidStatus {
                field: "resume",
                value,
            }),
        }
    }

    /// Returns the wire byte for this status.
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::SessionNotFound => 1,
        }
    }
}

/// Server verdict carried by the final acknowledgement after the trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalStatus {
    /// Ingestion completed and the checksum matched.
    Ok,
    /// The server-side checksum did not match the trailer.
    ChecksumMismatch,
    /// The server failed to persist the stream.
    WriteError,
}

impl FinalStatus {
    /// Parses the wire byte.
    pub fn from_wire(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::ChecksumMismatch),
            2 => Ok(Self::WriteError),
            _ => Err(ProtocolError::InvalidStatus {
                field: "final",
                value,
            }),
        }
    }

    /// Returns the wire byte for this status.
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::ChecksumMismatch => 1,
            Self::WriteError => 2,
        }
    }
}

/// Server verdict on a parallel stream join.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParallelJoinStatus {
    /// Join accepted; the carried offset is authoritative.
    Ok,
    /// The server cannot take another stream for this session.
    Full,
    /// The session or stream index is unknown.
    NotFound,
}

impl ParallelJoinStatus {
    /// Parses the wire byte.
    pub fn from_wire(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Full),
            2 => Ok(Self::NotFound),
            _ => Err(ProtocolError::InvalidStatus {
                field: "parallel-join",
                value,
            }),
        }
    }

    /// Returns the wire byte for this status.
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Full => 1,
            Self::NotFound => 2,
        }
    }
}

/// Compression variant negotiated in the handshake acknowledgement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    /// DEFLATE via gzip framing; the protocol default.
    #[default]
    Gzip,
    /// Zstandard.
    Zstd,
}

impl Compression {
    /// Parses the wire byte.
    pub fn from_wire(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Gzip),
            1 => Ok(Self::Zstd),
            _ => Err(ProtocolError::InvalidStatus {
                field: "compression",
                value,
            }),
        }
    }

    /// Returns the wire byte for this variant.
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::Gzip => 0,
            Self::Zstd => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_status_round_trips() {
        for value in 0..=4u8 {
            let status = HandshakeStatus::from_wire(value).unwrap();
            assert_eq!(status.to_wire(), value);
        }
    }

    #[test]
    fn handshake_status_rejects_unknown_byte() {
        assert!(HandshakeStatus::from_wire(9).is_err());
    }

    #[test]
    fn final_status_rejects_unknown_byte() {
        assert!(FinalStatus::from_wire(3).is_err());
    }

    #[test]
    fn compression_defaults_to_gzip() {
        assert_eq!(Compression::default(), Compression::Gzip);
    }

    #[test]
    fn compression_round_trips() {
        assert_eq!(Compression::from_wire(0).unwrap(), Compression::Gzip);
        assert_eq!(Compression::from_wire(1).unwrap(), Compression::Zstd);
        assert!(Compression::from_wire(2).is_err());
    }
}
