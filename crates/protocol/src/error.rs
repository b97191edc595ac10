use std::io;

/// Errors produced while encoding or decoding wire frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The peer sent a frame whose magic did not match any expectation.
    #[error("invalid magic {actual:02x?} while reading {context}")]
    InvalidMagic {
        /// The four bytes actually received.
        actual: [u8; 4],
        /// The frame or dispatch point being read.
        context: &'static str,
    },
    /// The peer advertised a protocol version outside the supported range.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    /// The stream ended in the middle of a frame.
    #[error("truncated frame while reading {0}")]
    Truncated(&'static str),
    /// A line-delimited field exceeded [`crate::MAX_LINE_LEN`].
    #[error("line field exceeds {limit} bytes while reading {context}")]
    LineTooLong {
        /// The enforced bound in bytes.
        limit: usize,
        /// The frame being read.
        context: &'static str,
    },
    /// A line-delimited field was not valid UTF-8.
    #[error("invalid UTF-8 in line field while reading {0}")]
    InvalidUtf8(&'static str),
    /// A line field handed to an encoder contained an embedded newline.
    #[error("embedded newline in outgoing field {0}")]
    EmbeddedNewline(&'static str),
    /// A status byte was outside the defined range for its frame.
    #[error("invalid {field} status byte {value}")]
    InvalidStatus {
        /// The status field name.
        field: &'static str,
        /// The offending byte.
        value: u8,
    },
    /// A chunk header declared a payload longer than the negotiated chunk
    /// size.
    #[error("chunk length {len} exceeds negotiated chunk size {max}")]
    LengthExceedsChunk {
        /// The declared payload length.
        len: u32,
        /// The negotiated maximum.
        max: u32,
    },
    /// Transport-level I/O failure.
    #[error("wire I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Returns `true` when the error indicates the peer closed the stream
    /// mid-frame.
    #[must_use]
    pub fn is_truncation(&self) -> bool {
        match self {
            Self::Truncated(_) => true,
            Self::Io(err) => err.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}
