//! Data-path frames: handshake, resume, acknowledgements, chunk framing,
//! and the trailer.

use std::io::{Read, Write};

use crate::status::{Compression, FinalStatus, HandshakeStatus, ParallelJoinStatus, ResumeStatus};
use crate::wire::{
    expect_magic, read_exact, read_u8, read_u32, read_u64, read_line, write_line,
};
use crate::{MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, ProtocolError, magic};

/// Encoded length of a [`ChunkHeader`] on the wire.
pub const CHUNK_HEADER_LEN: usize = 8;

/// Parallel-session parameters appended to the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParallelInit {
    /// Number of streams the agent may open, in `[1, 255]`.
    pub max_streams: u8,
    /// Chunk size in bytes for the framed parallel payload.
    pub chunk_size: u32,
}

/// Session handshake sent as the first frame on the data connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// Agent identity registered with the server.
    pub agent_name: String,
    /// Target storage name on the server.
    pub storage_name: String,
    /// Name of the backup entry being streamed.
    pub backup_name: String,
    /// Client software version line.
    pub client_version: String,
    /// Present when the agent requests a parallel session.
    pub parallel: Option<ParallelInit>,
}

impl Handshake {
    /// Writes the handshake. From protocol v4 on the parallel extension is
    /// always present; a zero stream count selects the single-stream path.
    pub fn encode(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        w.write_all(&magic::HANDSHAKE)?;
        w.write_all(&[PROTOCOL_VERSION])?;
        write_line(w, &self.agent_name, "handshake.agent")?;
        write_line(w, &self.storage_name, "handshake.storage")?;
        write_line(w, &self.backup_name, "handshake.backup")?;
        write_line(w, &self.client_version, "handshake.version")?;
        let parallel = self.parallel.unwrap_or(ParallelInit {
            max_streams: 0,
            chunk_size: 0,
        });
        w.write_all(&[parallel.max_streams])?;
        w.write_all(&parallel.chunk_size.to_be_bytes())?;
        Ok(())
    }

    /// Reads a handshake frame, magic included. Peers older than v4 do not
    /// send the parallel extension and always run single-stream.
    pub fn decode(r: &mut impl Read) -> Result<Self, ProtocolError> {
        expect_magic(r, magic::HANDSHAKE, "handshake")?;
        let version = read_u8(r, "handshake.version")?;
        if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let agent_name = read_line(r, "handshake.agent")?;
        let storage_name = read_line(r, "handshake.storage")?;
        let backup_name = read_line(r, "handshake.backup")?;
        let client_version = read_line(r, "handshake.version-line")?;
        let parallel = if version >= 4 {
            let max_streams = read_u8(r, "handshake.parallel")?;
            let chunk_size = read_u32(r, "handshake.parallel")?;
            (max_streams > 0).then_some(ParallelInit {
                max_streams,
                chunk_size,
            })
        } else {
            None
        };
        Ok(Self {
            agent_name,
            storage_name,
            backup_name,
            client_version,
            parallel,
        })
    }
}

/// Server acknowledgement of the session handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeAck {
    /// Admission verdict.
    pub status: HandshakeStatus,
    /// Human-readable detail line, possibly empty.
    pub message: String,
    /// Opaque session identifier assigned by the server.
    pub session_id: String,
    /// Compression variant the server selected (protocol v4+; earlier peers
    /// imply gzip).
    pub compression: Compression,
}

impl HandshakeAck {
    /// Reads the acknowledgement. `peer_version` selects whether the
    /// trailing compression byte is expected.
    pub fn decode(r: &mut impl Read, peer_version: u8) -> Result<Self, ProtocolError> {
        let status = HandshakeStatus::from_wire(read_u8(r, "ack.status")?)?;
        let message = read_line(r, "ack.message")?;
        let session_id = read_line(r, "ack.session")?;
        let compression = if peer_version >= 4 {
            Compression::from_wire(read_u8(r, "ack.compression")?)?
        } else {
            Compression::Gzip
        };
        Ok(Self {
            status,
            message,
            session_id,
            compression,
        })
    }

    /// Writes the acknowledgement in the given protocol version.
    pub fn encode(&self, w: &mut impl Write, peer_version: u8) -> Result<(), ProtocolError> {
        w.write_all(&[self.status.to_wire()])?;
        write_line(w, &self.message, "ack.message")?;
        write_line(w, &self.session_id, "ack.session")?;
        if peer_version >= 4 {
            w.write_all(&[self.compression.to_wire()])?;
        }
        Ok(())
    }
}

/// Resume request reopening an interrupted single-stream session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resume {
    /// Session identifier returned by the original handshake.
    pub session_id: String,
    /// Agent identity, re-stated for authentication.
    pub agent_name: String,
    /// Storage name, re-stated for validation.
    pub storage_name: String,
}

impl Resume {
    /// Writes the resume request.
    pub fn encode(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        w.write_all(&magic::RESUME)?;
        w.write_all(&[PROTOCOL_VERSION])?;
        write_line(w, &self.session_id, "resume.session")?;
        write_line(w, &self.agent_name, "resume.agent")?;
        write_line(w, &self.storage_name, "resume.storage")?;
        Ok(())
    }

    /// Reads a resume request, magic included.
    pub fn decode(r: &mut impl Read) -> Result<Self, ProtocolError> {
        expect_magic(r, magic::RESUME, "resume")?;
        let version = read_u8(r, "resume.version")?;
        if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        Ok(Self {
            session_id: read_line(r, "resume.session")?,
            agent_name: read_line(r, "resume.agent")?,
            storage_name: read_line(r, "resume.storage")?,
        })
    }
}

/// Server acknowledgement of a resume request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumeAck {
    /// Resume verdict.
    pub status: ResumeStatus,
    /// Last byte offset the server has durably received.
    pub last_offset: u64,
}

impl ResumeAck {
    /// Reads the acknowledgement.
    pub fn decode(r: &mut impl Read) -> Result<Self, ProtocolError> {
        Ok(Self {
            status: ResumeStatus::from_wire(read_u8(r, "resume-ack.status")?)?,
            last_offset: read_u64(r, "resume-ack.offset")?,
        })
    }

    /// Writes the acknowledgement.
    pub fn encode(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        w.write_all(&[self.status.to_wire()])?;
        w.write_all(&self.last_offset.to_be_bytes())?;
        Ok(())
    }
}

/// Single-stream selective acknowledgement carrying an absolute offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sack {
    /// Absolute stream offset durably received by the server.
    pub offset: u64,
}

impl Sack {
    /// Reads a SACK frame, magic included.
    pub fn decode(r: &mut impl Read) -> Result<Self, ProtocolError> {
        expect_magic(r, magic::SACK, "sack")?;
        Ok(Self {
            offset: read_u64(r, "sack.offset")?,
        })
    }

    /// Writes a SACK frame.
    pub fn encode(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        w.write_all(&magic::SACK)?;
        w.write_all(&self.offset.to_be_bytes())?;
        Ok(())
    }
}

/// Data trailer closing the stream with the end-to-end checksum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trailer {
    /// SHA-256 over the compressed byte stream.
    pub sha256: [u8; 32],
    /// Total compressed bytes produced.
    pub size: u64,
}

impl Trailer {
    /// Writes the trailer frame.
    pub fn encode(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        w.write_all(&magic::TRAILER)?;
        w.write_all(&self.sha256)?;
        w.write_all(&self.size.to_be_bytes())?;
        Ok(())
    }

    /// Reads a trailer frame, magic included.
    pub fn decode(r: &mut impl Read) -> Result<Self, ProtocolError> {
        expect_magic(r, magic::TRAILER, "trailer")?;
        let mut sha256 = [0u8; 32];
        read_exact(r, &mut sha256, "trailer.sha256")?;
        Ok(Self {
            sha256,
            size: read_u64(r, "trailer.size")?,
        })
    }
}

/// Final server acknowledgement after the trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FinalAck {
    /// Ingestion verdict.
    pub status: FinalStatus,
}

impl FinalAck {
    /// Reads the acknowledgement.
    pub fn decode(r: &mut impl Read) -> Result<Self, ProtocolError> {
        Ok(Self {
            status: FinalStatus::from_wire(read_u8(r, "final-ack.status")?)?,
        })
    }

    /// Writes the acknowledgement.
    pub fn encode(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        w.write_all(&[self.status.to_wire()])?;
        Ok(())
    }
}

/// Join request attaching one parallel stream to an existing session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParallelJoin {
    /// Session identifier from the handshake acknowledgement.
    pub session_id: String,
    /// Stream slot being attached, in `[0, max_streams)`.
    pub stream_index: u8,
}

impl ParallelJoin {
    /// Writes the join request.
    pub fn encode(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        w.write_all(&magic::PARALLEL_JOIN)?;
        w.write_all(&[PROTOCOL_VERSION])?;
        write_line(w, &self.session_id, "join.session")?;
        w.write_all(&[self.stream_index])?;
        Ok(())
    }

    /// Reads a join request, magic included.
    pub fn decode(r: &mut impl Read) -> Result<Self, ProtocolError> {
        expect_magic(r, magic::PARALLEL_JOIN, "parallel-join")?;
        let version = read_u8(r, "join.version")?;
        if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        Ok(Self {
            session_id: read_line(r, "join.session")?,
            stream_index: read_u8(r, "join.stream")?,
        })
    }
}

/// Server acknowledgement of a parallel stream join.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParallelAck {
    /// Join verdict.
    pub status: ParallelJoinStatus,
    /// Last wire offset the server has durably received on this stream.
    pub last_offset: u64,
}

impl ParallelAck {
    /// Reads the acknowledgement.
    pub fn decode(r: &mut impl Read) -> Result<Self, ProtocolError> {
        Ok(Self {
            status: ParallelJoinStatus::from_wire(read_u8(r, "parallel-ack.status")?)?,
            last_offset: read_u64(r, "parallel-ack.offset")?,
        })
    }

    /// Writes the acknowledgement.
    pub fn encode(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        w.write_all(&[self.status.to_wire()])?;
        w.write_all(&self.last_offset.to_be_bytes())?;
        Ok(())
    }
}

/// Per-stream selective acknowledgement in wire-offset space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSack {
    /// Stream the acknowledgement applies to.
    pub stream_index: u8,
    /// Highest chunk sequence fully received.
    pub chunk_seq: u32,
    /// Wire offset durably received on this stream.
    pub offset: u64,
}

impl ChunkSack {
    /// Reads a chunk SACK, magic included.
    pub fn decode(r: &mut impl Read) -> Result<Self, ProtocolError> {
        expect_magic(r, magic::CHUNK_SACK, "chunk-sack")?;
        Ok(Self {
            stream_index: read_u8(r, "chunk-sack.stream")?,
            chunk_seq: read_u32(r, "chunk-sack.seq")?,
            offset: read_u64(r, "chunk-sack.offset")?,
        })
    }

    /// Writes a chunk SACK.
    pub fn encode(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        w.write_all(&magic::CHUNK_SACK)?;
        w.write_all(&[self.stream_index])?;
        w.write_all(&self.chunk_seq.to_be_bytes())?;
        w.write_all(&self.offset.to_be_bytes())?;
        Ok(())
    }
}

/// In-band header preceding every parallel chunk payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Session-wide monotonic chunk sequence.
    pub seq: u32,
    /// Payload length in bytes, at most the negotiated chunk size.
    pub len: u32,
}

impl ChunkHeader {
    /// Encodes the header into its fixed 8-byte form.
    #[must_use]
    pub fn to_bytes(self) -> [u8; CHUNK_HEADER_LEN] {
        let mut out = [0u8; CHUNK_HEADER_LEN];
        out[..4].copy_from_slice(&self.seq.to_be_bytes());
        out[4..].copy_from_slice(&self.len.to_be_bytes());
        out
    }

    /// Decodes a header from its fixed 8-byte form, validating the length
    /// against `max_chunk`.
    pub fn from_bytes(
        bytes: [u8; CHUNK_HEADER_LEN],
        max_chunk: u32,
    ) -> Result<Self, ProtocolError> {
        let seq = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if len > max_chunk {
            return Err(ProtocolError::LengthExceedsChunk {
                len,
                max: max_chunk,
            });
        }
        Ok(Self { seq, len })
    }
}
