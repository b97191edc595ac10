#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `protocol` defines the wire format spoken between the backup agent and the
//! storage server: the session handshake and its acknowledgement, the resume
//! exchange, selective acknowledgements for both the single-stream and the
//! parallel data paths, the chunk framing used by parallel streams, the
//! trailer carrying the end-to-end checksum, the out-of-band control frames,
//! and the degenerate health-check probe.
//!
//! # Design
//!
//! All integers are big-endian. Frame magics are four ASCII bytes. Variable
//! fields are UTF-8 lines terminated by a single `\n` and bounded by
//! [`MAX_LINE_LEN`]; readers enforce the bound before allocating so hostile
//! peers cannot force unbounded memory growth. Frames sent by the agent carry
//! a magic; acknowledgement frames sent by the server are expected in
//! context and carry none. Every frame is a plain struct with `encode`/
//! `decode` methods over [`std::io::Write`]/[`std::io::Read`], so the codec
//! has no opinion about the transport underneath.
//!
//! # Errors
//!
//! All operations return [`ProtocolError`]. Truncated frames, bad magics,
//! unsupported versions, over-long lines, and out-of-range status bytes each
//! map to a distinct variant so callers can decide between retrying,
//! reconnecting, and aborting the session.

mod control;
mod error;
mod frames;
mod health;
mod status;
mod wire;

pub use control::{
    AutoScaleStats, ControlFrame, ControlHello, Ping, Pong, Progress, RotateAck, StatsSample,
    read_control_frame, write_ingestion_done, write_rotate_ack,
};
pub use error::ProtocolError;
pub use frames::{
    CHUNK_HEADER_LEN, ChunkHeader, ChunkSack, FinalAck, Handshake, HandshakeAck, ParallelAck,
    ParallelInit, ParallelJoin, Resume, ResumeAck, Sack, Trailer,
};
pub use health::{HealthResponse, HealthStatus, read_health_response, write_health_probe};
pub use status::{Compression, FinalStatus, HandshakeStatus, ParallelJoinStatus, ResumeStatus};

/// Protocol version spoken by this agent. Version 4 added the negotiated
/// compression byte to the handshake acknowledgement.
pub const PROTOCOL_VERSION: u8 = 4;

/// Oldest protocol version whose acknowledgements we still parse.
pub const MIN_PROTOCOL_VERSION: u8 = 3;

/// Upper bound on any line-delimited field, in bytes (excluding the `\n`).
pub const MAX_LINE_LEN: usize = 512;

/// Smallest negotiable chunk size for parallel sessions (64 KiB).
pub const MIN_CHUNK_SIZE: u32 = 64 * 1024;

/// Largest negotiable chunk size for parallel sessions (16 MiB).
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Four-byte ASCII frame magics.
pub mod magic {
    /// Session handshake, client to server.
    pub const HANDSHAKE: [u8; 4] = *b"NBKP";
    /// Resume request, client to server.
    pub const RESUME: [u8; 4] = *b"RSME";
    /// Single-stream selective acknowledgement, server to client.
    pub const SACK: [u8; 4] = *b"SACK";
    /// Data trailer, client to server.
    pub const TRAILER: [u8; 4] = *b"DONE";
    /// Parallel stream join, client to server.
    pub const PARALLEL_JOIN: [u8; 4] = *b"PJIN";
    /// Per-stream chunk acknowledgement, server to client.
    pub const CHUNK_SACK: [u8; 4] = *b"CSAK";
    /// Control channel hello, client to server.
    pub const CONTROL: [u8; 4] = *b"CTRL";
    /// Keepalive ping (client to server) and pong (server to client).
    pub const CONTROL_PING: [u8; 4] = *b"CPNG";
    /// Server-initiated flow rotation request.
    pub const CONTROL_ROTATE: [u8; 4] = *b"CROT";
    /// Rotation acknowledgement, client to server.
    pub const CONTROL_ROTATE_ACK: [u8; 4] = *b"CRAK";
    /// Session admission, server to client.
    pub const CONTROL_ADMIT: [u8; 4] = *b"CADM";
    /// Session deferral, server to client.
    pub const CONTROL_DEFER: [u8; 4] = *b"CDFE";
    /// Session abort, server to client.
    pub const CONTROL_ABORT: [u8; 4] = *b"CABT";
    /// Walk progress report, client to server.
    pub const CONTROL_PROGRESS: [u8; 4] = *b"CPRG";
    /// System statistics report, client to server.
    pub const CONTROL_STATS: [u8; 4] = *b"CSTS";
    /// Auto-scaler snapshot report, client to server.
    pub const CONTROL_AUTOSCALE: [u8; 4] = *b"CASS";
    /// Explicit end-of-ingestion marker, client to server.
    pub const CONTROL_INGESTION_DONE: [u8; 4] = *b"CIDN";
    /// Health-check probe, client to server.
    pub const HEALTH: [u8; 4] = *b"PING";
}
