#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `pipeline` turns the scanner's entry stream into the compressed archive
//! byte stream the network senders transmit. The write chain is
//!
//! ```text
//! tar writer -> gzip/zstd counting encoder -> SHA-256 + byte-count tee -> destination
//! ```
//!
//! so the returned [`StreamResult`] describes exactly the bytes the server
//! receives: the checksum and count are taken *after* compression, which is
//! what the session trailer carries and the server verifies.
//!
//! # Design
//!
//! Regular files are opened first and then stat'ed through the descriptor,
//! so the tar header always describes the object actually being read rather
//! than a path that may have been swapped underneath us. File bodies are
//! copied through a size-bounded reader that yields exactly `header.size`
//! bytes: a file growing mid-copy cannot overrun its header, and one
//! shrinking mid-copy is zero-padded to keep the archive well-formed.
//! Entries that vanish between scan and open, and symlinks whose targets
//! cannot be read, are skipped silently.

mod archive;
mod codec;
mod tee;

pub use archive::{PipelineError, StreamResult, stream_archive};
pub use codec::CountingEncoder;
pub use tee::DigestWriter;
