//! Drives scanner entries through the tar/compression/tee write chain.

use std::fs::File;
use std::io::{self, Read, Write};

use protocol::Compression;
use tar::{Builder, EntryType, Header, HeaderMode};
use tracing::debug;
use walk::{EntryKind, ScanEntry};

use crate::codec::CountingEncoder;
use crate::tee::DigestWriter;

/// Error produced when the archive pipeline fails.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The write chain (tar, compressor, or destination) failed.
    #[error("archive pipeline failed: {0}")]
    Io(#[from] io::Error),
}

/// Final accounting for one produced archive stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamResult {
    /// SHA-256 over the compressed byte stream.
    pub sha256: [u8; 32],
    /// Total compressed bytes written to the destination.
    pub bytes: u64,
}

/// Streams `entries` as a compressed tar archive into `dest`.
///
/// `on_object` is invoked once per entry actually appended, which feeds the
/// progress reporter and the control channel's walk statistics. The returned
/// [`StreamResult`] covers the compressed bytes, trailer included.
pub fn stream_archive<W, I>(
    entries: I,
    variant: Compression,
    dest: W,
    mut on_object: impl FnMut(&ScanEntry),
) -> Result<StreamResult, PipelineError>
where
    W: Write,
    I: IntoIterator<Item = ScanEntry>,
{
    let tee = DigestWriter::new(dest);
    let encoder = CountingEncoder::new(variant, tee)?;
    let mut builder = Builder::new(encoder);

    for entry in entries {
        if append_entry(&mut builder, &entry)? {
            on_object(&entry);
        }
    }

    let encoder = builder.into_inner()?;
    let tee = encoder.finish()?;
    let (mut dest, sha256, bytes) = tee.finalize();
    dest.flush()?;
    Ok(StreamResult { sha256, bytes })
}

/// Appends one entry, returning `false` when it was skipped.
fn append_entry<W: Write>(
    builder: &mut Builder<W>,
    entry: &ScanEntry,
) -> Result<bool, PipelineError> {
    match entry.kind {
        EntryKind::Directory => {
            let Ok(meta) = std::fs::symlink_metadata(&entry.path) else {
                debug!(path = %entry.path.display(), "directory vanished before archiving");
                return Ok(false);
            };
            let mut header = Header::new_gnu();
            header.set_metadata_in_mode(&meta, HeaderMode::Complete);
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, &entry.rel, io::empty())?;
            Ok(true)
        }
        EntryKind::File => {
            // Open first, stat through the descriptor: the header must
            // describe the object we read, not whatever the path points at
            // by the time we stat it.
            let file = match File::open(&entry.path) {
                Ok(file) => file,
                Err(err) => {
                    debug!(path = %entry.path.display(), error = %err, "file vanished before archiving");
                    return Ok(false);
                }
            };
            let meta = file.metadata()?;
            let size = meta.len();
            let mut header = Header::new_gnu();
            header.set_metadata_in_mode(&meta, HeaderMode::Complete);
            header.set_size(size);
            let body = ExactSizeReader::new(file.take(size), size);
            builder.append_data(&mut header, &entry.rel, body)?;
            Ok(true)
        }
        EntryKind::Symlink => {
            let target = match std::fs::read_link(&entry.path) {
                Ok(target) => target,
                Err(err) => {
                    debug!(path = %entry.path.display(), error = %err, "skipping unreadable symlink");
                    return Ok(false);
                }
            };
            let Ok(meta) = std::fs::symlink_metadata(&entry.path) else {
                return Ok(false);
            };
            let mut header = Header::new_gnu();
            header.set_metadata_in_mode(&meta, HeaderMode::Complete);
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, &entry.rel, &target)?;
            Ok(true)
        }
    }
}

/// Reader yielding exactly `size` bytes: reads are bounded by the inner
/// `Take` so a growing file cannot overrun its header, and early EOF from a
/// shrinking file is zero-padded so the archive stays well-formed.
struct ExactSizeReader<R> {
    inner: R,
    remaining: u64,
    padding: bool,
}

impl<R: Read> ExactSizeReader<R> {
    fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            remaining: size,
            padding: false,
        }
    }
}

impl<R: Read> Read for ExactSizeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        if !self.padding {
            let n = self.inner.read(&mut buf[..want])?;
            if n > 0 {
                self.remaining -= n as u64;
                return Ok(n);
            }
            self.padding = true;
        }
        for byte in &mut buf[..want] {
            *byte = 0;
        }
        self.remaining -= want as u64;
        Ok(want)
    }
}
