#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `walk` produces the ordered entry stream the archive pipeline consumes.
//! Each configured source root is walked depth-first with directory entries
//! sorted by name, so two walks over an unchanged tree yield the same
//! sequence and therefore the same archive bytes. Excluded entries are
//! dropped before they are emitted and excluded directories are pruned from
//! descent. Unreadable entries are skipped without failing the walk, and a
//! cooperative cancellation flag is checked at every directory step.
//!
//! The scanner either drives a callback in the calling thread
//! ([`Scanner::scan`]) or runs on its own thread feeding a bounded channel
//! ([`Scanner::spawn`]), which is how the backup session wires it to the tar
//! producer: the channel bound provides natural backpressure between
//! filesystem traversal and archive emission.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, bounded};
use filters::ExcludeSet;
use tracing::debug;

/// Entry stream channel depth; bounds how far the walk runs ahead of the
/// archive producer.
const CHANNEL_DEPTH: usize = 256;

/// Errors surfaced by a walk.
#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    /// The cancellation flag was raised mid-walk.
    #[error("filesystem walk cancelled")]
    Cancelled,
    /// A source root could not be inspected at all.
    #[error("source root '{root}' is not accessible: {source}")]
    RootUnreadable {
        /// The configured root path.
        root: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

/// Kind of filesystem object an entry describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// A directory.
    Directory,
    /// A regular file.
    File,
    /// A symbolic link (never followed).
    Symlink,
}

/// One filesystem object selected for archiving.
#[derive(Clone, Debug)]
pub struct ScanEntry {
    /// Absolute path on the local filesystem.
    pub path: PathBuf,
    /// Archive-relative path: the root's name followed by the path below it.
    pub rel: PathBuf,
    /// Object kind, from a non-following stat.
    pub kind: EntryKind,
}

/// Aggregate result of a completed walk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Entries emitted (directories included).
    pub objects: u64,
    /// Entries skipped because they were unreadable or of an unsupported
    /// kind.
    pub skipped: u64,
}

/// Recursive scanner over a set of source roots.
pub struct Scanner {
    roots: Vec<PathBuf>,
    excludes: ExcludeSet,
    cancel: Arc<AtomicBool>,
}

impl Scanner {
    /// Creates a scanner over `roots` filtered by `excludes`.
    #[must_use]
    pub fn new(roots: Vec<PathBuf>, excludes: ExcludeSet) -> Self {
        Self {
            roots,
            excludes,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replaces the cancellation flag with a shared one.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Walks all roots, invoking `sink` for every selected entry.
    pub fn scan(&self, sink: &mut dyn FnMut(ScanEntry)) -> Result<ScanStats, WalkError> {
        let mut stats = ScanStats::default();
        for root in &self.roots {
            self.scan_root(root, sink, &mut stats)?;
        }
        Ok(stats)
    }

    /// Spawns the walk on its own thread, returning the bounded entry
    /// channel and the join handle carrying the final statistics.
    #[must_use]
    pub fn spawn(self) -> (Receiver<ScanEntry>, thread::JoinHandle<Result<ScanStats, WalkError>>) {
        let (tx, rx) = bounded(CHANNEL_DEPTH);
        let handle = thread::Builder::new()
            .name("nbackup-walk".into())
            .spawn(move || {
                self.scan(&mut |entry| {
                    // A closed receiver means the consumer is gone; raising
                    // the cancel flag ends the walk at the next directory.
                    if tx.send(entry).is_err() {
                        self.cancel.store(true, Ordering::Relaxed);
                    }
                })
            })
            .expect("spawning the walk thread cannot fail");
        (rx, handle)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn scan_root(
        &self,
        root: &Path,
        sink: &mut dyn FnMut(ScanEntry),
        stats: &mut ScanStats,
    ) -> Result<(), WalkError> {
        let meta = fs::symlink_metadata(root).map_err(|source| WalkError::RootUnreadable {
            root: root.to_path_buf(),
            source,
        })?;
        let prefix = root
            .file_name()
            .map_or_else(|| PathBuf::from("."), PathBuf::from);

        if meta.is_dir() {
            sink(ScanEntry {
                path: root.to_path_buf(),
                rel: prefix.clone(),
                kind: EntryKind::Directory,
            });
            stats.objects += 1;
            self.scan_dir(root, root, &prefix, sink, stats)
        } else {
            self.emit(root.to_path_buf(), prefix, &meta, sink, stats);
            Ok(())
        }
    }

    fn scan_dir(
        &self,
        root: &Path,
        dir: &Path,
        prefix: &Path,
        sink: &mut dyn FnMut(ScanEntry),
        stats: &mut ScanStats,
    ) -> Result<(), WalkError> {
        if self.cancelled() {
            return Err(WalkError::Cancelled);
        }

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %dir.display(), error = %err, "skipping unreadable directory");
                stats.skipped += 1;
                return Ok(());
            }
        };
        let mut names: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.file_name()))
            .collect();
        names.sort_unstable();

        for name in names {
            let path = dir.join(&name);
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "skipping unreadable entry");
                    stats.skipped += 1;
                    continue;
                }
            };
            let match_rel = match path.strip_prefix(root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            let is_dir = meta.is_dir();
            if self.excludes.matches(&slash_path(&match_rel), is_dir) {
                continue;
            }
            let rel = prefix.join(&match_rel);
            if is_dir {
                sink(ScanEntry {
                    path: path.clone(),
                    rel,
                    kind: EntryKind::Directory,
                });
                stats.objects += 1;
                self.scan_dir(root, &path, prefix, sink, stats)?;
            } else {
                self.emit(path, rel, &meta, sink, stats);
            }
        }
        Ok(())
    }

    fn emit(
        &self,
        path: PathBuf,
        rel: PathBuf,
        meta: &fs::Metadata,
        sink: &mut dyn FnMut(ScanEntry),
        stats: &mut ScanStats,
    ) {
        let kind = if meta.file_type().is_symlink() {
            EntryKind::Symlink
        } else if meta.is_file() {
            EntryKind::File
        } else {
            // Sockets, FIFOs, and device nodes have no place in the archive.
            stats.skipped += 1;
            return;
        };
        sink(ScanEntry { path, rel, kind });
        stats.objects += 1;
    }
}

/// Normalises a relative path into `/`-separated form for matching.
fn slash_path(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}
