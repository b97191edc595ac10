#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `buffer` implements the offset-addressed ring buffer that sits between the
//! archive pipeline and every network sender. The buffer is a fixed-capacity
//! circular byte store keyed by monotonically increasing *absolute* offsets:
//! `head` is the next write position in the logical stream and `tail` the
//! oldest byte still retained. Writers block when the buffer is full
//! (backpressure), readers block when their offset has not been produced yet,
//! and acknowledgement handling advances `tail` so capacity is released only
//! once the remote end has confirmed receipt. Because offsets never reset,
//! "is the data at offset X still here?" is a plain range check independent
//! of wrap-around arithmetic, which is what makes resume-after-reconnect
//! straightforward for the senders built on top.
//!
//! # Invariants
//!
//! - `tail <= head` and `head - tail <= capacity` at all times.
//! - The physical index of absolute offset `x` is `x % capacity`.
//! - `advance` is monotone: a smaller offset than the current tail is ignored,
//!   and the tail never moves past `head`.
//! - Close is terminal; both waiter classes are woken and all subsequent
//!   blocking calls return promptly.
//!
//! # Errors
//!
//! [`BufferError::OffsetExpired`] reports unrecoverable loss of history for a
//! consumer (its offset fell behind `tail`); callers treat the owning stream
//! as permanently dead. [`BufferError::Closed`] reports terminal shutdown and
//! carries the number of bytes a writer managed to store before the close.

use std::sync::{Condvar, Mutex};

mod ring;

pub use ring::RingBuffer;

/// Errors surfaced by [`RingBuffer`] operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// The buffer was closed. For writes, `written` counts the bytes stored
    /// before the close was observed; for reads it is zero.
    #[error("ring buffer closed ({written} bytes written before close)")]
    Closed {
        /// Bytes successfully written before the close was observed.
        written: usize,
    },
    /// The requested offset is older than the current tail, meaning the data
    /// has been released and can never be read again.
    #[error("offset {offset} expired: oldest retained offset is {tail}")]
    OffsetExpired {
        /// The offset the caller asked for.
        offset: u64,
        /// The oldest offset still retained when the request was made.
        tail: u64,
    },
}

impl BufferError {
    /// Returns `true` when the error is terminal buffer shutdown.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// Returns `true` when the error reports expired producer history.
    #[must_use]
    pub const fn is_expired(&self) -> bool {
        matches!(self, Self::OffsetExpired { .. })
    }
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<ring::State>,
    pub(crate) not_full: Condvar,
    pub(crate) not_empty: Condvar,
}
