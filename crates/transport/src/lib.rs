#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `transport` owns everything between the session logic and the operating
//! system: TCP connection establishment with DSCP marking, the TLS 1.3
//! client with mutual certificate verification, a full-duplex
//! [`Connection`] wrapper safe for one reader and one writer thread, the
//! exponential-backoff [`RetryPolicy`], the cooperative [`CancelToken`],
//! and the single-shot health-check probe.
//!
//! # Design
//!
//! The data path runs on plain blocking sockets. Write deadlines
//! ([`WRITE_DEADLINE`]) are armed on every socket so a half-open peer is
//! detected as a timed-out write rather than an eternal hang; read
//! timeouts are left to the caller because the two consumers want
//! different things (the ack reader blocks until shutdown, the control
//! channel times out to count missed reads). Closing a connection shuts
//! the socket down in both directions, which doubles as the wakeup signal
//! for any thread blocked inside a read.

mod cancel;
mod conn;
mod dialer;
mod dscp;
mod error;
mod health;
mod retry;
mod tls;

pub use cancel::CancelToken;
pub use conn::Connection;
pub use dialer::Dialer;
pub use dscp::Dscp;
pub use error::TransportError;
pub use health::health_check;
pub use retry::{Backoff, RetryPolicy};
pub use tls::{TlsClient, TlsSettings};

use std::time::Duration;

/// Deadline armed on every socket write to detect half-open connections.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(30);
