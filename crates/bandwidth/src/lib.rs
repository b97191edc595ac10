#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `bandwidth` paces the backup data path with a token-bucket style limiter.
//! The limiter accumulates a byte *debt* as writes are registered and sleeps
//! once the debt translates into a long-enough delay at the configured rate,
//! mirroring upstream pacing behaviour: short writes proceed unhindered,
//! sustained throughput converges on the configured bytes-per-second, and
//! bursts never exceed [`MAX_BURST_BYTES`].
//!
//! A rate of zero disables pacing entirely; [`RateLimiter::from_rate`]
//! returns `None` in that case so callers can skip the wrapper. Sleeps are
//! sliced and re-check a shared cancellation flag so a stopping session is
//! never stuck inside the limiter.

mod limiter;
mod writer;

pub use limiter::{LimiterSleep, MAX_BURST_BYTES, RateLimiter};
pub use writer::LimitedWriter;
