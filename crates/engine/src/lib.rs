#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `engine` moves the archive byte stream onto the network. Three layers
//! share this crate:
//!
//! - the **single-stream sender** ([`single::SingleSender`]): one ring
//!   buffer between the archive producer and a network writer, selective
//!   acknowledgements advancing the tail, and reconnect-with-resume on
//!   transport failure;
//! - the **parallel dispatcher** ([`dispatch::Dispatcher`]): frames the
//!   stream into globally-sequenced chunks, fans them out round-robin over
//!   per-stream ring buffers, runs a resumable sender and ack reader per
//!   stream, and can retransmit any chunk still covered by its ring;
//! - the **auto-scaler** ([`scaler::AutoScaler`]): a periodic evaluator of
//!   producer and drain rates that activates or deactivates streams, either
//!   with classical hysteresis thresholds or by probe-and-measure.
//!
//! # Concurrency
//!
//! Per stream, the in-flight frame write is serialised by a dedicated write
//! mutex (retransmits use the same one), while the connection reference has
//! its own lock so reconnects can swap it without stalling unrelated
//! streams. The chunk map takes a reader-writer lock: emission writes,
//! retransmission reads. Sequence allocation and the round-robin cursor
//! live under a single mutex so no two chunks can share a sequence or a
//! slot. Rate and diagnostic counters are swap-and-reset atomics, giving
//! the scaler samples over disjoint windows.

mod counters;
mod dispatch;
mod error;
mod producer;
mod scaler;
mod single;
mod stream;
#[cfg(test)]
mod test_support;

pub use counters::{RateCounters, RateSample};
pub use dispatch::{DispatchWriter, Dispatcher, DispatcherConfig};
pub use error::EngineError;
pub use producer::RingWriter;
pub use transport::Dialer;
pub use scaler::{
    AutoScaler, Bottleneck, ScaleSnapshot, ScaleTarget, ScalerConfig, ScalerMode, ScalerState,
};
pub use single::{SingleConfig, SingleSender};
pub use stream::StreamStats;
