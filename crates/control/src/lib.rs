#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `control` maintains the long-lived auxiliary connection beside the data
//! path. On it the agent sends keepalive pings (measuring an RTT EWMA from
//! the echoed pongs), periodic progress, system-statistics, and auto-scaler
//! reports, and the explicit ingestion-done marker; the server sends pongs
//! with its own gauges, flow-rotation requests, and session admission
//! verdicts.
//!
//! # Design
//!
//! The channel owns two sub-tasks sharing a write lock on the connection: a
//! periodic writer ticking at the keepalive interval and a framed reader
//! dispatching on magic. A supervisor thread reconnects with exponential
//! backoff whenever either side fails. [`ControlChannel::stop`] closes the
//! connection *first* so a blocked read returns immediately, then joins the
//! sub-tasks, then clears the connection and parks the state at
//! disconnected — stopping is bounded no matter what the channel was doing.

mod channel;
mod error;

pub use channel::{ControlChannel, ControlConfig, LinkState, MetricsProvider};
pub use error::ControlError;
