#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `core` wires the backup agent together: it owns the typed
//! [`Config`] every other crate consumes, performs the session handshake,
//! selects the single-stream or parallel data path, attaches the control
//! channel and the auto-scaler, and reduces each run to exactly one
//! terminal [`BackupSummary`] or [`BackupError`] with the first underlying
//! cause preserved.
//!
//! # Design
//!
//! [`run_backup`] is the one entry point external callers use. Scheduling,
//! configuration files, and progress rendering live outside this
//! workspace; they interact with the core through [`BackupEntry`],
//! [`BackupJob`] records, the [`Progress`] reporter trait, and the
//! re-exported control-channel lifecycle.

mod config;
mod error;
mod health;
mod job;
mod progress;
mod session;

pub use config::{Config, ConfigBuilder, ScalerSettings};
pub use control::{ControlChannel, ControlConfig, LinkState, MetricsProvider};
pub use engine::{Bottleneck, ScaleSnapshot, ScalerMode, ScalerState};
pub use error::BackupError;
pub use health::check_server_health;
pub use job::{BackupEntry, BackupJob, JobStatus, LastRun};
pub use progress::{NullProgress, Progress};
pub use session::{BackupSummary, run_backup, run_backup_observed, run_backup_with_cancel};
#[doc(hidden)]
pub use session::run_session;

/// Client version line reported in handshakes and control hellos.
pub const CLIENT_VERSION: &str = concat!("nbackup/", env!("CARGO_PKG_VERSION"));
