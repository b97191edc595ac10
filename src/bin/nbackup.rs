#![deny(unsafe_code)]

//! Thin agent binary: builds a configuration from the command line and
//! runs each requested backup entry. Scheduling, config files, and signal
//! handling belong to the surrounding daemon, not this shim.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use core::{BackupEntry, BackupJob, Config, JobStatus, LastRun, run_backup};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const USAGE: &str = "usage: nbackup <server:port> <agent> <storage> <backup-name> <source>...";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 5 {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    }

    let config = match Config::builder(&args[0], &args[1], &args[2]).build() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration rejected");
            return ExitCode::FAILURE;
        }
    };
    let entry = BackupEntry {
        name: args[3].clone(),
        sources: args[4..].iter().map(PathBuf::from).collect(),
        excludes: Vec::new(),
    };
    let job = BackupJob::new(entry);

    let started = std::time::Instant::now();
    match run_backup(&config, job.entry(), Some(Arc::new(core::NullProgress))) {
        Ok(summary) => {
            job.record(LastRun {
                status: JobStatus::Success,
                duration: summary.duration,
                bytes: summary.bytes,
                objects: summary.objects,
                handshake_rtt: summary.handshake_rtt,
                error: None,
            });
            info!(
                bytes = summary.bytes,
                objects = summary.objects,
                secs = summary.duration.as_secs(),
                "backup complete"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            job.record(LastRun {
                status: if err.is_cancelled() {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Failed
                },
                duration: started.elapsed(),
                bytes: 0,
                objects: 0,
                handshake_rtt: std::time::Duration::ZERO,
                error: Some(err.to_string()),
            });
            error!(error = %err, "backup failed");
            ExitCode::FAILURE
        }
    }
}
