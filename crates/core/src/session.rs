//! One backup run: handshake, data path, control channel, trailer.

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bandwidth::{LimitedWriter, RateLimiter};
use control::{ControlChannel, ControlConfig, MetricsProvider};
use engine::{
    AutoScaler, Dispatcher, DispatcherConfig, EngineError, RateCounters, ScaleSnapshot,
    SingleConfig, SingleSender,
};
use filters::ExcludeSet;
use pipeline::{StreamResult, stream_archive};
use protocol::{
    Compression, FinalAck, FinalStatus, Handshake, HandshakeAck, HandshakeStatus, PROTOCOL_VERSION,
    ParallelInit, Trailer,
};
use tracing::{info, warn};
use transport::{CancelToken, Connection, Dialer, TlsClient};
use walk::Scanner;

use crate::config::Config;
use crate::error::BackupError;
use crate::job::BackupEntry;
use crate::progress::{NullProgress, Progress};
use crate::CLIENT_VERSION;

/// How long a session waits for an admission verdict before assuming the
/// server does not implement flow control.
const ADMISSION_GRACE: Duration = Duration::from_millis(500);

/// Terminal accounting of one successful run.
#[derive(Clone, Copy, Debug)]
pub struct BackupSummary {
    /// Compressed bytes streamed to the server.
    pub bytes: u64,
    /// Objects archived.
    pub objects: u64,
    /// SHA-256 over the compressed stream, as carried by the trailer.
    pub sha256: [u8; 32],
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// Round-trip time of the session handshake.
    pub handshake_rtt: Duration,
}

/// Runs one backup entry to completion.
pub fn run_backup(
    config: &Config,
    entry: &BackupEntry,
    progress: Option<Arc<dyn Progress>>,
) -> Result<BackupSummary, BackupError> {
    run_backup_with_cancel(config, entry, progress, &CancelToken::new())
}

/// Runs one backup entry under an externally owned cancellation token.
pub fn run_backup_with_cancel(
    config: &Config,
    entry: &BackupEntry,
    progress: Option<Arc<dyn Progress>>,
    cancel: &CancelToken,
) -> Result<BackupSummary, BackupError> {
    run_backup_observed(config, entry, progress, None, cancel)
}

/// Runs one backup entry with the full observer surface: a progress
/// reporter and a system-metrics provider feeding the control channel's
/// `CSTS` frames.
pub fn run_backup_observed(
    config: &Config,
    entry: &BackupEntry,
    progress: Option<Arc<dyn Progress>>,
    metrics: Option<Arc<dyn MetricsProvider>>,
    cancel: &CancelToken,
) -> Result<BackupSummary, BackupError> {
    let client = Arc::new(TlsClient::new(config.tls())?);
    let addr = config.server_addr().to_owned();
    let dscp = config.dscp();
    let dialer: Arc<dyn Dialer> = Arc::new(move || client.connect(&addr, dscp));
    run_session_observed(config, entry, progress, metrics, cancel, dialer)
}

/// Shared session state mirrored into the control channel's reports.
struct WalkProgress {
    discovered: AtomicU32,
    sent: AtomicU32,
    complete: AtomicBool,
}

/// Runs a session over an externally supplied dialer.
///
/// This is the wiring [`run_backup_with_cancel`] uses underneath the TLS
/// client; it is exposed for embedding and integration tests that drive
/// the protocol over their own transport.
#[doc(hidden)]
pub fn run_session(
    config: &Config,
    entry: &BackupEntry,
    progress: Option<Arc<dyn Progress>>,
    cancel: &CancelToken,
    dialer: Arc<dyn Dialer>,
) -> Result<BackupSummary, BackupError> {
    run_session_observed(config, entry, progress, None, cancel, dialer)
}

fn run_session_observed(
    config: &Config,
    entry: &BackupEntry,
    progress: Option<Arc<dyn Progress>>,
    metrics: Option<Arc<dyn MetricsProvider>>,
    cancel: &CancelToken,
    dialer: Arc<dyn Dialer>,
) -> Result<BackupSummary, BackupError> {
    let started = Instant::now();
    let progress = progress.unwrap_or_else(|| Arc::new(NullProgress));

    // Handshake on the session's primary connection.
    let conn = dialer.dial()?;
    let handshake_started = Instant::now();
    Handshake {
        agent_name: config.agent_name().to_owned(),
        storage_name: config.storage_name().to_owned(),
        backup_name: entry.name.clone(),
        client_version: CLIENT_VERSION.to_owned(),
        parallel: (config.max_streams() > 0).then(|| ParallelInit {
            max_streams: config.max_streams(),
            chunk_size: config.chunk_size(),
        }),
    }
    .encode(&mut &conn)?;
    let ack = HandshakeAck::decode(&mut &conn, PROTOCOL_VERSION)?;
    let handshake_rtt = handshake_started.elapsed();
    if ack.status != HandshakeStatus::Ok {
        return Err(EngineError::HandshakeRejected {
            status: ack.status,
            message: ack.message,
        }
        .into());
    }
    let session_id = ack.session_id;
    let compression = ack.compression;
    info!(
        session = %session_id,
        ?compression,
        streams = config.max_streams(),
        "session established"
    );

    // Control channel beside the data path.
    let control = ControlChannel::new(
        ControlConfig {
            keepalive: config.keepalive(),
            reconnect_initial: config.reconnect_initial(),
            reconnect_max: config.reconnect_max(),
            client_version: CLIENT_VERSION.to_owned(),
        },
        Arc::clone(&dialer),
    );
    if let Some(metrics) = metrics {
        control.set_metrics(metrics);
    }
    let walk_progress = Arc::new(WalkProgress {
        discovered: AtomicU32::new(0),
        sent: AtomicU32::new(0),
        complete: AtomicBool::new(false),
    });
    let counters = Arc::new(RateCounters::new());
    {
        let walk_progress = Arc::clone(&walk_progress);
        let counters = Arc::clone(&counters);
        let progress = Arc::clone(&progress);
        let reported_retries = AtomicU64::new(0);
        control.set_progress(Arc::new(move || {
            // Piggyback retry deltas onto the periodic report.
            let retries = counters.retries();
            let seen = reported_retries.swap(retries, Ordering::Relaxed);
            for _ in seen..retries {
                progress.add_retry();
            }
            protocol::Progress {
                total_objects: walk_progress.discovered.load(Ordering::Relaxed),
                objects_sent: walk_progress.sent.load(Ordering::Relaxed),
                walk_complete: walk_progress.complete.load(Ordering::Relaxed),
            }
        }));
    }
    control.start();
    match control.await_admission(ADMISSION_GRACE) {
        Ok(()) => {}
        Err(err) => {
            control.stop();
            return Err(err.into());
        }
    }

    // Scanner feeding the archive pipeline over a bounded channel.
    let excludes = ExcludeSet::compile(&entry.excludes)?;
    let scanner = Scanner::new(entry.sources.clone(), excludes).with_cancel(cancel.flag());
    let (entries_rx, walk_handle) = scanner.spawn();

    let limiter =
        RateLimiter::from_rate(config.bandwidth_limit()).map(|l| l.with_cancel(cancel.flag()));

    let data_result = if config.max_streams() == 0 {
        run_single(
            config,
            &session_id,
            compression,
            conn,
            Arc::clone(&dialer),
            Arc::clone(&counters),
            limiter,
            Arc::clone(&progress),
            cancel,
            entries_rx,
            &walk_progress,
        )
    } else {
        run_parallel(
            config,
            &session_id,
            compression,
            &conn,
            Arc::clone(&dialer),
            Arc::clone(&counters),
            limiter,
            Arc::clone(&progress),
            cancel,
            entries_rx,
            &walk_progress,
            &control,
        )
    };

    // The walk must have completed for the archive to be whole.
    let walk_result = walk_handle.join().unwrap_or(Err(walk::WalkError::Cancelled));
    let data_result = match (data_result, walk_result) {
        (Ok(result), Ok(stats)) => {
            info!(objects = stats.objects, skipped = stats.skipped, "walk complete");
            Ok(result)
        }
        (Ok(_), Err(err)) => Err(err.into()),
        (Err(err), _) => Err(err),
    };

    let outcome = match data_result {
        Ok(stream_result) => {
            if let Err(err) = control.send_ingestion_done() {
                warn!(error = %err, "ingestion-done not delivered");
            }
            Ok(BackupSummary {
                bytes: stream_result.bytes,
                objects: u64::from(walk_progress.sent.load(Ordering::Relaxed)),
                sha256: stream_result.sha256,
                duration: started.elapsed(),
                handshake_rtt,
            })
        }
        Err(err) => Err(err),
    };
    control.stop();
    outcome
}

/// `Write` wrapper pushing byte progress to the reporter.
struct ProgressWriter<W> {
    inner: W,
    progress: Arc<dyn Progress>,
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.progress.add_bytes(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[allow(clippy::too_many_arguments)]
fn run_single(
    config: &Config,
    session_id: &str,
    compression: Compression,
    conn: Connection,
    dialer: Arc<dyn Dialer>,
    counters: Arc<RateCounters>,
    limiter: Option<RateLimiter>,
    progress: Arc<dyn Progress>,
    cancel: &CancelToken,
    entries_rx: crossbeam_channel::Receiver<walk::ScanEntry>,
    walk_progress: &Arc<WalkProgress>,
) -> Result<StreamResult, BackupError> {
    let sender = SingleSender::new(
        SingleConfig {
            session_id: session_id.to_owned(),
            agent_name: config.agent_name().to_owned(),
            storage_name: config.storage_name().to_owned(),
            ring_capacity: config.ring_capacity(),
            retry: config.retry(),
        },
        conn,
        dialer,
        Arc::clone(&counters),
        cancel.clone(),
    );
    progress.set_streams(1);

    let producer = {
        let ring = sender.ring();
        let dest = ProgressWriter {
            inner: LimitedWriter::new(sender.producer_writer(), limiter),
            progress: Arc::clone(&progress),
        };
        let walk_progress = Arc::clone(walk_progress);
        let progress = Arc::clone(&progress);
        let entries = entries_rx.into_iter().inspect({
            let walk_progress = Arc::clone(&walk_progress);
            let progress = Arc::clone(&progress);
            move |_| {
                let total = walk_progress.discovered.fetch_add(1, Ordering::Relaxed) + 1;
                progress.set_totals(u64::from(total));
            }
        });
        thread::Builder::new()
            .name("nbackup-producer".into())
            .spawn(move || {
                let result = stream_archive(entries, compression, dest, |_| {
                    walk_progress.sent.fetch_add(1, Ordering::Relaxed);
                    progress.add_object();
                });
                walk_progress.complete.store(true, Ordering::Relaxed);
                ring.close();
                result
            })
            .expect("spawning the producer cannot fail")
    };

    let run_result = sender.run();
    // The producer may still be blocked on backpressure after a sender
    // failure; the close releases it either way.
    sender.ring().close();
    let produce_result = producer
        .join()
        .map_err(|_| BackupError::Cancelled)
        .and_then(|r| r.map_err(BackupError::from));

    run_result.map_err(BackupError::from)?;
    let stream_result = produce_result?;
    sender.finish(stream_result.sha256, stream_result.bytes)?;
    Ok(stream_result)
}

#[allow(clippy::too_many_arguments)]
fn run_parallel(
    config: &Config,
    session_id: &str,
    compression: Compression,
    conn: &Connection,
    dialer: Arc<dyn Dialer>,
    counters: Arc<RateCounters>,
    limiter: Option<RateLimiter>,
    progress: Arc<dyn Progress>,
    cancel: &CancelToken,
    entries_rx: crossbeam_channel::Receiver<walk::ScanEntry>,
    walk_progress: &Arc<WalkProgress>,
    control: &ControlChannel,
) -> Result<StreamResult, BackupError> {
    let dispatcher = Dispatcher::new(
        DispatcherConfig {
            session_id: session_id.to_owned(),
            max_streams: config.max_streams(),
            chunk_size: config.chunk_size() as usize,
            ring_capacity: config.ring_capacity(),
            retry: config.retry(),
        },
        Arc::clone(&dialer),
        Arc::clone(&counters),
        cancel.clone(),
    );

    // With scaling enabled the session starts narrow and the scaler grows
    // it; with scaling disabled every configured stream joins up front.
    let initial = if config.scaler().enabled {
        1
    } else {
        config.max_streams()
    };
    for index in 0..initial {
        dispatcher.activate_stream(index)?;
    }
    progress.set_streams(dispatcher.active_count());

    // Server-initiated rotation re-joins the stream on a fresh connection.
    {
        let dispatcher = dispatcher.clone();
        control.on_rotate(Arc::new(move |index| {
            if let Err(err) = dispatcher.activate_stream(index) {
                warn!(stream = index, error = %err, "rotation failed");
            }
        }));
    }

    // Auto-scaler and its snapshot feed for the control channel.
    let scaler = Arc::new(AutoScaler::new(
        config.scaler().to_engine(),
        Arc::new(dispatcher.clone()),
        Arc::clone(&counters),
    ));
    {
        let scaler = Arc::clone(&scaler);
        let dispatcher = dispatcher.clone();
        let progress = Arc::clone(&progress);
        let last_active = AtomicU8::new(dispatcher.active_count());
        control.set_scale_stats(Arc::new(move || {
            let active = dispatcher.active_count();
            if last_active.swap(active, Ordering::Relaxed) != active {
                progress.set_streams(active);
            }
            snapshot_to_wire(scaler.snapshot())
        }));
    }
    let scaler_stop = CancelToken::new();
    let scaler_thread = {
        let scaler = Arc::clone(&scaler);
        let scaler_stop = scaler_stop.clone();
        thread::Builder::new()
            .name("nbackup-scaler".into())
            .spawn(move || scaler.run(&scaler_stop))
            .expect("spawning the scaler cannot fail")
    };

    // Producer drives the archive into the dispatcher.
    let producer = {
        let dispatcher = dispatcher.clone();
        let dest = ProgressWriter {
            inner: LimitedWriter::new(dispatcher.writer(), limiter),
            progress: Arc::clone(&progress),
        };
        let walk_progress = Arc::clone(walk_progress);
        let progress = Arc::clone(&progress);
        let entries = entries_rx.into_iter().inspect({
            let walk_progress = Arc::clone(&walk_progress);
            let progress = Arc::clone(&progress);
            move |_| {
                let total = walk_progress.discovered.fetch_add(1, Ordering::Relaxed) + 1;
                progress.set_totals(u64::from(total));
            }
        });
        thread::Builder::new()
            .name("nbackup-producer".into())
            .spawn(move || {
                let archive_result = stream_archive(entries, compression, dest, |_| {
                    walk_progress.sent.fetch_add(1, Ordering::Relaxed);
                    progress.add_object();
                });
                walk_progress.complete.store(true, Ordering::Relaxed);
                let close_result = dispatcher.close();
                (archive_result, close_result)
            })
            .expect("spawning the producer cannot fail")
    };

    // The drain wait goes first: its watcher closes every ring on
    // cancellation, which is also what unblocks a backpressured producer.
    let drain_result = dispatcher.wait_all_senders(None);
    let produce_result = producer.join().map_err(|_| BackupError::Cancelled);

    scaler_stop.cancel();
    let _ = scaler_thread.join();

    for (index, err) in dispatcher.take_dead_errors() {
        warn!(stream = index, error = %err, "stream died during session");
    }

    let outcome = (|| -> Result<StreamResult, BackupError> {
        let (archive_result, close_result) = produce_result?;
        drain_result?;
        let stream_result = archive_result?;
        close_result?;

        // The trailer travels on the quiet primary connection, not on any
        // chunk stream.
        Trailer {
            sha256: stream_result.sha256,
            size: stream_result.bytes,
        }
        .encode(&mut &*conn)?;
        let final_ack = FinalAck::decode(&mut &*conn)?;
        match final_ack.status {
            FinalStatus::Ok => Ok(stream_result),
            FinalStatus::ChecksumMismatch => Err(EngineError::ChecksumMismatch.into()),
            FinalStatus::WriteError => Err(EngineError::ServerWriteError.into()),
        }
    })();

    dispatcher.shutdown();
    outcome
}

fn snapshot_to_wire(snapshot: ScaleSnapshot) -> protocol::AutoScaleStats {
    protocol::AutoScaleStats {
        efficiency: snapshot.efficiency as f32,
        producer_mbs: (snapshot.producer_bps / 1_000_000.0) as f32,
        drain_mbs: (snapshot.drain_bps / 1_000_000.0) as f32,
        active_streams: snapshot.active_streams,
        max_streams: snapshot.max_streams,
        state: snapshot.state.to_wire(),
        probe_active: snapshot.probe_active,
    }
}
