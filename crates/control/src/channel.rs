//! Control channel lifecycle: supervisor, periodic writer, framed reader.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use protocol::{
    AutoScaleStats, ControlFrame, ControlHello, Ping, Progress, ProtocolError, StatsSample,
    read_control_frame, write_ingestion_done, write_rotate_ack,
};
use tracing::{debug, info, warn};
use transport::{CancelToken, Connection, Dialer};

use crate::error::ControlError;

/// Reads missed before the link is considered degraded.
const DEGRADED_AFTER: u32 = 3;
/// EWMA weight of a new RTT sample (alpha = 0.25 as a rational).
const RTT_ALPHA_NUM: u64 = 1;
const RTT_ALPHA_DEN: u64 = 4;

/// Control channel parameters.
#[derive(Clone, Debug)]
pub struct ControlConfig {
    /// Keepalive tick interval. The server derives its read timeout as
    /// 2.5 times this value, so the writer must tick at least that often.
    pub keepalive: Duration,
    /// First reconnect delay.
    pub reconnect_initial: Duration,
    /// Reconnect delay cap.
    pub reconnect_max: Duration,
    /// Client software version line sent in the hello.
    pub client_version: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(30),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            client_version: String::from("nbackup"),
        }
    }
}

/// Observable connection state of the channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinkState {
    /// No connection and no attempt in flight.
    #[default]
    Disconnected,
    /// Dialling or handshaking.
    Connecting,
    /// Hello accepted, sub-tasks running.
    Connected,
    /// Three or more consecutive reads failed; reconnecting.
    Degraded,
}

/// Supplier of the system gauges reported in `CSTS` frames and the hello.
pub trait MetricsProvider: Send + Sync {
    /// Samples the current system statistics.
    fn sample(&self) -> StatsSample;
}

/// Session admission directive received from the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Admission {
    Pending,
    Admitted,
    DeferredUntil(Instant),
    Aborted(u32),
}

#[derive(Default)]
struct Callbacks {
    metrics: Option<Arc<dyn MetricsProvider>>,
    progress: Option<Arc<dyn Fn() -> Progress + Send + Sync>>,
    scale: Option<Arc<dyn Fn() -> AutoScaleStats + Send + Sync>>,
    rotate: Option<Arc<dyn Fn(u8) + Send + Sync>>,
}

struct Inner {
    config: ControlConfig,
    dialer: Arc<dyn Dialer>,
    state: Mutex<LinkState>,
    conn: Mutex<Option<Arc<Connection>>>,
    write_lock: Mutex<()>,
    callbacks: Mutex<Callbacks>,
    rtt_nanos: AtomicU64,
    server_load_bits: AtomicU32,
    disk_free_mb: AtomicU32,
    missed_reads: AtomicU32,
    admission: Mutex<Admission>,
    admission_wake: Condvar,
    stop: CancelToken,
}

/// The agent side of the out-of-band control connection.
pub struct ControlChannel {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ControlChannel {
    /// Creates a stopped channel. Configure providers and callbacks, then
    /// call [`ControlChannel::start`].
    #[must_use]
    pub fn new(config: ControlConfig, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                dialer,
                state: Mutex::new(LinkState::Disconnected),
                conn: Mutex::new(None),
                write_lock: Mutex::new(()),
                callbacks: Mutex::new(Callbacks::default()),
                rtt_nanos: AtomicU64::new(0),
                server_load_bits: AtomicU32::new(0),
                disk_free_mb: AtomicU32::new(0),
                missed_reads: AtomicU32::new(0),
                admission: Mutex::new(Admission::Pending),
                admission_wake: Condvar::new(),
                stop: CancelToken::new(),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Installs the system-metrics provider.
    pub fn set_metrics(&self, provider: Arc<dyn MetricsProvider>) {
        lock(&self.inner.callbacks).metrics = Some(provider);
    }

    /// Installs the walk-progress supplier.
    pub fn set_progress(&self, progress: Arc<dyn Fn() -> Progress + Send + Sync>) {
        lock(&self.inner.callbacks).progress = Some(progress);
    }

    /// Installs the auto-scaler snapshot supplier.
    pub fn set_scale_stats(&self, scale: Arc<dyn Fn() -> AutoScaleStats + Send + Sync>) {
        lock(&self.inner.callbacks).scale = Some(scale);
    }

    /// Installs the flow-rotation callback.
    pub fn on_rotate(&self, rotate: Arc<dyn Fn(u8) + Send + Sync>) {
        lock(&self.inner.callbacks).rotate = Some(rotate);
    }

    /// Starts the supervisor. Idempotent.
    pub fn start(&self) {
        let mut slot = lock(&self.supervisor);
        if slot.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *slot = Some(
            thread::Builder::new()
                .name("nbackup-control".into())
                .spawn(move || supervise(&inner))
                .expect("spawning the control supervisor cannot fail"),
        );
    }

    /// Stops the channel within a bounded time: the connection is closed
    /// first (unblocking any pending read), the sub-tasks are joined, the
    /// connection reference is cleared, and the state parks at
    /// disconnected.
    pub fn stop(&self) {
        self.inner.stop.cancel();
        if let Some(conn) = lock(&self.inner.conn).clone() {
            conn.close();
        }
        if let Some(handle) = lock(&self.supervisor).take() {
            let _ = handle.join();
        }
        *lock(&self.inner.conn) = None;
        *lock(&self.inner.state) = LinkState::Disconnected;
    }

    /// Returns `true` while the hello has been accepted and the sub-tasks
    /// are running.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *lock(&self.inner.state) == LinkState::Connected
    }

    /// Returns the current link state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        *lock(&self.inner.state)
    }

    /// Returns the smoothed round-trip time, zero before the first pong.
    #[must_use]
    pub fn rtt(&self) -> Duration {
        Duration::from_nanos(self.inner.rtt_nanos.load(Ordering::Relaxed))
    }

    /// Returns the latest server load gauge.
    #[must_use]
    pub fn server_load(&self) -> f32 {
        f32::from_bits(self.inner.server_load_bits.load(Ordering::Relaxed))
    }

    /// Returns the latest server free-disk gauge in MiB.
    #[must_use]
    pub fn server_disk_free_mb(&self) -> u32 {
        self.inner.disk_free_mb.load(Ordering::Relaxed)
    }

    /// Sends the explicit ingestion-done marker for the finished session.
    pub fn send_ingestion_done(&self) -> Result<(), ControlError> {
        let conn = lock(&self.inner.conn)
            .clone()
            .ok_or(ControlError::NotConnected)?;
        let _write_guard = lock(&self.inner.write_lock);
        write_ingestion_done(&mut &*conn)?;
        info!("ingestion-done sent");
        Ok(())
    }

    /// Waits for the server's admission verdict.
    ///
    /// Admit returns immediately; a deferral extends the wait by the
    /// server-requested delay; silence beyond `grace` admits by default
    /// (servers without flow control never send a verdict); abort is an
    /// error. Stopping the channel mid-wait surfaces as a timeout.
    pub fn await_admission(&self, grace: Duration) -> Result<(), ControlError> {
        let mut deadline = Instant::now() + grace;
        let mut admission = lock(&self.inner.admission);
        loop {
            match *admission {
                Admission::Admitted => return Ok(()),
                Admission::Aborted(reason) => return Err(ControlError::Aborted(reason)),
                Admission::DeferredUntil(until) => {
                    deadline = deadline.max(until);
                    if Instant::now() >= until {
                        return Ok(());
                    }
                }
                Admission::Pending => {
                    if Instant::now() >= deadline {
                        return Ok(());
                    }
                }
            }
            if self.inner.stop.is_cancelled() {
                return Err(ControlError::AdmissionTimeout);
            }
            let wait = deadline.saturating_duration_since(Instant::now()).min(Duration::from_millis(100));
            let (guard, _timeout) = self
                .inner
                .admission_wake
                .wait_timeout(admission, wait)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            admission = guard;
        }
    }
}

fn supervise(inner: &Arc<Inner>) {
    let mut delay = inner.config.reconnect_initial;
    while !inner.stop.is_cancelled() {
        // A degraded link stays visibly degraded through reconnect cycles
        // until a pong resets the missed-read counter.
        let degraded = inner.missed_reads.load(Ordering::Relaxed) >= DEGRADED_AFTER;
        if !degraded {
            *lock(&inner.state) = LinkState::Connecting;
        }
        let conn = match connect(inner) {
            Ok(conn) => conn,
            Err(err) => {
                debug!(error = %err, "control connect failed");
                if !degraded {
                    *lock(&inner.state) = LinkState::Disconnected;
                }
                if inner.stop.wait_timeout(delay) {
                    break;
                }
                delay = (delay * 2).min(inner.config.reconnect_max);
                continue;
            }
        };
        delay = inner.config.reconnect_initial;
        *lock(&inner.conn) = Some(Arc::clone(&conn));
        if !degraded {
            *lock(&inner.state) = LinkState::Connected;
        }
        debug!("control channel connected");

        let writer = spawn_writer(Arc::clone(inner), Arc::clone(&conn));
        read_loop(inner, &conn);
        conn.close();
        let _ = writer.join();

        if !inner.stop.is_cancelled()
            && inner.missed_reads.load(Ordering::Relaxed) < DEGRADED_AFTER
        {
            *lock(&inner.state) = LinkState::Disconnected;
        }
    }
    *lock(&inner.state) = LinkState::Disconnected;
}

fn connect(inner: &Arc<Inner>) -> Result<Arc<Connection>, ControlError> {
    let conn = inner.dialer.dial()?;
    let stats = lock(&inner.callbacks)
        .metrics
        .as_ref()
        .map_or_else(StatsSample::default, |provider| provider.sample());
    ControlHello {
        keepalive_secs: inner.config.keepalive.as_secs().min(u64::from(u32::MAX)) as u32,
        client_version: inner.config.client_version.clone(),
        stats,
    }
    .encode(&mut &conn)?;
    // Reads must give up fast enough to notice missing pongs.
    conn.set_read_timeout(Some(inner.config.keepalive * 2))
        .map_err(transport::TransportError::Io)?;
    Ok(Arc::new(conn))
}

fn spawn_writer(inner: Arc<Inner>, conn: Arc<Connection>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("nbackup-control-writer".into())
        .spawn(move || {
            loop {
                if inner.stop.wait_timeout(inner.config.keepalive) {
                    return;
                }
                if let Err(err) = write_tick(&inner, &conn) {
                    debug!(error = %err, "control writer stopped");
                    return;
                }
            }
        })
        .expect("spawning the control writer cannot fail")
}

/// One keepalive tick: ping, then whichever report providers are set.
fn write_tick(inner: &Arc<Inner>, conn: &Arc<Connection>) -> Result<(), ControlError> {
    let (metrics, progress, scale) = {
        let callbacks = lock(&inner.callbacks);
        (
            callbacks.metrics.clone(),
            callbacks.progress.clone(),
            callbacks.scale.clone(),
        )
    };
    let _write_guard = lock(&inner.write_lock);
    Ping {
        timestamp_nanos: now_nanos(),
    }
    .encode(&mut &**conn)?;
    if let Some(progress) = progress {
        progress().encode(&mut &**conn)?;
    }
    if let Some(metrics) = metrics {
        metrics.sample().encode(&mut &**conn)?;
    }
    if let Some(scale) = scale {
        scale().encode(&mut &**conn)?;
    }
    Ok(())
}

fn read_loop(inner: &Arc<Inner>, conn: &Arc<Connection>) {
    loop {
        if inner.stop.is_cancelled() {
            return;
        }
        match read_control_frame(&mut &**conn) {
            Ok(ControlFrame::Pong(pong)) => {
                inner.missed_reads.store(0, Ordering::Relaxed);
                *lock(&inner.state) = LinkState::Connected;
                let sample = now_nanos().saturating_sub(pong.timestamp_nanos).max(0) as u64;
                update_rtt(inner, sample);
                inner
                    .server_load_bits
                    .store(pong.server_load.to_bits(), Ordering::Relaxed);
                inner
                    .disk_free_mb
                    .store(pong.disk_free_mb, Ordering::Relaxed);
            }
            Ok(ControlFrame::Rotate { stream_index }) => handle_rotate(inner, conn, stream_index),
            Ok(ControlFrame::Admit) => set_admission(inner, Admission::Admitted),
            Ok(ControlFrame::Defer { delay_secs }) => {
                set_admission(
                    inner,
                    Admission::DeferredUntil(
                        Instant::now() + Duration::from_secs(u64::from(delay_secs)),
                    ),
                );
            }
            Ok(ControlFrame::Abort { reason }) => {
                warn!(reason, "session aborted by server");
                set_admission(inner, Admission::Aborted(reason));
            }
            Err(ProtocolError::InvalidMagic { actual, .. }) => {
                warn!(?actual, "unknown control magic; reconnecting");
                return;
            }
            Err(err) => {
                let missed = inner.missed_reads.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(error = %err, missed, "control read failed");
                if missed >= DEGRADED_AFTER {
                    *lock(&inner.state) = LinkState::Degraded;
                }
                return;
            }
        }
    }
}

/// Runs the rotation callback outside every channel lock; the
/// acknowledgement goes out even if the callback panicked.
fn handle_rotate(inner: &Arc<Inner>, conn: &Arc<Connection>, stream_index: u8) {
    let rotate = lock(&inner.callbacks).rotate.clone();
    if let Some(rotate) = rotate {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| rotate(stream_index)));
        if outcome.is_err() {
            warn!(stream = stream_index, "rotation callback panicked");
        }
    }
    let _write_guard = lock(&inner.write_lock);
    if let Err(err) = write_rotate_ack(&mut &**conn, stream_index) {
        debug!(error = %err, "rotate ack failed");
    }
}

fn set_admission(inner: &Arc<Inner>, admission: Admission) {
    *lock(&inner.admission) = admission;
    inner.admission_wake.notify_all();
}

fn update_rtt(inner: &Arc<Inner>, sample: u64) {
    let previous = inner.rtt_nanos.load(Ordering::Relaxed);
    let next = if previous == 0 {
        sample
    } else {
        // Integer-nanosecond EWMA: new = 0.25 * sample + 0.75 * previous.
        (RTT_ALPHA_NUM * sample + (RTT_ALPHA_DEN - RTT_ALPHA_NUM) * previous) / RTT_ALPHA_DEN
    };
    inner.rtt_nanos.store(next, Ordering::Relaxed);
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos().min(i64::MAX as u128) as i64)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
