//! Single-stream resumable sender.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use buffer::{BufferError, RingBuffer};
use protocol::{FinalStatus, Resume, ResumeAck, ResumeStatus, Trailer, magic};
use tracing::{debug, info, warn};
use transport::{CancelToken, Connection, Dialer, RetryPolicy};

use crate::counters::RateCounters;
use crate::error::EngineError;
use crate::producer::RingWriter;

/// Parameters for a single-stream session.
#[derive(Clone, Debug)]
pub struct SingleConfig {
    /// Server-assigned session identifier, needed for resume.
    pub session_id: String,
    /// Agent identity, re-stated on resume.
    pub agent_name: String,
    /// Storage name, re-stated on resume.
    pub storage_name: String,
    /// Ring-buffer capacity in bytes.
    pub ring_capacity: usize,
    /// Reconnect budget.
    pub retry: RetryPolicy,
}

/// Network chunk the sender drains per iteration.
const IO_CHUNK: usize = 128 * 1024;

/// Drains one ring buffer into the data connection, advancing the tail on
/// selective acknowledgements and resuming from the server-reported offset
/// after transport failures.
pub struct SingleSender {
    config: SingleConfig,
    ring: Arc<RingBuffer>,
    conn: Mutex<Arc<Connection>>,
    dialer: Arc<dyn Dialer>,
    counters: Arc<RateCounters>,
    cancel: CancelToken,
}

impl SingleSender {
    /// Creates a sender over an already established (handshaken) session
    /// connection.
    #[must_use]
    pub fn new(
        config: SingleConfig,
        conn: Connection,
        dialer: Arc<dyn Dialer>,
        counters: Arc<RateCounters>,
        cancel: CancelToken,
    ) -> Self {
        let ring = Arc::new(RingBuffer::new(config.ring_capacity));
        Self {
            config,
            ring,
            conn: Mutex::new(Arc::new(conn)),
            dialer,
            counters,
            cancel,
        }
    }

    /// Returns the ring buffer the archive producer fills.
    #[must_use]
    pub fn ring(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.ring)
    }

    /// Returns the producer-side writer for the archive pipeline.
    #[must_use]
    pub fn producer_writer(&self) -> RingWriter {
        RingWriter::new(Arc::clone(&self.ring), Arc::clone(&self.counters))
    }

    fn current_conn(&self) -> Arc<Connection> {
        Arc::clone(&lock(&self.conn))
    }

    fn install_conn(&self, conn: Connection) {
        let mut slot = lock(&self.conn);
        slot.close();
        *slot = Arc::new(conn);
    }

    /// Drains the ring until the producer closes it and every byte is
    /// acknowledged. Reconnects and resumes on transport failure.
    pub fn run(&self) -> Result<(), EngineError> {
        // Cancellation must reach a sender blocked inside the ring and a
        // producer blocked on backpressure; closing the ring wakes both.
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let watcher = {
            let ring = Arc::clone(&self.ring);
            let cancel = self.cancel.clone();
            let done = Arc::clone(&done);
            thread::Builder::new()
                .name("nbackup-cancel-watch".into())
                .spawn(move || {
                    use std::sync::atomic::Ordering;
                    while !done.load(Ordering::Relaxed) {
                        if cancel.wait_timeout(std::time::Duration::from_millis(100)) {
                            ring.close();
                            return;
                        }
                    }
                })
                .expect("spawning the cancel watcher cannot fail")
        };
        let result = self.run_inner();
        done.store(true, std::sync::atomic::Ordering::Relaxed);
        let _ = watcher.join();
        result
    }

    fn run_inner(&self) -> Result<(), EngineError> {
        let mut reader = self.spawn_ack_reader();
        let mut buf = vec![0u8; IO_CHUNK];
        let mut send_offset = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                self.ring.close();
                return Err(EngineError::Cancelled);
            }
            let waited = Instant::now();
            let n = match self.ring.read_at(send_offset, &mut buf) {
                Ok(n) => {
                    self.counters.add_sender_idle(waited.elapsed());
                    n
                }
                Err(BufferError::Closed { .. }) => break,
                Err(err @ BufferError::OffsetExpired { .. }) => return Err(err.into()),
            };
            match self.current_conn().write_all(&buf[..n]) {
                Ok(()) => send_offset += n as u64,
                Err(err) => {
                    warn!(error = %err, "data write failed; reconnecting");
                    send_offset = self.reconnect()?;
                    reader = self.spawn_ack_reader();
                }
            }
        }
        if self.cancel.is_cancelled() {
            self.current_conn().close();
            return Err(EngineError::Cancelled);
        }

        // Drained. Wait for the server to acknowledge the full stream so
        // the trailer goes out on a quiet connection.
        loop {
            match reader.join() {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => {
                    if self.ring.tail() >= self.ring.head() {
                        return Ok(());
                    }
                    warn!(error = %err, "ack reader lost its connection; reconnecting");
                    let resumed = self.reconnect()?;
                    reader = self.spawn_ack_reader();
                    // Anything past the resume offset must be re-sent.
                    let mut offset = resumed;
                    while offset < self.ring.head() {
                        let n = match self.ring.read_at(offset, &mut buf) {
                            Ok(n) => n,
                            Err(BufferError::Closed { .. }) => break,
                            Err(err) => return Err(err.into()),
                        };
                        self.current_conn()
                            .write_all(&buf[..n])
                            .map_err(transport::TransportError::Io)?;
                        offset += n as u64;
                    }
                }
                Err(_) => return Err(EngineError::Cancelled),
            }
        }
    }

    /// Writes the trailer, half-closes the stream, and maps the final
    /// acknowledgement. Must only be called after [`SingleSender::run`]
    /// returned successfully and the producer's result is known.
    pub fn finish(&self, sha256: [u8; 32], size: u64) -> Result<(), EngineError> {
        let conn = self.current_conn();
        Trailer { sha256, size }.encode(&mut &*conn)?;
        conn.close_write();

        // Late SACKs may still be queued ahead of the final status byte;
        // their magic starts with 'S', which no status byte can be.
        loop {
            let mut byte = [0u8; 1];
            (&*conn)
                .read_exact(&mut byte)
                .map_err(transport::TransportError::Io)?;
            if byte[0] == magic::SACK[0] {
                let mut rest = [0u8; 11];
                (&*conn)
                    .read_exact(&mut rest)
                    .map_err(transport::TransportError::Io)?;
                continue;
            }
            return match FinalStatus::from_wire(byte[0])? {
                FinalStatus::Ok => {
                    info!(bytes = size, "session completed");
                    Ok(())
                }
                FinalStatus::ChecksumMismatch => Err(EngineError::ChecksumMismatch),
                FinalStatus::WriteError => Err(EngineError::ServerWriteError),
            };
        }
    }

    /// Reconnects with exponential backoff, sends the resume request, and
    /// rolls the send position back to the server-confirmed offset. The
    /// caller spawns a fresh ack reader on the installed connection.
    fn reconnect(&self) -> Result<u64, EngineError> {
        self.current_conn().close();
        let mut backoff = self.config.retry.backoff();
        loop {
            if !backoff.sleep(&self.cancel) {
                if self.cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                return Err(EngineError::MaxRetriesExceeded {
                    index: 0,
                    attempts: backoff.attempts(),
                });
            }
            self.counters.add_retry();
            match self.try_resume() {
                Ok((conn, last_offset)) => {
                    // Resume eligibility: the server's offset must still be
                    // covered by the ring buffer.
                    if last_offset < self.ring.tail() {
                        return Err(EngineError::ResumeOffsetExpired {
                            offset: last_offset,
                            tail: self.ring.tail(),
                        });
                    }
                    let old_tail = self.ring.tail();
                    let new_tail = self.ring.advance(last_offset);
                    if new_tail > old_tail {
                        self.counters.add_drained_bytes(new_tail - old_tail);
                    }
                    self.install_conn(conn);
                    debug!(offset = last_offset, "resumed session");
                    return Ok(last_offset);
                }
                Err(err) if err.is_transient() => {
                    debug!(error = %err, "resume attempt failed");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_resume(&self) -> Result<(Connection, u64), EngineError> {
        let conn = self.dialer.dial()?;
        Resume {
            session_id: self.config.session_id.clone(),
            agent_name: self.config.agent_name.clone(),
            storage_name: self.config.storage_name.clone(),
        }
        .encode(&mut &conn)?;
        let ack = ResumeAck::decode(&mut &conn)?;
        match ack.status {
            ResumeStatus::Ok => Ok((conn, ack.last_offset)),
            status => Err(EngineError::ResumeRejected { status }),
        }
    }

    /// Ack reader: applies SACK offsets to the ring tail, exiting cleanly
    /// once the closed ring is fully acknowledged.
    fn spawn_ack_reader(&self) -> JoinHandle<Result<(), std::io::Error>> {
        let ring = Arc::clone(&self.ring);
        let conn = self.current_conn();
        let counters = Arc::clone(&self.counters);
        thread::Builder::new()
            .name("nbackup-ack".into())
            .spawn(move || {
                loop {
                    let sack = protocol::Sack::decode(&mut &*conn)
                        .map_err(|err| std::io::Error::other(err.to_string()))?;
                    let old_tail = ring.tail();
                    let new_tail = ring.advance(sack.offset);
                    if new_tail > old_tail {
                        counters.add_drained_bytes(new_tail - old_tail);
                    }
                    if ring.is_closed() && new_tail >= ring.head() {
                        return Ok(());
                    }
                }
            })
            .expect("spawning the ack reader cannot fail")
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
