//! Parallel dispatcher: chunk framing, round-robin fan-out, per-stream
//! senders with reconnect-and-resume, and chunk retransmission.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use protocol::{
    CHUNK_HEADER_LEN, ChunkHeader, ChunkSack, ParallelAck, ParallelJoin, ParallelJoinStatus,
};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use transport::{CancelToken, Connection, Dialer, RetryPolicy};

use crate::counters::RateCounters;
use crate::error::EngineError;
use crate::scaler::ScaleTarget;
use crate::stream::{StreamState, StreamStats};

/// Parameters for one parallel session.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Server-assigned session identifier.
    pub session_id: String,
    /// Number of stream slots, in `[1, 255]`.
    pub max_streams: u8,
    /// Chunk payload size in bytes.
    pub chunk_size: usize,
    /// Ring-buffer capacity per stream, in bytes.
    pub ring_capacity: usize,
    /// Reconnect budget per stream.
    pub retry: RetryPolicy,
}

/// Where a chunk's frame lives, for retransmission.
#[derive(Clone, Copy, Debug)]
struct ChunkLocation {
    stream: u8,
    offset: u64,
    frame_len: u32,
}

struct EmitState {
    pending: Vec<u8>,
    next_seq: u32,
    cursor: usize,
}

struct Shared {
    config: DispatcherConfig,
    streams: Vec<Arc<StreamState>>,
    /// Sequence allocation and the round-robin cursor share one mutex so
    /// no two chunks can ever share a sequence or a slot.
    emit: Mutex<EmitState>,
    chunk_map: RwLock<FxHashMap<u32, ChunkLocation>>,
    dialer: Arc<dyn Dialer>,
    cancel: CancelToken,
    counters: Arc<RateCounters>,
    senders: Mutex<Vec<(u8, JoinHandle<Result<(), EngineError>>)>>,
    dead_errors: Mutex<Vec<(u8, EngineError)>>,
}

/// Fans the archive byte stream into framed chunks across parallel streams.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Creates a dispatcher with every stream inactive. Streams join the
    /// session through [`Dispatcher::activate_stream`].
    #[must_use]
    pub fn new(
        config: DispatcherConfig,
        dialer: Arc<dyn Dialer>,
        counters: Arc<RateCounters>,
        cancel: CancelToken,
    ) -> Self {
        let streams = (0..config.max_streams)
            .map(|index| Arc::new(StreamState::new(index, config.ring_capacity)))
            .collect();
        Self {
            shared: Arc::new(Shared {
                streams,
                emit: Mutex::new(EmitState {
                    pending: Vec::with_capacity(config.chunk_size),
                    next_seq: 0,
                    cursor: 0,
                }),
                chunk_map: RwLock::new(FxHashMap::default()),
                dialer,
                cancel,
                counters,
                senders: Mutex::new(Vec::new()),
                dead_errors: Mutex::new(Vec::new()),
                config,
            }),
        }
    }

    /// Returns the producer-side writer the archive pipeline drives.
    #[must_use]
    pub fn writer(&self) -> DispatchWriter {
        DispatchWriter {
            dispatcher: self.clone(),
        }
    }

    /// Number of streams currently accepting new chunks.
    #[must_use]
    pub fn active_count(&self) -> u8 {
        self.shared
            .streams
            .iter()
            .filter(|s| s.is_active() && !s.is_dead())
            .count() as u8
    }

    /// Per-stream counters for stats reporting and tests.
    #[must_use]
    pub fn stream_stats(&self) -> Vec<StreamStats> {
        self.shared.streams.iter().map(|s| s.stats()).collect()
    }

    /// Dials, joins, and starts the given stream. Activating a dead stream
    /// fails; re-activating an already active stream is a no-op beyond a
    /// fresh connection. The sender thread is started exactly once per
    /// stream.
    pub fn activate_stream(&self, index: u8) -> Result<(), EngineError> {
        let stream = self.stream(index)?;
        if stream.is_dead() {
            return Err(EngineError::StreamDead { index });
        }

        let conn = Arc::new(self.shared.dialer.dial()?);
        {
            // A rotation can land while the sender has a frame in flight;
            // the write lock keeps the offset rollback off a half-written
            // frame.
            let _write_guard = lock(&stream.write_lock);
            join_stream(&self.shared, stream, &conn)?;
            stream.install_conn(Arc::clone(&conn));
        }
        stream.set_active(true);
        spawn_ack_reader(&self.shared, stream, conn);

        if stream.claim_sender() {
            let shared = Arc::clone(&self.shared);
            let stream = Arc::clone(stream);
            let index = stream.index;
            let handle = thread::Builder::new()
                .name(format!("nbackup-send-{index}"))
                .spawn(move || {
                    let result = sender_loop(&shared, &stream);
                    // Whatever ended this sender, nothing will drain the
                    // ring any more; close it so the producer unblocks.
                    stream.ring.close();
                    result
                })
                .expect("spawning a sender thread cannot fail");
            lock(&self.shared.senders).push((index, handle));
        }
        debug!(stream = index, "stream activated");
        Ok(())
    }

    /// Stops assigning new chunks to the stream. Its sender keeps draining
    /// until the ring closes.
    pub fn deactivate_stream(&self, index: u8) -> Result<(), EngineError> {
        let stream = self.stream(index)?;
        stream.set_active(false);
        debug!(stream = index, "stream deactivated");
        Ok(())
    }

    /// Emits any partial pending block as a final short chunk.
    pub fn flush(&self) -> Result<(), EngineError> {
        let mut emit = lock(&self.shared.emit);
        if emit.pending.is_empty() {
            return Ok(());
        }
        let payload = std::mem::take(&mut emit.pending);
        self.emit_chunk(&mut emit, &payload)
    }

    /// Flushes and closes every ring buffer. Connections stay open so
    /// in-flight data can drain.
    pub fn close(&self) -> Result<(), EngineError> {
        let result = self.flush();
        for stream in &self.shared.streams {
            stream.ring.close();
        }
        result
    }

    /// Closes every connection. Called after the session is over so ack
    /// readers unblock and exit.
    pub fn shutdown(&self) {
        for stream in &self.shared.streams {
            stream.close_conn();
        }
    }

    /// Re-sends the identified chunk on its original stream.
    ///
    /// Returns `false` when the chunk is not recoverable: unknown sequence,
    /// dead stream, or its bytes already released from the ring buffer.
    /// The original stream is mandatory so wire offsets stay coherent.
    pub fn retransmit(&self, seq: u32) -> Result<bool, EngineError> {
        let location = match lock_read(&self.shared.chunk_map).get(&seq) {
            Some(location) => *location,
            None => return Ok(false),
        };
        let stream = self.stream(location.stream)?;
        if stream.is_dead() {
            return Ok(false);
        }
        if !stream
            .ring
            .contains_range(location.offset, u64::from(location.frame_len))
        {
            return Ok(false);
        }

        let mut frame = vec![0u8; location.frame_len as usize];
        let _write_guard = lock(&stream.write_lock);
        match stream.ring.read_full_at(location.offset, &mut frame) {
            Ok(()) => {}
            // The tail can advance between the range check and the read.
            Err(buffer::BufferError::OffsetExpired { .. }) => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        let Some(conn) = stream.current_conn() else {
            return Ok(false);
        };
        conn.write_all(&frame).map_err(transport::TransportError::Io)?;
        stream.note_retransmit(u64::from(location.frame_len));
        debug!(seq, stream = location.stream, len = location.frame_len, "chunk retransmitted");
        Ok(true)
    }

    /// Waits for every started sender to finish.
    ///
    /// The first error from a stream that is *not* dead is surfaced;
    /// dead-stream errors are recorded for post-loop reporting via
    /// [`Dispatcher::take_dead_errors`]. When `timeout` expires first,
    /// every ring buffer is closed (returning blocked senders a terminal
    /// close) and [`EngineError::DeadlineExceeded`] is returned.
    pub fn wait_all_senders(&self, timeout: Option<Duration>) -> Result<(), EngineError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let expired = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));

        let watcher = {
            let shared = Arc::clone(&self.shared);
            let expired = Arc::clone(&expired);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                loop {
                    if done.load(Ordering::SeqCst) {
                        return;
                    }
                    let deadline_hit = deadline.is_some_and(|d| Instant::now() >= d);
                    if deadline_hit || shared.cancel.is_cancelled() {
                        expired.store(deadline_hit, Ordering::SeqCst);
                        for stream in &shared.streams {
                            stream.ring.close();
                        }
                        return;
                    }
                    thread::sleep(Duration::from_millis(25));
                }
            })
        };

        let handles: Vec<_> = lock(&self.shared.senders).drain(..).collect();
        let mut first_error = None;
        for (index, handle) in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    let is_dead = self
                        .shared
                        .streams
                        .get(index as usize)
                        .is_some_and(|s| s.is_dead());
                    if is_dead {
                        lock(&self.shared.dead_errors).push((index, err));
                    } else if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(EngineError::StreamDead { index });
                    }
                }
            }
        }
        done.store(true, Ordering::SeqCst);
        let _ = watcher.join();

        if self.shared.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if expired.load(Ordering::SeqCst) {
            return Err(EngineError::DeadlineExceeded);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drains the dead-stream errors recorded during the session.
    #[must_use]
    pub fn take_dead_errors(&self) -> Vec<(u8, EngineError)> {
        std::mem::take(&mut *lock(&self.shared.dead_errors))
    }

    fn stream(&self, index: u8) -> Result<&Arc<StreamState>, EngineError> {
        self.shared
            .streams
            .get(index as usize)
            .ok_or(EngineError::StreamDead { index })
    }

    fn push_bytes(&self, buf: &[u8]) -> Result<usize, EngineError> {
        let mut emit = lock(&self.shared.emit);
        let space = self.shared.config.chunk_size - emit.pending.len();
        let take = space.min(buf.len());
        emit.pending.extend_from_slice(&buf[..take]);
        if emit.pending.len() == self.shared.config.chunk_size {
            let payload = std::mem::take(&mut emit.pending);
            emit.pending.reserve(self.shared.config.chunk_size);
            self.emit_chunk(&mut emit, &payload)?;
        }
        Ok(take)
    }

    /// Allocates a sequence, picks the next eligible stream, records the
    /// chunk map entry, and appends the frame whole to that stream's ring.
    fn emit_chunk(&self, emit: &mut EmitState, payload: &[u8]) -> Result<(), EngineError> {
        let seq = emit.next_seq;
        emit.next_seq += 1;

        let stream = self.pick_stream(&mut emit.cursor)?;
        let header = ChunkHeader {
            seq,
            len: payload.len() as u32,
        };
        let frame_len = CHUNK_HEADER_LEN + payload.len();
        let offset = stream.ring.head();
        lock_write(&self.shared.chunk_map).insert(
            seq,
            ChunkLocation {
                stream: stream.index,
                offset,
                frame_len: frame_len as u32,
            },
        );

        let mut frame = Vec::with_capacity(frame_len);
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(payload);

        let started = Instant::now();
        stream.ring.write(&frame)?;
        self.shared.counters.add_producer_blocked(started.elapsed());
        self.shared.counters.add_producer_bytes(frame_len as u64);
        Ok(())
    }

    /// Round-robin over active, non-dead streams.
    fn pick_stream(&self, cursor: &mut usize) -> Result<Arc<StreamState>, EngineError> {
        let streams = &self.shared.streams;
        for step in 0..streams.len() {
            let index = (*cursor + step) % streams.len();
            let stream = &streams[index];
            if stream.is_active() && !stream.is_dead() {
                *cursor = index + 1;
                return Ok(Arc::clone(stream));
            }
        }
        Err(EngineError::AllStreamsDead)
    }

    #[cfg(test)]
    pub(crate) fn force_cursor(&self, cursor: usize) {
        lock(&self.shared.emit).cursor = cursor;
    }
}

impl ScaleTarget for Dispatcher {
    fn active_streams(&self) -> u8 {
        self.active_count()
    }

    fn max_streams(&self) -> u8 {
        self.shared.config.max_streams
    }

    fn activate_next(&self) -> bool {
        let next = self
            .shared
            .streams
            .iter()
            .find(|s| !s.is_active() && !s.is_dead())
            .map(|s| s.index);
        match next {
            Some(index) => match self.activate_stream(index) {
                Ok(()) => true,
                Err(err) => {
                    warn!(stream = index, error = %err, "stream activation failed");
                    false
                }
            },
            None => false,
        }
    }

    fn deactivate_highest(&self) -> bool {
        if self.active_count() <= 1 {
            return false;
        }
        let highest = self
            .shared
            .streams
            .iter()
            .rev()
            .find(|s| s.is_active() && !s.is_dead())
            .map(|s| s.index);
        highest.is_some_and(|index| self.deactivate_stream(index).is_ok())
    }
}

/// Producer-side `Write` handle; the archive pipeline's destination in
/// parallel mode.
pub struct DispatchWriter {
    dispatcher: Dispatcher,
}

impl Write for DispatchWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.dispatcher.push_bytes(buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.dispatcher.flush().map_err(io::Error::other)
    }
}

/// Joins the session on a fresh connection and rolls the stream's offsets
/// back to the server-confirmed wire position.
fn join_stream(
    shared: &Arc<Shared>,
    stream: &Arc<StreamState>,
    conn: &Arc<Connection>,
) -> Result<(), EngineError> {
    ParallelJoin {
        session_id: shared.config.session_id.clone(),
        stream_index: stream.index,
    }
    .encode(&mut &**conn)?;
    let ack = ParallelAck::decode(&mut &**conn)?;
    match ack.status {
        ParallelJoinStatus::Ok => {}
        status => {
            return Err(EngineError::JoinRejected {
                index: stream.index,
                status,
            });
        }
    }

    let base = stream.resume_to(ack.last_offset, &shared.counters);
    validate_resume_position(shared, stream, base)
}

/// A resumed position must either be the fully-drained head or start with
/// a parseable chunk header still covered by the ring buffer.
fn validate_resume_position(
    shared: &Arc<Shared>,
    stream: &Arc<StreamState>,
    base: u64,
) -> Result<(), EngineError> {
    if base == stream.ring.head() {
        return Ok(());
    }
    if !stream
        .ring
        .contains_range(base, CHUNK_HEADER_LEN as u64)
    {
        stream.mark_dead();
        return Err(EngineError::ResumeOffsetExpired {
            offset: base,
            tail: stream.ring.tail(),
        });
    }
    let mut header = [0u8; CHUNK_HEADER_LEN];
    stream.ring.read_full_at(base, &mut header)?;
    if ChunkHeader::from_bytes(header, shared.config.chunk_size as u32).is_err() {
        stream.mark_dead();
        return Err(EngineError::ResumeDesync { offset: base });
    }
    Ok(())
}

fn spawn_ack_reader(shared: &Arc<Shared>, stream: &Arc<StreamState>, conn: Arc<Connection>) {
    let stream = Arc::clone(stream);
    let counters = Arc::clone(&shared.counters);
    let builder = thread::Builder::new().name(format!("nbackup-ack-{}", stream.index));
    builder
        .spawn(move || {
            loop {
                match ChunkSack::decode(&mut &*conn) {
                    Ok(sack) => {
                        if sack.stream_index == stream.index {
                            stream.apply_sack(sack.offset, &counters);
                        } else {
                            debug!(
                                got = sack.stream_index,
                                expected = stream.index,
                                "chunk ack for foreign stream ignored"
                            );
                        }
                    }
                    // Connection torn down; the sender notices on its next
                    // write and drives the reconnect.
                    Err(_) => return,
                }
            }
        })
        .expect("spawning an ack reader cannot fail");
}

/// Per-stream sender: reads whole frames at `send_offset`, writes them
/// under the write lock, and reconnects with resume on transport failure.
fn sender_loop(shared: &Arc<Shared>, stream: &Arc<StreamState>) -> Result<(), EngineError> {
    let chunk_size = shared.config.chunk_size;
    let mut frame = vec![0u8; CHUNK_HEADER_LEN + chunk_size];

    loop {
        let send_offset = stream.send_offset();
        let mut header_bytes = [0u8; CHUNK_HEADER_LEN];
        let waited = Instant::now();
        match stream.ring.read_full_at(send_offset, &mut header_bytes) {
            Ok(()) => shared.counters.add_sender_idle(waited.elapsed()),
            Err(buffer::BufferError::Closed { .. }) => return Ok(()),
            Err(err @ buffer::BufferError::OffsetExpired { .. }) => {
                stream.mark_dead();
                return Err(err.into());
            }
        }

        let header = match ChunkHeader::from_bytes(header_bytes, chunk_size as u32) {
            Ok(header) => header,
            Err(err) => {
                stream.mark_dead();
                return Err(err.into());
            }
        };
        let frame_len = CHUNK_HEADER_LEN + header.len as usize;
        let buf = &mut frame[..frame_len];
        match stream.ring.read_full_at(send_offset, buf) {
            Ok(()) => {}
            Err(err) => {
                stream.mark_dead();
                return Err(err.into());
            }
        }

        let write_result = {
            let _write_guard = lock(&stream.write_lock);
            match stream.current_conn() {
                Some(conn) => match conn.write_all(buf) {
                    Ok(()) => {
                        stream.note_sent(frame_len as u64);
                        Ok(())
                    }
                    Err(err) => Err(err),
                },
                None => Err(io::Error::new(io::ErrorKind::NotConnected, "no connection")),
            }
        };

        if let Err(err) = write_result {
            warn!(stream = stream.index, error = %err, "frame write failed; reconnecting");
            reconnect(shared, stream)?;
        }
    }
}

/// Exponential-backoff rejoin. Transient failures retry until the budget
/// is exhausted; anything else marks the stream dead.
fn reconnect(shared: &Arc<Shared>, stream: &Arc<StreamState>) -> Result<(), EngineError> {
    stream.close_conn();
    let mut backoff = shared.config.retry.backoff();
    loop {
        if !backoff.sleep(&shared.cancel) {
            if shared.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            stream.mark_dead();
            return Err(EngineError::MaxRetriesExceeded {
                index: stream.index,
                attempts: backoff.attempts(),
            });
        }
        shared.counters.add_retry();
        match try_rejoin(shared, stream) {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient() => {
                debug!(stream = stream.index, error = %err, "rejoin attempt failed");
            }
            Err(err) => {
                stream.mark_dead();
                return Err(err);
            }
        }
    }
}

fn try_rejoin(shared: &Arc<Shared>, stream: &Arc<StreamState>) -> Result<(), EngineError> {
    let conn = Arc::new(shared.dialer.dial()?);
    join_stream(shared, stream, &conn)?;
    stream.install_conn(Arc::clone(&conn));
    spawn_ack_reader(shared, stream, conn);
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn lock_read<T>(rwlock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn lock_write<T>(rwlock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    rwlock
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
