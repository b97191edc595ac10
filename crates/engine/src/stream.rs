//! Per-stream state: offsets, retransmit spans, and wire↔buffer
//! translation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use buffer::RingBuffer;
use transport::Connection;

use crate::counters::RateCounters;

/// A retransmit span in wire-offset space, `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Span {
    start: u64,
    end: u64,
}

/// Offset bookkeeping guarded by the send mutex.
///
/// Invariant: `wire_offset - send_offset == acked_retransmit +`
/// the summed length of `spans`. Retransmitted payload occupies wire space
/// without advancing the ring-buffer read position, and this equation is
/// what lets an incoming wire-offset acknowledgement be translated back to
/// a ring-buffer offset.
#[derive(Debug, Default)]
struct SendState {
    send_offset: u64,
    wire_offset: u64,
    acked_retransmit: u64,
    acked_base: u64,
    spans: Vec<Span>,
}

/// Observable counters for one stream, used by stats reporting and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamStats {
    /// Stream slot index.
    pub index: u8,
    /// Whether the dispatcher currently assigns new chunks here.
    pub active: bool,
    /// Whether the stream is permanently dead.
    pub dead: bool,
    /// Next ring-buffer offset the sender will drain.
    pub send_offset: u64,
    /// Next wire position, retransmits included.
    pub wire_offset: u64,
    /// Retransmitted bytes already acknowledged.
    pub acked_retransmit: u64,
    /// Ring-buffer bytes released by acknowledgements.
    pub drained_bytes: u64,
    /// Bytes currently held in the ring buffer (head minus tail).
    pub buffered_bytes: u64,
}

pub(crate) struct StreamState {
    pub(crate) index: u8,
    pub(crate) ring: Arc<RingBuffer>,
    conn: Mutex<Option<Arc<Connection>>>,
    /// Serialises in-flight frame writes and retransmits on the connection.
    pub(crate) write_lock: Mutex<()>,
    send: Mutex<SendState>,
    active: AtomicBool,
    dead: AtomicBool,
    sender_started: AtomicBool,
    drained: AtomicU64,
}

impl StreamState {
    pub(crate) fn new(index: u8, ring_capacity: usize) -> Self {
        Self {
            index,
            ring: Arc::new(RingBuffer::new(ring_capacity)),
            conn: Mutex::new(None),
            write_lock: Mutex::new(()),
            send: Mutex::new(SendState::default()),
            active: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            sender_started: AtomicBool::new(false),
            drained: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Death is terminal: the flag never clears, and the ring is closed so
    /// a producer blocked on this stream's backpressure fails promptly
    /// instead of waiting on a drain that will never come.
    pub(crate) fn mark_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        self.ring.close();
    }

    /// Marks the sender thread as started; returns `true` the first time.
    pub(crate) fn claim_sender(&self) -> bool {
        !self.sender_started.swap(true, Ordering::SeqCst)
    }

    /// Swaps in a fresh connection, closing the previous one so its ack
    /// reader unblocks and exits.
    pub(crate) fn install_conn(&self, conn: Arc<Connection>) {
        let mut slot = lock(&self.conn);
        if let Some(old) = slot.replace(conn) {
            old.close();
        }
    }

    pub(crate) fn current_conn(&self) -> Option<Arc<Connection>> {
        lock(&self.conn).clone()
    }

    pub(crate) fn close_conn(&self) {
        if let Some(conn) = lock(&self.conn).take() {
            conn.close();
        }
    }

    pub(crate) fn send_offset(&self) -> u64 {
        lock(&self.send).send_offset
    }

    pub(crate) fn wire_offset(&self) -> u64 {
        lock(&self.send).wire_offset
    }

    /// Advances both offsets after a frame write. Caller holds the write
    /// lock so retransmit span starts stay coherent with the wire.
    pub(crate) fn note_sent(&self, frame_len: u64) {
        let mut send = lock(&self.send);
        send.send_offset += frame_len;
        send.wire_offset += frame_len;
    }

    /// Records a retransmit of `len` bytes at the current wire tail.
    /// Caller holds the write lock.
    pub(crate) fn note_retransmit(&self, len: u64) {
        let mut send = lock(&self.send);
        let start = send.wire_offset;
        send.wire_offset += len;
        send.spans.push(Span {
            start,
            end: start + len,
        });
    }

    /// Applies a wire-offset acknowledgement: settles retransmit spans
    /// below the mark, translates to a ring-buffer base offset, advances
    /// the tail, and returns the base offset.
    pub(crate) fn apply_sack(&self, wire_off: u64, counters: &RateCounters) -> u64 {
        let mut send = lock(&self.send);
        settle_spans(&mut send, wire_off);
        let base = wire_off.saturating_sub(send.acked_retransmit);
        if base > send.acked_base {
            let delta = base - send.acked_base;
            send.acked_base = base;
            drop(send);
            self.ring.advance(base);
            self.drained.fetch_add(delta, Ordering::Relaxed);
            counters.add_drained_bytes(delta);
        }
        base
    }

    /// Rolls internal counters back to the server-reported wire offset
    /// after a reconnect: every span below the mark is settled, pending
    /// spans are cleared, and `send_offset` restarts at the translated
    /// ring-buffer base. Returns that base.
    pub(crate) fn resume_to(&self, wire_off: u64, counters: &RateCounters) -> u64 {
        let mut send = lock(&self.send);
        settle_spans(&mut send, wire_off);
        send.spans.clear();
        send.wire_offset = wire_off;
        let base = wire_off.saturating_sub(send.acked_retransmit);
        send.send_offset = base;
        if base > send.acked_base {
            let delta = base - send.acked_base;
            send.acked_base = base;
            drop(send);
            self.ring.advance(base);
            self.drained.fetch_add(delta, Ordering::Relaxed);
            counters.add_drained_bytes(delta);
        }
        base
    }

    pub(crate) fn drained_bytes(&self) -> u64 {
        self.drained.load(Ordering::Relaxed)
    }

    pub(crate) fn stats(&self) -> StreamStats {
        let send = lock(&self.send);
        StreamStats {
            index: self.index,
            active: self.is_active(),
            dead: self.is_dead(),
            send_offset: send.send_offset,
            wire_offset: send.wire_offset,
            acked_retransmit: send.acked_retransmit,
            drained_bytes: self.drained.load(Ordering::Relaxed),
            buffered_bytes: self.ring.head() - self.ring.tail(),
        }
    }

    #[cfg(test)]
    pub(crate) fn offset_invariant_holds(&self) -> bool {
        let send = lock(&self.send);
        let span_total: u64 = send.spans.iter().map(|s| s.end - s.start).sum();
        send.send_offset + send.acked_retransmit + span_total == send.wire_offset
    }
}

/// Settles every span below `wire_off`: fully covered spans move their
/// length into `acked_retransmit` and are dropped; a partially covered span
/// (defended against, not expected) accounts its covered prefix and keeps
/// the rest.
fn settle_spans(send: &mut SendState, wire_off: u64) {
    let mut acked = send.acked_retransmit;
    send.spans.retain_mut(|span| {
        if span.end <= wire_off {
            acked += span.end - span.start;
            false
        } else if span.start < wire_off {
            acked += wire_off - span.start;
            span.start = wire_off;
            true
        } else {
            true
        }
    });
    send.acked_retransmit = acked;
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
