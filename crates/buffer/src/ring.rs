//! Ring buffer state machine and its blocking operations.

use std::sync::{Condvar, Mutex};

use crate::{BufferError, Shared};

pub(crate) struct State {
    buf: Box<[u8]>,
    head: u64,
    tail: u64,
    closed: bool,
}

impl State {
    fn free(&self, capacity: usize) -> usize {
        capacity - (self.head - self.tail) as usize
    }
}

/// Thread-safe circular byte store keyed by monotonic absolute offsets.
///
/// One mutex guards the state; two condition variables signal
/// space-available (`not_full`) and data-available (`not_empty`). All offsets
/// are absolute stream positions and never reset, so consumers can hold an
/// offset across reconnects and ask whether the bytes behind it are still
/// retained.
pub struct RingBuffer {
    shared: Shared,
    capacity: usize,
}

impl RingBuffer {
    /// Creates an empty buffer retaining at most `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            shared: Shared {
                state: Mutex::new(State {
                    buf: vec![0u8; capacity].into_boxed_slice(),
                    head: 0,
                    tail: 0,
                    closed: false,
                }),
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
            },
            capacity,
        }
    }

    /// Returns the fixed capacity in bytes.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `bytes` to the stream, blocking while the buffer is full.
    ///
    /// The write may wrap around the physical array. On success the entire
    /// slice has been stored and the head advanced by `bytes.len()`. If the
    /// buffer is closed before all bytes fit, [`BufferError::Closed`] reports
    /// how many bytes were stored; there is no other partial-success path.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, BufferError> {
        let mut written = 0usize;
        let mut state = self.lock();
        while written < bytes.len() {
            if state.closed {
                return Err(BufferError::Closed { written });
            }
            let free = state.free(self.capacity);
            if free == 0 {
                state = self
                    .shared
                    .not_full
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                continue;
            }
            let n = free.min(bytes.len() - written);
            let head = state.head;
            copy_in(&mut state.buf, head, &bytes[written..written + n]);
            state.head += n as u64;
            written += n;
            self.shared.not_empty.notify_all();
        }
        Ok(written)
    }

    /// Copies bytes from `[offset, head)` into `buf`, blocking while the
    /// offset has not been produced yet.
    ///
    /// Returns the number of bytes copied, always at least one. Fails with
    /// [`BufferError::OffsetExpired`] when `offset` is older than the tail
    /// and with [`BufferError::Closed`] when the buffer is closed and the
    /// offset is at or past the head.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, BufferError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.lock();
        loop {
            if offset < state.tail {
                return Err(BufferError::OffsetExpired {
                    offset,
                    tail: state.tail,
                });
            }
            if offset < state.head {
                let available = (state.head - offset) as usize;
                let n = available.min(buf.len());
                copy_out(&state.buf, offset, &mut buf[..n]);
                return Ok(n);
            }
            if state.closed {
                return Err(BufferError::Closed { written: 0 });
            }
            state = self
                .shared
                .not_empty
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Like [`RingBuffer::read_at`] but loops until `buf` is completely
    /// filled or a terminal error occurs.
    pub fn read_full_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), BufferError> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self.read_at(offset + filled as u64, &mut buf[filled..])?;
            filled += n;
        }
        Ok(())
    }

    /// Moves the tail forward to `offset`, releasing capacity.
    ///
    /// The offset is clamped to `[tail, head]`: a smaller offset is ignored
    /// (advance is monotone) and an offset past the head releases everything
    /// currently buffered. Returns the tail after the call.
    pub fn advance(&self, offset: u64) -> u64 {
        let mut state = self.lock();
        let target = offset.min(state.head);
        if target > state.tail {
            state.tail = target;
            self.shared.not_full.notify_all();
        }
        state.tail
    }

    /// Returns `true` when the byte at `offset` is still retained.
    #[must_use]
    pub fn contains(&self, offset: u64) -> bool {
        let state = self.lock();
        offset >= state.tail && offset < state.head
    }

    /// Returns `true` when the whole range `[offset, offset + len)` is
    /// retained. An empty range is contained when `offset` is within
    /// `[tail, head]`.
    #[must_use]
    pub fn contains_range(&self, offset: u64, len: u64) -> bool {
        let state = self.lock();
        offset >= state.tail && offset.saturating_add(len) <= state.head
    }

    /// Returns the next write position in the stream.
    #[must_use]
    pub fn head(&self) -> u64 {
        self.lock().head
    }

    /// Returns the oldest retained offset.
    #[must_use]
    pub fn tail(&self) -> u64 {
        self.lock().tail
    }

    /// Returns `true` once [`RingBuffer::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Marks the buffer terminally closed and wakes all waiters.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.shared.not_full.notify_all();
        self.shared.not_empty.notify_all();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn copy_in(buf: &mut [u8], offset: u64, bytes: &[u8]) {
    let capacity = buf.len();
    let start = (offset % capacity as u64) as usize;
    let first = bytes.len().min(capacity - start);
    buf[start..start + first].copy_from_slice(&bytes[..first]);
    if first < bytes.len() {
        buf[..bytes.len() - first].copy_from_slice(&bytes[first..]);
    }
}

fn copy_out(buf: &[u8], offset: u64, out: &mut [u8]) {
    let capacity = buf.len();
    let start = (offset % capacity as u64) as usize;
    let first = out.len().min(capacity - start);
    out[..first].copy_from_slice(&buf[start..start + first]);
    if first < out.len() {
        let out_len = out.len();
        out[first..].copy_from_slice(&buf[..out_len - first]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    // ========================================================================
    // Basic write/read round trips
    // ========================================================================

    #[test]
    fn write_then_read_at_returns_same_bytes() {
        let ring = RingBuffer::new(16);
        ring.write(b"hello").unwrap();
        let mut out = [0u8; 5];
        let n = ring.read_at(0, &mut out).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn read_at_mid_stream_offset() {
        let ring = RingBuffer::new(16);
        ring.write(b"abcdef").unwrap();
        let mut out = [0u8; 3];
        let n = ring.read_at(2, &mut out).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&out, b"cde");
    }

    #[test]
    fn read_at_limits_to_available_bytes() {
        let ring = RingBuffer::new(16);
        ring.write(b"abc").unwrap();
        let mut out = [0u8; 8];
        let n = ring.read_at(0, &mut out).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&out[..3], b"abc");
    }

    #[test]
    fn read_at_empty_buf_is_zero() {
        let ring = RingBuffer::new(16);
        ring.write(b"abc").unwrap();
        let mut out = [];
        assert_eq!(ring.read_at(0, &mut out).unwrap(), 0);
    }

    #[test]
    fn writes_wrap_across_the_physical_boundary() {
        let ring = RingBuffer::new(8);
        ring.write(b"abcdef").unwrap();
        ring.advance(6);
        ring.write(b"ghijkl").unwrap();
        let mut out = [0u8; 6];
        ring.read_full_at(6, &mut out).unwrap();
        assert_eq!(&out, b"ghijkl");
    }

    #[test]
    fn head_and_tail_track_absolute_offsets() {
        let ring = RingBuffer::new(8);
        ring.write(b"abcd").unwrap();
        assert_eq!(ring.head(), 4);
        assert_eq!(ring.tail(), 0);
        ring.advance(2);
        assert_eq!(ring.tail(), 2);
        ring.write(b"efgh").unwrap();
        assert_eq!(ring.head(), 8);
    }

    // ========================================================================
    // Offset expiry and close semantics
    // ========================================================================

    #[test]
    fn read_at_before_tail_is_expired() {
        let ring = RingBuffer::new(8);
        ring.write(b"abcdef").unwrap();
        ring.advance(4);
        let mut out = [0u8; 2];
        let err = ring.read_at(1, &mut out).unwrap_err();
        assert_eq!(err, BufferError::OffsetExpired { offset: 1, tail: 4 });
    }

    #[test]
    fn read_at_head_after_close_is_closed() {
        let ring = RingBuffer::new(8);
        ring.write(b"ab").unwrap();
        ring.close();
        let mut out = [0u8; 2];
        assert_eq!(
            ring.read_at(2, &mut out).unwrap_err(),
            BufferError::Closed { written: 0 }
        );
    }

    #[test]
    fn read_at_below_head_still_succeeds_after_close() {
        let ring = RingBuffer::new(8);
        ring.write(b"ab").unwrap();
        ring.close();
        let mut out = [0u8; 2];
        assert_eq!(ring.read_at(0, &mut out).unwrap(), 2);
        assert_eq!(&out, b"ab");
    }

    #[test]
    fn write_after_close_reports_zero_written() {
        let ring = RingBuffer::new(8);
        ring.close();
        assert_eq!(
            ring.write(b"abc").unwrap_err(),
            BufferError::Closed { written: 0 }
        );
    }

    #[test]
    fn close_wakes_blocked_writer_with_partial_count() {
        let ring = Arc::new(RingBuffer::new(4));
        let writer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.write(b"abcdef"))
        };
        // Give the writer time to store the first 4 bytes and block.
        thread::sleep(Duration::from_millis(50));
        ring.close();
        let err = writer.join().unwrap().unwrap_err();
        assert_eq!(err, BufferError::Closed { written: 4 });
    }

    #[test]
    fn close_wakes_blocked_reader() {
        let ring = Arc::new(RingBuffer::new(4));
        let reader = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut out = [0u8; 1];
                ring.read_at(0, &mut out)
            })
        };
        thread::sleep(Duration::from_millis(50));
        ring.close();
        assert_eq!(
            reader.join().unwrap().unwrap_err(),
            BufferError::Closed { written: 0 }
        );
    }

    // ========================================================================
    // Advance semantics
    // ========================================================================

    #[test]
    fn advance_is_monotone() {
        let ring = RingBuffer::new(8);
        ring.write(b"abcdef").unwrap();
        assert_eq!(ring.advance(4), 4);
        assert_eq!(ring.advance(2), 4);
        assert_eq!(ring.tail(), 4);
    }

    #[test]
    fn advance_clamps_to_head() {
        let ring = RingBuffer::new(8);
        ring.write(b"abc").unwrap();
        assert_eq!(ring.advance(100), 3);
        assert_eq!(ring.tail(), 3);
    }

    #[test]
    fn contains_reflects_retained_window() {
        let ring = RingBuffer::new(8);
        ring.write(b"abcdef").unwrap();
        ring.advance(2);
        assert!(!ring.contains(1));
        assert!(ring.contains(2));
        assert!(ring.contains(5));
        assert!(!ring.contains(6));
    }

    #[test]
    fn contains_range_checks_both_ends() {
        let ring = RingBuffer::new(8);
        ring.write(b"abcdef").unwrap();
        ring.advance(2);
        assert!(ring.contains_range(2, 4));
        assert!(!ring.contains_range(1, 2));
        assert!(!ring.contains_range(4, 3));
        assert!(ring.contains_range(6, 0));
    }

    // ========================================================================
    // Backpressure
    // ========================================================================

    #[test]
    fn full_buffer_blocks_writer_until_advance() {
        let ring = Arc::new(RingBuffer::new(64));
        ring.write(&[0u8; 64]).unwrap();

        let (tx, rx) = mpsc::channel();
        let writer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let result = ring.write(b"extra");
                tx.send(()).unwrap();
                result
            })
        };

        // Still blocked after 100ms.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        ring.advance(5);
        rx.recv_timeout(Duration::from_secs(1))
            .expect("write should complete after advance");
        assert_eq!(writer.join().unwrap().unwrap(), 5);
        assert_eq!(ring.head(), 69);
    }

    #[test]
    fn blocked_reader_wakes_on_write() {
        let ring = Arc::new(RingBuffer::new(8));
        let reader = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut out = [0u8; 4];
                let n = ring.read_at(0, &mut out).unwrap();
                (n, out)
            })
        };
        thread::sleep(Duration::from_millis(20));
        ring.write(b"wxyz").unwrap();
        let (n, out) = reader.join().unwrap();
        assert_eq!(n, 4);
        assert_eq!(&out, b"wxyz");
    }

    // ========================================================================
    // Concurrent producer/consumer integrity
    // ========================================================================

    #[test]
    fn concurrent_stream_preserves_byte_sequence() {
        let ring = Arc::new(RingBuffer::new(97));
        const TOTAL: usize = 10_000;

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut written = 0usize;
                while written < TOTAL {
                    let n = (TOTAL - written).min(31);
                    let chunk: Vec<u8> = (written..written + n).map(|i| (i % 251) as u8).collect();
                    ring.write(&chunk).unwrap();
                    written += n;
                }
                ring.close();
            })
        };

        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut offset = 0u64;
                let mut out = vec![0u8; 13];
                loop {
                    match ring.read_at(offset, &mut out) {
                        Ok(n) => {
                            for (i, &b) in out[..n].iter().enumerate() {
                                let expect = ((offset as usize + i) % 251) as u8;
                                assert_eq!(b, expect, "byte mismatch at {}", offset as usize + i);
                            }
                            offset += n as u64;
                            ring.advance(offset);
                        }
                        Err(BufferError::Closed { .. }) => break,
                        Err(err) => panic!("unexpected error: {err}"),
                    }
                }
                offset
            })
        };

        producer.join().unwrap();
        assert_eq!(consumer.join().unwrap(), TOTAL as u64);
    }

    #[test]
    fn read_full_at_assembles_across_multiple_writes() {
        let ring = Arc::new(RingBuffer::new(16));
        let reader = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut out = [0u8; 9];
                ring.read_full_at(0, &mut out).unwrap();
                out
            })
        };
        thread::sleep(Duration::from_millis(10));
        ring.write(b"abc").unwrap();
        thread::sleep(Duration::from_millis(10));
        ring.write(b"defghi").unwrap();
        assert_eq!(&reader.join().unwrap(), b"abcdefghi");
    }
}
