//! Producer-side adapter feeding the archive pipeline into a ring buffer.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

use buffer::RingBuffer;

use crate::counters::RateCounters;

/// `Write` adapter the archive pipeline uses as its destination in
/// single-stream mode.
///
/// Every write lands in the ring buffer (blocking on backpressure, which is
/// accounted as producer-blocked time) and bumps the producer byte counter.
pub struct RingWriter {
    ring: Arc<RingBuffer>,
    counters: Arc<RateCounters>,
}

impl RingWriter {
    /// Creates a writer appending to `ring`.
    #[must_use]
    pub fn new(ring: Arc<RingBuffer>, counters: Arc<RateCounters>) -> Self {
        Self { ring, counters }
    }
}

impl Write for RingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let started = Instant::now();
        let written = self
            .ring
            .write(buf)
            .map_err(|err| io::Error::new(io::ErrorKind::BrokenPipe, err))?;
        self.counters.add_producer_blocked(started.elapsed());
        self.counters.add_producer_bytes(written as u64);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn writes_land_in_the_ring() {
        let ring = Arc::new(RingBuffer::new(64));
        let counters = Arc::new(RateCounters::new());
        let mut writer = RingWriter::new(Arc::clone(&ring), Arc::clone(&counters));
        writer.write_all(b"payload").unwrap();
        assert_eq!(ring.head(), 7);
        let sample = counters.sample_and_reset(Duration::from_secs(1));
        assert_eq!(sample.producer_bps, 7.0);
    }

    #[test]
    fn closed_ring_surfaces_broken_pipe() {
        let ring = Arc::new(RingBuffer::new(64));
        ring.close();
        let mut writer = RingWriter::new(ring, Arc::new(RateCounters::new()));
        let err = writer.write_all(b"payload").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
