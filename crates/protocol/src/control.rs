//! Control-channel frames and the agent-side frame dispatcher.

use std::io::{Read, Write};

use crate::wire::{read_f32, read_i64, read_magic, read_u8, read_u32, write_line};
use crate::{ProtocolError, magic};

/// System statistics payload: four big-endian `f32` gauges, 16 bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StatsSample {
    /// CPU utilisation percentage.
    pub cpu_percent: f32,
    /// Memory utilisation percentage.
    pub memory_percent: f32,
    /// Disk utilisation percentage.
    pub disk_percent: f32,
    /// One-minute load average.
    pub load: f32,
}

impl StatsSample {
    fn write_body(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        w.write_all(&self.cpu_percent.to_be_bytes())?;
        w.write_all(&self.memory_percent.to_be_bytes())?;
        w.write_all(&self.disk_percent.to_be_bytes())?;
        w.write_all(&self.load.to_be_bytes())?;
        Ok(())
    }

    fn read_body(r: &mut impl Read) -> Result<Self, ProtocolError> {
        Ok(Self {
            cpu_percent: read_f32(r, "stats.cpu")?,
            memory_percent: read_f32(r, "stats.memory")?,
            disk_percent: read_f32(r, "stats.disk")?,
            load: read_f32(r, "stats.load")?,
        })
    }

    /// Writes the `CSTS` frame.
    pub fn encode(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        w.write_all(&magic::CONTROL_STATS)?;
        self.write_body(w)
    }
}

/// Control-channel hello opening the auxiliary connection.
///
/// The server derives its read timeout as 2.5 times the keepalive interval,
/// so the agent must tick at least that often.
#[derive(Clone, Debug, PartialEq)]
pub struct ControlHello {
    /// Keepalive interval in seconds the agent commits to.
    pub keepalive_secs: u32,
    /// Client software version line.
    pub client_version: String,
    /// Initial statistics sample.
    pub stats: StatsSample,
}

impl ControlHello {
    /// Writes the hello frame.
    pub fn encode(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        w.write_all(&magic::CONTROL)?;
        w.write_all(&self.keepalive_secs.to_be_bytes())?;
        write_line(w, &self.client_version, "control.version")?;
        self.stats.write_body(w)
    }
}

/// Keepalive ping carrying the send timestamp in nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ping {
    /// Nanosecond timestamp echoed back by the server.
    pub timestamp_nanos: i64,
}

impl Ping {
    /// Writes the ping frame.
    pub fn encode(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        w.write_all(&magic::CONTROL_PING)?;
        w.write_all(&self.timestamp_nanos.to_be_bytes())?;
        Ok(())
    }
}

/// Keepalive pong echoing the ping timestamp plus server gauges.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pong {
    /// Echoed ping timestamp.
    pub timestamp_nanos: i64,
    /// Server load gauge.
    pub server_load: f32,
    /// Free disk space on the server in MiB.
    pub disk_free_mb: u32,
}

impl Pong {
    /// Writes the pong frame (server side; kept for loopback tests).
    pub fn encode(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        w.write_all(&magic::CONTROL_PING)?;
        w.write_all(&self.timestamp_nanos.to_be_bytes())?;
        w.write_all(&self.server_load.to_be_bytes())?;
        w.write_all(&self.disk_free_mb.to_be_bytes())?;
        Ok(())
    }
}

/// Walk progress report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    /// Objects discovered so far.
    pub total_objects: u32,
    /// Objects already streamed.
    pub objects_sent: u32,
    /// `true` once the filesystem walk has finished.
    pub walk_complete: bool,
}

impl Progress {
    const FLAG_WALK_COMPLETE: u8 = 0b0000_0001;

    /// Writes the `CPRG` frame.
    pub fn encode(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        w.write_all(&magic::CONTROL_PROGRESS)?;
        w.write_all(&self.total_objects.to_be_bytes())?;
        w.write_all(&self.objects_sent.to_be_bytes())?;
        let flags = if self.walk_complete {
            Self::FLAG_WALK_COMPLETE
        } else {
            0
        };
        w.write_all(&[flags])?;
        Ok(())
    }
}

/// Auto-scaler snapshot report.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AutoScaleStats {
    /// Producer-to-drain efficiency ratio.
    pub efficiency: f32,
    /// Producer rate in MB/s.
    pub producer_mbs: f32,
    /// Aggregate drain rate in MB/s.
    pub drain_mbs: f32,
    /// Active stream count.
    pub active_streams: u8,
    /// Configured maximum stream count.
    pub max_streams: u8,
    /// Scaler state tag byte.
    pub state: u8,
    /// `true` while a probe experiment is running.
    pub probe_active: bool,
}

impl AutoScaleStats {
    /// Writes the `CASS` frame.
    pub fn encode(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        w.write_all(&magic::CONTROL_AUTOSCALE)?;
        w.write_all(&self.efficiency.to_be_bytes())?;
        w.write_all(&self.producer_mbs.to_be_bytes())?;
        w.write_all(&self.drain_mbs.to_be_bytes())?;
        w.write_all(&[
            self.active_streams,
            self.max_streams,
            self.state,
            u8::from(self.probe_active),
        ])?;
        Ok(())
    }
}

/// Rotation acknowledgement sent after the rotation callback ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RotateAck {
    /// Stream index that was rotated.
    pub stream_index: u8,
}

/// Writes a `CRAK` rotation acknowledgement.
pub fn write_rotate_ack(w: &mut impl Write, stream_index: u8) -> Result<(), ProtocolError> {
    w.write_all(&magic::CONTROL_ROTATE_ACK)?;
    w.write_all(&[stream_index])?;
    Ok(())
}

/// Writes the bodyless `CIDN` ingestion-done marker.
pub fn write_ingestion_done(w: &mut impl Write) -> Result<(), ProtocolError> {
    w.write_all(&magic::CONTROL_INGESTION_DONE)?;
    Ok(())
}

/// Server-to-agent control frames, dispatched on magic.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControlFrame {
    /// Keepalive pong.
    Pong(Pong),
    /// Rotate the given stream's connection.
    Rotate {
        /// Stream index to rotate.
        stream_index: u8,
    },
    /// Session admitted; proceed with ingestion.
    Admit,
    /// Session deferred for the given number of seconds.
    Defer {
        /// Seconds the agent should wait before proceeding.
        delay_secs: u32,
    },
    /// Session aborted by the server.
    Abort {
        /// Server-defined reason code.
        reason: u32,
    },
}

/// Reads one server-to-agent control frame.
///
/// An unknown magic is a protocol violation: the caller is expected to close
/// and reconnect the channel.
pub fn read_control_frame(r: &mut impl Read) -> Result<ControlFrame, ProtocolError> {
    let actual = read_magic(r, "control")?;
    match actual {
        magic::CONTROL_PING => Ok(ControlFrame::Pong(Pong {
            timestamp_nanos: read_i64(r, "pong.timestamp")?,
            server_load: read_f32(r, "pong.load")?,
            disk_free_mb: read_u32(r, "pong.disk")?,
        })),
        magic::CONTROL_ROTATE => Ok(ControlFrame::Rotate {
            stream_index: read_u8(r, "rotate.stream")?,
        }),
        magic::CONTROL_ADMIT => {
            let _reserved = read_u8(r, "admit.reserved")?;
            Ok(ControlFrame::Admit)
        }
        magic::CONTROL_DEFER => Ok(ControlFrame::Defer {
            delay_secs: read_u32(r, "defer.delay")?,
        }),
        magic::CONTROL_ABORT => Ok(ControlFrame::Abort {
            reason: read_u32(r, "abort.reason")?,
        }),
        _ => Err(ProtocolError::InvalidMagic {
            actual,
            context: "control",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn hello_layout_is_magic_interval_version_stats() {
        let hello = ControlHello {
            keepalive_secs: 30,
            client_version: "nbackup/0.3.2".into(),
            stats: StatsSample::default(),
        };
        let mut buf = Vec::new();
        hello.encode(&mut buf).unwrap();
        assert_eq!(&buf[..4], b"CTRL");
        assert_eq!(&buf[4..8], &30u32.to_be_bytes());
        // version line + '\n' + 16-byte stats payload
        assert_eq!(buf.len(), 8 + "nbackup/0.3.2".len() + 1 + 16);
    }

    #[test]
    fn pong_round_trips_through_dispatcher() {
        let pong = Pong {
            timestamp_nanos: 123_456_789,
            server_load: 0.5,
            disk_free_mb: 40_960,
        };
        let mut buf = Vec::new();
        pong.encode(&mut buf).unwrap();
        let frame = read_control_frame(&mut Cursor::new(buf)).unwrap();
        assert_eq!(frame, ControlFrame::Pong(pong));
    }

    #[test]
    fn rotate_frame_carries_stream_index() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"CROT");
        buf.push(2);
        let frame = read_control_frame(&mut Cursor::new(buf)).unwrap();
        assert_eq!(frame, ControlFrame::Rotate { stream_index: 2 });
    }

    #[test]
    fn admit_defer_abort_dispatch() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"CADM");
        buf.push(0);
        assert_eq!(
            read_control_frame(&mut Cursor::new(buf)).unwrap(),
            ControlFrame::Admit
        );

        let mut buf = Vec::new();
        buf.extend_from_slice(b"CDFE");
        buf.extend_from_slice(&15u32.to_be_bytes());
        assert_eq!(
            read_control_frame(&mut Cursor::new(buf)).unwrap(),
            ControlFrame::Defer { delay_secs: 15 }
        );

        let mut buf = Vec::new();
        buf.extend_from_slice(b"CABT");
        buf.extend_from_slice(&7u32.to_be_bytes());
        assert_eq!(
            read_control_frame(&mut Cursor::new(buf)).unwrap(),
            ControlFrame::Abort { reason: 7 }
        );
    }

    #[test]
    fn unknown_magic_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"XYZW");
        let err = read_control_frame(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMagic { .. }));
    }

    #[test]
    fn progress_sets_walk_complete_flag() {
        let mut buf = Vec::new();
        Progress {
            total_objects: 10,
            objects_sent: 4,
            walk_complete: true,
        }
        .encode(&mut buf)
        .unwrap();
        assert_eq!(&buf[..4], b"CPRG");
        assert_eq!(buf[12], 1);
    }

    #[test]
    fn autoscale_stats_layout() {
        let mut buf = Vec::new();
        AutoScaleStats {
            efficiency: 1.25,
            producer_mbs: 80.0,
            drain_mbs: 64.0,
            active_streams: 3,
            max_streams: 8,
            state: 1,
            probe_active: true,
        }
        .encode(&mut buf)
        .unwrap();
        assert_eq!(&buf[..4], b"CASS");
        assert_eq!(buf.len(), 4 + 12 + 4);
        assert_eq!(buf[16], 3);
        assert_eq!(buf[17], 8);
        assert_eq!(buf[18], 1);
        assert_eq!(buf[19], 1);
    }

    #[test]
    fn ingestion_done_is_magic_only() {
        let mut buf = Vec::new();
        write_ingestion_done(&mut buf).unwrap();
        assert_eq!(buf, b"CIDN");
    }

    #[test]
    fn stats_payload_is_16_bytes() {
        let mut buf = Vec::new();
        StatsSample::default().encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 20);
        let decoded = StatsSample::read_body(&mut Cursor::new(buf[4..].to_vec())).unwrap();
        assert_eq!(decoded, StatsSample::default());
    }
}
