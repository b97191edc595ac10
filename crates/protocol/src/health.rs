//! Single-shot health-check probe.

use std::io::{Read, Write};

use crate::wire::{read_exact, read_u8, read_u64};
use crate::{ProtocolError, magic};

/// Server health as reported by the probe response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    /// Accepting sessions.
    Ready,
    /// Temporarily saturated.
    Busy,
    /// Disk space below the server's admission threshold.
    LowDisk,
    /// Administratively drained.
    Maintenance,
}

impl HealthStatus {
    fn from_wire(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Ready),
            1 => Ok(Self::Busy),
            2 => Ok(Self::LowDisk),
            3 => Ok(Self::Maintenance),
            _ => Err(ProtocolError::InvalidStatus {
                field: "health",
                value,
            }),
        }
    }
}

/// Probe response: status plus free disk space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthResponse {
    /// Current server health.
    pub status: HealthStatus,
    /// Free disk space in bytes.
    pub disk_free: u64,
}

/// Writes the 4-byte ASCII `PING` probe.
pub fn write_health_probe(w: &mut impl Write) -> Result<(), ProtocolError> {
    w.write_all(&magic::HEALTH)?;
    Ok(())
}

/// Reads the fixed 10-byte probe response `[status][disk_free u64][\n]`.
pub fn read_health_response(r: &mut impl Read) -> Result<HealthResponse, ProtocolError> {
    let status = HealthStatus::from_wire(read_u8(r, "health.status")?)?;
    let disk_free = read_u64(r, "health.disk")?;
    let mut terminator = [0u8; 1];
    read_exact(r, &mut terminator, "health.terminator")?;
    if terminator[0] != b'\n' {
        return Err(ProtocolError::InvalidStatus {
            field: "health-terminator",
            value: terminator[0],
        });
    }
    Ok(HealthResponse { status, disk_free })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn probe_is_ascii_ping() {
        let mut buf = Vec::new();
        write_health_probe(&mut buf).unwrap();
        assert_eq!(buf, b"PING");
    }

    #[test]
    fn response_parses_status_and_disk() {
        let mut buf = vec![2u8];
        buf.extend_from_slice(&(8u64 << 30).to_be_bytes());
        buf.push(b'\n');
        let response = read_health_response(&mut Cursor::new(buf)).unwrap();
        assert_eq!(response.status, HealthStatus::LowDisk);
        assert_eq!(response.disk_free, 8 << 30);
    }

    #[test]
    fn response_rejects_missing_terminator() {
        let mut buf = vec![0u8];
        buf.extend_from_slice(&0u64.to_be_bytes());
        buf.push(b'x');
        assert!(read_health_response(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn response_rejects_unknown_status() {
        let mut buf = vec![9u8];
        buf.extend_from_slice(&0u64.to_be_bytes());
        buf.push(b'\n');
        assert!(read_health_response(&mut Cursor::new(buf)).is_err());
    }
}
