//! DSCP marking applied to the TCP socket before the TLS handshake.

use std::net::TcpStream;

use crate::TransportError;

/// Differentiated-services code point for outgoing backup traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Dscp(u8);

impl Dscp {
    /// The zero code point: leave the socket unmarked.
    pub const DEFAULT: Self = Self(0);

    /// Parses a standard class name (`EF`, `AF11`..`AF43`, `CS0`..`CS7`).
    pub fn from_name(name: &str) -> Result<Self, TransportError> {
        let code = match name.to_ascii_uppercase().as_str() {
            "" | "CS0" => 0,
            "CS1" => 8,
            "CS2" => 16,
            "CS3" => 24,
            "CS4" => 32,
            "CS5" => 40,
            "CS6" => 48,
            "CS7" => 56,
            "EF" => 46,
            "AF11" => 10,
            "AF12" => 12,
            "AF13" => 14,
            "AF21" => 18,
            "AF22" => 20,
            "AF23" => 22,
            "AF31" => 26,
            "AF32" => 28,
            "AF33" => 30,
            "AF41" => 34,
            "AF42" => 36,
            "AF43" => 38,
            _ => return Err(TransportError::UnknownDscp(name.to_owned())),
        };
        Ok(Self(code))
    }

    /// Returns the raw six-bit code point.
    #[must_use]
    pub const fn code(self) -> u8 {
        self.0
    }

    /// Returns the TOS byte: the code point shifted into the upper six bits.
    #[must_use]
    pub const fn tos(self) -> u8 {
        self.0 << 2
    }

    /// Marks `stream` with this code point. A zero code point is a no-op.
    pub fn apply(self, stream: &TcpStream) -> std::io::Result<()> {
        if self.0 == 0 {
            return Ok(());
        }
        set_tos(stream, self.tos())
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn set_tos(stream: &TcpStream, tos: u8) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let fd = stream.as_raw_fd();
    let value = i32::from(tos);
    let (level, option) = if stream.peer_addr()?.is_ipv6() {
        (libc::IPPROTO_IPV6, libc::IPV6_TCLASS)
    } else {
        (libc::IPPROTO_IP, libc::IP_TOS)
    };
    // SAFETY: fd is a live socket owned by `stream`; the option value is a
    // plain int of the size passed.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            std::ptr::from_ref(&value).cast(),
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn set_tos(_stream: &TcpStream, _tos: u8) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expedited_forwarding_is_46() {
        let dscp = Dscp::from_name("EF").unwrap();
        assert_eq!(dscp.code(), 46);
        assert_eq!(dscp.tos(), 46 << 2);
    }

    #[test]
    fn assured_forwarding_classes() {
        assert_eq!(Dscp::from_name("AF11").unwrap().code(), 10);
        assert_eq!(Dscp::from_name("af43").unwrap().code(), 38);
    }

    #[test]
    fn class_selectors_step_by_eight() {
        for class in 0..=7u8 {
            let dscp = Dscp::from_name(&format!("CS{class}")).unwrap();
            assert_eq!(dscp.code(), class * 8);
        }
    }

    #[test]
    fn empty_name_is_unmarked() {
        assert_eq!(Dscp::from_name("").unwrap(), Dscp::DEFAULT);
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!(matches!(
            Dscp::from_name("GOLD"),
            Err(TransportError::UnknownDscp(_))
        ));
    }
}
