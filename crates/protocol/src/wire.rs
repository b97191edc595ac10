//! Primitive big-endian and line-field codecs shared by every frame.

use std::io::{self, Read, Write};

use crate::{MAX_LINE_LEN, ProtocolError};

pub(crate) fn read_exact(
    r: &mut impl Read,
    buf: &mut [u8],
    context: &'static str,
) -> Result<(), ProtocolError> {
    r.read_exact(buf).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated(context)
        } else {
            ProtocolError::Io(err)
        }
    })
}

pub(crate) fn read_u8(r: &mut impl Read, context: &'static str) -> Result<u8, ProtocolError> {
    let mut buf = [0u8; 1];
    read_exact(r, &mut buf, context)?;
    Ok(buf[0])
}

pub(crate) fn read_u32(r: &mut impl Read, context: &'static str) -> Result<u32, ProtocolError> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf, context)?;
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn read_u64(r: &mut impl Read, context: &'static str) -> Result<u64, ProtocolError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf, context)?;
    Ok(u64::from_be_bytes(buf))
}

pub(crate) fn read_i64(r: &mut impl Read, context: &'static str) -> Result<i64, ProtocolError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf, context)?;
    Ok(i64::from_be_bytes(buf))
}

pub(crate) fn read_f32(r: &mut impl Read, context: &'static str) -> Result<f32, ProtocolError> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf, context)?;
    Ok(f32::from_be_bytes(buf))
}

pub(crate) fn read_magic(
    r: &mut impl Read,
    context: &'static str,
) -> Result<[u8; 4], ProtocolError> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf, context)?;
    Ok(buf)
}

pub(crate) fn expect_magic(
    r: &mut impl Read,
    expected: [u8; 4],
    context: &'static str,
) -> Result<(), ProtocolError> {
    let actual = read_magic(r, context)?;
    if actual == expected {
        Ok(())
    } else {
        Err(ProtocolError::InvalidMagic { actual, context })
    }
}

/// Reads a `\n`-terminated UTF-8 field one byte at a time, enforcing the
/// line bound before the terminator is seen.
pub(crate) fn read_line(r: &mut impl Read, context: &'static str) -> Result<String, ProtocolError> {
    let mut raw = Vec::new();
    loop {
        let byte = read_u8(r, context)?;
        if byte == b'\n' {
            break;
        }
        if raw.len() >= MAX_LINE_LEN {
            return Err(ProtocolError::LineTooLong {
                limit: MAX_LINE_LEN,
                context,
            });
        }
        raw.push(byte);
    }
    String::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8(context))
}

pub(crate) fn write_line(
    w: &mut impl Write,
    value: &str,
    context: &'static str,
) -> Result<(), ProtocolError> {
    if value.contains('\n') {
        return Err(ProtocolError::EmbeddedNewline(context));
    }
    w.write_all(value.as_bytes())?;
    w.write_all(b"\n")?;
    Ok(())
}
