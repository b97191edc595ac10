//! Single-shot server health probe.

use protocol::{HealthResponse, read_health_response, write_health_probe};

use crate::{Connection, TransportError};

/// Sends the `PING` probe on an established connection and reads the fixed
/// 10-byte response.
pub fn health_check(conn: &Connection) -> Result<HealthResponse, TransportError> {
    write_health_probe(&mut &*conn)?;
    let response = read_health_response(&mut &*conn)?;
    Ok(response)
}
