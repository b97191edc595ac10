//! Server health probe exposed to external tooling.

use protocol::HealthResponse;
use transport::{TlsClient, health_check};

use crate::{BackupError, Config};

/// Connects to the configured server and runs the single-shot health
/// probe.
pub fn check_server_health(config: &Config) -> Result<HealthResponse, BackupError> {
    let client = TlsClient::new(config.tls())?;
    let conn = client.connect(config.server_addr(), config.dscp())?;
    let response = health_check(&conn)?;
    conn.close();
    Ok(response)
}
