//! Typed agent configuration and its builder.

use std::path::PathBuf;
use std::time::Duration;

use engine::{ScalerConfig, ScalerMode};
use protocol::{Compression, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use transport::{Dscp, RetryPolicy, TlsSettings};

use crate::BackupError;

/// Smallest accepted bandwidth limit when one is set (64 KiB/s).
const MIN_BANDWIDTH: u64 = 64 * 1024;

/// Auto-scaler knobs.
#[derive(Clone, Copy, Debug)]
pub struct ScalerSettings {
    /// Scaling strategy.
    pub mode: ScalerMode,
    /// Consecutive windows before a decision.
    pub hysteresis: u32,
    /// Evaluation period.
    pub interval: Duration,
    /// Whether scaling decisions are applied at all.
    pub enabled: bool,
}

impl Default for ScalerSettings {
    fn default() -> Self {
        Self {
            mode: ScalerMode::Efficiency,
            hysteresis: 3,
            interval: Duration::from_secs(15),
            enabled: true,
        }
    }
}

impl ScalerSettings {
    pub(crate) const fn to_engine(self) -> ScalerConfig {
        ScalerConfig {
            mode: self.mode,
            hysteresis: self.hysteresis,
            interval: self.interval,
            enabled: self.enabled,
        }
    }
}

/// Validated agent configuration consumed by [`crate::run_backup`].
#[derive(Clone, Debug)]
pub struct Config {
    server_addr: String,
    agent_name: String,
    storage_name: String,
    tls: TlsSettings,
    compression: Compression,
    ring_capacity: usize,
    chunk_size: u32,
    max_streams: u8,
    retry: RetryPolicy,
    keepalive: Duration,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    bandwidth_limit: u64,
    dscp: Dscp,
    scaler: ScalerSettings,
}

impl Config {
    /// Starts a builder with the required identity fields.
    #[must_use]
    pub fn builder(
        server_addr: impl Into<String>,
        agent_name: impl Into<String>,
        storage_name: impl Into<String>,
    ) -> ConfigBuilder {
        ConfigBuilder {
            server_addr: server_addr.into(),
            agent_name: agent_name.into(),
            storage_name: storage_name.into(),
            ca_bundle: PathBuf::from("/etc/nbackup/ca.pem"),
            client_cert: PathBuf::from("/etc/nbackup/agent.pem"),
            client_key: PathBuf::from("/etc/nbackup/agent.key"),
            server_name: None,
            compression: Compression::Gzip,
            ring_capacity: 32 * 1024 * 1024,
            chunk_size: 1024 * 1024,
            max_streams: 0,
            retry: RetryPolicy::default(),
            keepalive: Duration::from_secs(30),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            bandwidth_limit: 0,
            dscp_name: String::new(),
            scaler: ScalerSettings::default(),
        }
    }

    /// Server address in `host:port` form.
    #[must_use]
    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    /// Agent identity registered with the server.
    #[must_use]
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Target storage name.
    #[must_use]
    pub fn storage_name(&self) -> &str {
        &self.storage_name
    }

    /// TLS material and server name.
    #[must_use]
    pub const fn tls(&self) -> &TlsSettings {
        &self.tls
    }

    /// Preferred compression variant; a v4 server's choice overrides it.
    #[must_use]
    pub const fn compression(&self) -> Compression {
        self.compression
    }

    /// Ring-buffer capacity in bytes (per stream in parallel mode).
    #[must_use]
    pub const fn ring_capacity(&self) -> usize {
        self.ring_capacity
    }

    /// Chunk payload size for parallel sessions.
    #[must_use]
    pub const fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Stream count: zero selects the single-stream path.
    #[must_use]
    pub const fn max_streams(&self) -> u8 {
        self.max_streams
    }

    /// Reconnect policy for the data path.
    #[must_use]
    pub const fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Control-channel keepalive interval.
    #[must_use]
    pub const fn keepalive(&self) -> Duration {
        self.keepalive
    }

    /// First control-channel reconnect delay.
    #[must_use]
    pub const fn reconnect_initial(&self) -> Duration {
        self.reconnect_initial
    }

    /// Control-channel reconnect delay cap.
    #[must_use]
    pub const fn reconnect_max(&self) -> Duration {
        self.reconnect_max
    }

    /// Bandwidth limit in bytes per second, zero when disabled.
    #[must_use]
    pub const fn bandwidth_limit(&self) -> u64 {
        self.bandwidth_limit
    }

    /// DSCP marking for data and control sockets.
    #[must_use]
    pub const fn dscp(&self) -> Dscp {
        self.dscp
    }

    /// Auto-scaler settings.
    #[must_use]
    pub const fn scaler(&self) -> ScalerSettings {
        self.scaler
    }
}

/// Builder for [`Config`], validating on [`ConfigBuilder::build`].
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    server_addr: String,
    agent_name: String,
    storage_name: String,
    ca_bundle: PathBuf,
    client_cert: PathBuf,
    client_key: PathBuf,
    server_name: Option<String>,
    compression: Compression,
    ring_capacity: usize,
    chunk_size: u32,
    max_streams: u8,
    retry: RetryPolicy,
    keepalive: Duration,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    bandwidth_limit: u64,
    dscp_name: String,
    scaler: ScalerSettings,
}

impl ConfigBuilder {
    /// Sets the TLS material paths.
    #[must_use]
    pub fn tls_material(
        mut self,
        ca_bundle: impl Into<PathBuf>,
        client_cert: impl Into<PathBuf>,
        client_key: impl Into<PathBuf>,
    ) -> Self {
        self.ca_bundle = ca_bundle.into();
        self.client_cert = client_cert.into();
        self.client_key = client_key.into();
        self
    }

    /// Overrides the TLS server name (defaults to the address host).
    #[must_use]
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Sets the preferred compression variant.
    #[must_use]
    pub const fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the ring-buffer capacity in bytes.
    #[must_use]
    pub const fn ring_capacity(mut self, bytes: usize) -> Self {
        self.ring_capacity = bytes;
        self
    }

    /// Sets the parallel chunk size in bytes.
    #[must_use]
    pub const fn chunk_size(mut self, bytes: u32) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Sets the stream count (zero = single-stream).
    #[must_use]
    pub const fn max_streams(mut self, streams: u8) -> Self {
        self.max_streams = streams;
        self
    }

    /// Sets the data-path retry policy.
    #[must_use]
    pub const fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the control keepalive interval.
    #[must_use]
    pub const fn keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }

    /// Sets the control reconnect delays.
    #[must_use]
    pub const fn reconnect_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial = initial;
        self.reconnect_max = max;
        self
    }

    /// Sets the bandwidth limit in bytes per second (zero disables).
    #[must_use]
    pub const fn bandwidth_limit(mut self, bytes_per_second: u64) -> Self {
        self.bandwidth_limit = bytes_per_second;
        self
    }

    /// Sets the DSCP class name (`EF`, `AF21`, `CS3`, ...).
    #[must_use]
    pub fn dscp(mut self, name: impl Into<String>) -> Self {
        self.dscp_name = name.into();
        self
    }

    /// Sets the auto-scaler settings.
    #[must_use]
    pub const fn scaler(mut self, scaler: ScalerSettings) -> Self {
        self.scaler = scaler;
        self
    }

    /// Validates the knobs and produces the configuration.
    pub fn build(self) -> Result<Config, BackupError> {
        if self.server_addr.is_empty() {
            return Err(BackupError::Config("server address is required".into()));
        }
        if self.agent_name.is_empty() || self.storage_name.is_empty() {
            return Err(BackupError::Config(
                "agent and storage names are required".into(),
            ));
        }
        if self.max_streams > 0
            && !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size)
        {
            return Err(BackupError::Config(format!(
                "chunk size {} outside [{MIN_CHUNK_SIZE}, {MAX_CHUNK_SIZE}]",
                self.chunk_size
            )));
        }
        if self.bandwidth_limit != 0 && self.bandwidth_limit < MIN_BANDWIDTH {
            return Err(BackupError::Config(format!(
                "bandwidth limit {} below minimum {MIN_BANDWIDTH}",
                self.bandwidth_limit
            )));
        }
        if self.max_streams > 0 && self.ring_capacity < self.chunk_size as usize + 8 {
            return Err(BackupError::Config(
                "ring capacity must hold at least one framed chunk".into(),
            ));
        }
        let dscp = Dscp::from_name(&self.dscp_name)
            .map_err(|err| BackupError::Config(err.to_string()))?;
        let server_name = self.server_name.unwrap_or_else(|| {
            self.server_addr
                .rsplit_once(':')
                .map_or(self.server_addr.clone(), |(host, _)| host.to_owned())
        });

        Ok(Config {
            tls: TlsSettings {
                ca_bundle: self.ca_bundle,
                client_cert: self.client_cert,
                client_key: self.client_key,
                server_name,
            },
            server_addr: self.server_addr,
            agent_name: self.agent_name,
            storage_name: self.storage_name,
            compression: self.compression,
            ring_capacity: self.ring_capacity,
            chunk_size: self.chunk_size,
            max_streams: self.max_streams,
            retry: self.retry,
            keepalive: self.keepalive,
            reconnect_initial: self.reconnect_initial,
            reconnect_max: self.reconnect_max,
            bandwidth_limit: self.bandwidth_limit,
            dscp,
            scaler: self.scaler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> ConfigBuilder {
        Config::builder("backup.example:7430", "agent-1", "vault")
    }

    #[test]
    fn defaults_build_cleanly() {
        let config = builder().build().unwrap();
        assert_eq!(config.max_streams(), 0);
        assert_eq!(config.compression(), Compression::Gzip);
        assert_eq!(config.chunk_size(), 1024 * 1024);
        assert_eq!(config.tls().server_name, "backup.example");
    }

    #[test]
    fn empty_identity_is_rejected() {
        assert!(Config::builder("", "a", "s").build().is_err());
        assert!(Config::builder("addr:1", "", "s").build().is_err());
        assert!(Config::builder("addr:1", "a", "").build().is_err());
    }

    #[test]
    fn chunk_size_bounds_apply_in_parallel_mode() {
        let err = builder().max_streams(4).chunk_size(1024).build();
        assert!(err.is_err());
        let err = builder().max_streams(4).chunk_size(32 * 1024 * 1024).build();
        assert!(err.is_err());
        assert!(builder().max_streams(4).chunk_size(64 * 1024).build().is_ok());
    }

    #[test]
    fn single_stream_ignores_chunk_bounds() {
        assert!(builder().chunk_size(1024).ring_capacity(4096).build().is_ok());
    }

    #[test]
    fn bandwidth_floor_is_enforced() {
        assert!(builder().bandwidth_limit(1024).build().is_err());
        assert!(builder().bandwidth_limit(64 * 1024).build().is_ok());
        assert!(builder().bandwidth_limit(0).build().is_ok());
    }

    #[test]
    fn ring_must_hold_one_chunk() {
        let err = builder()
            .max_streams(2)
            .chunk_size(1024 * 1024)
            .ring_capacity(1024)
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn unknown_dscp_is_rejected() {
        assert!(builder().dscp("PLATINUM").build().is_err());
        assert!(builder().dscp("EF").build().is_ok());
    }

    #[test]
    fn explicit_server_name_wins() {
        let config = builder().server_name("vault.internal").build().unwrap();
        assert_eq!(config.tls().server_name, "vault.internal");
    }
}
