use crate::protocol::AdbError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default adbd TCP port
pub const DEFAULT_PORT: u16 = 5555;

/// Features advertised in the CNXN banner
pub const DEFAULT_FEATURES: &[&str] = &[
    "shell_v2",
    "cmd",
    "stat_v2",
    "ls_v2",
    "fixed_push_mkdir",
    "apex",
    "abb",
    "fixed_push_symlink_timestamp",
    "abb_exec",
    "remount_shell",
    "track_app",
    "sendrecv_v2",
    "sendrecv_v2_brotli",
    "sendrecv_v2_lz4",
    "sendrecv_v2_zstd",
    "sendrecv_v2_dry_run_send",
    "openscreen_mdns",
];

/// Client settings. Every field has a default, so a TOML file only needs
/// the keys it wants to change.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Connect and read timeout
    pub timeout_ms: u64,
    /// Sleep before resending an unacknowledged SND2 chunk
    pub chunk_retry_delay_ms: u64,
    /// `None` resends forever
    pub max_chunk_retries: Option<u32>,
    /// zstd level used for SND2 payloads
    pub compression_level: i32,
    pub features: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            timeout_ms: 5000,
            chunk_retry_delay_ms: 500,
            max_chunk_retries: None,
            compression_level: 4,
            features: DEFAULT_FEATURES.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Connect and read timeout, at least one millisecond
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = (timeout.as_millis() as u64).max(1);
        self
    }

    pub fn with_chunk_retry(mut self, delay: Duration, max_retries: Option<u32>) -> Self {
        self.chunk_retry_delay_ms = delay.as_millis() as u64;
        self.max_chunk_retries = max_retries;
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self, AdbError> {
        let config: Self = toml::from_str(text).map_err(|e| AdbError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, AdbError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| AdbError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<(), AdbError> {
        if self.host.is_empty() {
            return Err(AdbError::Config("host must not be empty".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(AdbError::Config("timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn chunk_retry_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_retry_delay_ms)
    }

    /// CNXN payload: `host::features=<comma separated list>`
    pub fn connection_banner(&self) -> String {
        format!("host::features={}", self.features.join(","))
    }
}
