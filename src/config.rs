// Serde traits so a JSON file maps straight onto our structs
use serde::Deserialize;

// IP parsing for the bind address
use std::net::{IpAddr, SocketAddr};

// File reading and error kinds
use std::{fs, io, path::Path};

// Durations for timeouts and backoff
use std::time::Duration;

// Error returned when a config file cannot be loaded
use crate::error::ConfigError;

/// Port used when neither the config nor the caller picks one.
pub const DEFAULT_PORT: u16 = 12345;

//////////////////////
// LoggerConfig     //
//////////////////////

/// Settings for the global fern dispatcher built by `init_logger`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Minimum level as a string ("trace", "debug", "info", "warn", "error")
    pub log_level: String,

    /// Print coloured lines to stdout
    pub enable_console_log: bool,

    /// Also write `<log_file_path>/<name>.log`
    pub enable_file_log: bool,

    /// Directory for the log file; empty means the working directory
    pub log_file_path: String,

    /// chrono format string used for every timestamp
    pub date_format: String,

    /// Write file lines as JSON envelopes instead of plain text
    pub enable_json_log: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_level: "debug".to_string(),
            enable_console_log: true,
            enable_file_log: false,
            log_file_path: String::new(),
            date_format: "%Y-%m-%d %H:%M:%S%.3f".to_string(),
            enable_json_log: false,
        }
    }
}

//////////////////////
// ServerConfig     //
//////////////////////

/// Everything the server needs besides the port passed to `start`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP address to listen on (e.g. `"0.0.0.0"` for every interface)
    pub host: String,

    /// Port used before the first explicit `start(port)`
    pub port: u16,

    /// How many pending connections the kernel may queue
    pub backlog: u32,

    /// Size of each handler's read buffer in bytes
    pub read_buffer_size: usize,

    /// Seconds of silence before an idle client is dropped; `None` waits forever
    pub read_timeout_secs: Option<u64>,

    /// Milliseconds to sleep after a failed accept
    pub accept_error_backoff_ms: u64,

    /// How many Tokio worker threads to spin up (defaults to cpu-1)
    pub worker_threads: usize,

    /// Logger settings
    pub logger: LoggerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            backlog: 1024,
            read_buffer_size: 1024,
            read_timeout_secs: None,
            accept_error_backoff_ms: 100,
            // Default worker threads = #cores minus one, but at least one
            worker_threads: num_cpus::get().saturating_sub(1).max(1),
            logger: LoggerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse a config from a JSON document. Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = serde_json::from_str(json)?;
        Ok(config.normalized())
    }

    /// Read and parse a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// The address `start(port)` binds to.
    pub fn bind_addr(&self, port: u16) -> io::Result<SocketAddr> {
        let ip: IpAddr = self.host.trim().parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid host '{}': {}", self.host, e),
            )
        })?;
        Ok(SocketAddr::new(ip, port))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs.map(Duration::from_secs)
    }

    pub fn accept_error_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_error_backoff_ms)
    }

    // Zero-sized buffers or runtimes make no sense; clamp instead of failing.
    // Applied to every config a Server is built from, not only parsed ones.
    pub(crate) fn normalized(mut self) -> Self {
        self.read_buffer_size = self.read_buffer_size.max(1);
        self.worker_threads = self.worker_threads.max(1);
        self.backlog = self.backlog.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 12345);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.read_buffer_size, 1024);
        assert!(cfg.read_timeout().is_none());
        assert!(cfg.worker_threads >= 1);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg = ServerConfig::from_json_str(
            r#"{ "port": 9000, "read_timeout_secs": 30, "logger": { "log_level": "info" } }"#,
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.read_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.logger.log_level, "info");
        assert!(cfg.logger.enable_console_log);
        assert_eq!(cfg.backlog, 1024);
    }

    #[test]
    fn test_zero_values_are_clamped() {
        let cfg =
            ServerConfig::from_json_str(r#"{ "read_buffer_size": 0, "worker_threads": 0 }"#)
                .unwrap();
        assert_eq!(cfg.read_buffer_size, 1);
        assert_eq!(cfg.worker_threads, 1);
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = ServerConfig::from_json_str("{ port: nope").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ServerConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_from_file_reads_json() {
        let path = std::env::temp_dir().join(format!(
            "rust_tokio_server_cfg_{}.json",
            std::process::id()
        ));
        fs::write(&path, r#"{ "host": "127.0.0.1", "backlog": 16 }"#).unwrap();
        let cfg = ServerConfig::from_file(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.backlog, 16);
    }

    #[test]
    fn test_bind_addr() {
        let cfg = ServerConfig {
            host: "127.0.0.1".into(),
            ..ServerConfig::default()
        };
        assert_eq!(cfg.bind_addr(9000).unwrap().to_string(), "127.0.0.1:9000");

        let bad = ServerConfig {
            host: "not-an-ip".into(),
            ..ServerConfig::default()
        };
        let err = bad.bind_addr(9000).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
