// Import local time formatting tools from chrono
use chrono::Local;

// Per-level colours for the console branch
use fern::colors::{Color, ColoredLevelConfig};

// Set the global log level (e.g., Debug, Info, Warn, Error)
use log::LevelFilter;

// Set up the dispatch builder for combining logger outputs
use fern::Dispatch;

// JSON envelopes for structured file output
use serde_json::Value as JsonValue;

// Standard I/O and filesystem operations (stdout, file creation)
use std::{fs, io};

// Used to initialize a static value only once in a thread-safe way
use std::sync::OnceLock;

// User settings for the dispatcher
use crate::config::LoggerConfig;

/// A simple Logger struct that wraps logging functions.
/// Clonable to allow use across multiple threads/tasks.
#[derive(Clone, Copy, Debug, Default)]
pub struct Logger;

impl Logger {
    /// Logs a message at DEBUG level
    pub fn debug(&self, msg: &str) {
        log::debug!("{}", msg);
    }

    /// Logs a message at INFO level
    pub fn info(&self, msg: &str) {
        log::info!("{}", msg);
    }

    /// Logs a message at WARN level
    pub fn warn(&self, msg: &str) {
        log::warn!("{}", msg);
    }

    /// Logs a message at ERROR level
    pub fn error(&self, msg: &str) {
        log::error!("{}", msg);
    }

    /// Logs a message at an arbitrary level
    pub fn log(&self, level: log::Level, msg: &str) {
        log::log!(level, "{}", msg);
    }
}

/// Static global LOGGER instance, initialized once
static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Where the file branch writes for a logger called `name`.
pub fn log_file_path(name: &str, cfg: &LoggerConfig) -> String {
    let file_name = format!("{}.log", name.replace('.', "_"));
    if cfg.log_file_path.is_empty() {
        file_name
    } else {
        format!("{}/{}", cfg.log_file_path.trim_end_matches('/'), file_name)
    }
}

/// Build the JSON line written to the file branch when `enable_json_log` is on.
/// Messages that are themselves JSON are embedded as objects, not strings.
pub fn json_envelope(timestamp: &str, name: &str, level: log::Level, message: &str) -> JsonValue {
    let message_json: JsonValue = serde_json::from_str(message)
        .unwrap_or_else(|_| JsonValue::String(message.to_string()));

    serde_json::json!({
        "timestamp": timestamp,
        "name":      name,
        "level":     level.to_string(),
        "message":   message_json
    })
}

/// Initialize the global logger exactly once, according to the provided settings.
/// After this call, all calls to `log::debug!(), info!(), warn!(), error!()` (and the
/// `Logger` methods) go through the configured fern dispatcher.
pub fn init_logger(name: &str, cfg: &LoggerConfig) -> Logger {
    *LOGGER.get_or_init(|| {
        // ────────────────────────────────────────────────────────────────
        // 1) Parse the configured level string into a log::LevelFilter
        //    If parsing fails, we default to Debug (most verbose).
        // ────────────────────────────────────────────────────────────────
        let level = cfg
            .log_level
            .parse::<LevelFilter>()
            .unwrap_or(LevelFilter::Debug);

        // ────────────────────────────────────────────────────────────────
        // 2) Build the base fern::Dispatch with the global minimum level
        // ────────────────────────────────────────────────────────────────
        let mut base = Dispatch::new().level(level);

        // ────────────────────────────────────────────────────────────────
        // 3) Console branch: timestamp, name, coloured level, message
        // ────────────────────────────────────────────────────────────────
        if cfg.enable_console_log {
            let nm = name.to_string();
            let datefmt = cfg.date_format.clone();
            let colors = ColoredLevelConfig::new()
                .info(Color::Green)
                .warn(Color::Yellow)
                .error(Color::Red)
                .debug(Color::Blue)
                .trace(Color::Magenta);

            let log_format_console = move |out: fern::FormatCallback, message: &std::fmt::Arguments, record: &log::Record| {
                out.finish(format_args!(
                    "\x1b[92m{}\x1b[0m - \x1b[94m{}\x1b[0m - {} - {}",
                    Local::now().format(&datefmt),
                    nm,
                    colors.color(record.level()),
                    message
                ))
            };

            base = base.chain(
                Dispatch::new()
                    .format(log_format_console)
                    .chain(io::stdout()),
            );
        }

        // ────────────────────────────────────────────────────────────────
        // 4) File branch: plain text or JSON envelopes in
        //    "<log_file_path>/<name>.log"
        // ────────────────────────────────────────────────────────────────
        if cfg.enable_file_log {
            // Ensure the directory exists (no-op if empty or already present)
            if !cfg.log_file_path.is_empty() {
                let _ = fs::create_dir_all(&cfg.log_file_path);
            }

            let nm = name.to_string();
            let datefmt = cfg.date_format.clone();
            let enable_json = cfg.enable_json_log;
            let filepath = log_file_path(name, cfg);

            let log_format_file = move |out: fern::FormatCallback, message: &std::fmt::Arguments, record: &log::Record| {
                let timestamp = Local::now().format(&datefmt).to_string();
                if enable_json {
                    let envelope = json_envelope(&timestamp, &nm, record.level(), &message.to_string());
                    out.finish(format_args!("{}", envelope))
                } else {
                    out.finish(format_args!(
                        "{} - {} - {} - {}",
                        timestamp,
                        nm,
                        record.level(),
                        message
                    ))
                }
            };

            // Attempt to open the logfile, but don't panic—fallback to sink on error
            let file_output: Box<dyn io::Write + Send> = match fern::log_file(&filepath) {
                Ok(fh) => Box::new(fh),
                Err(err) => {
                    eprintln!("Warning: could not open log file {}: {}", filepath, err);
                    Box::new(io::sink())
                }
            };

            base = base.chain(
                Dispatch::new()
                    .format(log_format_file)
                    .chain(file_output),
            );
        }

        // ────────────────────────────────────────────────────────────────
        // 5) Apply the composed dispatcher as the global logger.
        //    Another crate may have installed one already; keep theirs.
        // ────────────────────────────────────────────────────────────────
        if let Err(e) = base.apply() {
            eprintln!("Warning: logger for {} not installed: {}", name, e);
        }

        Logger
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_path_sanitizes_name() {
        let cfg = LoggerConfig::default();
        assert_eq!(log_file_path("tokio.server", &cfg), "tokio_server.log");

        let cfg = LoggerConfig {
            log_file_path: "logs/".into(),
            ..LoggerConfig::default()
        };
        assert_eq!(log_file_path("srv", &cfg), "logs/srv.log");
    }

    #[test]
    fn test_json_envelope_embeds_json_messages() {
        let env = json_envelope("t", "srv", log::Level::Info, r#"{"port":9000}"#);
        assert_eq!(env["message"]["port"], 9000);
        assert_eq!(env["level"], "INFO");

        let env = json_envelope("t", "srv", log::Level::Warn, "plain text");
        assert_eq!(env["message"], "plain text");
    }
}
