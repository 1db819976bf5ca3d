//! Error types returned by the lifecycle API and the config loader.
//!
//! Only setup-time failures surface here. Accept errors and per-connection
//! read errors are logged where they happen and never reach the caller.

use std::fmt;
use std::io;

/// Which step of listening socket setup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    /// Resolving the bind address or creating the socket.
    Create,
    /// Binding the socket to `host:port`.
    Bind,
    /// Switching the bound socket into listening mode.
    Listen,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStage::Create => "create",
            SetupStage::Bind => "bind",
            SetupStage::Listen => "listen on",
        };
        f.write_str(name)
    }
}

/// Why `Server::start` (or the start half of `restart`) failed.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("failed to initialize network runtime: {0}")]
    Initialization(#[source] io::Error),

    #[error("failed to {stage} socket for {addr}: {source}")]
    SocketSetup {
        stage: SetupStage,
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl StartError {
    /// The OS error code behind the failure, when there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            StartError::AlreadyRunning => None,
            StartError::Initialization(e) => e.raw_os_error(),
            StartError::SocketSetup { source, .. } => source.raw_os_error(),
        }
    }

    /// The setup stage that failed, for socket setup errors.
    pub fn stage(&self) -> Option<SetupStage> {
        match self {
            StartError::SocketSetup { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Why `Server::stop` could not shut down cleanly.
///
/// After `AcceptLoop` cleanup has still run to completion and the server is
/// Stopped. `InsideRuntime` is returned before anything is touched.
#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("accept loop terminated abnormally: {0}")]
    AcceptLoop(#[source] tokio::task::JoinError),

    /// Refused before anything changed; stop blocks, so it cannot run on a
    /// runtime thread (including from an observer callback on a worker).
    #[error("stop must be called from outside an async runtime")]
    InsideRuntime,
}

/// Failure to load a `ServerConfig`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_setup_message_names_stage_and_addr() {
        let err = StartError::SocketSetup {
            stage: SetupStage::Bind,
            addr: "127.0.0.1:9000".into(),
            source: io::Error::from_raw_os_error(98),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("failed to bind socket for 127.0.0.1:9000"));
        assert_eq!(err.raw_os_error(), Some(98));
        assert_eq!(err.stage(), Some(SetupStage::Bind));
    }

    #[test]
    fn test_already_running_has_no_os_code() {
        assert_eq!(StartError::AlreadyRunning.raw_os_error(), None);
        assert_eq!(StartError::AlreadyRunning.stage(), None);
    }

    #[test]
    fn test_inside_runtime_message() {
        assert_eq!(
            StopError::InsideRuntime.to_string(),
            "stop must be called from outside an async runtime"
        );
    }

    #[test]
    fn test_listen_stage_display() {
        assert_eq!(SetupStage::Listen.to_string(), "listen on");
    }
}
