//! Error taxonomy for meshbench.

use std::time::Duration;

/// Errors produced while driving external infrastructure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A CLI invocation exited non-zero in strict mode.
    #[error("command `{}` exited with code {exit_code}: {stderr}", .argv.join(" "))]
    ExternalCommand {
        argv: Vec<String>,
        exit_code: i32,
        stderr: String,
    },

    /// The program could not be started at all.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A readiness query failed in a way that is known to be transient.
    #[error("transient poll error: {0}")]
    TransientPoll(String),

    /// The load-test endpoint could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// The load-test endpoint answered, but not with a usable result.
    #[error("load test failed: {0}")]
    LoadTest(String),

    /// Malformed input detected before any resource was created.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Tearing down a resource failed.
    #[error("teardown of {resource} failed: {message}")]
    Teardown { resource: String, message: String },

    /// Some rollouts were abandoned after non-recoverable status errors.
    #[error("rollout incomplete in namespace {namespace}: abandoned {}", .abandoned.join(", "))]
    RolloutIncomplete {
        namespace: String,
        abandoned: Vec<String>,
    },

    #[error("timed out after {waited:?} waiting for {check}")]
    PollTimeout { check: String, waited: Duration },

    /// The operator aborted while `during` was in progress.
    #[error("cancelled during {during}")]
    Cancelled { during: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn cancelled(during: impl Into<String>) -> Self {
        Error::Cancelled {
            during: during.into(),
        }
    }

    /// Whether the error is recovered locally by re-queueing a poll.
    pub fn is_transient_poll(&self) -> bool {
        matches!(self, Error::TransientPoll(_))
    }

    /// Whether the error is a connection-level failure that warrants a retry.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Whether a readiness wait must stop instead of polling again.
    ///
    /// Query failures in general mean "not ready yet"; only errors that no
    /// amount of waiting can fix end the wait.
    pub fn aborts_poll(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_)
                | Error::Spawn { .. }
                | Error::Cancelled { .. }
                | Error::RolloutIncomplete { .. }
        )
    }

    /// Stderr of a failed external command, if this is one.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Error::ExternalCommand { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Result type for meshbench operations.
pub type Result<T> = std::result::Result<T, Error>;
