//! Result codes and error types shared by the poller.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal result of a check as exchanged with the scheduler
///
/// The numeric values are stable and shared with the configuration cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ResultCode {
    Success = 0,
    NotSupported = -3,
    NetworkError = -4,
    TimeoutError = -5,
    AgentError = -6,
    GatewayError = -7,
    ConfigError = -8,
    SignalInterrupted = -9,
}

impl ResultCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultCode::Success => "SUCCEED",
            ResultCode::NotSupported => "NOTSUPPORTED",
            ResultCode::NetworkError => "NETWORK_ERROR",
            ResultCode::TimeoutError => "TIMEOUT_ERROR",
            ResultCode::AgentError => "AGENT_ERROR",
            ResultCode::GatewayError => "GATEWAY_ERROR",
            ResultCode::ConfigError => "CONFIG_ERROR",
            ResultCode::SignalInterrupted => "SIG_ERROR",
        };
        f.write_str(name)
    }
}

/// Protocol stage a check was in when its deadline fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckStage {
    /// Waiting for the connection (and the secure handshake, if any)
    ConnectWait,
    Send,
    Recv,
    /// Waiting for a free transfer slot in the HTTP engine
    Queued,
    Transfer,
}

impl fmt::Display for CheckStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckStage::ConnectWait => "ConnectWait",
            CheckStage::Send => "Send",
            CheckStage::Recv => "Recv",
            CheckStage::Queued => "Queued",
            CheckStage::Transfer => "Transfer",
        };
        f.write_str(name)
    }
}

/// Terminal error of a single check
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CheckError {
    pub code: ResultCode,
    pub message: String,
    /// Set only for timeouts
    pub stage: Option<CheckStage>,
}

impl CheckError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), stage: None }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ResultCode::ConfigError, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ResultCode::NetworkError, message)
    }

    pub fn gateway(message: impl Into<String>) -> Self {
        Self::new(ResultCode::GatewayError, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ResultCode::NotSupported, message)
    }

    pub fn agent(message: impl Into<String>) -> Self {
        Self::new(ResultCode::AgentError, message)
    }

    /// Deadline expiry, annotated with the stage it interrupted
    pub fn timeout(context: &str, stage: CheckStage) -> Self {
        Self {
            code: ResultCode::TimeoutError,
            message: format!("{context}: timed out during {stage}"),
            stage: Some(stage),
        }
    }
}

/// Failure talking to one of the poller's collaborators
///
/// These are logged by the reactor and never stop it.
#[derive(Debug, Error)]
pub enum PollerError {
    #[error("scheduler error: {0}")]
    Scheduler(String),
    #[error("value pipeline error: {0}")]
    ValuePipeline(String),
    #[error("availability channel error: {0}")]
    Availability(String),
    #[error("cannot encode availability update: {0}")]
    Encode(#[from] serde_json::Error),
}
