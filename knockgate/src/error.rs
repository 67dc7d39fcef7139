use std::{error::Error, fmt};

use knockgate_common::ConfigError;

use crate::capture::CaptureError;

/// Fatal listener startup/runtime errors.
///
/// Exit codes are part of the supervision contract: the supervisor
/// classifies a rapid exit by code, not by scraping logs.
#[derive(Debug)]
pub enum ListenerError {
    /// Capture and firewall mutation require root.
    MissingPrivilege,
    Config(ConfigError),
    Capture(CaptureError),
    Runtime(String),
}

impl ListenerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ListenerError::MissingPrivilege => 1,
            ListenerError::Config(_) => 2,
            ListenerError::Capture(_) | ListenerError::Runtime(_) => 3,
        }
    }
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerError::MissingPrivilege => {
                write!(f, "root privilege required to capture and manage the firewall")
            }
            ListenerError::Config(e) => write!(f, "invalid configuration: {e}"),
            ListenerError::Capture(e) => e.fmt(f),
            ListenerError::Runtime(msg) => f.write_str(msg),
        }
    }
}

impl Error for ListenerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ListenerError::Config(e) => Some(e),
            ListenerError::Capture(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for ListenerError {
    fn from(e: ConfigError) -> Self {
        ListenerError::Config(e)
    }
}

impl From<CaptureError> for ListenerError {
    fn from(e: CaptureError) -> Self {
        ListenerError::Capture(e)
    }
}
