//! Error types for the OTA transfer middleware.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OtaError>;

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    #[error("out of memory: {0}")]
    NoMemory(&'static str),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("firmware version mismatch: local {local:#010x}, peer {peer:#010x}")]
    Version { local: u32, peer: u32 },

    #[error("device topology error: {0}")]
    Device(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("peer send failed after {attempts} attempts")]
    PeerSend { attempts: u32 },

    #[error("timed out waiting for peer {waiting_for}")]
    PeerTimeout { waiting_for: &'static str },

    #[error("session is desynchronized")]
    Desynchronized,

    #[error("firmware check failed: {0}")]
    FwCheck(String),
}

/// Status codes surfaced to the surrounding application, mirroring the
/// wire-level exit set of the deployed protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    InvalidParam = 1,
    NoMemory = 2,
    ParseError = 3,
    VersionError = 4,
    DeviceError = 5,
    ConfigError = 6,
    Failure = 7,
    /// Resume accepted: the session continues from a persisted breakpoint.
    Resume = 8,
}

impl From<&OtaError> for ExitCode {
    fn from(err: &OtaError) -> Self {
        match err {
            OtaError::InvalidParam(_) => ExitCode::InvalidParam,
            OtaError::NoMemory(_) => ExitCode::NoMemory,
            OtaError::Parse(_) => ExitCode::ParseError,
            OtaError::Version { .. } => ExitCode::VersionError,
            OtaError::Device(_) | OtaError::PeerTimeout { .. } => ExitCode::DeviceError,
            OtaError::Config(_) => ExitCode::ConfigError,
            OtaError::Io(_)
            | OtaError::PeerSend { .. }
            | OtaError::Desynchronized
            | OtaError::FwCheck(_) => ExitCode::Failure,
        }
    }
}
