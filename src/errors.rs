//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Test manifest could not be read or failed validation.
    Manifest(String),
    /// No test plan is defined for the given unit identifier.
    NoPlanForUnit(String),
    /// The resolved test plan declares zero subtests.
    EmptyPlan(String),
    /// A declared script could not be resolved or started.
    Launch(String),
    /// A process in a launched group exited with a nonzero or unknown status.
    AbnormalExit(String),
    /// A decision resolution arrived while no decision was outstanding.
    NoPendingDecision,
    /// The requested operation is not valid in the current session stage.
    InvalidState(String),
    /// Failure handing a report or note to the inventory sink.
    ReportSink(String),
    /// Result channel registration or transport failure.
    Channel(String),
    /// IPC communication failure.
    Ipc(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Manifest(msg) => write!(f, "manifest: {msg}"),
            Self::NoPlanForUnit(unit) => write!(f, "no plan for unit: {unit}"),
            Self::EmptyPlan(unit) => write!(f, "empty plan: {unit}"),
            Self::Launch(msg) => write!(f, "launch: {msg}"),
            Self::AbnormalExit(msg) => write!(f, "abnormal exit: {msg}"),
            Self::NoPendingDecision => write!(f, "no pending decision"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::ReportSink(msg) => write!(f, "report sink: {msg}"),
            Self::Channel(msg) => write!(f, "channel: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::ReportSink(err.to_string())
    }
}
