#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod ipc;
pub mod launcher;
pub mod manifest;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod report;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
