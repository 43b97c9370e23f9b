//! Local IPC layer for `qual-ctl` interaction.
//!
//! Provides a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! server that accepts JSON-line session control commands from the
//! companion CLI.

pub mod server;

pub use server::spawn_ipc_server;
