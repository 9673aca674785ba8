//! Dirt Admin Daemon (dirtd)
//!
//! Hosts the deployment supervisor: contends for leadership with peer admin
//! processes and, while leading, tracks live containers and pending
//! deployments.
//!
//! ## Quick Start
//!
//! ```bash
//! # Single node: embedded coordination service plus a local container
//! dirtd
//!
//! # Custom namespace and admin id, metrics on :9090
//! dirtd --namespace staging --admin-id admin-1 --metrics-bind 0.0.0.0:9090
//! ```

pub mod cli;
pub mod server;

pub use cli::Cli;
pub use server::{AdminServer, ShutdownHandle};
