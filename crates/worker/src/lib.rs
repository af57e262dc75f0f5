//! Igloo worker
//!
//! A small command-line host for the connector dispatch core: it loads
//! [`WorkerSettings`], starts a `ConnectorManager` and runs SQL scans over CSV
//! files in a data directory.

pub mod config;
pub mod error;
pub mod scan;

pub use crate::config::WorkerSettings;
pub use error::WorkerError;
pub use scan::{run_scan, scan_request};
