//! Bootstrap helpers for the aceproxy binary
//!
//! Configuration loading and validation happen here so the binary stays a
//! thin lifecycle shell.

pub mod config;

pub use config::load_config;
