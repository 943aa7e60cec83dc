//! Configuration parsing and CSV diagnostics output.

pub mod config;
pub mod data_log;

pub use config::Config;
pub use data_log::DataLogger;
