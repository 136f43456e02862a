// Library interface for ptyd
// The binary, integration tests, and benchmarks all go through these modules

pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
