//! Top-level error aggregation for the daemon binary.

use snafu::Snafu;

use crate::config::ConfigError;
use crate::engine::EngineError;

#[derive(Debug, Snafu)]
pub enum AppError {
    #[snafu(display("{source}"))]
    Config { source: ConfigError },
    #[snafu(display("{source}"))]
    Engine { source: EngineError },
    #[snafu(display("no probe matched the --probes whitelist"))]
    EmptyProbeSelection,
    #[snafu(display("unknown compression method '{name}'"))]
    UnknownCompressionMethod { name: String },
}

impl From<ConfigError> for AppError {
    fn from(source: ConfigError) -> Self {
        AppError::Config { source }
    }
}

impl From<EngineError> for AppError {
    fn from(source: EngineError) -> Self {
        AppError::Engine { source }
    }
}
