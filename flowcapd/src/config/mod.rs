//! Configuration types: probes, sensors, and the immutable daemon config
//! threaded by reference through the engine.
//!
//! The upstream daemon this is modeled on keeps destination directory,
//! compression method, version, and size/time limits as process globals.
//! Here they're bundled into [`DaemonConfig`] once at startup and passed by
//! reference; nothing needs to mutate them after `start()`.

pub mod loading;
pub mod probe;
pub mod sensor;

use std::path::PathBuf;
use std::time::Duration;

use flow_record::{CompressionMethod, RecordVersion};

pub use loading::{ConfigError, SensorConfig};
pub use probe::{Probe, ProbeQuirks, ProbeType, Transport};
pub use sensor::{classify, Decider, NetworkRole, Sensor, SensorConfigError};

/// Everything the engine needs that doesn't change after `start()`.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub destination_directory: PathBuf,
    pub max_file_size: u64,
    pub write_timeout: Duration,
    pub clock_time_offset: Option<Duration>,
    pub freespace_minimum: u64,
    pub space_maximum_percent: f64,
    pub record_version: RecordVersion,
    pub compression: CompressionMethod,
    pub probe_allowlist: Option<Vec<String>>,
}

impl DaemonConfig {
    /// Per-file disk allowance: `max_file_size * 1.15`, enough slack to
    /// absorb worst-case compression expansion.
    pub fn per_file_allowance(&self) -> u64 {
        (self.max_file_size as f64 * 1.15).ceil() as u64
    }
}
