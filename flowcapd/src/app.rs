//! Bootstrap: parses the CLI, loads the sensor configuration, builds the
//! immutable daemon config, and drives the engine through a signal-gated
//! start/stop cycle.

use std::str::FromStr;

use flow_record::{CompressionMethod, RecordVersion};

use crate::cli::Args;
use crate::config::{DaemonConfig, SensorConfig};
use crate::engine::Engine;
use crate::errors::AppError;

pub async fn run(args: Args) -> Result<(), AppError> {
    let sensor_config = SensorConfig::load(&args.sensor_configuration)?;

    if let Some(verbosity) = &args.verify_sensor_config {
        if verbosity == "verbose" || verbosity == "VERBOSE" {
            for name in sensor_config.probe_names() {
                println!("{name}");
            }
        }
        return Ok(());
    }

    let compression = CompressionMethod::from_str(&args.compression_method).map_err(|_| AppError::UnknownCompressionMethod {
        name: args.compression_method.clone(),
    })?;
    let record_version =
        RecordVersion::from_u8(args.fc_version).expect("clap range validator already bounds fc_version to 2..=5");

    let daemon_config = DaemonConfig {
        destination_directory: args.destination_directory.clone(),
        max_file_size: args.max_file_size,
        write_timeout: std::time::Duration::from_secs(u64::from(args.timeout)),
        clock_time_offset: args.clock_time.map(|secs| std::time::Duration::from_secs(u64::from(secs))),
        freespace_minimum: args.freespace_minimum,
        space_maximum_percent: args.space_maximum_percent,
        record_version,
        compression,
        probe_allowlist: args.probes.clone(),
    };

    let (probes, sensors, probe_sensor_links) = select_probes(sensor_config, &daemon_config);
    if probes.is_empty() {
        return Err(AppError::EmptyProbeSelection);
    }

    let mut engine = Engine::start(daemon_config, probes, sensors, probe_sensor_links).await?;

    crate::signal::wait_for_shutdown().await;
    engine.stop().await;
    Ok(())
}

/// Probes, sensors, and `probe_sensor_links` reindexed to line up with
/// whichever probes survive the CLI allowlist.
type SelectedProbes = (Vec<crate::config::Probe>, Vec<crate::config::Sensor>, Vec<Vec<usize>>);

/// Narrows `sensor_config.probes` to the CLI allowlist (or keeps all of
/// them), returning the surviving probes alongside the full sensor table and
/// `probe_sensor_links` reindexed to line up with the surviving probes'
/// positions.
fn select_probes(sensor_config: SensorConfig, daemon_config: &DaemonConfig) -> SelectedProbes {
    let SensorConfig {
        probes,
        sensors,
        probe_sensor_links,
    } = sensor_config;

    match &daemon_config.probe_allowlist {
        None => (probes, sensors, probe_sensor_links),
        Some(allowlist) => {
            let mut kept_probes = Vec::new();
            let mut kept_links = Vec::new();
            for (probe, links) in probes.into_iter().zip(probe_sensor_links) {
                if allowlist.iter().any(|name| name == &probe.name) {
                    kept_probes.push(probe);
                    kept_links.push(links);
                }
            }
            (kept_probes, sensors, kept_links)
        }
    }
}
