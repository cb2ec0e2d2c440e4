//! Process command-line interface.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "flowcapd", version, about = "Network-flow capture daemon")]
pub struct Args {
    /// Probe/sensor configuration file.
    #[arg(long)]
    pub sensor_configuration: PathBuf,

    /// Parse the sensor configuration and exit: 0 if valid, 1 if invalid.
    /// With no value, silent; with `verbose`, also prints probe names.
    #[arg(long, value_name = "VERBOSE", num_args = 0..=1, default_missing_value = "")]
    pub verify_sensor_config: Option<String>,

    /// Directory dotfiles and placeholders are written into.
    #[arg(long)]
    pub destination_directory: PathBuf,

    /// Maximum size of one output file before it's rotated, e.g. `100k`, `4m`.
    #[arg(long, value_parser = parse_bytesize)]
    pub max_file_size: u64,

    /// Close-timer period in seconds.
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u32).range(1..=(u32::MAX - 1) as i64))]
    pub timeout: u32,

    /// Align close-timer boundaries to midnight UTC plus this many seconds.
    /// With no value, aligns to midnight UTC exactly.
    #[arg(long, value_name = "OFFSET_SECONDS", num_args = 0..=1, default_missing_value = "0")]
    pub clock_time: Option<u32>,

    /// Minimum free bytes the destination filesystem must retain.
    #[arg(long, default_value = "1GiB", value_parser = parse_bytesize)]
    pub freespace_minimum: u64,

    /// Maximum percent of the destination filesystem that may be used.
    #[arg(long, default_value_t = 98.00)]
    pub space_maximum_percent: f64,

    /// Comma-separated probe-name whitelist; unset runs every configured probe.
    #[arg(long, value_delimiter = ',')]
    pub probes: Option<Vec<String>>,

    /// Output record version.
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u8).range(2..=5))]
    pub fc_version: u8,

    /// Stream compression method.
    #[arg(long, default_value = "none")]
    pub compression_method: String,
}

fn parse_bytesize(s: &str) -> Result<u64, String> {
    let parsed: bytesize::ByteSize = s.parse().map_err(|e: String| e)?;
    let bytes = parsed.as_u64();
    if bytes > u64::from(u32::MAX) {
        return Err(format!("size '{s}' exceeds the 2^32-1 byte upper bound"));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_human_suffixed_sizes() {
        assert_eq!(parse_bytesize("100k").unwrap(), 100_000);
        assert_eq!(parse_bytesize("4m").unwrap(), 4_000_000);
    }

    #[test]
    fn rejects_sizes_over_the_u32_bound() {
        assert!(parse_bytesize("5g").is_ok());
        assert!(parse_bytesize("5t").is_err());
    }
}
