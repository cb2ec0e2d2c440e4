//! The dotfile/placeholder publish protocol and disk-space admission check
//! (component C7).
//!
//! A consumer polling the destination directory must never observe a
//! partially written file under its final name. We guarantee that by
//! reserving the final name as a zero-byte placeholder up front, writing
//! under a dot-prefixed name the whole time, and only at close time
//! `rename`-ing the dotfile over the placeholder — an atomic operation on
//! the same filesystem.

use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use nix::sys::statvfs::statvfs;
use snafu::{ResultExt, Snafu};
use tokio::fs::{self, File, OpenOptions};

#[derive(Debug, Snafu)]
pub enum RotationError {
    #[snafu(display("failed to create placeholder '{}': {source}", path.display()))]
    CreatePlaceholder { path: PathBuf, source: std::io::Error },
    #[snafu(display("failed to create dotfile '{}': {source}", path.display()))]
    CreateDotfile { path: PathBuf, source: std::io::Error },
    #[snafu(display("failed to remove stale dotfile '{}': {source}", path.display()))]
    RemoveStaleDotfile { path: PathBuf, source: std::io::Error },
    #[snafu(display("failed to publish '{}' -> '{}': {source}", from.display(), to.display()))]
    Publish { from: PathBuf, to: PathBuf, source: std::io::Error },
    #[snafu(display("failed to remove empty file '{}': {source}", path.display()))]
    RemoveEmpty { path: PathBuf, source: std::io::Error },
    #[snafu(display("failed to read free space for '{}': {source}", path.display()))]
    Statvfs { path: PathBuf, source: nix::Error },
    #[snafu(display(
        "disk admission failed: free {free} bytes minus reserved {reserved} bytes is below the {minimum}-byte floor"
    ))]
    BelowMinimumFree { free: u64, reserved: u64, minimum: u64 },
    #[snafu(display(
        "disk admission failed: projected usage {used_percent:.2}% exceeds the {max_percent:.2}% ceiling"
    ))]
    AboveMaximumPercent { used_percent: f64, max_percent: f64 },
}

/// The two paths a file under rotation occupies at once: the dot-prefixed
/// working name and the placeholder it will be published onto.
pub struct RotationPaths {
    pub dotfile: PathBuf,
    pub placeholder: PathBuf,
}

impl RotationPaths {
    /// Builds `<dir>/<YYYYMMDDhhmmss>_<probe>.XXXXXX` as the placeholder and
    /// `<dir>/.<basename>` as the dotfile, for a file opened "now".
    pub fn new_now(destination_dir: &Path, probe_name: &str) -> Self {
        let timestamp = Utc::now().format("%Y%m%d%H%M%S");
        let suffix = unique_suffix();
        let basename = format!("{timestamp}_{probe_name}.{suffix}");
        let placeholder = destination_dir.join(&basename);
        let dotfile = destination_dir.join(format!(".{basename}"));
        Self { dotfile, placeholder }
    }
}

/// Generates the `XXXXXX`-style unique suffix. Six base36 characters give
/// enough entropy to make a same-millisecond collision between probes or
/// across a restart implausible without requiring a shared counter.
fn unique_suffix() -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..6).map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char).collect()
}

/// Opens the placeholder (mode 0644, reserving the name) and then the
/// dotfile (exclusive create), retrying the dotfile once if a crash
/// remnant is found. Returns the open dotfile descriptor, ready to be
/// wrapped by the stream writer.
pub async fn open_for_write(paths: &RotationPaths) -> Result<File, RotationError> {
    let placeholder = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(&paths.placeholder)
        .await
        .context(CreatePlaceholderSnafu { path: paths.placeholder.clone() })?;
    drop(placeholder);

    match OpenOptions::new().write(true).create_new(true).mode(0o644).open(&paths.dotfile).await {
        Ok(file) => Ok(file),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            fs::remove_file(&paths.dotfile)
                .await
                .context(RemoveStaleDotfileSnafu { path: paths.dotfile.clone() })?;
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o644)
                .open(&paths.dotfile)
                .await
                .context(CreateDotfileSnafu { path: paths.dotfile.clone() })
        }
        Err(source) => Err(RotationError::CreateDotfile { path: paths.dotfile.clone(), source }),
    }
}

/// Publishes a non-empty file: atomically renames the dotfile over the
/// placeholder. After this call returns, consumers see the file as
/// complete (no dot prefix, size > 0).
pub async fn publish(paths: &RotationPaths) -> Result<(), RotationError> {
    fs::rename(&paths.dotfile, &paths.placeholder).await.context(PublishSnafu {
        from: paths.dotfile.clone(),
        to: paths.placeholder.clone(),
    })
}

/// Removes both the dotfile and the placeholder for a file that received
/// zero records, leaving no trace in the destination directory.
pub async fn remove_empty(paths: &RotationPaths) -> Result<(), RotationError> {
    fs::remove_file(&paths.dotfile)
        .await
        .context(RemoveEmptySnafu { path: paths.dotfile.clone() })?;
    fs::remove_file(&paths.placeholder)
        .await
        .context(RemoveEmptySnafu { path: paths.placeholder.clone() })
}

/// Checks the admission inequalities against the destination filesystem's
/// current free/total space before a new file is opened.
///
/// `reserved_bytes` is `per_file_allowance * active_probe_count` (`A·N`):
/// the worst-case space every other currently open probe file might still
/// consume, which must be set aside before admitting one more.
pub fn check_disk_admission(
    destination_dir: &Path,
    reserved_bytes: u64,
    minimum_free: u64,
    max_percent: f64,
) -> Result<(), RotationError> {
    let stats = statvfs(destination_dir).context(StatvfsSnafu { path: destination_dir.to_path_buf() })?;
    let block_size = stats.block_size();
    let free = stats.blocks_available() * block_size;
    let total = stats.blocks() * block_size;

    let free_after_reservation = free.saturating_sub(reserved_bytes);
    if free_after_reservation < minimum_free {
        return Err(RotationError::BelowMinimumFree {
            free,
            reserved: reserved_bytes,
            minimum: minimum_free,
        });
    }

    if total > 0 {
        let used = total.saturating_sub(free_after_reservation);
        let used_percent = used as f64 / total as f64 * 100.0;
        if used_percent > max_percent {
            return Err(RotationError::AboveMaximumPercent { used_percent, max_percent });
        }
    }

    Ok(())
}
