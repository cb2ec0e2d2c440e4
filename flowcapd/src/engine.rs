//! Capture engine (component C6): the per-probe output-file state machine,
//! close triggers, and disk-space admission.
//!
//! One [`ProbeReader`] exists per started probe. Its output file moves
//! through `NoFile -> Open -> Closing -> NoFile|Open` as records arrive and
//! close triggers fire. A size trigger and a timer trigger racing for the
//! same file are serialized by a single engine-wide close-serialization
//! mutex: whichever trigger takes it first sets `closing`, and the other
//! observes that flag and returns without touching the file.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flow_record::{ByteOrder, CodecQuirks};
use snafu::{ResultExt, Snafu};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::{DaemonConfig, Probe, Sensor};
use crate::probe_source::{self, ProbeReceiver};
use crate::rotation::{self, RotationError, RotationPaths};
use crate::stream_writer::{StreamWriter, StreamWriterError};

#[derive(Debug, Snafu)]
pub enum EngineError {
    #[snafu(display("no probe started successfully"))]
    NoProbeStarted,
    #[snafu(display("disk admission rejected opening a file for probe '{probe}': {source}"))]
    DiskAdmission { probe: String, source: RotationError },
    #[snafu(display("rotation protocol failed for probe '{probe}': {source}"))]
    Rotation { probe: String, source: RotationError },
    #[snafu(display("stream writer failed for probe '{probe}': {source}"))]
    Writer { probe: String, source: StreamWriterError },
}

struct OpenFile {
    writer: StreamWriter,
    paths: RotationPaths,
    opened_at: Instant,
}

struct ReaderState {
    file: Option<OpenFile>,
    record_count_since_open: u64,
    closing: bool,
}

/// One probe's output-file state, guarded by its own mutex. Lock order
/// relative to the engine's close-serialization mutex: that mutex is always
/// acquired first.
struct ProbeReader {
    probe: Probe,
    state: Mutex<ReaderState>,
    running: AtomicBool,
    /// Notified whenever a size-triggered reopen happens, so the timer task
    /// can push its next fire a full `write_timeout` out instead of closing
    /// a file that's only seconds old.
    timer_reset: Notify,
}

/// Drives every started probe's receive loop and output-file lifecycle.
pub struct Engine {
    config: Arc<DaemonConfig>,
    readers: Vec<Arc<ProbeReader>>,
    close_serialization: Arc<Mutex<()>>,
    stopping: Arc<AtomicBool>,
    active_probe_count: Arc<AtomicU64>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Binds every probe, opens the first output file for each one that
    /// starts, and spawns its consumer and timer tasks. If every probe
    /// fails to start, the engine aborts and tears down whatever did start.
    /// `sensors` and `probe_sensor_links` (`probes[i]` is fed by
    /// `sensors[probe_sensor_links[i][..]]`) carry the classification data
    /// each probe's receive task needs to tag its decoded records.
    pub async fn start(
        config: DaemonConfig,
        probes: Vec<Probe>,
        sensors: Vec<Sensor>,
        probe_sensor_links: Vec<Vec<usize>>,
    ) -> Result<Self, EngineError> {
        let config = Arc::new(config);
        let close_serialization = Arc::new(Mutex::new(()));
        let stopping = Arc::new(AtomicBool::new(false));
        let active_probe_count = Arc::new(AtomicU64::new(0));

        let mut readers = Vec::with_capacity(probes.len());
        let mut tasks = Vec::new();
        let mut links_iter = probe_sensor_links.into_iter();

        for probe in probes {
            let probe_name = probe.name.clone();
            let probe_sensors: Vec<Sensor> = links_iter
                .next()
                .unwrap_or_default()
                .into_iter()
                .filter_map(|idx| sensors.get(idx).cloned())
                .collect();
            let reader = Arc::new(ProbeReader {
                probe: probe.clone(),
                state: Mutex::new(ReaderState {
                    file: None,
                    record_count_since_open: 0,
                    closing: false,
                }),
                running: AtomicBool::new(false),
                timer_reset: Notify::new(),
            });

            let receiver = match probe_source::spawn(probe, probe_sensors) {
                Ok(receiver) => receiver,
                Err(source) => {
                    crate::internal_events::probe_start_failed(&probe_name, &source);
                    readers.push(reader);
                    continue;
                }
            };

            reader.running.store(true, Ordering::SeqCst);
            active_probe_count.fetch_add(1, Ordering::SeqCst);
            crate::internal_events::probe_started(&probe_name);

            if let Err(err) = open_file(&config, &close_serialization, &reader, &active_probe_count).await {
                tracing::error!(probe = %probe_name, %err, "initial file open failed");
                return Err(err);
            }

            let consumer = spawn_consumer(
                Arc::clone(&config),
                Arc::clone(&reader),
                Arc::clone(&close_serialization),
                Arc::clone(&stopping),
                Arc::clone(&active_probe_count),
                receiver,
            );
            let timer = spawn_timer(
                Arc::clone(&config),
                Arc::clone(&reader),
                Arc::clone(&close_serialization),
                Arc::clone(&stopping),
                Arc::clone(&active_probe_count),
            );
            tasks.push(consumer);
            tasks.push(timer);
            readers.push(reader);
        }

        if readers.iter().all(|r| !r.running.load(Ordering::SeqCst)) {
            return Err(EngineError::NoProbeStarted);
        }

        Ok(Self {
            config,
            readers,
            close_serialization,
            stopping,
            active_probe_count,
            tasks,
        })
    }

    /// Signals every receive/timer task to stop, joins them, and closes
    /// every still-open file. Idempotent: a second call observes an
    /// already-set stopping flag and an already-empty task list.
    pub async fn stop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        for reader in &self.readers {
            if !reader.running.load(Ordering::SeqCst) {
                continue;
            }
            if let Err(err) = try_close(&self.close_serialization, reader).await {
                tracing::error!(probe = %reader.probe.name, %err, "error closing file during shutdown");
            }
        }
    }
}

fn spawn_consumer(
    config: Arc<DaemonConfig>,
    reader: Arc<ProbeReader>,
    close_serialization: Arc<Mutex<()>>,
    stopping: Arc<AtomicBool>,
    active_probe_count: Arc<AtomicU64>,
    mut receiver: ProbeReceiver,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = receiver.records.recv().await {
            if stopping.load(Ordering::SeqCst) {
                break;
            }

            let mut state = reader.state.lock().await;
            let size_trigger = {
                let Some(file) = state.file.as_mut() else {
                    // The previous close raced ahead of us; drop this record
                    // rather than open a new file mid-consume. A fresh file
                    // opens on the next timer fire or engine restart.
                    continue;
                };
                if let Err(err) = file.writer.write_record(&record).await {
                    tracing::error!(probe = %reader.probe.name, %err, "fatal write error");
                    std::process::exit(1);
                }
                state.record_count_since_open += 1;
                state.file.as_ref().unwrap().writer.upper_bound_bytes() >= config.max_file_size
            };
            drop(state);

            if size_trigger {
                if let Err(err) = try_close(&close_serialization, &reader).await {
                    tracing::error!(probe = %reader.probe.name, %err, "fatal close error");
                    std::process::exit(1);
                }
                if let Err(err) = open_file(&config, &close_serialization, &reader, &active_probe_count).await {
                    tracing::error!(probe = %reader.probe.name, %err, "fatal reopen error");
                    std::process::exit(1);
                }
                // The file this size trigger just opened has a full
                // `write_timeout` ahead of it; push the timer task's next
                // fire out instead of letting it close a freshly opened file.
                reader.timer_reset.notify_one();
            }
        }
    })
}

fn spawn_timer(
    config: Arc<DaemonConfig>,
    reader: Arc<ProbeReader>,
    close_serialization: Arc<Mutex<()>>,
    stopping: Arc<AtomicBool>,
    active_probe_count: Arc<AtomicU64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let first_delay = next_boundary_delay(config.write_timeout, config.clock_time_offset);
        let mut deadline = tokio::time::Instant::now() + first_delay;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    if stopping.load(Ordering::SeqCst) {
                        return;
                    }

                    if let Err(err) = try_close(&close_serialization, &reader).await {
                        tracing::error!(probe = %reader.probe.name, %err, "fatal close error");
                        std::process::exit(1);
                    }
                    if !stopping.load(Ordering::SeqCst) {
                        if let Err(err) = open_file(&config, &close_serialization, &reader, &active_probe_count).await {
                            tracing::error!(probe = %reader.probe.name, %err, "fatal reopen error");
                            std::process::exit(1);
                        }
                    }

                    deadline = tokio::time::Instant::now() + config.write_timeout;
                }
                _ = reader.timer_reset.notified() => {
                    // A size-triggered reopen already gave this probe a fresh
                    // file; rearm for a full period from now without closing
                    // anything ourselves.
                    deadline = tokio::time::Instant::now() + config.write_timeout;
                }
            }

            if stopping.load(Ordering::SeqCst) {
                return;
            }
        }
    })
}

/// Delay until the first close-timer fire. With no clock anchor configured,
/// the first fire is simply one full period away. With an anchor, the first
/// fire is aligned to the next `write_timeout` boundary past midnight UTC +
/// offset, so restarts and multiple probes close in lockstep.
fn next_boundary_delay(write_timeout: Duration, clock_time_offset: Option<Duration>) -> Duration {
    let Some(offset) = clock_time_offset else {
        return write_timeout;
    };
    let period = write_timeout.as_secs().max(1);
    let now = chrono::Utc::now();
    let midnight = now.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
    let elapsed_today = (now - midnight).num_seconds().max(0) as u64;
    let anchored = elapsed_today.saturating_sub(offset.as_secs());
    let remainder = anchored % period;
    let until_boundary = if remainder == 0 { 0 } else { period - remainder };
    Duration::from_secs(until_boundary.max(1))
}

/// Attempts to transition a reader into `Closing` and run the close
/// procedure. Acquires the close-serialization mutex first, then the
/// per-reader mutex, per the documented lock order. If another trigger has
/// already claimed this close, returns immediately without touching the
/// file.
async fn try_close(close_serialization: &Mutex<()>, reader: &ProbeReader) -> Result<(), EngineError> {
    let _serialization_guard = close_serialization.lock().await;
    let mut state = reader.state.lock().await;

    if state.closing {
        return Ok(());
    }
    state.closing = true;

    let Some(file) = state.file.take() else {
        state.closing = false;
        return Ok(());
    };

    let elapsed = file.opened_at.elapsed();
    let record_count = state.record_count_since_open;
    state.record_count_since_open = 0;

    if record_count == 0 {
        drop_empty_file(file, &reader.probe.name, elapsed).await?;
    } else {
        publish_file(file, &reader.probe.name, record_count, elapsed).await?;
    }

    // `closing` clears here unconditionally; `open_file` re-locks the same
    // per-reader mutex right after every trigger kind, so there is no window
    // where a cleared flag could let a second concurrent close through.
    state.closing = false;
    Ok(())
}

async fn drop_empty_file(file: OpenFile, probe_name: &str, elapsed: Duration) -> Result<(), EngineError> {
    file.writer.close().await.context(WriterSnafu { probe: probe_name.to_string() })?;
    rotation::remove_empty(&file.paths)
        .await
        .context(RotationSnafu { probe: probe_name.to_string() })?;
    crate::internal_events::empty_file_removed(probe_name, elapsed);
    Ok(())
}

async fn publish_file(
    file: OpenFile,
    probe_name: &str,
    record_count: u64,
    elapsed: Duration,
) -> Result<(), EngineError> {
    let uncompressed = file.writer.uncompressed_logical_len();
    let compressed = file.writer.upper_bound_bytes();
    file.writer.close().await.context(WriterSnafu { probe: probe_name.to_string() })?;

    let ratio = if uncompressed > 0 {
        (uncompressed as f64 - compressed as f64) / uncompressed as f64
    } else {
        0.0
    };

    rotation::publish(&file.paths)
        .await
        .context(RotationSnafu { probe: probe_name.to_string() })?;

    crate::internal_events::file_published(probe_name, record_count, compressed, elapsed, ratio);
    Ok(())
}

/// Runs the open procedure: disk-space admission, placeholder + dotfile
/// creation, header write, and entry into the data phase.
async fn open_file(
    config: &DaemonConfig,
    close_serialization: &Mutex<()>,
    reader: &ProbeReader,
    active_probe_count: &AtomicU64,
) -> Result<(), EngineError> {
    let _serialization_guard = close_serialization.lock().await;
    let mut state = reader.state.lock().await;

    let active = active_probe_count.load(Ordering::SeqCst).max(1);
    let reserved = config.per_file_allowance() * active;
    if let Err(source) =
        check_admission(&config.destination_directory, reserved, config.freespace_minimum, config.space_maximum_percent)
    {
        crate::internal_events::disk_admission_rejected(&reader.probe.name, &source);
        return Err(EngineError::DiskAdmission { probe: reader.probe.name.clone(), source });
    }

    let paths = RotationPaths::new_now(&config.destination_directory, &reader.probe.name);
    let file = rotation::open_for_write(&paths)
        .await
        .context(RotationSnafu { probe: reader.probe.name.clone() })?;

    let quirks = CodecQuirks { zero_packets: reader.probe.quirks.zero_packets };
    let anchor_ms = chrono::Utc::now().timestamp_millis();
    let writer = StreamWriter::open(
        file,
        config.record_version,
        ByteOrder::native(),
        config.compression,
        anchor_ms,
        quirks,
        &reader.probe.name,
    )
    .await
    .context(WriterSnafu { probe: reader.probe.name.clone() })?;

    state.file = Some(OpenFile {
        writer,
        paths,
        opened_at: Instant::now(),
    });
    state.record_count_since_open = 0;
    Ok(())
}

fn check_admission(dir: &Path, reserved: u64, minimum: u64, max_percent: f64) -> Result<(), RotationError> {
    rotation::check_disk_admission(dir, reserved, minimum, max_percent)
}
