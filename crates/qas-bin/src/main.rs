//! CLI entry point for QAS fly scans
//!
//! Provides command-line interface for:
//! - Running fly scans against the simulated beamline
//! - Probing the streaming box's access to the network filesystem
//! - Decoding pizza-box and streaming-box data files
//!
//! # Usage
//!
//! ```bash
//! qas-flyscan simulate --variant xs --cycles 2 --duration 10 --out docs.jsonl
//! qas-flyscan check-mount --unmounted
//! qas-flyscan decode --kind enc /epics/pb_data/en_a1b2c3 --chunk-size 1024 --chunk 0
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use qas_core::config::Settings;
use qas_core::context::BeamlineContext;
use qas_core::document::{Document, StopDoc};
use qas_core::handlers;
use qas_driver_sim::{FlyerVariant, SimBeamline, SimOptions};
use qas_experiment::{scan_metadata, FlyScan, RunEngine, ScanInfo};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qas-flyscan")]
#[command(about = "Fly-scan orchestration for the QAS beamline", long_about = None)]
struct Cli {
    /// Settings file (TOML); `QAS_*` environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run fly scans against the simulated beamline
    Simulate {
        /// Flyer to use
        #[arg(long, default_value = "apb")]
        variant: FlyerVariant,

        /// Scan name
        #[arg(long, default_value = "sim")]
        name: String,

        /// Comment stored with every run
        #[arg(long, default_value = "")]
        comment: String,

        /// Number of runs
        #[arg(long, default_value = "1")]
        cycles: usize,

        /// Pause between runs in seconds
        #[arg(long, default_value = "0")]
        delay: f64,

        /// Trajectory duration in seconds
        #[arg(long, default_value = "10")]
        duration: f64,

        /// Simulated seconds per real second (smaller is faster)
        #[arg(long)]
        time_scale: Option<f64>,

        /// Directory receiving every simulated file
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Write run documents as JSON lines
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Probe the streaming box's access to the network filesystem
    CheckMount {
        /// Simulate a box that cannot reach the mount
        #[arg(long)]
        unmounted: bool,

        /// Directory receiving the probe files
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Decode a data file
    Decode {
        /// File format
        #[arg(long, value_enum)]
        kind: FileKind,

        /// File to decode
        file: PathBuf,

        /// Rows per chunk for text files
        #[arg(long, default_value = "1024")]
        chunk_size: usize,

        /// Print the rows of this chunk as JSON lines
        #[arg(long)]
        chunk: Option<usize>,
    },
}

/// Data file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FileKind {
    /// Pizza-box encoder text
    Enc,
    /// Pizza-box digital input text
    Di,
    /// Pizza-box analog input text
    An,
    /// Streaming box binary
    Apb,
    /// Pulse output binary
    Trig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())
        .with_context(|| match &cli.config {
            Some(path) => format!("loading settings from {}", path.display()),
            None => "loading default settings".to_string(),
        })?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate {
            variant,
            name,
            comment,
            cycles,
            delay,
            duration,
            time_scale,
            data_dir,
            out,
        } => {
            let mut options = SimOptions::default();
            if let Some(scale) = time_scale {
                options.time_scale = scale;
            }
            options.lut_points = trajectory_points(duration, settings.trajectory.servo_rate_hz)?;
            let settings = rebase(settings, data_dir.as_deref());
            let request = ScanRequest {
                variant,
                name,
                comment,
                cycles,
                delay,
            };
            let stops = simulate(settings, options, request, out.as_deref()).await?;
            let failed = stops.iter().filter(|s| s.exit_status != "success").count();
            if failed > 0 {
                bail!("{failed} of {} runs did not succeed", stops.len());
            }
            Ok(())
        }
        Commands::CheckMount {
            unmounted,
            data_dir,
        } => check_mount(rebase(settings, data_dir.as_deref()), !unmounted).await,
        Commands::Decode {
            kind,
            file,
            chunk_size,
            chunk,
        } => decode(kind, &file, chunk_size, chunk).await,
    }
}

/// What to fly and how often.
struct ScanRequest {
    variant: FlyerVariant,
    name: String,
    comment: String,
    cycles: usize,
    delay: f64,
}

fn scan_info(variant: FlyerVariant, name: &str, comment: &str) -> ScanInfo {
    match variant {
        FlyerVariant::Apb => ScanInfo::apb(name, comment),
        FlyerVariant::ApbTrigger => ScanInfo::apb_trigger(name, comment),
        FlyerVariant::Xs => ScanInfo::xs(name, comment),
        FlyerVariant::Pilatus => ScanInfo::pilatus(name, comment),
    }
}

fn trajectory_points(duration: f64, servo_rate_hz: f64) -> Result<u64> {
    if !(duration.is_finite() && duration > 0.0) {
        bail!("trajectory duration must be positive, got {duration}");
    }
    Ok((duration * servo_rate_hz).round() as u64)
}

/// Move every output location under `dir`, or under the system temp
/// directory when none is given.
fn rebase(mut settings: Settings, dir: Option<&Path>) -> Settings {
    let dir = dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| std::env::temp_dir().join("qas-flyscan"));
    settings.paths.root = dir.join("legacy");
    settings.paths.pizzabox_dir = dir.join("pb_data");
    settings.paths.mount_root = dir.join("legacy").join("raw").join("apb");
    settings
}

async fn simulate(
    settings: Settings,
    options: SimOptions,
    request: ScanRequest,
    out: Option<&Path>,
) -> Result<Vec<StopDoc>> {
    let context = BeamlineContext::new(settings);
    let sim = SimBeamline::build(context.settings(), options, context.cancel_token())
        .context("building simulated beamline")?;
    let flyer = Arc::new(
        sim.flyer(request.variant)
            .with_context(|| format!("building {} flyer", request.variant))?,
    );
    let info = scan_info(request.variant, &request.name, &request.comment);
    let metadata = scan_metadata(context.metadata().as_ref(), &info);

    let engine = RunEngine::new(context.clone());
    engine.register_motor(sim.devices.mono.clone()).await;
    engine.register_flyer(flyer.clone()).await;

    let done = CancellationToken::new();
    let writer = tokio::spawn(write_documents(
        engine.subscribe(),
        out.map(Path::to_path_buf),
        done.clone(),
    ));

    let plan = FlyScan::new(&info.name, request.variant.flyer_name(), "mono1")
        .with_plan_name(&info.plan_name)
        .with_cycles(request.cycles)
        .with_delay(request.delay)
        .with_metadata(metadata);
    info!(variant = %request.variant, cycles = request.cycles, "Starting simulated fly scan");

    let run = engine.run(Box::new(plan));
    tokio::pin!(run);
    let stops = tokio::select! {
        stops = &mut run => stops?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, aborting the scan");
            engine.abort("interrupted").await?;
            run.await?
        }
    };

    done.cancel();
    let written = writer.await.context("document writer panicked")??;
    for stop in &stops {
        info!(
            run_uid = %stop.run_uid,
            exit_status = %stop.exit_status,
            num_events = stop.num_events,
            "Run finished"
        );
    }
    info!(documents = written, runs = stops.len(), "Simulation complete");
    context.shutdown();
    Ok(stops)
}

/// Copy documents from `rx` to `out` (JSON lines) until `done` fires.
async fn write_documents(
    mut rx: broadcast::Receiver<Document>,
    out: Option<PathBuf>,
    done: CancellationToken,
) -> Result<usize> {
    let mut file = match &out {
        Some(path) => Some(tokio::io::BufWriter::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("creating {}", path.display()))?,
        )),
        None => None,
    };
    let mut written = 0;
    loop {
        let doc = tokio::select! {
            received = rx.recv() => match received {
                Ok(doc) => doc,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Document writer fell behind");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = done.cancelled() => match rx.try_recv() {
                Ok(doc) => doc,
                Err(_) => break,
            },
        };
        if let Some(file) = file.as_mut() {
            let mut line = serde_json::to_vec(&doc)?;
            line.push(b'\n');
            file.write_all(&line).await?;
        }
        written += 1;
    }
    if let Some(mut file) = file {
        file.flush().await?;
    }
    Ok(written)
}

async fn check_mount(settings: Settings, mounted: bool) -> Result<()> {
    let options = SimOptions {
        mount_available: mounted,
        ..SimOptions::default()
    };
    let cancel = CancellationToken::new();
    let sim = SimBeamline::build(&settings, options, &cancel)
        .context("building simulated beamline")?;
    let result = sim.devices.apb.check_mount().await;
    cancel.cancel();
    result.with_context(|| {
        format!(
            "mount check against {}",
            settings.paths.mount_root.display()
        )
    })?;
    info!(mount_root = %settings.paths.mount_root.display(), "Mount available");
    Ok(())
}

/// Summary of a decoded file.
#[derive(Debug, PartialEq, Serialize)]
struct DecodeSummary {
    rows: usize,
    chunks: usize,
    first_time: Option<f64>,
    last_time: Option<f64>,
}

async fn decode(kind: FileKind, file: &Path, chunk_size: usize, chunk: Option<usize>) -> Result<()> {
    let (summary, rows) = decode_file(kind, file, chunk_size, chunk).await?;
    println!("{}", serde_json::to_string(&summary)?);
    for row in rows {
        println!("{row}");
    }
    Ok(())
}

/// Decode `file`, returning its summary and the selected chunk as JSON.
async fn decode_file(
    kind: FileKind,
    file: &Path,
    chunk_size: usize,
    chunk: Option<usize>,
) -> Result<(DecodeSummary, Vec<serde_json::Value>)> {
    if chunk_size == 0 {
        bail!("chunk size must be positive");
    }
    let read_text = || async move {
        tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("reading {}", file.display()))
    };
    let read_bytes = || async move {
        tokio::fs::read(file)
            .await
            .with_context(|| format!("reading {}", file.display()))
    };
    let text_time = |ts_s: i64, ts_ns: i64| ts_s as f64 + 1e-9 * ts_ns as f64;

    match kind {
        FileKind::Enc => {
            let rows = handlers::parse_encoder_rows(&read_text().await?)?;
            let times: Vec<f64> = rows.iter().map(|r| text_time(r.ts_s, r.ts_ns)).collect();
            summarize(&rows, &times, chunk_size, chunk)
        }
        FileKind::Di => {
            let rows = handlers::parse_digital_rows(&read_text().await?)?;
            let times: Vec<f64> = rows.iter().map(|r| text_time(r.ts_s, r.ts_ns)).collect();
            summarize(&rows, &times, chunk_size, chunk)
        }
        FileKind::An => {
            let rows = handlers::parse_analog_rows(&read_text().await?)?;
            let times: Vec<f64> = rows.iter().map(|r| r.time).collect();
            summarize(&rows, &times, chunk_size, chunk)
        }
        FileKind::Apb => {
            let rows = handlers::parse_apb_bin(&read_bytes().await?)?;
            let times: Vec<f64> = rows.iter().map(|r| r.timestamp).collect();
            summarize(&rows, &times, chunk_size, chunk)
        }
        FileKind::Trig => {
            let rows = handlers::parse_apb_trigger_bin(&read_bytes().await?)?;
            let times: Vec<f64> = rows.iter().map(|r| r.timestamp).collect();
            summarize(&rows, &times, chunk_size, chunk)
        }
    }
}

fn summarize<T: Serialize>(
    rows: &[T],
    times: &[f64],
    chunk_size: usize,
    chunk: Option<usize>,
) -> Result<(DecodeSummary, Vec<serde_json::Value>)> {
    let summary = DecodeSummary {
        rows: rows.len(),
        chunks: handlers::chunk_count(rows.len(), chunk_size),
        first_time: times.first().copied(),
        last_time: times.last().copied(),
    };
    let selected = match chunk {
        Some(n) => handlers::chunk(rows, chunk_size, n)
            .iter()
            .map(serde_json::to_value)
            .collect::<serde_json::Result<Vec<_>>>()?,
        None => Vec::new(),
    };
    Ok((summary, selected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulate_arguments_parse() {
        let cli = Cli::try_parse_from([
            "qas-flyscan",
            "simulate",
            "--variant",
            "apb-trigger",
            "--cycles",
            "3",
            "--duration",
            "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Simulate {
                variant,
                cycles,
                duration,
                ..
            } => {
                assert_eq!(variant, FlyerVariant::ApbTrigger);
                assert_eq!(cycles, 3);
                assert_eq!(duration, 5.0);
            }
            _ => panic!("expected simulate"),
        }
        assert!(Cli::try_parse_from(["qas-flyscan", "simulate", "--variant", "xrf"]).is_err());
    }

    #[test]
    fn trajectory_points_follow_the_servo_rate() {
        assert_eq!(trajectory_points(10.0, 16000.0).unwrap(), 160_000);
        assert!(trajectory_points(0.0, 16000.0).is_err());
        assert!(trajectory_points(f64::NAN, 16000.0).is_err());
    }

    #[test]
    fn rebase_moves_every_output_location() {
        let settings = rebase(Settings::default(), Some(Path::new("/tmp/qas")));
        assert!(settings.paths.root.starts_with("/tmp/qas"));
        assert!(settings.paths.pizzabox_dir.starts_with("/tmp/qas"));
        assert!(settings.paths.mount_root.starts_with(&settings.paths.root));
    }

    #[tokio::test]
    async fn decode_encoder_file_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("en_000001");
        let text: String = (0..5)
            .map(|i| format!("1700000000 {} {} {i} 0\n", i * 1000, 0xFFFFFE - i))
            .collect();
        std::fs::write(&path, text).unwrap();

        let (summary, rows) = decode_file(FileKind::Enc, &path, 2, Some(2)).await.unwrap();
        assert_eq!(summary.rows, 5);
        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.first_time, Some(1_700_000_000.0));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["index"], serde_json::json!(4));
    }

    #[tokio::test]
    async fn decode_rejects_zero_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("an_000001");
        std::fs::write(&path, "").unwrap();
        assert!(decode_file(FileKind::An, &path, 0, None).await.is_err());
    }

    #[tokio::test]
    async fn simulated_scan_writes_documents() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = rebase(Settings::default(), Some(dir.path()));
        settings.trigger.stream_settle = std::time::Duration::from_millis(5);
        let out = dir.path().join("docs.jsonl");
        let request = ScanRequest {
            variant: FlyerVariant::Apb,
            name: "sim".into(),
            comment: String::new(),
            cycles: 1,
            delay: 0.0,
        };

        let stops = simulate(settings, SimOptions::default(), request, Some(&out))
            .await
            .unwrap();

        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].exit_status, "success");
        let text = std::fs::read_to_string(out).unwrap();
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["type"], "start");
        assert!(text.lines().last().unwrap().contains("\"type\":\"stop\""));
    }
}
