//! Simulated IOC behaviour.
//!
//! Each `spawn_*` function starts a task that reacts to client puts on one
//! register set the way the real IOC does, and stops when the cancellation
//! token fires. Monitors are registered before the task is spawned so a put
//! made right after spawning is never missed.

use qas_core::signal::{LocalSignal, PvValue, Signal, SignalMonitor};
use qas_core::status::wait_for_change;
use qas_core::CancellationToken;
use qas_flyer::motor::TrajectoryTable;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::files::ChannelFileWriter;
use crate::regs::{ApbRegs, ChannelRegs, MonoRegs, PilatusRegs, TriggerRegs, XspressRegs};
use crate::timing::SimTiming;

/// Wait until `monitor` reports a change to `target` from anything else.
async fn changed_to(monitor: &mut SignalMonitor, target: i64, cancel: &CancellationToken) -> bool {
    wait_for_change(monitor, cancel, |c| {
        Ok(c.new.as_rounded() == Some(target) && c.old.as_rounded() != Some(target))
    })
    .await
    .is_ok()
}

/// Sleep unless cancelled first.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

fn number(sig: &LocalSignal) -> f64 {
    sig.value().as_f64().unwrap_or(0.0)
}

/// APB streaming box.
///
/// `stream <- 1` starts an acquisition of `stream_samples` at the configured
/// rate; it ends early on `stream <- 0`. Both files are reported saved
/// afterwards unless `mount_available` is false.
pub fn spawn_apb(
    regs: ApbRegs,
    timing: SimTiming,
    mount_available: bool,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut stream = regs.stream.monitor();
    tokio::spawn(async move {
        loop {
            if !changed_to(&mut stream, 1, &cancel).await {
                return;
            }
            regs.filebin_status.set(0);
            regs.filetxt_status.set(0);
            if !pause(timing.streaming_delay, &cancel).await {
                return;
            }
            regs.streaming.set(1);

            let rate_hz = number(&regs.acq_rate) * 1000.0;
            let samples = number(&regs.stream_samples);
            let run = if rate_hz > 0.0 {
                timing.scaled(samples / rate_hz)
            } else {
                Duration::ZERO
            };
            debug!(samples, rate_hz, ?run, "APB streaming");
            let stopped_by_client = tokio::select! {
                _ = tokio::time::sleep(run) => false,
                stopped = changed_to(&mut stream, 0, &cancel) => {
                    if !stopped {
                        return;
                    }
                    true
                }
            };
            regs.streaming.set(0);
            if !stopped_by_client {
                regs.stream.set(0);
            }

            if !mount_available {
                warn!("APB storage not mounted, files not saved");
                continue;
            }
            if !pause(timing.file_save, &cancel).await {
                return;
            }
            regs.filebin_status.set(1);
            regs.filetxt_status.set(1);
        }
    })
}

/// Monochromator trajectory controller.
pub fn spawn_mono(
    regs: MonoRegs,
    table: TrajectoryTable,
    timing: SimTiming,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let prepare = {
        let regs = regs.clone();
        let cancel = cancel.clone();
        let mut prepare = regs.prepare_trajectory.monitor();
        tokio::spawn(async move {
            while changed_to(&mut prepare, 1, &cancel).await {
                regs.trajectory_ready.set(1);
                if !pause(timing.prepare, &cancel).await {
                    return;
                }
                regs.trajectory_ready.set(0);
                regs.prepare_trajectory.set(0);
            }
        })
    };
    let mut start = regs.start_trajectory.monitor();
    let start = tokio::spawn(async move {
        while changed_to(&mut start, 1, &cancel).await {
            let lut = regs.lut_number_rbv.value().as_text();
            let duration = table.duration(&lut).unwrap_or(0.0);
            regs.trajectory_running.set(1);
            debug!(lut = %lut, duration, "Trajectory running");
            if !pause(timing.scaled(duration), &cancel).await {
                return;
            }
            regs.trajectory_running.set(0);
            regs.start_trajectory.set(0);
        }
    });
    vec![prepare, start]
}

/// APB pulse output: generation mode 2 emits `max_counts` pulses at `freq`.
pub fn spawn_trigger(
    regs: TriggerRegs,
    timing: SimTiming,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut acquire = regs.acquire.monitor();
    tokio::spawn(async move {
        while changed_to(&mut acquire, 2, &cancel).await {
            regs.filebin_status.set(1);
            let freq = number(&regs.freq);
            let run = if freq > 0.0 {
                timing.scaled(number(&regs.max_counts) / freq)
            } else {
                Duration::ZERO
            };
            tokio::select! {
                _ = tokio::time::sleep(run) => {}
                stopped = changed_to(&mut acquire, 0, &cancel) => {
                    if !stopped {
                        return;
                    }
                }
            }
            regs.filebin_status.set(0);
        }
    })
}

/// Area detector capture: armed by `acquire <- 1`, finishes when the pulse
/// train driving it ends.
fn spawn_area_detector(
    acquire: Arc<LocalSignal>,
    capture: Arc<LocalSignal>,
    on_finish: impl Fn() + Send + 'static,
    pulses: Arc<LocalSignal>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut acquire_mon = acquire.monitor();
    tokio::spawn(async move {
        while changed_to(&mut acquire_mon, 1, &cancel).await {
            let mut pulse_mon = pulses.monitor();
            let finished = tokio::select! {
                done = changed_to(&mut pulse_mon, 0, &cancel) => done,
                stopped = changed_to(&mut acquire_mon, 0, &cancel) => {
                    if !stopped {
                        return;
                    }
                    false
                }
            };
            if finished {
                on_finish();
            }
            if capture.value().as_rounded() == Some(1) {
                capture.set(0);
            }
        }
    })
}

/// Xspress3 behind a pulse output.
pub fn spawn_xspress(
    regs: XspressRegs,
    pulses: Arc<LocalSignal>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let total = regs.total_points.clone();
    let captured = regs.num_captured.clone();
    spawn_area_detector(
        regs.acquire,
        regs.capture,
        move || captured.set(total.value()),
        pulses,
        cancel,
    )
}

/// Pilatus behind a pulse output.
pub fn spawn_pilatus(
    regs: PilatusRegs,
    pulses: Arc<LocalSignal>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let images = regs.num_images.clone();
    let counter = regs.array_counter.clone();
    spawn_area_detector(
        regs.acquire,
        regs.capture,
        move || counter.set(images.value()),
        pulses,
        cancel,
    )
}

/// Pizza-box channel: writes its file when capture stops.
pub fn spawn_channel(
    regs: ChannelRegs,
    writer: Option<ChannelFileWriter>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut gate = regs.ignore_sel.monitor();
    tokio::spawn(async move {
        loop {
            if !changed_to(&mut gate, 0, &cancel).await {
                return;
            }
            if !changed_to(&mut gate, 1, &cancel).await {
                return;
            }
            let Some(writer) = &writer else {
                continue;
            };
            let path = match regs.filepath.value() {
                PvValue::Text(path) if !path.is_empty() => PathBuf::from(path),
                _ => continue,
            };
            if let Err(err) = writer.write(&path).await {
                warn!(path = %path.display(), error = %err, "Channel file not written");
            }
        }
    })
}
