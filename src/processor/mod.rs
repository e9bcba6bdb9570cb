//! Raw session → [`TelemetryPayload`] transformation.

mod downsample;
mod normalize;

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::key::SessionKey;
use crate::payload::{SessionMetadata, TelemetryFrame, TelemetryPayload, TrackStatusPeriod};
use crate::session::{RawDriver, RawSample, RawSession};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("empty session: {0}")]
    EmptySession(String),
    #[error("processing cancelled")]
    Cancelled,
}

/// A sample flattened out of its lap with the lap-derived values attached.
struct LapSample<'a> {
    sample: &'a RawSample,
    lap: u32,
    tyre: u8,
    race_distance: Option<f64>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryProcessor;

impl TelemetryProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Transforms `raw` for `key`, calling `on_progress(percentage, message)` once
    /// per driver. The event for the last driver is held back until the payload
    /// is assembled and always reads exactly 100.0.
    pub fn run(
        &self,
        raw: &RawSession,
        key: &SessionKey,
        on_progress: &mut dyn FnMut(f64, String),
        cancel: &CancellationToken,
    ) -> Result<TelemetryPayload, ProcessError> {
        if raw.drivers.is_empty() {
            return Err(ProcessError::EmptySession(format!(
                "{} contains no drivers",
                raw.event_name
            )));
        }

        let mut seen = HashSet::new();
        let drivers: Vec<&RawDriver> = raw
            .drivers
            .iter()
            .filter(|d| key.includes_driver(&d.code.to_ascii_uppercase()))
            .filter(|d| d.timed_sample_count() > 0)
            .filter(|d| {
                let fresh = seen.insert(d.code.to_ascii_uppercase());
                if !fresh {
                    warn!(driver = %d.code, "duplicate driver code in session, keeping the first");
                }
                fresh
            })
            .collect();
        if drivers.is_empty() {
            return Err(ProcessError::EmptySession(format!(
                "no telemetry for the requested drivers in {}",
                raw.event_name
            )));
        }

        let t0 = drivers
            .iter()
            .flat_map(|d| d.laps.iter())
            .flat_map(|lap| lap.samples.iter())
            .map(|s| s.session_time)
            .filter(|t| t.is_finite())
            .min_by(f64::total_cmp)
            .unwrap_or(0.0);

        let total = drivers.len();
        let mut frames_by_driver = BTreeMap::new();
        let mut order = Vec::with_capacity(total);
        let mut driver_colors = BTreeMap::new();

        for (done, driver) in drivers.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ProcessError::Cancelled);
            }

            let code = driver.code.to_ascii_uppercase();
            let frames = driver_frames(driver, key.frame_skip(), t0);
            debug!(driver = %code, frames = frames.len(), "driver processed");

            if let Some(rgb) = driver.team_color.as_deref().and_then(normalize::team_color) {
                driver_colors.insert(code.clone(), rgb);
            }
            frames_by_driver.insert(code.clone(), frames);
            order.push(code.clone());

            let completed = done + 1;
            if completed < total {
                on_progress(
                    completed as f64 / total as f64 * 100.0,
                    format!("Processed {} ({}/{})", code, completed, total),
                );
            }
        }

        let payload = TelemetryPayload {
            metadata: SessionMetadata {
                season: key.season(),
                round: key.round(),
                event_name: raw.event_name.clone(),
                total_laps: raw.total_laps,
                frame_skip: key.frame_skip(),
                format_version: key.format_version(),
                generated_at: chrono::Utc::now().to_rfc3339(),
                drivers: order,
            },
            drivers: frames_by_driver,
            driver_colors,
            track_statuses: track_statuses(raw, t0),
        };

        let last = payload.metadata.drivers.last().cloned().unwrap_or_default();
        on_progress(
            100.0,
            format!("Processed {} ({}/{}); payload assembled", last, total, total),
        );
        Ok(payload)
    }
}

/// Flattens a driver's laps into a time-ordered sequence, downsamples it and
/// normalises every retained sample.
fn driver_frames(driver: &RawDriver, frame_skip: u32, t0: f64) -> Vec<TelemetryFrame> {
    let mut laps: Vec<_> = driver.laps.iter().collect();
    laps.sort_by_key(|lap| lap.lap_number);

    let mut flat = Vec::with_capacity(driver.sample_count());
    let mut distance_so_far = 0.0;
    let mut untimed = 0usize;

    for lap in laps {
        let tyre = normalize::tyre_compound(lap.compound.as_deref());
        let distances = lap
            .samples
            .iter()
            .filter_map(|s| s.distance)
            .filter(|d| d.is_finite());
        let (min, max) = distances.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), d| {
            (lo.min(d), hi.max(d))
        });
        let has_distance = min.is_finite();

        for sample in &lap.samples {
            if !sample.session_time.is_finite() {
                untimed += 1;
                continue;
            }
            let race_distance = sample
                .distance
                .filter(|d| d.is_finite() && has_distance)
                .map(|d| distance_so_far + (d - min));
            flat.push(LapSample {
                sample,
                lap: lap.lap_number,
                tyre,
                race_distance,
            });
        }

        if has_distance {
            distance_so_far += max - min;
        }
    }

    if untimed > 0 {
        warn!(
            driver = %driver.code,
            untimed,
            "samples without a session timestamp cannot be ordered and were skipped"
        );
    }

    // Stable: samples sharing a timestamp keep lap order.
    flat.sort_by(|a, b| {
        a.sample
            .session_time
            .partial_cmp(&b.sample.session_time)
            .unwrap_or(Ordering::Equal)
    });

    let lap_numbers: Vec<u32> = flat.iter().map(|s| s.lap).collect();
    downsample::retained_indices(&lap_numbers, frame_skip)
        .into_iter()
        .map(|i| frame(&flat[i], t0))
        .collect()
}

fn frame(lap_sample: &LapSample<'_>, t0: f64) -> TelemetryFrame {
    let s = lap_sample.sample;
    TelemetryFrame {
        t: normalize::time(s.session_time - t0),
        lap: lap_sample.lap,
        x: normalize::position(s.x),
        y: normalize::position(s.y),
        z: normalize::position(s.z),
        lap_distance: normalize::distance(s.distance),
        race_distance: normalize::distance(lap_sample.race_distance),
        rel_distance: normalize::relative_distance(s.relative_distance),
        speed: normalize::speed(s.speed),
        throttle: normalize::throttle(s.throttle),
        brake: normalize::brake(s.brake),
        gear: normalize::gear(s.gear),
        drs: normalize::drs(s.drs),
        tyre: lap_sample.tyre,
    }
}

/// Track status changes as periods on the relative timeline. Each period ends
/// where the next one starts; the last stays open.
fn track_statuses(raw: &RawSession, t0: f64) -> Vec<TrackStatusPeriod> {
    let mut changes: Vec<_> = raw
        .track_status
        .iter()
        .filter(|s| s.time.is_finite())
        .collect();
    changes.sort_by(|a, b| a.time.total_cmp(&b.time));

    let mut periods: Vec<TrackStatusPeriod> = Vec::with_capacity(changes.len());
    for change in changes {
        let start_time = normalize::time(change.time - t0);
        if let Some(previous) = periods.last_mut() {
            previous.end_time = Some(start_time);
        }
        periods.push(TrackStatusPeriod {
            status: change.status.clone(),
            message: change.message.clone(),
            start_time,
            end_time: None,
        });
    }
    periods
}
