//! Output artifact types.
//!
//! Channel values are `Option`s serialized as JSON `null` when the provider
//! had no reading. Nothing here skips `None` fields: `null` is the explicit
//! no-data marker consumers rely on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// DRS flap state derived from the provider's numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrsState {
    Off,
    /// Within the activation zone, flap still closed.
    Eligible,
    Open,
}

/// One downsampled sample for one driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    /// Seconds since the earliest sample of the session.
    pub t: f64,
    pub lap: u32,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    /// Metres into the current lap.
    pub lap_distance: Option<f64>,
    /// Metres since the start of the driver's first lap.
    pub race_distance: Option<f64>,
    pub rel_distance: Option<f64>,
    /// km/h.
    pub speed: Option<f64>,
    /// Percent, 0–100.
    pub throttle: Option<f64>,
    /// Percent, 0–100. Boolean brake channels map to 0 or 100.
    pub brake: Option<f64>,
    pub gear: Option<u8>,
    pub drs: Option<DrsState>,
    /// 1 soft .. 5 wet, 0 unknown.
    pub tyre: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackStatusPeriod {
    pub status: String,
    pub message: Option<String>,
    pub start_time: f64,
    pub end_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub season: i32,
    pub round: u32,
    pub event_name: String,
    pub total_laps: u32,
    pub frame_skip: u32,
    pub format_version: u32,
    /// RFC 3339 generation time.
    pub generated_at: String,
    /// Driver codes in payload order.
    pub drivers: Vec<String>,
}

/// The complete computed artifact for one [`crate::SessionKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub metadata: SessionMetadata,
    pub drivers: BTreeMap<String, Vec<TelemetryFrame>>,
    pub driver_colors: BTreeMap<String, [u8; 3]>,
    pub track_statuses: Vec<TrackStatusPeriod>,
}

impl TelemetryPayload {
    pub fn frame_count(&self) -> usize {
        self.drivers.values().map(Vec::len).sum()
    }
}
