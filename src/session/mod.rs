//! Upstream provider boundary: raw session types and the [`SessionLoader`] trait.

mod directory;
mod http;
pub mod retry;

pub use directory::DirectorySessionLoader;
pub use http::{HttpSessionLoader, HttpSessionLoaderConfig};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::key::SessionKey;
use retry::IsRetryable;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("session {season} round {round} not found")]
    NotFound { season: i32, round: u32 },
    #[error("no event schedule for season {season}")]
    ScheduleNotFound { season: i32 },
    #[error("upstream provider unavailable: {0}")]
    Unavailable(String),
    #[error("load cancelled")]
    Cancelled,
}

impl IsRetryable for LoadError {
    fn is_retryable(&self) -> bool {
        matches!(self, LoadError::Unavailable(_))
    }
}

/// Brake channel as the provider reports it: either on/off or a pressure percentage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawBrake {
    Pressed(bool),
    Percent(f64),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    /// Seconds since the session clock started.
    pub session_time: f64,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub z: Option<f64>,
    /// Metres into the lap, as the provider measures it.
    #[serde(default)]
    pub distance: Option<f64>,
    #[serde(default)]
    pub relative_distance: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub throttle: Option<f64>,
    #[serde(default)]
    pub brake: Option<RawBrake>,
    #[serde(default)]
    pub gear: Option<i64>,
    #[serde(default)]
    pub drs: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawLap {
    pub lap_number: u32,
    #[serde(default)]
    pub compound: Option<String>,
    #[serde(default)]
    pub samples: Vec<RawSample>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDriver {
    pub code: String,
    #[serde(default)]
    pub number: Option<String>,
    /// `#RRGGBB`.
    #[serde(default)]
    pub team_color: Option<String>,
    #[serde(default)]
    pub laps: Vec<RawLap>,
}

impl RawDriver {
    pub fn sample_count(&self) -> usize {
        self.laps.iter().map(|lap| lap.samples.len()).sum()
    }

    /// Samples that can be placed on the session timeline.
    pub fn timed_sample_count(&self) -> usize {
        self.laps
            .iter()
            .flat_map(|lap| lap.samples.iter())
            .filter(|s| s.session_time.is_finite())
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrackStatus {
    /// Seconds since the session clock started.
    pub time: f64,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Provider response for one session. Read-only once loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSession {
    pub event_name: String,
    #[serde(default)]
    pub season: i32,
    #[serde(default)]
    pub round: u32,
    #[serde(default)]
    pub total_laps: u32,
    #[serde(default)]
    pub drivers: Vec<RawDriver>,
    #[serde(default)]
    pub track_status: Vec<RawTrackStatus>,
}

/// One entry of a season's event schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummary {
    pub round: u32,
    pub event_name: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
}

/// Source of raw sessions. Implementations must check `cancel` between
/// loading segments and return [`LoadError::Cancelled`] once it fires.
#[async_trait::async_trait]
pub trait SessionLoader: Send + Sync {
    async fn load(
        &self,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<RawSession, LoadError>;

    /// Events of a season ordered by round.
    async fn list_events(&self, season: i32) -> Result<Vec<EventSummary>, LoadError>;
}
