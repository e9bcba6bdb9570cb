//! Deterministic identity of one computed telemetry artifact.
//!
//! A [`SessionKey`] is built from request parameters through
//! [`KeyParams::into_key`], which validates and canonicalises them. The same
//! key doubles as the in-flight run identity and as the cache address.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Bumped whenever the serialized payload shape changes. Entries written
/// under an older version are left on disk but never matched.
pub const FORMAT_VERSION: u32 = 1;

/// First season with positional car telemetry from the provider.
pub const DEFAULT_MIN_SEASON: i32 = 2018;

const MAX_SEASON: i32 = 2100;
const MAX_DRIVER_CODE_LEN: usize = 4;
const ARTIFACT_EXTENSION: &str = ".json.gz";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("season must be between {min} and {max}, got {got}")]
    Season { min: i32, max: i32, got: i64 },
    #[error("round must be at least 1, got {0}")]
    Round(i64),
    #[error("frame_skip must be a positive integer, got {0}")]
    FrameSkip(i64),
    #[error("invalid driver identifier '{0}'")]
    Driver(String),
}

/// Canonical set of driver codes. Always sorted and de-duplicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DriverFilter(BTreeSet<String>);

impl DriverFilter {
    /// Parses identifiers, trimming and upper-casing them. Returns `None` for an
    /// empty input so that an empty filter and an absent filter are the same key.
    pub fn parse<I, S>(codes: I) -> Result<Option<Self>, KeyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for raw in codes {
            let code = raw.as_ref().trim();
            if code.is_empty() {
                continue;
            }
            let valid = code.len() <= MAX_DRIVER_CODE_LEN
                && code.chars().all(|c| c.is_ascii_alphanumeric());
            if !valid {
                return Err(KeyError::Driver(code.to_string()));
            }
            set.insert(code.to_ascii_uppercase());
        }

        if set.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Self(set)))
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.0.contains(code)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Identity of a computed artifact. Equal keys address the same cache entry
/// and the same in-flight run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    season: i32,
    round: u32,
    drivers: Option<DriverFilter>,
    frame_skip: u32,
    format_version: u32,
}

impl SessionKey {
    pub fn season(&self) -> i32 {
        self.season
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn drivers(&self) -> Option<&DriverFilter> {
        self.drivers.as_ref()
    }

    pub fn frame_skip(&self) -> u32 {
        self.frame_skip
    }

    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    /// Whether `code` passes this key's driver filter.
    pub fn includes_driver(&self, code: &str) -> bool {
        self.drivers
            .as_ref()
            .map(|filter| filter.contains(code))
            .unwrap_or(true)
    }

    /// Relative storage path of this key's artifact:
    /// `v<format>/<season>/<round>/skip_<n>__<drivers|all>.json.gz`.
    pub fn storage_path(&self) -> PathBuf {
        let drivers = match &self.drivers {
            Some(filter) => filter.iter().collect::<Vec<_>>().join("-"),
            None => "all".to_string(),
        };
        PathBuf::from(format!("v{}", self.format_version))
            .join(self.season.to_string())
            .join(self.round.to_string())
            .join(format!(
                "skip_{}__{}{}",
                self.frame_skip, drivers, ARTIFACT_EXTENSION
            ))
    }

    /// Inverse of [`SessionKey::storage_path`]. Returns `None` for anything that
    /// is not an artifact path, so foreign files under the root are ignored.
    pub fn from_storage_path(path: &Path) -> Option<Self> {
        let parts: Vec<&str> = path.iter().filter_map(|p| p.to_str()).collect();
        let [version, season, round, file] = parts.as_slice() else {
            return None;
        };

        let format_version = version.strip_prefix('v')?.parse().ok()?;
        let season = season.parse().ok()?;
        let round = round.parse().ok()?;
        let stem = file.strip_suffix(ARTIFACT_EXTENSION)?;
        let (skip, drivers) = stem.strip_prefix("skip_")?.split_once("__")?;
        let frame_skip: u32 = skip.parse().ok()?;
        if frame_skip == 0 || round == 0 {
            return None;
        }

        let drivers = match drivers {
            "all" => None,
            list => Some(DriverFilter::parse(list.split('-')).ok()??),
        };

        Some(Self {
            season,
            round,
            drivers,
            frame_skip,
            format_version,
        })
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} round {} skip {}", self.season, self.round, self.frame_skip)?;
        if let Some(filter) = &self.drivers {
            write!(f, " [{}]", filter.iter().collect::<Vec<_>>().join(","))?;
        }
        Ok(())
    }
}

/// Unvalidated request parameters. Wide integer types so that negative input
/// reaches validation instead of failing deserialization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyParams {
    pub season: i64,
    pub round: i64,
    #[serde(default)]
    pub drivers: Option<Vec<String>>,
    #[serde(default)]
    pub frame_skip: Option<i64>,
}

impl KeyParams {
    pub fn new(season: i64, round: i64) -> Self {
        Self {
            season,
            round,
            ..Default::default()
        }
    }

    pub fn with_frame_skip(mut self, frame_skip: i64) -> Self {
        self.frame_skip = Some(frame_skip);
        self
    }

    pub fn with_drivers<I, S>(mut self, drivers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.drivers = Some(drivers.into_iter().map(Into::into).collect());
        self
    }

    /// Validates and canonicalises into a key. No I/O.
    pub fn into_key(self, min_season: i32) -> Result<SessionKey, KeyError> {
        if self.season < i64::from(min_season) || self.season > i64::from(MAX_SEASON) {
            return Err(KeyError::Season {
                min: min_season,
                max: MAX_SEASON,
                got: self.season,
            });
        }
        let round = u32::try_from(self.round)
            .ok()
            .filter(|r| *r >= 1)
            .ok_or(KeyError::Round(self.round))?;

        let frame_skip = self.frame_skip.unwrap_or(1);
        let frame_skip = u32::try_from(frame_skip)
            .ok()
            .filter(|n| *n >= 1)
            .ok_or(KeyError::FrameSkip(frame_skip))?;

        let drivers = match self.drivers {
            Some(list) => DriverFilter::parse(list)?,
            None => None,
        };

        Ok(SessionKey {
            season: self.season as i32,
            round,
            drivers,
            frame_skip,
            format_version: FORMAT_VERSION,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(params: KeyParams) -> SessionKey {
        params.into_key(DEFAULT_MIN_SEASON).unwrap()
    }

    #[test]
    fn driver_order_and_case_do_not_change_identity() {
        let a = key(KeyParams::new(2023, 5).with_drivers(["ham", "VER", " lec "]));
        let b = key(KeyParams::new(2023, 5).with_drivers(["LEC", "HAM", "VER", "ver"]));
        assert_eq!(a, b);
        assert_eq!(a.storage_path(), b.storage_path());
    }

    #[test]
    fn empty_filter_equals_absent_filter() {
        let a = key(KeyParams::new(2023, 5).with_drivers(Vec::<String>::new()));
        let b = key(KeyParams::new(2023, 5));
        assert_eq!(a, b);
        assert!(a.drivers().is_none());
    }

    #[test]
    fn frame_skip_defaults_to_one() {
        assert_eq!(key(KeyParams::new(2023, 5)).frame_skip(), 1);
    }

    #[test]
    fn rejects_non_positive_frame_skip() {
        for bad in [0, -1, -10] {
            let err = KeyParams::new(2023, 5)
                .with_frame_skip(bad)
                .into_key(DEFAULT_MIN_SEASON)
                .unwrap_err();
            assert_eq!(err, KeyError::FrameSkip(bad));
        }
    }

    #[test]
    fn rejects_out_of_range_season_and_round() {
        assert!(matches!(
            KeyParams::new(2017, 1).into_key(DEFAULT_MIN_SEASON),
            Err(KeyError::Season { got: 2017, .. })
        ));
        assert_eq!(
            KeyParams::new(2023, 0).into_key(DEFAULT_MIN_SEASON),
            Err(KeyError::Round(0))
        );
    }

    #[test]
    fn rejects_malformed_driver_codes() {
        let err = KeyParams::new(2023, 5)
            .with_drivers(["VER", "max verstappen"])
            .into_key(DEFAULT_MIN_SEASON)
            .unwrap_err();
        assert!(matches!(err, KeyError::Driver(_)));
    }

    #[test]
    fn storage_path_is_reversible() {
        let with_filter = key(
            KeyParams::new(2023, 5)
                .with_frame_skip(10)
                .with_drivers(["VER", "HAM"]),
        );
        assert_eq!(
            with_filter.storage_path(),
            PathBuf::from("v1/2023/5/skip_10__HAM-VER.json.gz")
        );
        assert_eq!(
            SessionKey::from_storage_path(&with_filter.storage_path()),
            Some(with_filter)
        );

        let all = key(KeyParams::new(2021, 12));
        assert_eq!(SessionKey::from_storage_path(&all.storage_path()), Some(all));
    }

    #[test]
    fn foreign_paths_are_not_keys() {
        for path in [
            "v1/2023/5/notes.txt",
            "v1/2023/5/skip_0__all.json.gz",
            "2023/5/skip_1__all.json.gz",
            "v1/2023/5/skip_1__all.json.gz.tmp",
        ] {
            assert_eq!(SessionKey::from_storage_path(Path::new(path)), None, "{path}");
        }
    }

    #[test]
    fn format_version_is_part_of_identity() {
        let current = key(KeyParams::new(2023, 5));
        let mut older = current.clone();
        older.format_version = FORMAT_VERSION + 1;
        assert_ne!(current, older);
        assert_ne!(current.storage_path(), older.storage_path());
    }
}
