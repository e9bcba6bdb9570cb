//! Channel normalisation to fixed units. Every function maps an unusable
//! reading (missing, NaN, infinite, out of range) to `None`.

use crate::payload::DrsState;
use crate::session::RawBrake;

const POSITION_PRECISION: i32 = 1;
const DISTANCE_PRECISION: i32 = 1;
const TIME_PRECISION: i32 = 2;
const MAX_GEAR: i64 = 8;

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

pub(crate) fn time(seconds: f64) -> f64 {
    round_to(seconds, TIME_PRECISION)
}

pub(crate) fn position(value: Option<f64>) -> Option<f64> {
    finite(value).map(|v| round_to(v, POSITION_PRECISION))
}

pub(crate) fn distance(value: Option<f64>) -> Option<f64> {
    finite(value).map(|v| round_to(v, DISTANCE_PRECISION))
}

pub(crate) fn relative_distance(value: Option<f64>) -> Option<f64> {
    finite(value).map(|v| round_to(v.clamp(0.0, 1.0), 3))
}

/// Whole km/h. Negative readings are sensor faults.
pub(crate) fn speed(value: Option<f64>) -> Option<f64> {
    finite(value).filter(|v| *v >= 0.0).map(f64::round)
}

pub(crate) fn throttle(value: Option<f64>) -> Option<f64> {
    finite(value).map(|v| v.clamp(0.0, 100.0))
}

pub(crate) fn brake(value: Option<RawBrake>) -> Option<f64> {
    match value? {
        RawBrake::Pressed(true) => Some(100.0),
        RawBrake::Pressed(false) => Some(0.0),
        RawBrake::Percent(p) => throttle(Some(p)),
    }
}

/// 0 is neutral.
pub(crate) fn gear(value: Option<i64>) -> Option<u8> {
    value
        .filter(|g| (0..=MAX_GEAR).contains(g))
        .map(|g| g as u8)
}

/// Provider DRS codes: 0/1 off, 8 eligible, 10/12/14 open.
pub(crate) fn drs(value: Option<i64>) -> Option<DrsState> {
    match value? {
        0 | 1 => Some(DrsState::Off),
        8 => Some(DrsState::Eligible),
        10 | 12 | 14 => Some(DrsState::Open),
        _ => None,
    }
}

pub(crate) fn tyre_compound(compound: Option<&str>) -> u8 {
    let Some(compound) = compound else {
        return 0;
    };
    match compound.trim().to_ascii_uppercase().as_str() {
        "SOFT" => 1,
        "MEDIUM" => 2,
        "HARD" => 3,
        "INTERMEDIATE" => 4,
        "WET" => 5,
        _ => 0,
    }
}

/// Parses `#RRGGBB` (leading `#` optional).
pub(crate) fn team_color(hex: &str) -> Option<[u8; 3]> {
    let hex = hex.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_and_missing_become_no_data() {
        assert_eq!(speed(Some(f64::NAN)), None);
        assert_eq!(speed(None), None);
        assert_eq!(throttle(Some(f64::INFINITY)), None);
        assert_eq!(position(Some(f64::NAN)), None);
        assert_eq!(brake(Some(RawBrake::Percent(f64::NAN))), None);
    }

    #[test]
    fn speed_rounds_to_whole_kph_and_rejects_negative() {
        assert_eq!(speed(Some(287.6)), Some(288.0));
        assert_eq!(speed(Some(-3.0)), None);
    }

    #[test]
    fn throttle_and_brake_are_percentages() {
        assert_eq!(throttle(Some(104.0)), Some(100.0));
        assert_eq!(throttle(Some(-1.0)), Some(0.0));
        assert_eq!(brake(Some(RawBrake::Pressed(true))), Some(100.0));
        assert_eq!(brake(Some(RawBrake::Pressed(false))), Some(0.0));
        assert_eq!(brake(Some(RawBrake::Percent(37.5))), Some(37.5));
    }

    #[test]
    fn gear_outside_gearbox_is_no_data() {
        assert_eq!(gear(Some(0)), Some(0));
        assert_eq!(gear(Some(8)), Some(8));
        assert_eq!(gear(Some(9)), None);
        assert_eq!(gear(Some(-1)), None);
    }

    #[test]
    fn drs_codes_map_to_states() {
        assert_eq!(drs(Some(0)), Some(DrsState::Off));
        assert_eq!(drs(Some(1)), Some(DrsState::Off));
        assert_eq!(drs(Some(8)), Some(DrsState::Eligible));
        assert_eq!(drs(Some(12)), Some(DrsState::Open));
        assert_eq!(drs(Some(3)), None);
    }

    #[test]
    fn compounds_map_to_codes() {
        assert_eq!(tyre_compound(Some("soft")), 1);
        assert_eq!(tyre_compound(Some("INTERMEDIATE")), 4);
        assert_eq!(tyre_compound(Some("TEST_UNKNOWN")), 0);
        assert_eq!(tyre_compound(None), 0);
    }

    #[test]
    fn team_colors_parse_hex() {
        assert_eq!(team_color("#3671C6"), Some([0x36, 0x71, 0xC6]));
        assert_eq!(team_color("e8002d"), Some([0xe8, 0x00, 0x2d]));
        assert_eq!(team_color("#fff"), None);
        assert_eq!(team_color("#zzzzzz"), None);
    }
}
