//! ReplayGain volume computation.
//!
//! Gain and peak are looked up in priority order:
//! 1. binary side data attached to the stream ([`ReplayGainData`])
//! 2. `replaygain_*` text tags
//! 3. nothing usable: volume 1.0
//!
//! A missing peak never invalidates a gain; it only disables clipping
//! prevention for that result.

use std::str::FromStr;

use anyhow::bail;

use crate::source::Tags;

/// Which set of ReplayGain values to prefer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReplayGainMode {
    #[default]
    Track,
    Album,
}

impl FromStr for ReplayGainMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "track" => Ok(ReplayGainMode::Track),
            "album" => Ok(ReplayGainMode::Album),
            other => bail!("invalid ReplayGain mode: {other}"),
        }
    }
}

/// Gain and peak values in units of 1/100000 (dB for gains, full scale for peaks).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayGainData {
    pub track_gain: Option<i32>,
    pub track_peak: Option<u32>,
    pub album_gain: Option<i32>,
    pub album_peak: Option<u32>,
}

impl ReplayGainData {
    pub fn is_empty(&self) -> bool {
        *self == ReplayGainData::default()
    }
}

const SIDE_DATA_SCALE: f64 = 100_000.0;

/// Parse a `"<float> dB"` gain into side-data units.
pub(crate) fn gain_units(value: &str) -> Option<i32> {
    parse_gain(value).map(|gain| (gain * SIDE_DATA_SCALE).round() as i32)
}

/// Parse a linear peak into side-data units. Negative peaks are rejected.
pub(crate) fn peak_units(value: &str) -> Option<u32> {
    let peak: f64 = value.trim().parse().ok()?;
    (peak.is_finite() && peak >= 0.0).then(|| (peak * SIDE_DATA_SCALE).round() as u32)
}

const TRACK_GAIN_TAGS: [&str; 3] = [
    "replaygain_track_gain",
    "replaygain_album_gain",
    "replaygain_gain",
];
const TRACK_PEAK_TAGS: [&str; 3] = [
    "replaygain_track_peak",
    "replaygain_album_peak",
    "replaygain_peak",
];
const ALBUM_GAIN_TAGS: [&str; 3] = [
    "replaygain_album_gain",
    "replaygain_track_gain",
    "replaygain_gain",
];
const ALBUM_PEAK_TAGS: [&str; 3] = [
    "replaygain_album_peak",
    "replaygain_track_peak",
    "replaygain_peak",
];

/// Volume scale factor for the given metadata.
pub fn volume(
    side_data: Option<&ReplayGainData>,
    tags: &Tags,
    mode: ReplayGainMode,
    prevent_clipping: bool,
) -> f64 {
    side_data
        .and_then(|data| from_side_data(data, mode, prevent_clipping))
        .or_else(|| from_tags(tags, mode, prevent_clipping))
        .unwrap_or(1.0)
}

fn volume_from_gain(gain_db: f64) -> f64 {
    10f64.powf(gain_db / 20.0)
}

fn apply_peak(volume: f64, peak: Option<f64>, prevent_clipping: bool) -> f64 {
    match peak {
        Some(peak) if prevent_clipping => volume.min(1.0 / peak),
        _ => volume,
    }
}

fn from_side_data(data: &ReplayGainData, mode: ReplayGainMode, prevent_clipping: bool) -> Option<f64> {
    let album_first = mode == ReplayGainMode::Album;

    let gain = match (album_first, data.track_gain, data.album_gain) {
        (true, _, Some(album)) => Some(album),
        (_, Some(track), _) => Some(track),
        (_, None, album) => album,
    }?;
    let peak = match (album_first, data.track_peak, data.album_peak) {
        (true, _, Some(album)) => Some(album),
        (_, Some(track), _) => Some(track),
        (_, None, album) => album,
    };

    let volume = volume_from_gain(gain as f64 / SIDE_DATA_SCALE);
    Some(apply_peak(
        volume,
        peak.map(|p| p as f64 / SIDE_DATA_SCALE),
        prevent_clipping,
    ))
}

fn from_tags(tags: &Tags, mode: ReplayGainMode, prevent_clipping: bool) -> Option<f64> {
    let (gain_tags, peak_tags) = match mode {
        ReplayGainMode::Track => (TRACK_GAIN_TAGS, TRACK_PEAK_TAGS),
        ReplayGainMode::Album => (ALBUM_GAIN_TAGS, ALBUM_PEAK_TAGS),
    };

    let lookup = |key: &str| {
        tags.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    };

    let gain = gain_tags
        .iter()
        .filter_map(|key| lookup(key))
        .find_map(parse_gain)?;
    let peak = peak_tags
        .iter()
        .filter_map(|key| lookup(key))
        .find_map(|value| value.parse::<f64>().ok());

    Some(apply_peak(volume_from_gain(gain), peak, prevent_clipping))
}

/// Parse `"<float> dB"`.
fn parse_gain(value: &str) -> Option<f64> {
    let number = value.strip_suffix(" dB")?;
    if number.is_empty() || number.contains(' ') {
        return None;
    }
    number.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn no_metadata_is_neutral() {
        assert_eq!(volume(None, &Tags::new(), ReplayGainMode::Track, true), 1.0);
        assert_eq!(volume(None, &Tags::new(), ReplayGainMode::Album, false), 1.0);
    }

    #[test]
    fn tag_values_convert_to_side_data_units() {
        assert_eq!(gain_units("-6.5 dB"), Some(-650_000));
        assert_eq!(gain_units("-6.5"), None);
        assert_eq!(peak_units("0.988547"), Some(98_855));
        assert_eq!(peak_units("-1"), None);
        assert!(ReplayGainData::default().is_empty());
    }

    #[test]
    fn tag_gain_converts_decibels() {
        let t = tags(&[("replaygain_track_gain", "-6.0 dB")]);
        let v = volume(None, &t, ReplayGainMode::Track, true);
        assert!(close(v, 10f64.powf(-6.0 / 20.0)));
    }

    #[test]
    fn peak_clamps_only_when_preventing_clipping() {
        let t = tags(&[
            ("replaygain_track_gain", "+6.0 dB"),
            ("replaygain_track_peak", "0.8"),
        ]);
        let clamped = volume(None, &t, ReplayGainMode::Track, true);
        assert!(close(clamped, 1.25));
        let unclamped = volume(None, &t, ReplayGainMode::Track, false);
        assert!(close(unclamped, 10f64.powf(6.0 / 20.0)));
    }

    #[test]
    fn volume_never_exceeds_inverse_peak() {
        for gain in [-12.0, -3.0, 0.0, 3.0, 9.0, 20.0] {
            for peak in [0.25, 0.5, 0.9, 1.0, 1.5] {
                let t = tags(&[
                    ("replaygain_track_gain", &format!("{gain} dB")),
                    ("replaygain_track_peak", &peak.to_string()),
                ]);
                let v = volume(None, &t, ReplayGainMode::Track, true);
                assert!(v <= 1.0 / peak + 1e-12, "gain {gain} peak {peak} -> {v}");
            }
        }
    }

    #[test]
    fn mode_selects_tag_order() {
        let t = tags(&[
            ("replaygain_track_gain", "-2 dB"),
            ("replaygain_album_gain", "-8 dB"),
        ]);
        assert!(close(
            volume(None, &t, ReplayGainMode::Track, false),
            volume_from_gain(-2.0)
        ));
        assert!(close(
            volume(None, &t, ReplayGainMode::Album, false),
            volume_from_gain(-8.0)
        ));
    }

    #[test]
    fn falls_back_across_tags_and_ignores_case() {
        let t = tags(&[("REPLAYGAIN_GAIN", "3 dB"), ("replaygain_track_gain", "loud")]);
        assert!(close(
            volume(None, &t, ReplayGainMode::Track, false),
            volume_from_gain(3.0)
        ));
    }

    #[test]
    fn malformed_gain_is_ignored() {
        for bad in ["-6.0", "-6.0 db", " dB", "1 2 dB", "abc dB"] {
            let t = tags(&[("replaygain_track_gain", bad)]);
            assert_eq!(volume(None, &t, ReplayGainMode::Track, true), 1.0, "{bad}");
        }
    }

    #[test]
    fn side_data_takes_priority_over_tags() {
        let data = ReplayGainData {
            track_gain: Some(-600_000),
            ..Default::default()
        };
        let t = tags(&[("replaygain_track_gain", "+6 dB")]);
        let v = volume(Some(&data), &t, ReplayGainMode::Track, true);
        assert!(close(v, volume_from_gain(-6.0)));
    }

    #[test]
    fn side_data_album_fallbacks() {
        let album_only = ReplayGainData {
            album_gain: Some(-300_000),
            album_peak: Some(50_000),
            ..Default::default()
        };
        // Track mode falls back to album values when track values are missing.
        let v = volume(Some(&album_only), &Tags::new(), ReplayGainMode::Track, true);
        assert!(close(v, volume_from_gain(-3.0)));

        let both = ReplayGainData {
            track_gain: Some(100_000),
            track_peak: Some(90_000),
            album_gain: Some(1_200_000),
            album_peak: Some(50_000),
        };
        let track = volume(Some(&both), &Tags::new(), ReplayGainMode::Track, false);
        assert!(close(track, volume_from_gain(1.0)));
        let album = volume(Some(&both), &Tags::new(), ReplayGainMode::Album, true);
        assert!(close(album, 2.0));
    }

    #[test]
    fn side_data_without_gain_defers_to_tags() {
        let data = ReplayGainData {
            track_peak: Some(100_000),
            ..Default::default()
        };
        let t = tags(&[("replaygain_track_gain", "-1 dB")]);
        let v = volume(Some(&data), &t, ReplayGainMode::Track, true);
        assert!(close(v, volume_from_gain(-1.0)));
    }

    #[test]
    fn mode_parses_known_names() {
        assert_eq!("album".parse::<ReplayGainMode>().unwrap(), ReplayGainMode::Album);
        assert!("off".parse::<ReplayGainMode>().is_err());
    }
}
