//! Duration strings such as `1h2m3.5s`, `250ms` or `90s`.

use std::time::Duration;

use anyhow::{Result, anyhow, bail};

const UNITS: &[(&str, f64)] = &[
    ("ns", 1.0),
    ("us", 1e3),
    ("µs", 1e3),
    ("ms", 1e6),
    ("s", 1e9),
    ("m", 60e9),
    ("h", 3600e9),
];

/// Parse a non-negative duration.
///
/// The string is a sequence of decimal numbers, each with an optional
/// fraction and a unit suffix (`ns`, `us`, `µs`, `ms`, `s`, `m`, `h`).
/// A bare `0` is accepted. Negative values are rejected.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let (negative, mut rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        bail!("invalid duration {input:?}");
    }

    let mut nanos = 0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| anyhow!("missing unit in duration {input:?}"))?;
        if number_len == 0 {
            bail!("invalid duration {input:?}");
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| anyhow!("invalid duration {input:?}"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        let scale = UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, scale)| *scale)
            .ok_or_else(|| anyhow!("unknown unit {unit:?} in duration {input:?}"))?;
        rest = &rest[unit_len..];
        nanos += value * scale;
    }

    if negative && nanos > 0.0 {
        bail!("negative duration {input:?}");
    }
    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        bail!("duration {input:?} out of range");
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}
