// Time units: microsecond ticks, per-representation timescales, ISO-8601 parsing
use chrono::{DateTime, NaiveDateTime, Utc};

/// Playback time in microseconds.
pub type Tick = i64;

/// Number of [`Tick`]s per second.
pub const CLOCK_FREQ: Tick = 1_000_000;

/// Converts fractional seconds to ticks, rounding to the nearest microsecond.
pub fn seconds(secs: f64) -> Tick {
    (secs * CLOCK_FREQ as f64).round() as Tick
}

/// Converts milliseconds to ticks.
pub const fn millis(ms: i64) -> Tick {
    ms * (CLOCK_FREQ / 1000)
}

/// Integer units-per-second used by segment start times and durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timescale(u64);

impl Timescale {
    /// HLS timelines are expressed directly in ticks.
    pub const TICKS: Timescale = Timescale(CLOCK_FREQ as u64);

    pub const fn new(units_per_second: u64) -> Self {
        if units_per_second == 0 {
            Self(1)
        } else {
            Self(units_per_second)
        }
    }

    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Scaled units to ticks.
    pub fn to_time(&self, scaled: u64) -> Tick {
        if self.0 == CLOCK_FREQ as u64 {
            return scaled as Tick;
        }
        ((scaled as u128 * CLOCK_FREQ as u128) / self.0 as u128) as Tick
    }

    /// Ticks to scaled units. Negative times clamp to zero.
    pub fn to_scaled(&self, time: Tick) -> u64 {
        if time <= 0 {
            return 0;
        }
        if self.0 == CLOCK_FREQ as u64 {
            return time as u64;
        }
        ((time as u128 * self.0 as u128) / CLOCK_FREQ as u128) as u64
    }
}

impl Default for Timescale {
    fn default() -> Self {
        Self::TICKS
    }
}

/// Parses an `xs:duration` such as `PT1H2M3.5S` or `P1DT12H`.
///
/// Years and months are rejected since they have no fixed length.
pub fn parse_iso8601_duration(input: &str) -> Option<Tick> {
    let s = input.trim();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let mut rest = s.strip_prefix('P')?;
    let mut total = 0f64;
    let mut in_time = false;
    let mut seen_component = false;

    while !rest.is_empty() {
        if let Some(r) = rest.strip_prefix('T') {
            in_time = true;
            rest = r;
            continue;
        }
        let end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if end == 0 || end == rest.len() {
            return None;
        }
        let value: f64 = rest[..end].parse().ok()?;
        let unit = rest[end..].chars().next()?;
        let factor = match (unit, in_time) {
            ('W', false) => 7.0 * 86400.0,
            ('D', false) => 86400.0,
            ('H', true) => 3600.0,
            ('M', true) => 60.0,
            ('S', true) => 1.0,
            _ => return None,
        };
        total += value * factor;
        seen_component = true;
        rest = &rest[end + unit.len_utf8()..];
    }

    if !seen_component {
        return None;
    }
    let ticks = seconds(total);
    Some(if negative { -ticks } else { ticks })
}

/// Parses an absolute UTC date-time into ticks since the Unix epoch.
///
/// Accepts RFC 3339 as well as the offset-less forms found in the wild
/// (treated as UTC).
pub fn parse_utc(input: &str) -> Option<Tick> {
    let s = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).timestamp_micros());
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc).timestamp_micros());
    }
    let naive = s.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|dt| dt.and_utc().timestamp_micros())
}

/// Current wall clock in ticks since the Unix epoch.
pub fn now_utc() -> Tick {
    Utc::now().timestamp_micros()
}
