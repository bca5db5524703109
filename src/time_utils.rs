// src/time_utils.rs

use chrono::{DateTime, FixedOffset, Local, Offset, Utc};
use chrono_tz::Tz;
use uuid::Uuid;

/// Display timezone for trace timestamps. Resolved once from configuration;
/// persisted instants always stay UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayZone {
    Local,
    Utc,
    Fixed(FixedOffset),
    Named(Tz),
}

/// Resolves a timezone name the way operators write them: empty or `local`
/// for the system zone, `UTC`/`GMT`/`Z`, fixed offsets like `+03:00` or
/// `-0530`, or an IANA name. Unknown names fall back to UTC.
pub fn resolve_timezone(name: &str) -> DisplayZone {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("local") {
        return DisplayZone::Local;
    }
    let upper = trimmed.to_ascii_uppercase();
    if matches!(upper.as_str(), "UTC" | "GMT" | "Z") {
        return DisplayZone::Utc;
    }
    if let Some(offset) = parse_fixed_offset(trimmed) {
        return DisplayZone::Fixed(offset);
    }
    match trimmed.parse::<Tz>() {
        Ok(tz) => DisplayZone::Named(tz),
        Err(_) => DisplayZone::Utc,
    }
}

fn parse_fixed_offset(value: &str) -> Option<FixedOffset> {
    let (sign, raw) = match value.as_bytes().first()? {
        b'+' => (1i32, &value[1..]),
        b'-' => (-1i32, &value[1..]),
        _ => return None,
    };
    let (hours, minutes) = match raw.split_once(':') {
        Some((h, m)) => (h, m),
        None if raw.len() > 2 => (&raw[..2], &raw[2..]),
        None => (raw, "0"),
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Formats a UTC instant in the display zone as `YYYY-mm-dd HH:MM:SS +ZZZZ`.
pub fn format_timestamp(dt: DateTime<Utc>, zone: DisplayZone) -> String {
    const FMT: &str = "%Y-%m-%d %H:%M:%S %z";
    match zone {
        DisplayZone::Local => dt.with_timezone(&Local).format(FMT).to_string(),
        DisplayZone::Utc => dt.with_timezone(&Utc.fix()).format(FMT).to_string(),
        DisplayZone::Fixed(offset) => dt.with_timezone(&offset).format(FMT).to_string(),
        DisplayZone::Named(tz) => dt.with_timezone(&tz).format(FMT).to_string(),
    }
}

pub fn now_timestamp(zone: DisplayZone) -> String {
    format_timestamp(Utc::now(), zone)
}

/// 16 random bytes as 32 lowercase hex characters, for request correlation.
pub fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}
