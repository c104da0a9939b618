//! Deterministic id/slug/duration glue used across the engine
//!
//! These are the small, pure helper functions the rest of the crates lean
//! on: task id allocation, filesystem-safe slugs, wall-clock parsing in a
//! caller's zone, and the `HHhMMminSSs` duration format used on the
//! returned task snapshot.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::EngineError;

/// Replaces every non-alphanumeric character with `_`, matching the
/// `task_dir` naming rule from §4.1.
pub fn slugify(input: &str) -> String {
    let slug: String = input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if slug.is_empty() {
        "_".to_string()
    } else {
        slug
    }
}

/// Builds the deterministic per-task artifact directory:
/// `<root>/<brand_slug>/<base_name>_<task_id>` (§4.1 Submit).
pub fn task_dir(root: &std::path::Path, brand_name: &str, base_name: &str, task_id: &str) -> std::path::PathBuf {
    root.join(slugify(brand_name))
        .join(format!("{}_{}", slugify(base_name), task_id))
}

/// Generates a monotonically increasing, zero-padded decimal task id from a
/// counter (§3.1). Ten digits comfortably outlives any single process's
/// counter without colliding on re-format.
pub fn next_task_id(counter: u64) -> String {
    format!("{:010}", counter)
}

/// Formats a duration in seconds as `HHhMMminSSs` (§6.2 `run_time`).
pub fn format_run_time(total_seconds: i64) -> String {
    let total_seconds = total_seconds.max(0);
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{:02}h{:02}min{:02}s", hours, minutes, seconds)
}

/// Parses an ISO-8601 timestamp or a naive `"YYYY-MM-DD HH:MM"` string.
/// Naive values are interpreted in `zone`; ISO-8601 values carrying their
/// own offset are converted to UTC directly (§6.1).
pub fn parse_caller_time(value: &str, zone: Tz) -> Result<DateTime<Utc>, EngineError> {
    let trimmed = value.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M"))
        .map_err(|e| EngineError::InvalidPayload(format!("invalid timestamp '{value}': {e}")))?;

    match zone.from_local_datetime(&naive).single() {
        Some(local) => Ok(local.with_timezone(&Utc)),
        None => Err(EngineError::InvalidPayload(format!(
            "ambiguous or invalid local time '{value}' in zone {zone}"
        ))),
    }
}

/// Looks up a named zone, falling back to UTC on an unrecognised name so a
/// bad `caller_timezone` config never blocks startup.
pub fn resolve_timezone(name: &str) -> Tz {
    name.parse().unwrap_or_else(|_| {
        tracing::warn!("unrecognised caller_timezone '{}', falling back to UTC", name);
        chrono_tz::UTC
    })
}

/// BLAKE3 checksum of a task's config-affecting fields, used to detect
/// whether an Update changed anything worth re-deriving scheduling state
/// for. Hex-encoded, matching the checksum format used elsewhere in this
/// codebase.
pub fn calculate_checksum(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_replaces_non_alphanumeric() {
        assert_eq!(slugify("Acme, Inc!"), "Acme__Inc_");
    }

    #[test]
    fn task_dir_matches_naming_rule() {
        let root = std::path::Path::new("/data/tasks");
        let dir = task_dir(root, "Acme Co", "spring-campaign", "0000000007");
        assert_eq!(
            dir,
            std::path::PathBuf::from("/data/tasks/Acme_Co/spring_campaign_0000000007")
        );
    }

    #[test]
    fn task_id_is_zero_padded() {
        assert_eq!(next_task_id(7), "0000000007");
        assert_eq!(next_task_id(12345), "0000012345");
    }

    #[test]
    fn run_time_formats_hours_minutes_seconds() {
        assert_eq!(format_run_time(3725), "01h02min05s");
        assert_eq!(format_run_time(59), "00h00min59s");
        assert_eq!(format_run_time(-5), "00h00min00s");
    }

    #[test]
    fn naive_time_is_interpreted_in_caller_zone() {
        let zone = resolve_timezone("Asia/Shanghai");
        let parsed = parse_caller_time("2026-08-01 12:00", zone).unwrap();
        // Asia/Shanghai is UTC+8 with no DST.
        assert_eq!(parsed.to_rfc3339(), "2026-08-01T04:00:00+00:00");
    }

    #[test]
    fn rfc3339_time_is_used_directly() {
        let zone = resolve_timezone("Asia/Shanghai");
        let parsed = parse_caller_time("2026-08-01T04:00:00Z", zone).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-08-01T04:00:00+00:00");
    }

    #[test]
    fn unknown_zone_name_falls_back_to_utc() {
        assert_eq!(resolve_timezone("Not/AZone"), chrono_tz::UTC);
    }

    #[test]
    fn checksum_is_deterministic_and_order_sensitive() {
        let a = calculate_checksum(&["foo", "bar"]);
        let b = calculate_checksum(&["foo", "bar"]);
        let c = calculate_checksum(&["bar", "foo"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
