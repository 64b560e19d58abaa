//! Scalar normalization for loosely typed upstream fields.
//!
//! Nothing here fails: anything that cannot be interpreted collapses to `None`
//! or `0.0`.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value as JsonValue;

fn speed_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(KB/s|MB/s|GB/s|B/s|K|M|G)")
            .expect("speed pattern is valid")
    })
}

/// Parse a human-readable transfer rate (`"12.3 MB/s"`, `"500 K"`) into MB/s.
///
/// Units are binary: 1 MB = 1024 KB.
pub fn parse_speed_mbps(raw: &str) -> f64 {
    let Some(caps) = speed_pattern().captures(raw) else {
        return 0.0;
    };
    let Ok(value) = caps[1].parse::<f64>() else {
        return 0.0;
    };
    let mbps = match caps[2].to_ascii_uppercase().as_str() {
        "KB/S" | "K" => value / 1024.0,
        "MB/S" | "M" => value,
        "GB/S" | "G" => value * 1024.0,
        "B/S" => value / (1024.0 * 1024.0),
        _ => 0.0,
    };
    if mbps.is_finite() {
        mbps
    } else {
        0.0
    }
}

/// Read a number the upstream may send as a JSON number or a numeric string.
pub fn lenient_f64(raw: Option<&JsonValue>) -> f64 {
    let value = match raw {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
}

fn scalar_to_int(raw: &JsonValue) -> Option<i32> {
    match raw {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .and_then(|v| i32::try_from(v).ok()),
        JsonValue::String(s) => s.trim().parse::<i32>().ok(),
        _ => None,
    }
}

/// Collapse an episode value to a single integer.
///
/// Multi-episode files (`S01E12E13`) arrive as a list; the first episode wins.
/// An empty list, `null` or anything non-numeric becomes `None`.
pub fn normalize_episode(raw: Option<&JsonValue>) -> Option<i32> {
    match raw? {
        JsonValue::Array(values) => values.first().and_then(scalar_to_int),
        other => scalar_to_int(other),
    }
}

/// Collapse a season value to a single integer, same list rule as episodes.
pub fn normalize_season(raw: Option<&JsonValue>) -> Option<i32> {
    match raw? {
        JsonValue::Array(values) => values.first().and_then(scalar_to_int),
        other => scalar_to_int(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn speed_strings_convert_to_megabytes() {
        assert_eq!(parse_speed_mbps("12.3 MB/s"), 12.3);
        assert_eq!(parse_speed_mbps("1024 KB/s"), 1.0);
        assert_eq!(parse_speed_mbps("512 K"), 0.5);
        assert_eq!(parse_speed_mbps("1.5 GB/s"), 1536.0);
        assert_eq!(parse_speed_mbps("2 gb/s"), 2048.0);
        assert_eq!(parse_speed_mbps("1048576 B/s"), 1.0);
        assert_eq!(parse_speed_mbps("7 M"), 7.0);
    }

    #[test]
    fn unparseable_speed_is_zero() {
        assert_eq!(parse_speed_mbps(""), 0.0);
        assert_eq!(parse_speed_mbps("fast"), 0.0);
        assert_eq!(parse_speed_mbps("12.3"), 0.0);
    }

    #[test]
    fn episode_lists_collapse_to_first_element() {
        assert_eq!(normalize_episode(Some(&json!([12, 13]))), Some(12));
        assert_eq!(normalize_episode(Some(&json!([]))), None);
        assert_eq!(normalize_episode(None), None);
        assert_eq!(normalize_episode(Some(&JsonValue::Null)), None);
        assert_eq!(normalize_episode(Some(&json!("5"))), Some(5));
        assert_eq!(normalize_episode(Some(&json!(7))), Some(7));
        assert_eq!(normalize_episode(Some(&json!(["3", "4"]))), Some(3));
    }

    #[test]
    fn unconvertible_values_become_none() {
        assert_eq!(normalize_episode(Some(&json!("pilot"))), None);
        assert_eq!(normalize_episode(Some(&json!([{"e": 1}]))), None);
        assert_eq!(normalize_episode(Some(&json!(true))), None);
        assert_eq!(normalize_season(Some(&json!(["x"]))), None);
    }

    #[test]
    fn season_follows_the_same_collapse_rule() {
        assert_eq!(normalize_season(Some(&json!([2, 3]))), Some(2));
        assert_eq!(normalize_season(Some(&json!([]))), None);
        assert_eq!(normalize_season(Some(&json!(4.0))), Some(4));
        assert_eq!(normalize_season(Some(&json!(" 10 "))), Some(10));
    }

    #[test]
    fn lenient_numbers_accept_strings() {
        assert_eq!(lenient_f64(Some(&json!("45.5"))), 45.5);
        assert_eq!(lenient_f64(Some(&json!(12))), 12.0);
        assert_eq!(lenient_f64(Some(&json!("n/a"))), 0.0);
        assert_eq!(lenient_f64(None), 0.0);
    }
}
