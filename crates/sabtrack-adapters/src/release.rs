//! Release-name parsing: title, year and raw season/episode markers.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value as JsonValue;

/// Structured view of a scene-style release name.
///
/// `season` / `episode` keep the raw shape the name implies: a list when a
/// file spans several episodes (`S01E12E13`). Run them through
/// [`normalize_episode`](crate::normalize_episode) before persisting.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseInfo {
    pub title: String,
    pub year: Option<i32>,
    pub season: Option<JsonValue>,
    pub episode: Option<JsonValue>,
}

struct Patterns {
    season_episode: Regex,
    episode_number: Regex,
    cross_episode: Regex,
    season_only: Regex,
    year: Regex,
    quality: Regex,
    bracket: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        season_episode: Regex::new(r"(?i)\bS(\d{1,2})((?:[ ._-]?E\d{1,3})+)\b")
            .expect("season/episode pattern is valid"),
        episode_number: Regex::new(r"(?i)E(\d{1,3})").expect("episode pattern is valid"),
        cross_episode: Regex::new(r"(?i)\b(\d{1,2})x(\d{2,3})\b").expect("NxM pattern is valid"),
        season_only: Regex::new(r"(?i)\b(?:S|Season[ ._-]?)(\d{1,2})\b")
            .expect("season pattern is valid"),
        year: Regex::new(r"\b(19\d{2}|20\d{2})\b").expect("year pattern is valid"),
        quality: Regex::new(
            r"(?i)\b(2160p|1080[pi]|720p|576p|480p|4k|uhd|blu-?ray|bdrip|brrip|web-?dl|webrip|hdtv|dvdrip|remux|x26[45]|h\.?26[45]|hevc|xvid|proper|repack|hdr|10bit)\b",
        )
        .expect("quality pattern is valid"),
        bracket: Regex::new(r"[\[\(\{]").expect("bracket pattern is valid"),
    })
}

fn as_number(raw: &str) -> Option<JsonValue> {
    raw.parse::<i64>().ok().map(JsonValue::from)
}

/// Split a release name into its title and trailing metadata.
///
/// The title ends at the first year, episode marker, quality tag or bracket;
/// a year at the very start belongs to the title (`2001.A.Space.Odyssey`).
pub fn parse_release(name: &str) -> ReleaseInfo {
    let p = patterns();
    let mut cut = name.len();
    let mut season = None;
    let mut episode = None;

    if let Some(caps) = p.season_episode.captures(name) {
        season = as_number(&caps[1]);
        let episodes: Vec<JsonValue> = p
            .episode_number
            .captures_iter(&caps[2])
            .filter_map(|c| as_number(&c[1]))
            .collect();
        episode = match episodes.len() {
            0 => None,
            1 => episodes.into_iter().next(),
            _ => Some(JsonValue::Array(episodes)),
        };
        cut = cut.min(caps.get(0).map_or(cut, |m| m.start()));
    } else if let Some(caps) = p.cross_episode.captures(name) {
        season = as_number(&caps[1]);
        episode = as_number(&caps[2]);
        cut = cut.min(caps.get(0).map_or(cut, |m| m.start()));
    } else if let Some(caps) = p.season_only.captures(name) {
        if caps.get(0).is_some_and(|m| m.start() > 0) {
            season = as_number(&caps[1]);
            cut = cut.min(caps.get(0).map_or(cut, |m| m.start()));
        }
    }

    if let Some(m) = p.quality.find(name) {
        cut = cut.min(m.start());
    }

    // Last year candidate before the metadata tail; position 0 is part of the title.
    let year_match = p
        .year
        .find_iter(name)
        .filter(|m| m.start() > 0 && m.start() <= cut)
        .last();
    let year = year_match.and_then(|m| m.as_str().parse::<i32>().ok());
    if let Some(m) = year_match {
        cut = cut.min(m.start());
    }

    // A leading bracket is usually a release-group tag, not the tail.
    if let Some(m) = p.bracket.find_iter(name).find(|m| m.start() > 0) {
        cut = cut.min(m.start());
    }

    let title = tidy_title(&name[..cut]);
    let title = if title.is_empty() {
        tidy_title(name)
    } else {
        title
    };

    ReleaseInfo {
        title,
        year,
        season,
        episode,
    }
}

fn tidy_title(raw: &str) -> String {
    raw.chars()
        .map(|c| if matches!(c, '.' | '_') { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c == '-' || c == ' ')
        .to_string()
}
