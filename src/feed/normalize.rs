//! Pure field normalization: publication dates and image URL inference.

use chrono::{DateTime, FixedOffset, Weekday};

const SRC_MARKER: &str = "src=\"";
const JPG_SUFFIX: &str = ".jpg";

const PUB_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";
const PUB_DATE_FORMAT_NO_WEEKDAY: &str = "%d %b %Y %H:%M:%S %z";

/// Named zones accepted in place of a numeric offset.
const NAMED_ZONES: &[(&str, &str)] = &[
    ("GMT", "+0000"),
    ("UT", "+0000"),
    ("UTC", "+0000"),
    ("Z", "+0000"),
    ("EST", "-0500"),
    ("EDT", "-0400"),
    ("CST", "-0600"),
    ("CDT", "-0500"),
    ("MST", "-0700"),
    ("MDT", "-0600"),
    ("PST", "-0800"),
    ("PDT", "-0700"),
];

/// Parses an RSS `pubDate` (`EEE, d MMM yyyy HH:mm:ss Z`, English month and
/// day names) into milliseconds since the Unix epoch.
///
/// The weekday, seconds and a full year are required; `24` is the year 24,
/// not 2024. The zone is a numeric offset or one of the common US/UTC names.
/// Feeds regularly publish a day-of-week that does not match the date, so a
/// well-formed weekday that disagrees with the date is ignored.
///
/// Returns `None` for anything else.
pub fn parse_pub_date(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let normalized = with_numeric_zone(raw)?;
    DateTime::parse_from_str(&normalized, PUB_DATE_FORMAT)
        .ok()
        .or_else(|| parse_ignoring_weekday(&normalized))
        .map(|date| date.timestamp_millis())
}

/// Replaces a trailing zone name with its offset. `None` for an unknown name.
fn with_numeric_zone(raw: &str) -> Option<String> {
    let (rest, zone) = raw.rsplit_once(' ')?;
    if zone.starts_with(|c: char| c == '+' || c == '-') {
        return Some(raw.to_string());
    }
    NAMED_ZONES
        .iter()
        .find(|(name, _)| zone.eq_ignore_ascii_case(name))
        .map(|(_, offset)| format!("{} {}", rest, offset))
}

fn parse_ignoring_weekday(date: &str) -> Option<DateTime<FixedOffset>> {
    let (weekday, rest) = date.split_once(", ")?;
    if weekday.len() != 3 || weekday.parse::<Weekday>().is_err() {
        return None;
    }
    DateTime::parse_from_str(rest, PUB_DATE_FORMAT_NO_WEEKDAY).ok()
}

/// Guesses an item image from its HTML description.
///
/// Takes the value of the first `src="` attribute up to and including `.jpg`.
/// The search never leaves the attribute value, so the result cannot contain
/// the closing quote. No `src="`, or no `.jpg` inside the value, yields `None`.
pub fn infer_image_url(description: &str) -> Option<String> {
    let start = description.find(SRC_MARKER)? + SRC_MARKER.len();
    let value = &description[start..];
    let value = match value.find('"') {
        Some(quote) => &value[..quote],
        None => value,
    };
    let end = value.find(JPG_SUFFIX)? + JPG_SUFFIX.len();
    Some(value[..end].to_string())
}
