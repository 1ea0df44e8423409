//! Directive parsing.
//!
//! A directive is a chat message starting with `.`, optionally followed by a
//! `HH.MM` time token, then the body: `.12.30 lunch with team`, `.gym`.
//! `.-` on its own removes the most recent entry.

use std::sync::LazyLock;

use mukit_core::TimeOfDay;
use regex::Regex;

const MARKER: char = '.';
const REMOVE_LAST: &str = "-";

/// `HH.MM` directly after the marker, terminated by whitespace or end of text.
static TIME_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{2})\.(\d{2})(?:\s+|$)").unwrap());

/// Result of parsing one raw message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParsedMessage {
    Entry(ParsedEntry),
    RemoveLast,
    Rejected(Rejection),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedEntry {
    pub time: TimeOfDay,
    /// Whether `time` came from the message rather than the clock.
    pub explicit_time: bool,
    pub body: String,
}

/// Why a message is not summarized. Neither case is an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// No leading marker; ordinary chat.
    NotDirective,
    /// Marker present but nothing to summarize.
    EmptyBody,
}

/// Parse `raw` into a directive. `now` is used when no time token is present.
pub fn parse(raw: &str, now: TimeOfDay) -> ParsedMessage {
    let Some(rest) = raw.strip_prefix(MARKER) else {
        return ParsedMessage::Rejected(Rejection::NotDirective);
    };

    if rest.trim_end() == REMOVE_LAST {
        return ParsedMessage::RemoveLast;
    }

    let (time, explicit_time, body) = match split_time_token(rest) {
        Some((time, remainder)) => (time, true, remainder),
        None => (now, false, rest),
    };

    let body = body.trim();
    if body.is_empty() {
        return ParsedMessage::Rejected(Rejection::EmptyBody);
    }

    ParsedMessage::Entry(ParsedEntry {
        time,
        explicit_time,
        body: lowercase_first_alphabetic(body),
    })
}

/// Out-of-range tokens (`25.99`) are not time tokens and stay in the body.
fn split_time_token(rest: &str) -> Option<(TimeOfDay, &str)> {
    let caps = TIME_TOKEN.captures(rest)?;
    let hour: u8 = caps[1].parse().ok()?;
    let minute: u8 = caps[2].parse().ok()?;
    let time = TimeOfDay::new(hour, minute)?;
    let end = caps.get(0)?.end();
    Some((time, &rest[end..]))
}

fn lowercase_first_alphabetic(body: &str) -> String {
    let Some((idx, ch)) = body.char_indices().find(|(_, c)| c.is_alphabetic()) else {
        return body.to_string();
    };
    let mut out = String::with_capacity(body.len());
    out.push_str(&body[..idx]);
    out.extend(ch.to_lowercase());
    out.push_str(&body[idx + ch.len_utf8()..]);
    out
}
