//! Shelveset naming.
//!
//! A name pattern is a positional format string:
//!
//! | Placeholder | Value |
//! |---|---|
//! | `{0}` | workspace name |
//! | `{1}` | owner identity (`domain\login`) |
//! | `{2}` | current local time |
//! | `{3}` | domain part of the owner |
//! | `{4}` | login part of the owner |
//!
//! `{{` and `}}` produce literal braces. The timestamp takes an optional
//! strftime format, as in `{2:%Y%m%d}`.

use std::fmt;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, TimeZone};

use crate::error::{ShelveError, ShelveResult};

/// Maximum length of a shelveset name, in characters.
pub const NAME_LENGTH: usize = 64;

/// Name used when a name or pattern is blank.
pub const DEFAULT_SHELVESET_NAME: &str = "Auto Shelve";

/// Pattern used when no options are supplied.
pub const DEFAULT_NAME_PATTERN: &str = "Auto Shelve {0}";

/// Rendering of the `{2}` placeholder.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const PLACEHOLDER_COUNT: usize = 5;

const TIMESTAMP_PLACEHOLDER: usize = 2;

const NAME_BAD_CHARACTERS: [char; 9] = ['/', ':', '<', '>', '\\', '|', '*', '?', ';'];

#[derive(Debug, PartialEq, Eq)]
enum Segment {
    Text(String),
    Placeholder(usize),
    Timestamp(String),
}

fn segments(pattern: &str) -> ShelveResult<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut chars = pattern.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                text.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                text.push('}');
            }
            '{' => {
                let mut index = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => index.push(c),
                        None => {
                            return Err(ShelveError::InvalidPattern(format!(
                                "unclosed placeholder in '{}'",
                                pattern
                            )))
                        }
                    }
                }
                let (index, format) = match index.split_once(':') {
                    Some((index, format)) => (index.to_string(), Some(format.to_string())),
                    None => (index.clone(), None),
                };
                let position = index
                    .parse::<usize>()
                    .ok()
                    .filter(|p| *p < PLACEHOLDER_COUNT)
                    .ok_or_else(|| {
                        ShelveError::InvalidPattern(format!(
                            "unknown placeholder {{{}}} in '{}'",
                            index, pattern
                        ))
                    })?;
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                match format {
                    None => segments.push(Segment::Placeholder(position)),
                    Some(format) if position == TIMESTAMP_PLACEHOLDER && is_valid_format(&format) => {
                        segments.push(Segment::Timestamp(format))
                    }
                    Some(format) => {
                        return Err(ShelveError::InvalidPattern(format!(
                            "bad format '{}' for placeholder {{{}}} in '{}'",
                            format, position, pattern
                        )))
                    }
                }
            }
            '}' => {
                return Err(ShelveError::InvalidPattern(format!(
                    "unbalanced '}}' in '{}'",
                    pattern
                )))
            }
            c => text.push(c),
        }
    }

    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    Ok(segments)
}

// Formatting an invalid strftime string fails at display time
fn is_valid_format(format: &str) -> bool {
    !format.is_empty() && !StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
}

/// Substitute the placeholders of `pattern`.
///
/// The result is not sanitized; pass it through [`sanitize`] before use.
pub fn resolve<Tz>(
    pattern: &str,
    workspace_name: &str,
    owner: &str,
    now: &DateTime<Tz>,
) -> ShelveResult<String>
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let mut name = String::with_capacity(pattern.len() + NAME_LENGTH);
    for segment in segments(pattern)? {
        match segment {
            Segment::Text(text) => name.push_str(&text),
            Segment::Placeholder(0) => name.push_str(workspace_name),
            Segment::Placeholder(1) => name.push_str(owner),
            Segment::Placeholder(2) => name.push_str(&now.format(TIMESTAMP_FORMAT).to_string()),
            Segment::Timestamp(format) => name.push_str(&now.format(&format).to_string()),
            Segment::Placeholder(3) => name.push_str(domain(owner)),
            Segment::Placeholder(_) => name.push_str(login(owner)),
        }
    }
    Ok(name)
}

/// Strip characters the backend rejects and cap the length.
///
/// Characters are processed in order, so truncation always drops trailing
/// content of the cleaned name.
pub fn sanitize(name: &str) -> String {
    if name.trim().is_empty() {
        return DEFAULT_SHELVESET_NAME.to_string();
    }

    let clean: String = name
        .chars()
        .filter(|c| !NAME_BAD_CHARACTERS.contains(c))
        .take(NAME_LENGTH)
        .collect();

    if clean.is_empty() {
        DEFAULT_SHELVESET_NAME.to_string()
    } else {
        clean
    }
}

/// Strip forbidden characters from the literal text of a name pattern.
///
/// Placeholder bodies are kept as written so timestamp formats such as
/// `{2:%H:%M}` survive. Resolved names still go through [`sanitize`].
pub fn sanitize_pattern(pattern: &str) -> String {
    let mut clean = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    let mut in_placeholder = false;

    while let Some(ch) = chars.next() {
        match ch {
            '{' if !in_placeholder && chars.peek() == Some(&'{') => {
                chars.next();
                clean.push_str("{{");
            }
            '{' if !in_placeholder => {
                in_placeholder = true;
                clean.push(ch);
            }
            '}' if in_placeholder => {
                in_placeholder = false;
                clean.push(ch);
            }
            c if in_placeholder || !NAME_BAD_CHARACTERS.contains(&c) => clean.push(c),
            _ => {}
        }
    }

    if clean.trim().is_empty() {
        DEFAULT_SHELVESET_NAME.to_string()
    } else {
        clean
    }
}

/// Whether names produced by `pattern` change over time (contains `{2}` or `{2:...}`).
pub fn is_timestamped(pattern: &str) -> bool {
    pattern.contains("{2}") || pattern.contains("{2:")
}

/// Whether names produced by `pattern` include the workspace name (contains `{0}`).
pub fn is_workspace_scoped(pattern: &str) -> bool {
    pattern.contains("{0}")
}

/// Domain part of `domain\login`, or empty when there is no backslash.
pub fn domain(owner: &str) -> &str {
    owner.split_once('\\').map(|(domain, _)| domain).unwrap_or("")
}

/// Login part of `domain\login`, or the whole identity when there is no backslash.
pub fn login(owner: &str) -> &str {
    owner.split_once('\\').map(|(_, login)| login).unwrap_or(owner)
}
