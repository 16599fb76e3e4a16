//! Comma-delimited record codec for the action log.
//!
//! Fields containing the delimiter or a quote are wrapped in double quotes,
//! with embedded quotes doubled. Line breaks inside fields are flattened to
//! spaces so that one record always occupies one line.

use super::entry::{ActionLogEntry, LogAction};
use chrono::{DateTime, SecondsFormat, Utc};

/// Header row of a fresh log.
pub const HEADER: &str = "Timestamp,RayID,IP,Hostname,Endpoint,User-Agent,Action,Country,SefinekAPI";

const DELIMITER: char = ',';
const QUOTE: char = '"';
const FIELD_COUNT: usize = 9;

/// Encode one entry as a record line, without the trailing newline.
pub fn encode_record(entry: &ActionLogEntry) -> String {
    let timestamp = entry.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
    let address = entry.address.to_string();
    let synced = if entry.secondary_synced { "true" } else { "false" };

    let fields: [&str; FIELD_COUNT] = [
        &timestamp,
        &entry.ray_id,
        &address,
        &entry.hostname,
        &entry.endpoint,
        &entry.user_agent,
        entry.action.as_str(),
        &entry.country,
        synced,
    ];

    fields
        .iter()
        .map(|field| escape_field(field))
        .collect::<Vec<_>>()
        .join(",")
}

/// Decode one record line. Returns `None` for malformed lines.
pub fn decode_record(line: &str) -> Option<ActionLogEntry> {
    let fields = split_fields(line)?;
    if fields.len() != FIELD_COUNT {
        return None;
    }

    let mut fields = fields.into_iter();
    let timestamp = fields.next()?;
    let ray_id = fields.next()?;
    let address = fields.next()?;
    let hostname = fields.next()?;
    let endpoint = fields.next()?;
    let user_agent = fields.next()?;
    let action = fields.next()?;
    let country = fields.next()?;
    let synced = fields.next()?;

    if ray_id.is_empty() {
        return None;
    }

    Some(ActionLogEntry {
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .ok()?
            .with_timezone(&Utc),
        ray_id,
        address: address.parse().ok()?,
        hostname,
        endpoint,
        user_agent,
        action: action.parse::<LogAction>().ok()?,
        country,
        secondary_synced: synced.eq_ignore_ascii_case("true"),
    })
}

/// Quote a field when it contains the delimiter or a quote.
pub fn escape_field(field: &str) -> String {
    let flat: String = field
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();

    if flat.contains(DELIMITER) || flat.contains(QUOTE) {
        format!("\"{}\"", flat.replace('"', "\"\""))
    } else {
        flat
    }
}

/// Split a record line into unescaped fields.
///
/// Returns `None` when a quoted field is never closed.
pub fn split_fields(line: &str) -> Option<Vec<String>> {
    let mut fields = Vec::with_capacity(FIELD_COUNT);
    let mut current = String::new();
    let mut in_quotes = false;
    let mut at_field_start = true;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == QUOTE {
                if chars.peek() == Some(&QUOTE) {
                    current.push(QUOTE);
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
            continue;
        }

        match c {
            DELIMITER => {
                fields.push(std::mem::take(&mut current));
                at_field_start = true;
                continue;
            }
            QUOTE if at_field_start => in_quotes = true,
            _ => current.push(c),
        }
        at_field_start = false;
    }

    if in_quotes {
        return None;
    }

    fields.push(current);
    Some(fields)
}
