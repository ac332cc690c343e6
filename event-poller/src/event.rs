use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;

// Upstream `since` filters take millisecond precision
pub const SINCE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// A single record pulled from the events endpoint.
///
/// The raw JSON object is kept untouched and is what sinks receive. `uuid` and `published` are
/// extracted once at fetch time, and `published` is parsed so ordering and boundary checks compare
/// instants rather than strings (sources are inconsistent about fractional seconds).
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    uuid: String,
    published: String,
    published_at: DateTime<Utc>,
    raw: Value,
}

impl Event {
    /// Build an event from one element of a response page. The error is a human readable reason,
    /// the caller attaches the url it came from.
    pub fn from_value(raw: Value) -> Result<Self, String> {
        let Value::Object(fields) = &raw else {
            return Err(format!("expected a JSON object, got {raw}"));
        };

        let uuid = match fields.get("uuid") {
            Some(Value::String(uuid)) if !uuid.is_empty() => uuid.clone(),
            Some(other) => return Err(format!("uuid must be a non-empty string, got {other}")),
            None => return Err("event has no uuid".to_owned()),
        };

        let published = match fields.get("published") {
            Some(Value::String(published)) => published.clone(),
            Some(other) => {
                return Err(format!(
                    "published of event {uuid} must be a string, got {other}"
                ))
            }
            None => return Err(format!("event {uuid} has no published timestamp")),
        };

        let published_at = parse_timestamp(&published).ok_or_else(|| {
            format!("published of event {uuid} is not a timestamp: {published}")
        })?;

        Ok(Self {
            uuid,
            published,
            published_at,
            raw,
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The timestamp exactly as the source formatted it.
    pub fn published(&self) -> &str {
        &self.published
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

/// Parse the timestamp formats seen from event sources: RFC 3339 with any number of fractional
/// digits and any offset, or the same without an offset, which is taken to be UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

/// Lossless representation used for the persisted watermark.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Representation used for the `since` query parameter. Sub-millisecond digits are dropped, which
/// moves the inclusive lower bound earlier, never later.
pub fn format_since(dt: DateTime<Utc>) -> String {
    dt.format(SINCE_FORMAT).to_string()
}

pub fn truncate_to_second(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.trunc_subsecs(0)
}
