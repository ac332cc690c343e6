use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::CursorError;
use crate::event::{format_timestamp, parse_timestamp, truncate_to_second, Event};

pub mod store;

use store::CursorStore;

/// Durable position in the event stream: the publication instant of the last delivered event, and
/// the uuids of the delivered events at that instant.
///
/// `ids` only describes events published at `after`. The upstream `since` filter is inclusive, so
/// the next run sees those events again and filters them out by uuid, while still picking up events
/// that arrived later at the same instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub after: DateTime<Utc>,
    pub ids: BTreeSet<String>,
}

// Persisted layout: {"after": "<RFC 3339>", "ids": [...]}
#[derive(Debug, Serialize, Deserialize)]
struct PersistedWatermark {
    after: String,
    #[serde(default)]
    ids: Vec<String>,
}

impl Watermark {
    pub fn new<I, S>(after: DateTime<Utc>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            after,
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Uuids delivered by earlier runs. Matching is by identity alone, whatever timestamp the
    /// source reports for the event this time.
    pub fn seen_ids(&self) -> HashSet<String> {
        self.ids.iter().cloned().collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>, CursorError> {
        let persisted = PersistedWatermark {
            after: format_timestamp(self.after),
            ids: self.ids.iter().cloned().collect(),
        };
        serde_json::to_vec(&persisted).map_err(|e| CursorError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CursorError> {
        let persisted: PersistedWatermark =
            serde_json::from_slice(bytes).map_err(|e| CursorError::Malformed(e.to_string()))?;
        let after = parse_timestamp(&persisted.after).ok_or_else(|| {
            CursorError::Malformed(format!("{} is not a timestamp", persisted.after))
        })?;
        Ok(Self::new(after, persisted.ids))
    }
}

/// How precisely two publication instants must match to count as the same boundary instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampGranularity {
    #[default]
    Exact,
    /// For sources that truncate some timestamps to whole seconds: anything within the same whole
    /// second as the watermark is treated as being at the watermark.
    Seconds,
}

impl TimestampGranularity {
    pub fn same_instant(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        match self {
            TimestampGranularity::Exact => a == b,
            TimestampGranularity::Seconds => truncate_to_second(a) == truncate_to_second(b),
        }
    }

    /// The earliest instant that still counts as `dt`, used as the inclusive lower bound of a
    /// request so truncated timestamps at the boundary are fetched again and filtered by uuid.
    pub fn floor(&self, dt: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimestampGranularity::Exact => dt,
            TimestampGranularity::Seconds => truncate_to_second(dt),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseGranularityError;

impl FromStr for TimestampGranularity {
    type Err = ParseGranularityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "exact" => Ok(TimestampGranularity::Exact),
            "seconds" | "second" => Ok(TimestampGranularity::Seconds),
            _ => Err(ParseGranularityError),
        }
    }
}

/// Compute the watermark to persist after delivering `batch`, which must already be ordered.
///
/// An empty batch leaves the prior watermark as it was. The watermark never moves backwards, and
/// when the boundary instant doesn't change, the prior ids are kept alongside the new ones.
pub fn advance(
    batch: &[Event],
    prior: Option<&Watermark>,
    granularity: TimestampGranularity,
) -> Option<Watermark> {
    let Some(latest) = batch.last().map(Event::published_at) else {
        return prior.cloned();
    };

    let after = match prior {
        Some(prior) if prior.after > latest => prior.after,
        _ => latest,
    };

    let mut ids: BTreeSet<String> = batch
        .iter()
        .filter(|event| granularity.same_instant(event.published_at(), after))
        .map(|event| event.uuid().to_owned())
        .collect();

    if let Some(prior) = prior.filter(|prior| granularity.same_instant(prior.after, after)) {
        ids.extend(prior.ids.iter().cloned());
    }

    Some(Watermark { after, ids })
}

/// Load the stored watermark. A stored value that can't be parsed is treated as absent, so the run
/// falls back to the look-back window instead of failing forever.
pub async fn load_watermark(store: &dyn CursorStore) -> Result<Option<Watermark>, CursorError> {
    let Some(bytes) = store.load().await? else {
        info!("No stored watermark found");
        return Ok(None);
    };

    if bytes.iter().all(u8::is_ascii_whitespace) {
        info!("Stored watermark is empty");
        return Ok(None);
    }

    match Watermark::decode(&bytes) {
        Ok(watermark) => Ok(Some(watermark)),
        Err(CursorError::Malformed(reason)) => {
            warn!(
                "Ignoring malformed watermark, falling back to the look-back window. Events already delivered may be delivered again: {}",
                reason
            );
            metrics::counter!("event_poller_malformed_cursor").increment(1);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

pub async fn save_watermark(
    store: &dyn CursorStore,
    watermark: &Watermark,
) -> Result<(), CursorError> {
    let encoded = watermark.encode()?;
    store.save(&encoded).await?;
    info!(
        "Saved watermark at {} with {} boundary ids",
        format_timestamp(watermark.after),
        watermark.ids.len()
    );
    Ok(())
}
