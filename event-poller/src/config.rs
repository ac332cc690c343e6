use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time;

use chrono::{DateTime, Duration, Utc};
use envconfig::Envconfig;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use tracing::warn;
use url::Url;

use crate::cursor::{TimestampGranularity, Watermark};
use crate::error::ConfigError;
use crate::event::parse_timestamp;
use crate::fetch::{FetchWindow, SortOrder};

const DEFAULT_CHUNK_SIZE: usize = 2000;

/// Integration level settings, read once from the environment.
#[derive(Envconfig, Clone)]
pub struct Config {
    pub events_url: String,

    // JSON object of static headers sent with every request, e.g. {"Authorization": "SSWS ..."}
    #[envconfig(default = "{}")]
    pub headers: String,

    // Only used when there is no stored watermark
    #[envconfig(default = "3")]
    pub lookback_days: u32,

    #[envconfig(default = "100")]
    pub page_limit: u32,

    #[envconfig(default = "ASCENDING")]
    pub sort_order: SortOrder,

    // Maximum number of events per delivered chunk, invalid values fall back to the default
    #[envconfig(default = "2000")]
    pub chunk_size: String,

    #[envconfig(default = "30000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub connect_timeout: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub max_pages: usize,

    #[envconfig(default = "100")]
    pub max_rounds: usize,

    #[envconfig(default = "exact")]
    pub timestamp_granularity: TimestampGranularity,

    #[envconfig(default = "./event-poller-cursor.json")]
    pub cursor_path: String,

    #[envconfig(default = "stdout")]
    pub sink: String,

    pub sink_path: Option<String>,

    #[envconfig(default = "true")]
    pub sink_as_json: bool,

    #[envconfig(default = "fetch")]
    pub run_mode: RunMode,

    #[envconfig(nested = true)]
    pub args: InvocationArgs,
}

/// Per-invocation arguments. They take precedence over `Config`, and for `query` runs over the
/// stored watermark too.
#[derive(Envconfig, Clone, Default)]
pub struct InvocationArgs {
    pub query_since: Option<String>,

    pub query_limit: Option<u32>,

    pub lookback_days_override: Option<u32>,
}

impl Config {
    pub fn events_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.events_url).map_err(|_| ConfigError::InvalidUrl(self.events_url.clone()))
    }

    pub fn header_map(&self) -> Result<HeaderMap, ConfigError> {
        let raw: HashMap<String, String> =
            serde_json::from_str(&self.headers).map_err(ConfigError::InvalidHeaders)?;

        let mut headers = HeaderMap::new();
        for (name, value) in raw {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConfigError::InvalidHeader(name.clone()))?;
            let mut header_value =
                HeaderValue::from_str(&value).map_err(|_| ConfigError::InvalidHeader(name))?;
            if header_name == AUTHORIZATION {
                header_value.set_sensitive(true);
            }
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }

    pub fn chunk_size(&self) -> usize {
        match self.chunk_size.trim().parse::<usize>() {
            Ok(size) if size > 0 => size,
            _ => {
                warn!(
                    "Invalid CHUNK_SIZE {:?}, using {}",
                    self.chunk_size, DEFAULT_CHUNK_SIZE
                );
                DEFAULT_CHUNK_SIZE
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One cheap request to check connectivity and credentials.
    Validate,
    /// The full fetch-dedup-cursor loop, persisting the watermark.
    Fetch,
    /// One bounded page for inspection, the watermark is left alone.
    Query,
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "validate" | "test-module" => Ok(RunMode::Validate),
            "fetch" | "fetch-events" => Ok(RunMode::Fetch),
            "query" | "get-events" => Ok(RunMode::Query),
            invalid => Err(ConfigError::InvalidRunMode(invalid.to_owned())),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunMode::Validate => write!(f, "validate"),
            RunMode::Fetch => write!(f, "fetch"),
            RunMode::Query => write!(f, "query"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Everything a single run needs, resolved once from config, invocation args and the stored
/// watermark. Never changes while the run is in progress.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub mode: RunMode,
    pub window: FetchWindow,
    pub chunk_size: usize,
    pub max_rounds: usize,
    pub granularity: TimestampGranularity,
}

impl RunSettings {
    /// Precedence for `since`: the watermark, then the look-back window for `fetch`; an explicit
    /// `QUERY_SINCE`, then the watermark, then the look-back window for `query`; always the
    /// look-back window for `validate`.
    pub fn resolve(
        config: &Config,
        mode: RunMode,
        watermark: Option<&Watermark>,
        now: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        let lookback_days = config
            .args
            .lookback_days_override
            .unwrap_or(config.lookback_days);
        let lookback_since = Duration::try_days(i64::from(lookback_days))
            .and_then(|window| now.checked_sub_signed(window))
            .ok_or(ConfigError::InvalidLookback(lookback_days))?;
        let granularity = config.timestamp_granularity;
        let stored_since = watermark.map(|w| granularity.floor(w.after));

        let (since, limit) = match mode {
            RunMode::Validate => (lookback_since, 1),
            RunMode::Fetch => (stored_since.unwrap_or(lookback_since), config.page_limit),
            RunMode::Query => {
                let query_since = config
                    .args
                    .query_since
                    .as_deref()
                    .map(|raw| {
                        parse_timestamp(raw)
                            .ok_or_else(|| ConfigError::InvalidTimestamp(raw.to_owned()))
                    })
                    .transpose()?;
                (
                    query_since.or(stored_since).unwrap_or(lookback_since),
                    config.args.query_limit.unwrap_or(config.page_limit),
                )
            }
        };

        Ok(Self {
            mode,
            window: FetchWindow {
                since,
                sort_order: config.sort_order,
                limit: limit.max(1),
            },
            chunk_size: config.chunk_size(),
            max_rounds: config.max_rounds.max(1),
            granularity,
        })
    }
}
