use std::time::Duration;

use reqwest::header::{self, HeaderMap};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{ConfigError, FetchError};
use crate::event::Event;
use crate::fetch::pagination::next_link;

// Keep error bodies short enough to log
const MAX_ERROR_BODY_CHARS: usize = 512;

/// One response from the events endpoint.
#[derive(Debug)]
pub struct Page {
    /// The url that produced this page, after redirects.
    pub url: Url,
    pub events: Vec<Event>,
    pub next: Option<Url>,
}

/// Thin wrapper over `reqwest::Client` that knows the events endpoint and turns responses into
/// pages of events.
#[derive(Clone)]
pub struct EventsClient {
    client: reqwest::Client,
    events_url: Url,
}

impl EventsClient {
    pub fn new(
        events_url: Url,
        headers: HeaderMap,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );
        default_headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        // Configured headers win over the defaults above
        default_headers.extend(headers);

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .user_agent("event-poller")
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(ConfigError::Client)?;

        Ok(Self { client, events_url })
    }

    pub fn events_url(&self) -> &Url {
        &self.events_url
    }

    /// Issue a GET and parse the body as a JSON array of events. Any non-2xx status is an error.
    pub async fn get_page(&self, url: Url, params: &[(&str, String)]) -> Result<Page, FetchError> {
        let request_url = url.to_string();
        debug!("Requesting {} with {:?}", request_url, params);

        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&request_url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            metrics::counter!("event_poller_fetch_errors", "reason" => "status").increment(1);
            return Err(FetchError::Status {
                url: request_url,
                status,
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let url = response.url().clone();
        let next = next_link(response.headers(), &url)?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(&request_url, e))?;
        let records: Vec<Value> =
            serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
                url: request_url.clone(),
                source,
            })?;

        let events = records
            .into_iter()
            .map(Event::from_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|reason| FetchError::InvalidEvent {
                url: request_url.clone(),
                reason,
            })?;

        metrics::counter!("event_poller_pages_fetched").increment(1);
        debug!(
            "Fetched {} events from {}, next page: {:?}",
            events.len(),
            request_url,
            next.as_ref().map(Url::as_str)
        );

        Ok(Page { url, events, next })
    }
}
