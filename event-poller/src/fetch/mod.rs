use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::event::{format_since, Event};

pub mod client;
pub mod pagination;

use client::EventsClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASCENDING",
            SortOrder::Descending => "DESCENDING",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseSortOrderError;

impl FromStr for SortOrder {
    type Err = ParseSortOrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_ref() {
            "ASCENDING" | "ASC" => Ok(SortOrder::Ascending),
            "DESCENDING" | "DESC" => Ok(SortOrder::Descending),
            _ => Err(ParseSortOrderError),
        }
    }
}

/// Query parameters of one "events since" request. Derived from the watermark, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchWindow {
    pub since: DateTime<Utc>,
    pub sort_order: SortOrder,
    pub limit: u32,
}

impl FetchWindow {
    pub fn with_since(&self, since: DateTime<Utc>) -> Self {
        Self {
            since,
            ..self.clone()
        }
    }

    pub fn query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("since", format_since(self.since)),
            ("sortOrder", self.sort_order.to_string()),
            ("limit", self.limit.to_string()),
        ]
    }
}

/// Somewhere events can be pulled from. `PageFetcher` is the HTTP implementation, the seam exists
/// so the iteration logic can be exercised against scripted responses.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// All events for the window, following continuation links until exhausted.
    async fn fetch(&self, window: &FetchWindow) -> Result<Vec<Event>, FetchError>;

    /// Only the first page for the window.
    async fn fetch_page(&self, window: &FetchWindow) -> Result<Vec<Event>, FetchError>;
}

pub struct PageFetcher {
    client: EventsClient,
    max_pages: usize,
}

impl PageFetcher {
    pub fn new(client: EventsClient, max_pages: usize) -> Self {
        Self {
            client,
            max_pages: max_pages.max(1),
        }
    }
}

#[async_trait]
impl EventSource for PageFetcher {
    async fn fetch(&self, window: &FetchWindow) -> Result<Vec<Event>, FetchError> {
        let mut page = self
            .client
            .get_page(self.client.events_url().clone(), &window.query())
            .await?;
        let mut pages = 1;
        let mut events = Vec::new();

        loop {
            let page_was_empty = page.events.is_empty();
            events.extend(page.events);

            let Some(next) = page.next else {
                break;
            };
            if page_was_empty {
                debug!("Empty page with a next link, treating {} as exhausted", page.url);
                break;
            }
            if next == page.url {
                warn!("Next link {} points back at the current page", next);
                return Err(FetchError::TooManyPages(pages));
            }
            if pages >= self.max_pages {
                warn!("Reached the limit of {} pages for one fetch", self.max_pages);
                return Err(FetchError::TooManyPages(pages));
            }

            // Continuation links are self contained, no query params are added
            page = self.client.get_page(next, &[]).await?;
            pages += 1;
        }

        debug!("Fetched {} events over {} pages", events.len(), pages);
        Ok(events)
    }

    async fn fetch_page(&self, window: &FetchWindow) -> Result<Vec<Event>, FetchError> {
        let page = self
            .client
            .get_page(self.client.events_url().clone(), &window.query())
            .await?;
        Ok(page.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use httpmock::MockServer;
    use reqwest::header::HeaderMap;
    use std::time::Duration;
    use url::Url;

    fn fetcher(server: &MockServer, max_pages: usize) -> PageFetcher {
        let client = EventsClient::new(
            Url::parse(&server.url("/api/v1/logs")).unwrap(),
            HeaderMap::new(),
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .unwrap();
        PageFetcher::new(client, max_pages)
    }

    fn window() -> FetchWindow {
        FetchWindow {
            since: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            sort_order: SortOrder::Ascending,
            limit: 2,
        }
    }

    #[test]
    fn test_window_query() {
        assert_eq!(
            window().query(),
            vec![
                ("since", "2023-01-01T00:00:00.000Z".to_owned()),
                ("sortOrder", "ASCENDING".to_owned()),
                ("limit", "2".to_owned()),
            ]
        );
    }

    #[test]
    fn test_sort_order_from_str() {
        assert_eq!("ascending".parse(), Ok(SortOrder::Ascending));
        assert_eq!("DESC".parse(), Ok(SortOrder::Descending));
        assert_eq!("sideways".parse::<SortOrder>(), Err(ParseSortOrderError));
    }

    #[tokio::test]
    async fn test_fetch_follows_next_links() {
        let server = MockServer::start();
        let page_2 = server.url("/api/v1/logs/page-2");
        let first = server.mock(|when, then| {
            when.method(httpmock::Method::GET)
                .path("/api/v1/logs")
                .query_param("since", "2023-01-01T00:00:00.000Z")
                .query_param("sortOrder", "ASCENDING")
                .query_param("limit", "2");
            then.status(200)
                .header("Link", format!("<{page_2}>; rel=\"next\""))
                .body(
                    r#"[{"uuid": "a", "published": "2023-01-01T00:00:01Z"},
                        {"uuid": "b", "published": "2023-01-01T00:00:02Z"}]"#,
                );
        });
        let second = server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/api/v1/logs/page-2");
            then.status(200)
                .body(r#"[{"uuid": "c", "published": "2023-01-01T00:00:03Z"}]"#);
        });

        let events = fetcher(&server, 10).fetch(&window()).await.unwrap();

        first.assert();
        second.assert();
        let ids: Vec<_> = events.iter().map(Event::uuid).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_fetch_stops_on_empty_page() {
        let server = MockServer::start();
        let page_2 = server.url("/api/v1/logs/page-2");
        let page_3 = server.url("/api/v1/logs/page-3");
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/api/v1/logs");
            then.status(200)
                .header("Link", format!("<{page_2}>; rel=\"next\""))
                .body(r#"[{"uuid": "a", "published": "2023-01-01T00:00:01Z"}]"#);
        });
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/api/v1/logs/page-2");
            then.status(200)
                .header("Link", format!("<{page_3}>; rel=\"next\""))
                .body("[]");
        });
        let third = server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/api/v1/logs/page-3");
            then.status(200).body("[]");
        });

        let events = fetcher(&server, 10).fetch(&window()).await.unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(third.hits(), 0);
    }

    #[tokio::test]
    async fn test_fetch_is_all_or_nothing() {
        let server = MockServer::start();
        let page_2 = server.url("/api/v1/logs/page-2");
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/api/v1/logs");
            then.status(200)
                .header("Link", format!("<{page_2}>; rel=\"next\""))
                .body(r#"[{"uuid": "a", "published": "2023-01-01T00:00:01Z"}]"#);
        });
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/api/v1/logs/page-2");
            then.status(500);
        });

        let result = fetcher(&server, 10).fetch(&window()).await;

        match result {
            Err(FetchError::Status { status, .. }) => assert_eq!(status.as_u16(), 500),
            other => panic!("expected a status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_bounds_pages() {
        let server = MockServer::start();
        let page_2 = server.url("/api/v1/logs/page-2");
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/api/v1/logs");
            then.status(200)
                .header("Link", format!("<{page_2}>; rel=\"next\""))
                .body(r#"[{"uuid": "a", "published": "2023-01-01T00:00:01Z"}]"#);
        });
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/api/v1/logs/page-2");
            then.status(200)
                .header("Link", format!("<{page_2}>; rel=\"next\""))
                .body(r#"[{"uuid": "b", "published": "2023-01-01T00:00:02Z"}]"#);
        });

        let err = fetcher(&server, 5).fetch(&window()).await.unwrap_err();
        assert!(matches!(err, FetchError::TooManyPages(2)), "got {err:?}");

        let err = fetcher(&server, 1).fetch(&window()).await.unwrap_err();
        assert!(matches!(err, FetchError::TooManyPages(1)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_fetch_page_ignores_next_link() {
        let server = MockServer::start();
        let page_2 = server.url("/api/v1/logs/page-2");
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/api/v1/logs");
            then.status(200)
                .header("Link", format!("<{page_2}>; rel=\"next\""))
                .body(r#"[{"uuid": "a", "published": "2023-01-01T00:00:01Z"}]"#);
        });
        let second = server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/api/v1/logs/page-2");
            then.status(200).body("[]");
        });

        let events = fetcher(&server, 10).fetch_page(&window()).await.unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(second.hits(), 0);
    }
}
