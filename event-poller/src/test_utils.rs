//! Shared helpers for unit and integration tests.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;

use crate::emit::{Emitter, Transaction};
use crate::error::FetchError;
use crate::event::{parse_timestamp, Event};
use crate::fetch::{EventSource, FetchWindow};

/// An event with only the fields the connector looks at.
pub fn event(uuid: &str, published: &str) -> Event {
    Event::from_value(json!({
        "uuid": uuid,
        "published": published,
    }))
    .expect("test event is valid")
}

pub fn ts(value: &str) -> DateTime<Utc> {
    parse_timestamp(value).expect("test timestamp is valid")
}

/// Answers fetches from a queue of canned responses, recording every window it was asked for.
/// Once the queue is drained every fetch returns an empty page.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    responses: Arc<Mutex<VecDeque<Result<Vec<Event>, FetchError>>>>,
    windows: Arc<Mutex<Vec<FetchWindow>>>,
}

impl ScriptedSource {
    pub fn new(pages: Vec<Vec<Event>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(pages.into_iter().map(Ok).collect())),
            windows: Arc::default(),
        }
    }

    pub async fn push_error(&self, error: FetchError) {
        self.responses.lock().await.push_back(Err(error));
    }

    pub async fn windows(&self) -> Vec<FetchWindow> {
        self.windows.lock().await.clone()
    }

    async fn next(&self, window: &FetchWindow) -> Result<Vec<Event>, FetchError> {
        self.windows.lock().await.push(window.clone());
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn fetch(&self, window: &FetchWindow) -> Result<Vec<Event>, FetchError> {
        self.next(window).await
    }

    async fn fetch_page(&self, window: &FetchWindow) -> Result<Vec<Event>, FetchError> {
        self.next(window).await
    }
}

/// Keeps every committed chunk. Chunks that were emitted but never committed are discarded.
#[derive(Clone, Default)]
pub struct CollectingEmitter {
    committed: Arc<Mutex<Vec<Vec<Event>>>>,
    fail_on_chunk: Option<usize>,
}

impl CollectingEmitter {
    /// Fail the commit of the chunk with this zero-based index.
    pub fn failing_on_chunk(index: usize) -> Self {
        Self {
            fail_on_chunk: Some(index),
            ..Self::default()
        }
    }

    pub async fn chunks(&self) -> Vec<Vec<Event>> {
        self.committed.lock().await.clone()
    }

    pub async fn uuids(&self) -> Vec<String> {
        self.chunks()
            .await
            .iter()
            .flatten()
            .map(|event| event.uuid().to_owned())
            .collect()
    }
}

#[async_trait]
impl Emitter for CollectingEmitter {
    async fn begin_write<'a>(&'a mut self) -> Result<Box<dyn Transaction<'a> + 'a>, Error> {
        Ok(Box::new(CollectingTransaction {
            emitter: self,
            pending: Mutex::new(Vec::new()),
        }))
    }
}

struct CollectingTransaction<'a> {
    emitter: &'a CollectingEmitter,
    pending: Mutex<Vec<Event>>,
}

#[async_trait]
impl<'a> Transaction<'a> for CollectingTransaction<'a> {
    async fn emit(&self, data: &[Event]) -> Result<(), Error> {
        self.pending.lock().await.extend_from_slice(data);
        Ok(())
    }

    async fn commit_write(self: Box<Self>) -> Result<(), Error> {
        let emitter = self.emitter;
        let pending = self.pending.into_inner();
        let mut committed = emitter.committed.lock().await;
        if emitter.fail_on_chunk == Some(committed.len()) {
            anyhow::bail!("sink unavailable");
        }
        committed.push(pending);
        Ok(())
    }
}
