use std::collections::HashSet;

use anyhow::Error;
use tracing::{debug, info, warn};

use crate::config::RunSettings;
use crate::cursor::store::CursorStore;
use crate::cursor::{advance, save_watermark, Watermark};
use crate::emit::Emitter;
use crate::error::{FetchError, RunError};
use crate::event::{format_timestamp, Event};
use crate::fetch::{EventSource, FetchWindow};
use crate::pipeline::{dedupe, order};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Start,
    Fetching,
    /// A page with unseen events came back: it's accumulated and the window moves to its anchor.
    Extending,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriverOutcome {
    pub fetched: usize,
    pub delivered: usize,
    pub chunks: usize,
    pub rounds: usize,
    pub watermark: Option<Watermark>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub chunks: usize,
}

/// Repeats "events since" requests until a request yields nothing new, then delivers everything
/// collected in order and moves the watermark past it.
///
/// `seen` starts as the prior watermark's ids. The upstream filter is inclusive, so every
/// follow-up request returns the anchor (the latest event of the previous page) again, along with
/// anything else published at that instant. Every uuid accumulated so far is added to `seen`, so
/// those come back filtered out, and a request that only returns already-seen events ends the loop.
///
/// The anchor itself is kept in the accumulated batch rather than set aside, so when a page holds
/// only its anchor the driver still issues one more request from that anchor before `Done`. The
/// delivered batch and the watermark are the same either way, at the cost of that extra request.
pub struct IterationDriver<'a> {
    source: &'a dyn EventSource,
    settings: &'a RunSettings,
    prior: Option<Watermark>,
    state: DriverState,
    window: FetchWindow,
    seen: HashSet<String>,
    page: Vec<Event>,
    accumulated: Vec<Event>,
    fetched: usize,
    rounds: usize,
}

impl<'a> IterationDriver<'a> {
    pub fn new(
        source: &'a dyn EventSource,
        settings: &'a RunSettings,
        prior: Option<Watermark>,
    ) -> Self {
        Self {
            source,
            settings,
            prior,
            state: DriverState::Start,
            window: settings.window.clone(),
            seen: HashSet::new(),
            page: Vec::new(),
            accumulated: Vec::new(),
            fetched: 0,
            rounds: 0,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn window(&self) -> &FetchWindow {
        &self.window
    }

    /// Perform one state transition and return the new state. `Done` is terminal.
    pub async fn step(&mut self) -> Result<DriverState, FetchError> {
        self.state = match self.state {
            DriverState::Start => {
                if let Some(prior) = &self.prior {
                    self.seen = prior.seen_ids();
                }
                info!(
                    "Fetching events since {} ({} boundary ids)",
                    format_timestamp(self.window.since),
                    self.seen.len()
                );
                DriverState::Fetching
            }
            DriverState::Fetching if self.rounds >= self.settings.max_rounds => {
                warn!(
                    "Stopping after {} rounds with {} events collected, the next run continues from here",
                    self.rounds,
                    self.accumulated.len()
                );
                DriverState::Done
            }
            DriverState::Fetching => {
                let events = self.source.fetch(&self.window).await?;
                self.rounds += 1;
                self.fetched += events.len();

                let received = events.len();
                let fresh = dedupe(events, &self.seen);
                info!(
                    "Round {}: received {} events, {} not seen before",
                    self.rounds,
                    received,
                    fresh.len()
                );

                if fresh.is_empty() {
                    DriverState::Done
                } else {
                    self.page = fresh;
                    DriverState::Extending
                }
            }
            DriverState::Extending => {
                let page = std::mem::take(&mut self.page);
                let anchor = page.iter().map(Event::published_at).max();
                self.seen
                    .extend(page.iter().map(|event| event.uuid().to_owned()));
                self.accumulated.extend(page);

                if let Some(anchor) = anchor {
                    let since = self.settings.granularity.floor(anchor);
                    debug!("Moving window to {}", format_timestamp(since));
                    self.window = self.window.with_since(since);
                }
                DriverState::Fetching
            }
            DriverState::Done => DriverState::Done,
        };
        Ok(self.state)
    }

    /// Drive the loop to `Done` and return everything collected, ordered for delivery.
    pub async fn collect(&mut self) -> Result<Vec<Event>, FetchError> {
        while self.step().await? != DriverState::Done {}
        Ok(order(std::mem::take(&mut self.accumulated)))
    }

    /// Collect, deliver in chunks, then persist the advanced watermark. Nothing is persisted
    /// unless something was delivered, and nothing is persisted if any chunk fails.
    pub async fn run(
        mut self,
        sink: &mut dyn Emitter,
        store: &dyn CursorStore,
    ) -> Result<DriverOutcome, RunError> {
        let batch = self.collect().await?;

        let delivery = deliver(sink, &batch, self.settings.chunk_size)
            .await
            .map_err(RunError::Sink)?;

        let watermark = advance(&batch, self.prior.as_ref(), self.settings.granularity);
        match &watermark {
            Some(watermark) if delivery.delivered > 0 => save_watermark(store, watermark).await?,
            _ => info!("No new events, watermark left as it was"),
        }

        Ok(DriverOutcome {
            fetched: self.fetched,
            delivered: delivery.delivered,
            chunks: delivery.chunks,
            rounds: self.rounds,
            watermark,
        })
    }
}

/// Hand `batch` to the sink in chunks of at most `chunk_size` events, each chunk in its own
/// transaction. Stops at the first chunk that fails.
pub async fn deliver(
    sink: &mut dyn Emitter,
    batch: &[Event],
    chunk_size: usize,
) -> Result<Delivery, Error> {
    let mut delivery = Delivery::default();
    for chunk in batch.chunks(chunk_size.max(1)) {
        let txn = sink.begin_write().await?;
        txn.emit(chunk).await?;
        txn.commit_write().await?;

        delivery.delivered += chunk.len();
        delivery.chunks += 1;
        metrics::counter!("event_poller_events_delivered").increment(chunk.len() as u64);
        debug!("Delivered chunk {} with {} events", delivery.chunks, chunk.len());
    }
    Ok(delivery)
}
