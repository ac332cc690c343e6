use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::{RunMode, RunSettings};
use crate::context::AppContext;
use crate::cursor::{load_watermark, Watermark};
use crate::driver::{deliver, IterationDriver};
use crate::error::RunError;
use crate::pipeline::order;

/// Summary of one invocation, logged by the binary.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub mode: RunMode,
    pub fetched: usize,
    pub delivered: usize,
    pub chunks: usize,
    pub rounds: usize,
    /// The watermark as it stands after the run. `validate` never reads it.
    pub watermark: Option<Watermark>,
}

pub async fn run(mode: RunMode, context: &mut AppContext) -> Result<RunReport, RunError> {
    run_at(mode, context, Utc::now()).await
}

/// As `run`, with the look-back window measured from `now`.
pub async fn run_at(
    mode: RunMode,
    context: &mut AppContext,
    now: DateTime<Utc>,
) -> Result<RunReport, RunError> {
    let result = match mode {
        RunMode::Validate => validate(context, now).await,
        RunMode::Fetch => fetch(context, now).await,
        RunMode::Query => query(context, now).await,
    };

    let outcome = if result.is_ok() { "success" } else { "failure" };
    metrics::counter!("event_poller_runs", "mode" => mode.to_string(), "outcome" => outcome)
        .increment(1);

    result
}

async fn validate(context: &mut AppContext, now: DateTime<Utc>) -> Result<RunReport, RunError> {
    let settings = RunSettings::resolve(&context.config, RunMode::Validate, None, now)?;
    let events = context.source.fetch_page(&settings.window).await?;
    info!("Events endpoint is reachable");

    Ok(RunReport {
        mode: RunMode::Validate,
        fetched: events.len(),
        delivered: 0,
        chunks: 0,
        rounds: 1,
        watermark: None,
    })
}

async fn fetch(context: &mut AppContext, now: DateTime<Utc>) -> Result<RunReport, RunError> {
    let watermark = load_watermark(context.store.as_ref()).await?;
    let settings = RunSettings::resolve(&context.config, RunMode::Fetch, watermark.as_ref(), now)?;

    let outcome = IterationDriver::new(context.source.as_ref(), &settings, watermark)
        .run(context.sink.as_mut(), context.store.as_ref())
        .await?;

    Ok(RunReport {
        mode: RunMode::Fetch,
        fetched: outcome.fetched,
        delivered: outcome.delivered,
        chunks: outcome.chunks,
        rounds: outcome.rounds,
        watermark: outcome.watermark,
    })
}

async fn query(context: &mut AppContext, now: DateTime<Utc>) -> Result<RunReport, RunError> {
    let watermark = load_watermark(context.store.as_ref()).await?;
    let settings = RunSettings::resolve(&context.config, RunMode::Query, watermark.as_ref(), now)?;

    let events = order(context.source.fetch_page(&settings.window).await?);
    let fetched = events.len();
    let delivery = deliver(context.sink.as_mut(), &events, settings.chunk_size)
        .await
        .map_err(RunError::Sink)?;

    Ok(RunReport {
        mode: RunMode::Query,
        fetched,
        delivered: delivery.delivered,
        chunks: delivery.chunks,
        rounds: 1,
        watermark,
    })
}
