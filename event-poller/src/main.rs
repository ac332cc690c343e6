use anyhow::Error;
use envconfig::Envconfig;
use event_poller::{
    config::Config,
    context::AppContext,
    error::RunError,
    event::format_timestamp,
    run::run,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer: tracing_subscriber::filter::Filtered<
        tracing_subscriber::fmt::Layer<tracing_subscriber::Registry>,
        EnvFilter,
        tracing_subscriber::Registry,
    > = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
pub async fn main() -> Result<(), Error> {
    setup_tracing();

    let config = Config::init_from_env()?;
    let mode = config.run_mode;
    info!("Starting {} run", mode);

    let mut context = AppContext::new(&config).await?;

    match run(mode, &mut context).await {
        Ok(report) => {
            info!(
                "Finished {} run: fetched {} events over {} rounds, delivered {} in {} chunks, watermark at {}",
                report.mode,
                report.fetched,
                report.rounds,
                report.delivered,
                report.chunks,
                report
                    .watermark
                    .as_ref()
                    .map(|w| format_timestamp(w.after))
                    .unwrap_or_else(|| "none".to_owned())
            );
            Ok(())
        }
        Err(e) => {
            let hint = match &e {
                RunError::FetchFailed(fetch_error) => Some(fetch_error.user_message()),
                _ => None,
            };
            // anyhow's alternate formatting prints the whole source chain
            let e = Error::from(e);
            error!("{} run failed: {:#}", mode, e);
            if let Some(hint) = hint {
                error!("{}", hint);
            }
            Err(e)
        }
    }
}
