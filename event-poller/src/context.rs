use std::str::FromStr;

use tracing::info;

use crate::config::Config;
use crate::cursor::store::{CursorStore, FileCursorStore};
use crate::emit::{Emitter, FileEmitter, LineFormat, NoOpEmitter, StdoutEmitter};
use crate::error::{ConfigError, RunError};
use crate::fetch::client::EventsClient;
use crate::fetch::{EventSource, PageFetcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Stdout,
    File,
    NoOp,
}

impl FromStr for SinkKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "stdout" => Ok(SinkKind::Stdout),
            "file" => Ok(SinkKind::File),
            "noop" => Ok(SinkKind::NoOp),
            invalid => Err(ConfigError::InvalidSink(invalid.to_owned())),
        }
    }
}

/// The collaborators of a single invocation. Built once from `Config`, then handed to `run`.
pub struct AppContext {
    pub config: Config,
    pub source: Box<dyn EventSource>,
    pub sink: Box<dyn Emitter>,
    pub store: Box<dyn CursorStore>,
}

impl AppContext {
    pub async fn new(config: &Config) -> Result<Self, RunError> {
        let client = EventsClient::new(
            config.events_url()?,
            config.header_map()?,
            config.connect_timeout.0,
            config.request_timeout.0,
        )?;
        let source = Box::new(PageFetcher::new(client, config.max_pages));

        let format = LineFormat::from_as_json(config.sink_as_json);
        let sink: Box<dyn Emitter> = match config.sink.parse::<SinkKind>()? {
            SinkKind::Stdout => Box::new(StdoutEmitter { format }),
            SinkKind::File => {
                let path = config.sink_path.clone().ok_or(ConfigError::MissingSinkPath)?;
                Box::new(
                    FileEmitter::new(path, format)
                        .await
                        .map_err(RunError::Sink)?,
                )
            }
            SinkKind::NoOp => Box::new(NoOpEmitter),
        };

        let store = FileCursorStore::new(&config.cursor_path);
        info!(
            "Polling {} with the watermark stored at {}",
            config.events_url,
            store.path().display()
        );

        Ok(Self::from_parts(config.clone(), source, sink, Box::new(store)))
    }

    pub fn from_parts(
        config: Config,
        source: Box<dyn EventSource>,
        sink: Box<dyn Emitter>,
        store: Box<dyn CursorStore>,
    ) -> Self {
        Self {
            config,
            source,
            sink,
            store,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use envconfig::Envconfig;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let mut env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.entry("EVENTS_URL".to_owned())
            .or_insert_with(|| "https://example.okta.com/api/v1/logs".to_owned());
        Config::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn test_sink_kind_from_str() {
        assert_eq!("STDOUT".parse::<SinkKind>().unwrap(), SinkKind::Stdout);
        assert_eq!("noop".parse::<SinkKind>().unwrap(), SinkKind::NoOp);
        assert!(matches!(
            "kafka".parse::<SinkKind>(),
            Err(ConfigError::InvalidSink(_))
        ));
    }

    #[tokio::test]
    async fn test_new_builds_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let cursor_path = dir.path().join("cursor.json");
        let sink_path = dir.path().join("events.jsonl");
        let config = config(&[
            ("SINK", "file"),
            ("SINK_PATH", sink_path.to_str().unwrap()),
            ("CURSOR_PATH", cursor_path.to_str().unwrap()),
        ]);

        let context = AppContext::new(&config).await.unwrap();
        assert_eq!(context.store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_new_rejects_bad_config() {
        let err = AppContext::new(&config(&[("SINK", "file")]))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RunError::Config(ConfigError::MissingSinkPath)));

        let err = AppContext::new(&config(&[("EVENTS_URL", "not a url")]))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RunError::Config(ConfigError::InvalidUrl(_))));

        let err = AppContext::new(&config(&[("HEADERS", "nope")]))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            RunError::Config(ConfigError::InvalidHeaders(_))
        ));
    }
}
