use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Error};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::event::Event;

/// Downstream destination for delivered events. Every chunk goes through its own transaction:
/// `begin_write`, `emit`, then `commit_write`.
#[async_trait]
pub trait Emitter: Send + Sync {
    async fn begin_write<'a>(&'a mut self) -> Result<Box<dyn Transaction<'a> + 'a>, Error>;
}

#[async_trait]
pub trait Transaction<'a>: Send + Sync {
    async fn emit(&self, data: &[Event]) -> Result<(), Error>;

    async fn commit_write(self: Box<Self>) -> Result<(), Error> {
        Ok(())
    }
}

/// How a delivered event is written out, one line per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFormat {
    /// The record exactly as the source sent it, as compact JSON.
    Json,
    /// `<published> <uuid> <record>`, for reading in a terminal.
    Text,
}

impl LineFormat {
    pub fn from_as_json(as_json: bool) -> Self {
        if as_json {
            LineFormat::Json
        } else {
            LineFormat::Text
        }
    }

    /// All of `data` rendered as newline terminated lines.
    pub fn render(&self, data: &[Event]) -> Result<String, Error> {
        let mut buffer = String::new();
        for event in data {
            let record = serde_json::to_string(event.raw())
                .with_context(|| format!("failed to serialize event {}", event.uuid()))?;
            if *self == LineFormat::Text {
                buffer.push_str(event.published());
                buffer.push(' ');
                buffer.push_str(event.uuid());
                buffer.push(' ');
            }
            buffer.push_str(&record);
            buffer.push('\n');
        }
        Ok(buffer)
    }
}

pub struct StdoutEmitter {
    pub format: LineFormat,
}

#[async_trait]
impl Emitter for StdoutEmitter {
    async fn begin_write<'a>(&'a mut self) -> Result<Box<dyn Transaction<'a> + 'a>, Error> {
        let to_store: &'a Self = self;
        Ok(Box::new(to_store))
    }
}

#[async_trait]
impl<'a> Transaction<'a> for &'a StdoutEmitter {
    async fn emit(&self, data: &[Event]) -> Result<(), Error> {
        let lines = self.format.render(data)?;
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(lines.as_bytes())?;
        stdout.flush()?;
        Ok(())
    }
}

pub struct NoOpEmitter;

#[async_trait]
impl Emitter for NoOpEmitter {
    async fn begin_write<'a>(&'a mut self) -> Result<Box<dyn Transaction<'a> + 'a>, Error> {
        let to_store: &'a Self = self;
        Ok(Box::new(to_store))
    }
}

#[async_trait]
impl<'a> Transaction<'a> for &'a NoOpEmitter {
    async fn emit(&self, data: &[Event]) -> Result<(), Error> {
        debug!("Discarding {} events", data.len());
        Ok(())
    }
}

/// Appends events to a file, one per line. A chunk is written with a single write, so a failed
/// chunk doesn't leave half of itself behind. Earlier contents are kept across runs.
pub struct FileEmitter {
    path: PathBuf,
    format: LineFormat,
}

impl FileEmitter {
    pub async fn new(path: impl Into<PathBuf>, format: LineFormat) -> Result<Self, Error> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        info!("Appending events to {}", path.display());
        Ok(Self { path, format })
    }
}

#[async_trait]
impl Emitter for FileEmitter {
    async fn begin_write<'a>(&'a mut self) -> Result<Box<dyn Transaction<'a> + 'a>, Error> {
        let to_store: &'a Self = self;
        Ok(Box::new(to_store))
    }
}

#[async_trait]
impl<'a> Transaction<'a> for &'a FileEmitter {
    async fn emit(&self, data: &[Event]) -> Result<(), Error> {
        let lines = self.format.render(data)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        debug!("Wrote {} events to {}", data.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::event;

    #[test]
    fn test_text_lines_show_the_record() {
        let lines = LineFormat::Text
            .render(&[event("a", "2023-01-01T10:00:00Z")])
            .unwrap();

        let record = lines
            .strip_prefix("2023-01-01T10:00:00Z a ")
            .and_then(|rest| rest.strip_suffix('\n'))
            .unwrap();
        let record: serde_json::Value = serde_json::from_str(record).unwrap();
        assert_eq!(
            record,
            serde_json::json!({"uuid": "a", "published": "2023-01-01T10:00:00Z"})
        );
    }

    #[test]
    fn test_json_lines_are_the_raw_record() {
        let lines = LineFormat::Json
            .render(&[
                event("a", "2023-01-01T10:00:00Z"),
                event("b", "2023-01-01T10:00:01Z"),
            ])
            .unwrap();

        let records: Vec<serde_json::Value> = lines
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(
            records,
            vec![
                serde_json::json!({"uuid": "a", "published": "2023-01-01T10:00:00Z"}),
                serde_json::json!({"uuid": "b", "published": "2023-01-01T10:00:01Z"}),
            ]
        );
    }

    #[tokio::test]
    async fn test_file_emitter_appends_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("events.jsonl");
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, "{\"uuid\":\"earlier\"}\n")
            .await
            .unwrap();

        let mut emitter = FileEmitter::new(&path, LineFormat::Json).await.unwrap();
        for chunk in [
            vec![event("a", "2023-01-01T10:00:00Z")],
            vec![
                event("b", "2023-01-01T10:00:01Z"),
                event("c", "2023-01-01T10:00:02Z"),
            ],
        ] {
            let txn = emitter.begin_write().await.unwrap();
            txn.emit(&chunk).await.unwrap();
            txn.commit_write().await.unwrap();
        }

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = written
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["uuid"], "earlier");
        assert_eq!(lines[1]["uuid"], "a");
        assert_eq!(lines[3]["published"], "2023-01-01T10:00:02Z");
    }

    #[tokio::test]
    async fn test_file_emitter_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("events.log");

        let mut emitter = FileEmitter::new(&path, LineFormat::Text).await.unwrap();
        let txn = emitter.begin_write().await.unwrap();
        txn.emit(&[event("a", "2023-01-01T10:00:00Z")]).await.unwrap();
        txn.commit_write().await.unwrap();

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(written.starts_with("2023-01-01T10:00:00Z a "), "got {written}");
    }
}
