//! Downstream collaborators that take ownership of finished records.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::config::{SinkConfig, SinkKind};
use crate::error::{PipelineError, Result};
use crate::record::EventRecord;

/// A record the chain could not process, with the reason.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub record: EventRecord,
    pub failed_unit: String,
    pub error_type: String,
    pub error_message: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(record: EventRecord, unit: &str, error: &PipelineError, attempts: u32) -> Self {
        Self {
            record,
            failed_unit: unit.to_string(),
            error_type: error.kind().to_string(),
            error_message: error.to_string(),
            attempts,
            failed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Takes a forwarded record together with its metadata sidecar.
    async fn deliver(&self, record: EventRecord) -> Result<()>;

    /// Takes a record whose traversal failed.
    async fn dead_letter(&self, letter: DeadLetter) -> Result<()>;
}

pub fn from_config(config: &SinkConfig) -> Arc<dyn EventSink> {
    match config.kind {
        SinkKind::Stdout => Arc::new(WriterSink::stdout(config.include_metadata)),
        SinkKind::None => Arc::new(NullSink),
    }
}

/// Writes one JSON document per line.
pub struct WriterSink<W> {
    writer: Mutex<W>,
    include_metadata: bool,
}

pub type StdoutSink = WriterSink<tokio::io::Stdout>;

impl StdoutSink {
    pub fn stdout(include_metadata: bool) -> Self {
        Self::new(tokio::io::stdout(), include_metadata)
    }
}

impl<W> WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W, include_metadata: bool) -> Self {
        Self {
            writer: Mutex::new(writer),
            include_metadata,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    async fn write_line(&self, doc: &serde_json::Value) -> Result<()> {
        let mut line = serde_json::to_vec(doc)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W> EventSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn deliver(&self, record: EventRecord) -> Result<()> {
        let doc = if self.include_metadata {
            let id = record.id;
            let (event, metadata) = record.into_parts();
            json!({ "id": id, "event": event, "metadata": serde_json::to_value(metadata)? })
        } else {
            record.into_parts().0
        };
        self.write_line(&doc).await
    }

    async fn dead_letter(&self, letter: DeadLetter) -> Result<()> {
        let doc = json!({ "dead_letter": serde_json::to_value(&letter)? });
        self.write_line(&doc).await
    }
}

/// Discards everything.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn deliver(&self, record: EventRecord) -> Result<()> {
        debug!("Discarding record {}", record.id);
        Ok(())
    }

    async fn dead_letter(&self, letter: DeadLetter) -> Result<()> {
        debug!("Discarding dead letter for record {}", letter.record.id);
        Ok(())
    }
}

#[derive(Debug)]
pub enum SinkEntry {
    Delivered(EventRecord),
    DeadLettered(DeadLetter),
}

/// Forwards entries over an unbounded channel, for embedding the pipeline
/// in another service.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEntry>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SinkEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, entry: SinkEntry) -> Result<()> {
        self.tx
            .send(entry)
            .map_err(|_| PipelineError::sink("channel receiver dropped"))
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn deliver(&self, record: EventRecord) -> Result<()> {
        self.send(SinkEntry::Delivered(record))
    }

    async fn dead_letter(&self, letter: DeadLetter) -> Result<()> {
        self.send(SinkEntry::DeadLettered(letter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn lines(buf: Vec<u8>) -> Vec<Value> {
        String::from_utf8(buf)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn writes_event_with_metadata() {
        let sink = WriterSink::new(Vec::new(), true);
        let mut record = EventRecord::new(json!({"class_uid": 2004}));
        record.metadata_mut().set("tag.severity", "high");
        sink.deliver(record).await.unwrap();

        let out = lines(sink.into_inner());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["event"], json!({"class_uid": 2004}));
        assert_eq!(out[0]["metadata"]["tag.severity"], json!("high"));
    }

    #[tokio::test]
    async fn writes_bare_body_without_metadata() {
        let sink = WriterSink::new(Vec::new(), false);
        sink.deliver(EventRecord::new(json!({"a": 1}))).await.unwrap();
        sink.deliver(EventRecord::new(json!({"b": 2}))).await.unwrap();
        assert_eq!(lines(sink.into_inner()), vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[tokio::test]
    async fn dead_letters_carry_reason() {
        let sink = WriterSink::new(Vec::new(), true);
        let error = PipelineError::record_format("asset_enricher expects object");
        let letter = DeadLetter::new(EventRecord::new(json!([1])), "asset_enricher", &error, 2);
        sink.dead_letter(letter).await.unwrap();

        let out = lines(sink.into_inner());
        let letter = &out[0]["dead_letter"];
        assert_eq!(letter["failed_unit"], json!("asset_enricher"));
        assert_eq!(letter["error_type"], json!("record_format"));
        assert_eq!(letter["attempts"], json!(2));
    }

    #[tokio::test]
    async fn channel_sink_reports_closed_receiver() {
        let (sink, rx) = ChannelSink::channel();
        drop(rx);
        assert!(matches!(
            sink.deliver(EventRecord::new(json!({}))).await,
            Err(PipelineError::SinkError(_))
        ));
    }
}
