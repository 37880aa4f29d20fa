use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::IngestionConfig;
use crate::error::{PipelineError, Result};
use crate::metrics;
use crate::record::EventRecord;

/// Metadata key holding the RFC3339 time a record entered the buffer.
pub const RECEIVED_AT_KEY: &str = "http.received_at";
/// Metadata key shared by every record of one submission.
pub const REQUEST_ID_KEY: &str = "http.request_id";

/// Outcome of a successful [`IngestionGateway::submit`].
#[derive(Debug, Clone)]
pub struct SubmissionReceipt {
    pub count: usize,
    pub received: DateTime<Utc>,
    pub request_id: Uuid,
}

/// Outcome of [`IngestionGateway::poll`].
#[derive(Debug)]
pub enum PollResult {
    Event(EventRecord),
    /// Deadline elapsed with nothing buffered. Callers simply poll again.
    Empty,
    /// The caller's cancellation token fired.
    Cancelled,
    /// The gateway was shut down and its buffer released.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// True when the buffer emptied before the wait elapsed.
    pub drained: bool,
    /// Records still buffered when resources were released.
    pub discarded: usize,
}

/// Accepts event submissions into a bounded buffer and hands them to chain
/// workers.
///
/// Enqueue never blocks: a full buffer rejects the rest of the submission
/// with [`PipelineError::QueueFull`]. Records accepted earlier in the same
/// submission stay enqueued.
pub struct IngestionGateway {
    tx: mpsc::Sender<EventRecord>,
    rx: Mutex<mpsc::Receiver<EventRecord>>,
    accepting: AtomicBool,
    closed: CancellationToken,
    capacity: usize,
    max_batch_size: usize,
}

impl IngestionGateway {
    pub fn new(config: &IngestionConfig) -> Self {
        let capacity = config.buffer_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        info!(
            "Ingestion gateway ready (buffer capacity {}, max batch size {})",
            capacity, config.max_batch_size
        );
        Self {
            tx,
            rx: Mutex::new(rx),
            accepting: AtomicBool::new(true),
            closed: CancellationToken::new(),
            capacity,
            max_batch_size: config.max_batch_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of records currently buffered.
    pub fn len(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Decodes `payload` (one object or an array of objects) and enqueues
    /// each event.
    pub fn submit(&self, payload: &[u8]) -> Result<SubmissionReceipt> {
        if !self.is_accepting() {
            return Err(PipelineError::ShuttingDown);
        }

        let events = match decode_payload(payload) {
            Ok(events) => events,
            Err(e) => {
                warn!("Rejecting submission: {}", e);
                metrics::inc_ingest("rejected_malformed", 1);
                return Err(e);
            }
        };

        let total = events.len();
        if total > self.max_batch_size {
            warn!("Batch size {} exceeds maximum {}", total, self.max_batch_size);
            metrics::inc_ingest("rejected_batch", total as u64);
            return Err(PipelineError::BatchTooLarge {
                count: total,
                max: self.max_batch_size,
            });
        }

        let received = Utc::now();
        let request_id = Uuid::new_v4();
        let request_id_str = request_id.to_string();

        for (accepted, body) in events.into_iter().enumerate() {
            let mut record = EventRecord::from_object(body);
            let md = record.metadata_mut();
            md.set(RECEIVED_AT_KEY, Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
            md.set(REQUEST_ID_KEY, request_id_str.clone());

            match self.tx.try_send(record) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Event queue full, accepted {}/{} events (request {})",
                        accepted, total, request_id
                    );
                    metrics::inc_ingest("accepted", accepted as u64);
                    metrics::inc_ingest("rejected_queue_full", (total - accepted) as u64);
                    metrics::set_buffer_depth(self.len());
                    return Err(PipelineError::QueueFull { accepted, total });
                }
                Err(TrySendError::Closed(_)) => return Err(PipelineError::ShuttingDown),
            }
        }

        metrics::inc_ingest("accepted", total as u64);
        metrics::set_buffer_depth(self.len());
        debug!("Accepted {} events (request {})", total, request_id);

        Ok(SubmissionReceipt {
            count: total,
            received,
            request_id,
        })
    }

    /// Waits for the next record until `deadline` elapses, `cancel` fires or
    /// the gateway closes.
    pub async fn poll(&self, deadline: Duration, cancel: &CancellationToken) -> PollResult {
        if self.closed.is_cancelled() {
            return PollResult::Closed;
        }

        let recv = async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => PollResult::Cancelled,
            _ = self.closed.cancelled() => PollResult::Closed,
            res = tokio::time::timeout(deadline, recv) => match res {
                Ok(Some(record)) => PollResult::Event(record),
                Ok(None) => PollResult::Closed,
                Err(_) => PollResult::Empty,
            },
        };

        if matches!(result, PollResult::Event(_)) {
            metrics::set_buffer_depth(self.len());
        }
        result
    }

    /// Like [`poll`](Self::poll), then takes up to `max - 1` more records
    /// that are already buffered without waiting.
    pub async fn poll_batch(
        &self,
        max: usize,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<EventRecord>, PollResult> {
        let first = match self.poll(deadline, cancel).await {
            PollResult::Event(record) => record,
            other => return Err(other),
        };
        let mut batch = vec![first];
        if max > 1 {
            let mut rx = self.rx.lock().await;
            while batch.len() < max {
                match rx.try_recv() {
                    Ok(record) => batch.push(record),
                    Err(_) => break,
                }
            }
        }
        metrics::set_buffer_depth(self.len());
        Ok(batch)
    }

    /// Stops accepting submissions, waits up to `wait` for consumers to
    /// drain the buffer, then releases it.
    pub async fn shutdown(&self, wait: Duration) -> ShutdownReport {
        info!("Shutting down ingestion gateway");
        self.accepting.store(false, Ordering::Release);

        let started = Instant::now();
        while !self.is_empty() && started.elapsed() < wait {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let drained = self.is_empty();

        self.closed.cancel();
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        metrics::set_buffer_depth(0);

        if discarded > 0 {
            warn!(
                "Ingestion gateway closed with {} undrained events after {:?}",
                discarded, wait
            );
        } else {
            info!("Ingestion gateway drained and closed");
        }

        ShutdownReport { drained, discarded }
    }
}

/// Splits a submission into event objects. An array yields one event per
/// element; anything else must be a single object.
pub fn decode_payload(payload: &[u8]) -> Result<Vec<Map<String, Value>>> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| PipelineError::malformed(format!("invalid JSON: {}", e)))?;

    match value {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(map) => Ok(map),
                _ => Err(PipelineError::malformed(format!(
                    "batch element {} is not an object",
                    i
                ))),
            })
            .collect(),
        Value::Object(map) => Ok(vec![map]),
        _ => Err(PipelineError::malformed("payload is not an object or array of objects")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn gateway(capacity: usize, max_batch: usize) -> IngestionGateway {
        IngestionGateway::new(&IngestionConfig {
            max_batch_size: max_batch,
            buffer_capacity: capacity,
            poll_timeout_ms: 100,
            shutdown_timeout_ms: 100,
        })
    }

    fn events(n: usize) -> Vec<u8> {
        let items: Vec<Value> = (0..n).map(|i| json!({"seq": i})).collect();
        serde_json::to_vec(&items).unwrap()
    }

    #[test]
    fn single_object_is_one_event() {
        let gw = gateway(10, 10);
        let receipt = gw.submit(br#"{"class_uid": 2004}"#).unwrap();
        assert_eq!(receipt.count, 1);
        assert_eq!(gw.len(), 1);
    }

    #[test]
    fn array_is_split_into_events() {
        let gw = gateway(10, 10);
        assert_eq!(gw.submit(&events(4)).unwrap().count, 4);
        assert_eq!(gw.len(), 4);
    }

    #[test]
    fn empty_array_accepts_nothing() {
        let gw = gateway(10, 10);
        assert_eq!(gw.submit(b"[]").unwrap().count, 0);
        assert!(gw.is_empty());
    }

    #[test]
    fn malformed_payloads_are_rejected_without_enqueueing() {
        let gw = gateway(10, 10);
        for bad in [&b"{not json"[..], b"42", b"\"str\"", b"null", br#"[{"a":1}, 2]"#] {
            assert!(matches!(gw.submit(bad), Err(PipelineError::MalformedInput(_))));
        }
        assert!(gw.is_empty());
    }

    #[test]
    fn oversized_batch_accepts_nothing() {
        let gw = gateway(10, 3);
        match gw.submit(&events(4)) {
            Err(PipelineError::BatchTooLarge { count, max }) => {
                assert_eq!((count, max), (4, 3));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(gw.is_empty());
    }

    #[test]
    fn full_buffer_rejects_and_keeps_exactly_capacity() {
        let gw = gateway(3, 10);
        gw.submit(&events(3)).unwrap();
        assert!(matches!(
            gw.submit(br#"{"late": true}"#),
            Err(PipelineError::QueueFull { accepted: 0, total: 1 })
        ));
        assert_eq!(gw.len(), 3);
    }

    #[test]
    fn partial_acceptance_keeps_earlier_events() {
        let gw = gateway(3, 10);
        gw.submit(&events(1)).unwrap();
        assert!(matches!(
            gw.submit(&events(4)),
            Err(PipelineError::QueueFull { accepted: 2, total: 4 })
        ));
        assert_eq!(gw.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_never_overfill() {
        let gw = Arc::new(gateway(10, 10));
        let producers = (0..64).map(|i| {
            let gw = gw.clone();
            tokio::spawn(async move { gw.submit(json!({"seq": i}).to_string().as_bytes()) })
        });

        let mut accepted = 0;
        let mut full = 0;
        for result in futures::future::join_all(producers).await {
            match result.unwrap() {
                Ok(receipt) => {
                    assert_eq!(receipt.count, 1);
                    accepted += 1;
                }
                Err(PipelineError::QueueFull { accepted: 0, total: 1 }) => full += 1,
                Err(other) => panic!("unexpected {:?}", other),
            }
        }

        assert_eq!(accepted, 10);
        assert_eq!(full, 54);
        assert_eq!(gw.len(), 10);
    }

    #[tokio::test]
    async fn poll_returns_event_with_ingestion_metadata() {
        let gw = gateway(4, 4);
        let receipt = gw.submit(br#"{"class_uid": 1007}"#).unwrap();
        let cancel = CancellationToken::new();
        match gw.poll(Duration::from_millis(100), &cancel).await {
            PollResult::Event(record) => {
                assert_eq!(record.body()["class_uid"], json!(1007));
                let received = record.metadata().get(RECEIVED_AT_KEY).unwrap();
                assert!(DateTime::parse_from_rfc3339(received).is_ok());
                let request_id = receipt.request_id.to_string();
                assert_eq!(record.metadata().get(REQUEST_ID_KEY), Some(request_id.as_str()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn poll_times_out_with_empty() {
        let gw = gateway(4, 4);
        let cancel = CancellationToken::new();
        assert!(matches!(
            gw.poll(Duration::from_millis(20), &cancel).await,
            PollResult::Empty
        ));
    }

    #[tokio::test]
    async fn cancellation_interrupts_blocked_poll() {
        let gw = Arc::new(gateway(4, 4));
        let cancel = CancellationToken::new();
        let handle = {
            let gw = gw.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gw.poll(Duration::from_secs(30), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, PollResult::Cancelled));
    }

    #[tokio::test]
    async fn poll_batch_takes_buffered_records() {
        let gw = gateway(10, 10);
        gw.submit(&events(5)).unwrap();
        let cancel = CancellationToken::new();
        let batch = gw
            .poll_batch(3, Duration::from_millis(50), &cancel)
            .await
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(gw.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_waits_for_consumer_to_drain() {
        let gw = Arc::new(gateway(10, 10));
        gw.submit(&events(5)).unwrap();

        let consumer = {
            let gw = gw.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let mut seen = 0;
                loop {
                    match gw.poll(Duration::from_millis(20), &cancel).await {
                        PollResult::Event(_) => seen += 1,
                        PollResult::Closed => break,
                        _ => {}
                    }
                }
                seen
            })
        };

        let report = gw.shutdown(Duration::from_secs(2)).await;
        assert_eq!(report, ShutdownReport { drained: true, discarded: 0 });
        assert_eq!(consumer.await.unwrap(), 5);
        assert!(matches!(gw.submit(b"{}"), Err(PipelineError::ShuttingDown)));
    }

    #[tokio::test]
    async fn shutdown_without_consumer_reports_discarded() {
        let gw = gateway(10, 10);
        gw.submit(&events(2)).unwrap();
        let report = gw.shutdown(Duration::from_millis(30)).await;
        assert_eq!(report, ShutdownReport { drained: false, discarded: 2 });
        let cancel = CancellationToken::new();
        assert!(matches!(
            gw.poll(Duration::from_millis(10), &cancel).await,
            PollResult::Closed
        ));
    }
}
