//! Worker pool draining the ingestion gateway through the processor chain.
//!
//! Each worker owns one record at a time, so a record's traversal is always
//! sequential while distinct records run in parallel.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ErrorHandling;
use crate::ingestion::{IngestionGateway, PollResult};
use crate::processors::{ChainOutcome, ProcessorChain};
use crate::record::EventRecord;
use crate::sink::{DeadLetter, EventSink};

pub const CHAIN_ERROR_KEY: &str = "chain_error";
pub const CHAIN_FAILED_UNIT_KEY: &str = "chain_failed_unit";

/// Where a record ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Delivered,
    Dropped,
    /// Failed and discarded under the `drop` or exhausted `retry` policy.
    Discarded,
    DeadLettered,
    /// The sink refused the record.
    SinkFailed,
}

/// Runs one record through the chain and applies the failure policy.
pub struct RecordProcessor {
    chain: Arc<ProcessorChain>,
    sink: Arc<dyn EventSink>,
    policy: ErrorHandling,
}

impl RecordProcessor {
    pub fn new(
        chain: Arc<ProcessorChain>,
        sink: Arc<dyn EventSink>,
        policy: ErrorHandling,
    ) -> Self {
        Self { chain, sink, policy }
    }

    pub async fn process(&self, record: EventRecord) -> Disposition {
        // Retries start from the record as it left the gateway, not from a
        // half-enriched copy.
        let pristine = match self.policy {
            ErrorHandling::Retry { .. } => Some(record.clone()),
            _ => None,
        };

        let mut attempts = 1;
        let mut outcome = self.chain.run(record).await;

        if let (
            ErrorHandling::Retry {
                max_attempts,
                delay_ms,
            },
            Some(pristine),
        ) = (&self.policy, &pristine)
        {
            while let ChainOutcome::Failed { unit, error, .. } = &outcome {
                if attempts >= *max_attempts {
                    break;
                }
                warn!(
                    "Attempt {}/{} failed in {}: {}, retrying",
                    attempts, max_attempts, unit, error
                );
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                attempts += 1;
                outcome = self.chain.run(pristine.clone()).await;
            }
        }

        match outcome {
            ChainOutcome::Forwarded(record) => {
                let id = record.id;
                match self.sink.deliver(record).await {
                    Ok(()) => Disposition::Delivered,
                    Err(e) => {
                        error!("Sink delivery failed for record {}: {}", id, e);
                        Disposition::SinkFailed
                    }
                }
            }
            ChainOutcome::Dropped { unit } => {
                debug!("Record dropped by {}", unit);
                Disposition::Dropped
            }
            ChainOutcome::Failed {
                mut record,
                unit,
                error,
            } => match self.policy {
                ErrorHandling::DeadLetter => {
                    let id = record.id;
                    let md = record.metadata_mut();
                    md.set(CHAIN_ERROR_KEY, error.to_string());
                    md.set(CHAIN_FAILED_UNIT_KEY, unit.clone());
                    warn!("Record {} failed in {}, dead-lettering: {}", id, unit, error);
                    let letter = DeadLetter::new(record, &unit, &error, attempts);
                    match self.sink.dead_letter(letter).await {
                        Ok(()) => Disposition::DeadLettered,
                        Err(e) => {
                            error!("Dead-letter delivery failed for record {}: {}", id, e);
                            Disposition::SinkFailed
                        }
                    }
                }
                ErrorHandling::Drop | ErrorHandling::Retry { .. } => {
                    error!(
                        "Record {} failed in {} after {} attempt(s), dropping: {}",
                        record.id, unit, attempts, error
                    );
                    Disposition::Discarded
                }
            },
        }
    }
}

/// Fixed set of tasks polling the gateway until it closes or the pool is
/// cancelled.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn spawn(
        count: usize,
        gateway: Arc<IngestionGateway>,
        processor: Arc<RecordProcessor>,
        poll_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let handles = (0..count)
            .map(|id| {
                let gateway = gateway.clone();
                let processor = processor.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    run_worker(id, gateway, processor, poll_timeout, cancel).await;
                })
            })
            .collect();

        info!("Started {} chain workers", count);
        Self { handles, cancel }
    }

    /// Interrupts idle workers. A worker busy with a record finishes it first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for every worker to exit.
    pub async fn join(self) {
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!("Worker task panicked: {}", e);
            }
        }
        info!("All chain workers stopped");
    }
}

async fn run_worker(
    id: usize,
    gateway: Arc<IngestionGateway>,
    processor: Arc<RecordProcessor>,
    poll_timeout: Duration,
    cancel: CancellationToken,
) {
    debug!("Worker {} started", id);
    loop {
        match gateway.poll(poll_timeout, &cancel).await {
            PollResult::Event(record) => {
                processor.process(record).await;
            }
            PollResult::Empty => continue,
            PollResult::Cancelled => {
                debug!("Worker {} cancelled", id);
                break;
            }
            PollResult::Closed => {
                debug!("Worker {} saw gateway close", id);
                break;
            }
        }
    }
}
