//! Processor chain and its transform units.
//!
//! A [`ProcessorChain`] drives one [`EventRecord`] through its units in the
//! declared order. Each unit answers with an [`Outcome`]; the first `Drop` or
//! `Fail` ends the traversal.

pub mod asset;
pub mod category_filter;
pub mod tagger;
pub mod threat_intel;
pub mod user;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::{LookupConfig, ProcessorConfig};
use crate::error::{LookupError, PipelineError};
use crate::lookup::LookupService;
use crate::metrics;
use crate::record::{str_at, EventRecord, Lookup};

pub use asset::AssetEnricher;
pub use category_filter::CategoryFilter;
pub use tagger::PayloadTagger;
pub use threat_intel::ThreatIntelEnricher;
pub use user::UserEnricher;

/// What a unit decided for the record it was handed.
#[derive(Debug)]
pub enum Outcome {
    /// Pass the (possibly mutated) record to the next unit.
    Continue,
    /// Discard the record silently.
    Drop,
    /// Stop and hand the error to the chain caller.
    Fail(PipelineError),
}

/// One step of the processor chain.
///
/// Units are shared across workers and may run concurrently on different
/// records. Any internal state must carry its own synchronization.
#[async_trait]
pub trait TransformUnit: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, record: &mut EventRecord) -> Outcome;
}

/// Result of a full chain traversal.
#[derive(Debug)]
pub enum ChainOutcome {
    Forwarded(EventRecord),
    Dropped {
        unit: String,
    },
    Failed {
        record: EventRecord,
        unit: String,
        error: PipelineError,
    },
}

#[derive(Debug, Default)]
struct UnitCounters {
    processed: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time counters for one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitStats {
    pub unit: String,
    pub processed: u64,
    pub dropped: u64,
    pub failed: u64,
}

struct Stage {
    unit: Box<dyn TransformUnit>,
    counters: UnitCounters,
}

pub struct ProcessorChain {
    stages: Vec<Stage>,
}

impl ProcessorChain {
    pub fn new(units: Vec<Box<dyn TransformUnit>>) -> Self {
        let stages = units
            .into_iter()
            .map(|unit| Stage {
                unit,
                counters: UnitCounters::default(),
            })
            .collect();
        Self { stages }
    }

    /// Builds the units declared in `configs`, in order, sharing one lookup
    /// client between the enrichers.
    pub fn from_config(
        configs: &[ProcessorConfig],
        client: Arc<dyn LookupService>,
        lookup: &LookupConfig,
    ) -> Self {
        let fallback = lookup.default_timeout_ms;
        let units: Vec<Box<dyn TransformUnit>> = configs
            .iter()
            .map(|config| -> Box<dyn TransformUnit> {
                match config {
                    ProcessorConfig::AssetEnricher(c) => {
                        Box::new(AssetEnricher::new(c, client.clone(), fallback))
                    }
                    ProcessorConfig::UserEnricher(c) => {
                        Box::new(UserEnricher::new(c, client.clone(), fallback))
                    }
                    ProcessorConfig::ThreatIntelEnricher(c) => {
                        Box::new(ThreatIntelEnricher::new(c, client.clone(), fallback))
                    }
                    ProcessorConfig::CategoryFilter(c) => Box::new(CategoryFilter::new(c)),
                    ProcessorConfig::PayloadTagger(c) => Box::new(PayloadTagger::new(c)),
                }
            })
            .collect();

        let chain = Self::new(units);
        if chain.is_empty() {
            warn!("No processors configured, records are forwarded unchanged");
        } else {
            info!(
                "Processor chain built with {} units: [{}]",
                chain.len(),
                chain.unit_names().join(" -> ")
            );
        }
        chain
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn unit_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.unit.name()).collect()
    }

    /// Runs every unit in order until one drops or fails the record.
    pub async fn run(&self, mut record: EventRecord) -> ChainOutcome {
        for stage in &self.stages {
            let name = stage.unit.name();
            stage.counters.processed.fetch_add(1, Ordering::Relaxed);

            match stage.unit.apply(&mut record).await {
                Outcome::Continue => metrics::inc_unit(name, "continue"),
                Outcome::Drop => {
                    stage.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::inc_unit(name, "dropped");
                    metrics::inc_chain("dropped");
                    debug!("Record {} dropped by {}", record.id, name);
                    return ChainOutcome::Dropped {
                        unit: name.to_string(),
                    };
                }
                Outcome::Fail(error) => {
                    stage.counters.failed.fetch_add(1, Ordering::Relaxed);
                    metrics::inc_unit(name, "failed");
                    metrics::inc_chain("failed");
                    return ChainOutcome::Failed {
                        record,
                        unit: name.to_string(),
                        error,
                    };
                }
            }
        }

        metrics::inc_chain("forwarded");
        ChainOutcome::Forwarded(record)
    }

    pub fn stats(&self) -> Vec<UnitStats> {
        self.stages
            .iter()
            .map(|s| UnitStats {
                unit: s.unit.name().to_string(),
                processed: s.counters.processed.load(Ordering::Relaxed),
                dropped: s.counters.dropped.load(Ordering::Relaxed),
                failed: s.counters.failed.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// Reads an enrichment key from a dotted path. The error explains why no
/// lookup was made.
pub(crate) fn enrichment_key<'a>(
    body: &'a Map<String, Value>,
    path: &str,
) -> std::result::Result<&'a str, String> {
    match str_at(body, path) {
        Lookup::Found("") => Err(format!("id field {} is empty", path)),
        Lookup::Found(key) => Ok(key),
        Lookup::Missing => Err(format!("id field {} not found", path)),
        Lookup::WrongType => Err(format!("id field {} is not a string", path)),
    }
}

/// Performs one keyed lookup, logging and counting the result.
pub(crate) async fn fetch_logged(
    client: &dyn LookupService,
    unit: &str,
    endpoint: &str,
    key: &str,
    timeout: Duration,
) -> std::result::Result<Map<String, Value>, LookupError> {
    let result = client.fetch(endpoint, key, timeout).await;
    metrics::inc_lookup(unit, result.is_ok());
    if let Err(e) = &result {
        warn!("{} lookup failed for {}: {}", unit, key, e);
    }
    result
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory lookup service keyed by `<endpoint>/<key>`. Records every
    /// call it receives.
    #[derive(Default)]
    pub struct StaticLookup {
        responses: HashMap<String, std::result::Result<Map<String, Value>, LookupError>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl StaticLookup {
        pub fn with(mut self, url: &str, value: Value) -> Self {
            let map = value.as_object().cloned().unwrap_or_default();
            self.responses.insert(url.to_string(), Ok(map));
            self
        }

        pub fn failing(mut self, url: &str, error: LookupError) -> Self {
            self.responses.insert(url.to_string(), Err(error));
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LookupService for StaticLookup {
        async fn fetch(
            &self,
            endpoint: &str,
            key: &str,
            _timeout: Duration,
        ) -> std::result::Result<Map<String, Value>, LookupError> {
            let url = format!("{}/{}", endpoint, key);
            self.calls.lock().unwrap().push(url.clone());
            self.responses.get(&url).cloned().unwrap_or(Err(LookupError::Status {
                status: 404,
                body: "not found".to_string(),
            }))
        }
    }
}
