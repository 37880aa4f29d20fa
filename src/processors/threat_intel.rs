//! Per-observable threat intelligence enrichment.
//!
//! Each observable whose `type_id` is eligible is looked up by its `name`;
//! a successful response lands on that observable as `threat_intel`. Failed
//! lookups leave the observable untouched and never fail the record.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{fetch_logged, Outcome, TransformUnit};
use crate::config::ThreatIntelConfig;
use crate::lookup::LookupService;
use crate::record::{str_at, value_as_i64, EventRecord, Lookup};

const MARKER: &str = "threat_intel";
const OBSERVABLES_FIELD: &str = "observables";
const OUTPUT_FIELD: &str = "threat_intel";

/// Observable kinds by `type_id`, numbered the way the eligible set in
/// [`ThreatIntelConfig`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservableType {
    Hostname,
    IpAddress,
    UserName,
    DomainName,
    EmailAddress,
    FileName,
    FileHash,
    ProcessName,
    Port,
    UserAgent,
    Url,
    Other(i64),
}

impl ObservableType {
    pub fn from_id(id: i64) -> Self {
        match id {
            1 => Self::Hostname,
            2 => Self::IpAddress,
            3 => Self::UserName,
            4 => Self::DomainName,
            5 => Self::EmailAddress,
            7 => Self::FileName,
            8 => Self::FileHash,
            9 => Self::ProcessName,
            14 => Self::Port,
            22 => Self::UserAgent,
            23 => Self::Url,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for ObservableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Hostname => "hostname",
            Self::IpAddress => "ip_address",
            Self::UserName => "user_name",
            Self::DomainName => "domain_name",
            Self::EmailAddress => "email_address",
            Self::FileName => "file_name",
            Self::FileHash => "file_hash",
            Self::ProcessName => "process_name",
            Self::Port => "port",
            Self::UserAgent => "user_agent",
            Self::Url => "url",
            Self::Other(id) => return write!(f, "type_{}", id),
        };
        f.write_str(label)
    }
}

/// Diagnostics of one pass over a record's observables.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnrichSummary {
    pub eligible: usize,
    pub enriched: usize,
    pub last_error: Option<String>,
}

pub struct ThreatIntelEnricher {
    endpoint: String,
    timeout: Duration,
    eligible_types: HashSet<i64>,
    client: Arc<dyn LookupService>,
}

impl ThreatIntelEnricher {
    pub const NAME: &'static str = "threat_intel_enricher";

    pub fn new(
        config: &ThreatIntelConfig,
        client: Arc<dyn LookupService>,
        fallback_timeout_ms: u64,
    ) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            timeout: config.timeout(fallback_timeout_ms),
            eligible_types: config.eligible_types().into_iter().collect(),
            client,
        }
    }

    /// Looks up every eligible observable in `body`, in order. Lookups run
    /// one at a time; observable order is never changed.
    pub async fn enrich_observables(&self, body: &mut Map<String, Value>) -> EnrichSummary {
        let mut summary = EnrichSummary::default();
        let Some(observables) = body.get_mut(OBSERVABLES_FIELD).and_then(Value::as_array_mut) else {
            return summary;
        };

        for (index, item) in observables.iter_mut().enumerate() {
            let Some(observable) = item.as_object_mut() else {
                debug!("Observable #{} is not an object, skipping", index);
                continue;
            };
            let Some(type_id) = observable.get("type_id").and_then(value_as_i64) else {
                continue;
            };
            if !self.eligible_types.contains(&type_id) {
                continue;
            }
            let name = match str_at(observable, "name") {
                Lookup::Found(name) if !name.is_empty() => name.to_string(),
                _ => continue,
            };

            summary.eligible += 1;
            debug!("Looking up {} observable {}", ObservableType::from_id(type_id), name);

            let fetched = fetch_logged(
                self.client.as_ref(),
                Self::NAME,
                &self.endpoint,
                &name,
                self.timeout,
            )
            .await;
            match fetched {
                Ok(intel) => {
                    observable.insert(OUTPUT_FIELD.to_string(), Value::Object(intel));
                    summary.enriched += 1;
                }
                Err(e) => summary.last_error = Some(e.to_string()),
            }
        }

        summary
    }
}

#[async_trait]
impl TransformUnit for ThreatIntelEnricher {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn apply(&self, record: &mut EventRecord) -> Outcome {
        let body = match record.object_mut(Self::NAME) {
            Ok(body) => body,
            Err(e) => return Outcome::Fail(e),
        };

        let summary = self.enrich_observables(body).await;
        if summary.eligible > 0 {
            info!(
                "Enriched {}/{} observables with threat intel (record {})",
                summary.enriched, summary.eligible, record.id
            );
        }
        if let Some(err) = summary.last_error {
            record.metadata_mut().mark_error(MARKER, err);
        }
        Outcome::Continue
    }
}
