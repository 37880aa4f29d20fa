//! Asset enrichment.
//!
//! Looks the asset up by a key read from the record, attaches the response
//! under `asset`, and appends contextual tags derived from the OCSF
//! classification and the fetched asset to the body's `tags` array.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{enrichment_key, fetch_logged, Outcome, TransformUnit};
use crate::config::EnricherConfig;
use crate::lookup::LookupService;
use crate::record::{array_at, f64_at, object_at, str_at, EventRecord, Lookup};

const MARKER: &str = "asset_enrich";
const OUTPUT_FIELD: &str = "asset";
const TAGS_FIELD: &str = "tags";

const DETECTION_FINDING: f64 = 2004.0;
const PROCESS_ACTIVITY: f64 = 1007.0;

pub struct AssetEnricher {
    endpoint: String,
    id_field: String,
    timeout: Duration,
    client: Arc<dyn LookupService>,
}

impl AssetEnricher {
    pub const NAME: &'static str = "asset_enricher";

    pub fn new(
        config: &EnricherConfig,
        client: Arc<dyn LookupService>,
        fallback_timeout_ms: u64,
    ) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            id_field: config.asset_id_field().to_string(),
            timeout: config.timeout(fallback_timeout_ms),
            client,
        }
    }
}

#[async_trait]
impl TransformUnit for AssetEnricher {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn apply(&self, record: &mut EventRecord) -> Outcome {
        let key = match record.object(Self::NAME) {
            Ok(body) => enrichment_key(body, &self.id_field).map(str::to_string),
            Err(e) => return Outcome::Fail(e),
        };
        let key = match key {
            Ok(key) => key,
            Err(reason) => {
                debug!("Skipping asset lookup: {}", reason);
                record.metadata_mut().mark_error(MARKER, reason);
                return Outcome::Continue;
            }
        };

        let asset = match fetch_logged(
            self.client.as_ref(),
            Self::NAME,
            &self.endpoint,
            &key,
            self.timeout,
        )
        .await
        {
            Ok(asset) => asset,
            Err(e) => {
                record.metadata_mut().mark_error(MARKER, e);
                return Outcome::Continue;
            }
        };

        let (body, _) = record.parts_mut();
        let Some(body) = body.as_object_mut() else {
            return Outcome::Continue;
        };

        let tags = derive_tags(body, &asset);
        if !append_tags(body, &tags) {
            warn!("Record has a non-array {} field, asset tags not applied", TAGS_FIELD);
        }
        body.insert(OUTPUT_FIELD.to_string(), Value::Object(asset));

        Outcome::Continue
    }
}

/// Tags implied by the event classification and the fetched asset, in a
/// stable order.
pub fn derive_tags(
    body: &Map<String, Value>,
    asset: &Map<String, Value>,
) -> Vec<&'static str> {
    let mut tags = Vec::new();
    // Classifiers compare as plain numbers, so fractional values still count.
    let class_uid = f64_at(body, "class_uid").found();

    if class_uid == Some(DETECTION_FINDING) {
        tags.push("ocsf_detection_finding");
        if let Lookup::Found(severity) = f64_at(body, "severity_id") {
            if severity >= 4.0 {
                tags.push("high_severity");
            }
            if severity == 5.0 {
                tags.push("critical_severity");
            }
        }
        let has_title = object_at(body, "finding")
            .found()
            .and_then(|f| str_at(f, "title").found())
            .is_some_and(|t| !t.is_empty());
        if has_title {
            tags.push("has_finding_title");
        }
    }

    if class_uid == Some(PROCESS_ACTIVITY) {
        tags.push("ocsf_process_activity");
        tags.push("edr_event");
    }

    if array_at(body, "observables").found().is_some_and(|o| !o.is_empty()) {
        tags.push("has_observables");
    }

    if str_at(asset, "owner") == Lookup::Found("IT") {
        tags.push("it_asset");
    }
    if str_at(asset, "criticality") == Lookup::Found("high") {
        tags.push("critical_asset");
    }

    tags
}

/// Appends tags not already present. Returns false when `tags` exists but is
/// not an array, in which case nothing is written.
fn append_tags(body: &mut Map<String, Value>, tags: &[&str]) -> bool {
    let entry = body
        .entry(TAGS_FIELD.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    let Some(existing) = entry.as_array_mut() else {
        return false;
    };
    for tag in tags {
        if !existing.iter().any(|t| t.as_str() == Some(tag)) {
            existing.push(Value::String((*tag).to_string()));
        }
    }
    true
}
