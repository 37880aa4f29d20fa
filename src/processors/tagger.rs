//! Semantic payload tagging.
//!
//! Derives `tag.*` metadata entries from OCSF classifier fields and from the
//! shape of the record. Tagging reads the body only and never fails; every
//! write is a map insert, so re-running on the same record is idempotent.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{Outcome, TransformUnit};
use crate::config::PayloadTaggerConfig;
use crate::ingestion::RECEIVED_AT_KEY;
use crate::record::{
    array_at, f64_at, resolve, str_at, value_as_i64, EventRecord, Lookup, Metadata,
};

pub struct PayloadTagger {
    tag_fields: Vec<String>,
    add_timestamp_tag: bool,
    add_source_tag: bool,
}

impl PayloadTagger {
    pub const NAME: &'static str = "payload_tagger";

    pub fn new(config: &PayloadTaggerConfig) -> Self {
        Self {
            tag_fields: config.tag_fields.clone(),
            add_timestamp_tag: config.add_timestamp_tag,
            add_source_tag: config.add_source_tag,
        }
    }

    /// Computes the tag entries for a record without writing them.
    pub fn derive(&self, body: &Value, metadata: &Metadata) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();

        if self.add_source_tag {
            tags.insert("tag.source".to_string(), "http_receiver".to_string());
        }
        if self.add_timestamp_tag {
            if let Some(received) = metadata.get(RECEIVED_AT_KEY) {
                tags.insert("tag.ingested_at".to_string(), received.to_string());
            }
        }

        let Some(body) = body.as_object() else {
            return tags;
        };

        for field in &self.tag_fields {
            if let Lookup::Found(value) = resolve(body, field) {
                tags.insert(format!("tag.{}", field), raw_value(value));
                semantic_tags(field, value, &mut tags);
            }
        }

        shape_tags(body, &mut tags);
        tags
    }
}

#[async_trait]
impl TransformUnit for PayloadTagger {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn apply(&self, record: &mut EventRecord) -> Outcome {
        let tags = self.derive(record.body(), record.metadata());
        let metadata = record.metadata_mut();
        for (key, value) in tags {
            metadata.set(key, value);
        }
        Outcome::Continue
    }
}

/// Strings as-is, integral numbers without a fraction, anything else as
/// compact JSON.
fn raw_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(_) => match value_as_i64(value) {
            Some(i) => i.to_string(),
            None => value.to_string(),
        },
        other => other.to_string(),
    }
}

fn semantic_tags(field: &str, value: &Value, tags: &mut BTreeMap<String, String>) {
    // Table lookups use the truncated integer part (`4.5` reads as 4).
    let Some(code) = value.as_f64().map(|f| f.trunc() as i64) else {
        return;
    };
    let mut set = |k: &str, v: &str| {
        tags.insert(format!("tag.{}", k), v.to_string());
    };

    match field {
        "class_uid" => match code {
            2004 => {
                set("category", "detection");
                set("type", "alert");
            }
            5001 => {
                set("category", "asset");
                set("type", "inventory");
            }
            4001..=4003 => {
                set("category", "network");
                set("type", "activity");
            }
            3001 | 3002 => set("category", "authentication"),
            1001..=1003 => {
                set("category", "system");
                set("type", "process");
            }
            _ => {}
        },
        "severity_id" => {
            let (severity, priority) = match code {
                1 => ("informational", "low"),
                2 => ("low", "low"),
                3 => ("medium", "medium"),
                4 => ("high", "high"),
                5 | 6 => ("critical", "critical"),
                _ => return,
            };
            set("severity", severity);
            set("priority", priority);
        }
        "category_uid" => {
            let domain = match code {
                1 => "system",
                2 => "findings",
                3 => "identity",
                4 => "network",
                5 => "discovery",
                _ => return,
            };
            set("domain", domain);
        }
        _ => {}
    }
}

fn shape_tags(body: &Map<String, Value>, tags: &mut BTreeMap<String, String>) {
    if let Lookup::Found(observables) = array_at(body, "observables") {
        if !observables.is_empty() {
            tags.insert("tag.has_observables".to_string(), "true".to_string());
            tags.insert("tag.observable_count".to_string(), observables.len().to_string());

            let detected = observables
                .iter()
                .filter_map(Value::as_object)
                .any(|o| o.contains_key("threat_intel"));
            if detected {
                tags.insert("tag.has_threat_intel".to_string(), "true".to_string());
                tags.insert("tag.threat_detected".to_string(), "true".to_string());
            }
        }
    }

    if body.contains_key("asset") {
        tags.insert("tag.enriched".to_string(), "asset".to_string());
    }

    if let Lookup::Found(status) = f64_at(body, "status_id") {
        let status = if status == 1.0 { "success" } else { "failure" };
        tags.insert("tag.status".to_string(), status.to_string());
    }

    if let Lookup::Found(uid) = str_at(body, "metadata.uid") {
        tags.insert("tag.event_id".to_string(), uid.to_string());
    }
}
