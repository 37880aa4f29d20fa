use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{enrichment_key, fetch_logged, Outcome, TransformUnit};
use crate::config::EnricherConfig;
use crate::lookup::LookupService;
use crate::record::EventRecord;

const MARKER: &str = "user_enrich";
const OUTPUT_FIELD: &str = "user";

/// Attaches the user profile fetched for the record's user id under `user`.
pub struct UserEnricher {
    endpoint: String,
    id_field: String,
    timeout: Duration,
    client: Arc<dyn LookupService>,
}

impl UserEnricher {
    pub const NAME: &'static str = "user_enricher";

    pub fn new(
        config: &EnricherConfig,
        client: Arc<dyn LookupService>,
        fallback_timeout_ms: u64,
    ) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            id_field: config.user_id_field().to_string(),
            timeout: config.timeout(fallback_timeout_ms),
            client,
        }
    }
}

#[async_trait]
impl TransformUnit for UserEnricher {
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
                debug!("Skipping user lookup: {}", reason);
                record.metadata_mut().mark_error(MARKER, reason);
                return Outcome::Continue;
            }
        };

        let fetched = fetch_logged(
            self.client.as_ref(),
            Self::NAME,
            &self.endpoint,
            &key,
            self.timeout,
        )
        .await;
        match fetched {
            Ok(user) => {
                if let Some(body) = record.body_mut().as_object_mut() {
                    body.insert(OUTPUT_FIELD.to_string(), Value::Object(user));
                }
            }
            Err(e) => record.metadata_mut().mark_error(MARKER, e),
        }
        Outcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LookupError;
    use crate::processors::test_support::StaticLookup;
    use serde_json::json;

    fn enricher(lookup: StaticLookup) -> (UserEnricher, Arc<StaticLookup>) {
        let lookup = Arc::new(lookup);
        let config = EnricherConfig {
            endpoint: "http://users/user".to_string(),
            id_field: Some("actor.user.uid".to_string()),
            timeout_ms: None,
        };
        (UserEnricher::new(&config, lookup.clone(), 5000), lookup)
    }

    #[tokio::test]
    async fn attaches_user_profile() {
        let (unit, _) = enricher(
            StaticLookup::default().with("http://users/user/u-7", json!({"department": "Finance"})),
        );
        let mut record = EventRecord::new(json!({"actor": {"user": {"uid": "u-7"}}}));
        assert!(matches!(unit.apply(&mut record).await, Outcome::Continue));
        assert_eq!(record.body()["user"], json!({"department": "Finance"}));
        assert_eq!(record.body()["actor"]["user"]["uid"], json!("u-7"));
    }

    #[tokio::test]
    async fn absent_id_skips_lookup() {
        let (unit, lookup) = enricher(StaticLookup::default());
        let body = json!({"actor": {"process": {"pid": 4}}});
        let mut record = EventRecord::new(body.clone());
        unit.apply(&mut record).await;
        assert_eq!(record.body(), &body);
        assert_eq!(lookup.call_count(), 0);
        assert!(record.metadata().get("user_enrich_error").unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn failed_lookup_is_marked_not_failed() {
        let (unit, _) = enricher(StaticLookup::default().failing(
            "http://users/user/u-7",
            LookupError::Status { status: 500, body: "down".to_string() },
        ));
        let body = json!({"actor": {"user": {"uid": "u-7"}}});
        let mut record = EventRecord::new(body.clone());
        assert!(matches!(unit.apply(&mut record).await, Outcome::Continue));
        assert_eq!(record.body(), &body);
        assert_eq!(record.metadata().get("user_enrich_error"), Some("http status 500: down"));
    }
}
