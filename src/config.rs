//! Configuration management for the event processor

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub server: ServerConfig,
    pub ingestion: IngestionConfig,
    pub lookup: LookupConfig,
    /// Transform units in chain order.
    pub processors: Vec<ProcessorConfig>,
    pub workers: WorkersConfig,
    pub sink: SinkConfig,
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    pub events_path: String,
    pub request_timeout_secs: u64,
    pub max_body_size: usize,
}

/// Ingestion gateway limits
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub max_batch_size: usize,
    pub buffer_capacity: usize,
    pub poll_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

/// Shared external lookup client
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LookupConfig {
    pub default_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub pool_max_idle_per_host: usize,
    pub max_error_body_bytes: usize,
}

/// One transform unit of the processor chain
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorConfig {
    AssetEnricher(EnricherConfig),
    UserEnricher(EnricherConfig),
    ThreatIntelEnricher(ThreatIntelConfig),
    CategoryFilter(CategoryFilterConfig),
    PayloadTagger(PayloadTaggerConfig),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EnricherConfig {
    /// Base URL; lookups go to `<endpoint>/<key>`.
    pub endpoint: String,
    /// Dotted path to the lookup key, e.g. `device.uid`.
    pub id_field: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ThreatIntelConfig {
    pub endpoint: String,
    pub timeout_ms: Option<u64>,
    /// Observable `type_id`s eligible for lookup. Defaults to hostname, IP,
    /// domain, email, file name, file hash and URL.
    pub eligible_types: Option<Vec<i64>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CategoryFilterConfig {
    pub field: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PayloadTaggerConfig {
    pub tag_fields: Vec<String>,
    pub add_timestamp_tag: bool,
    pub add_source_tag: bool,
}

/// Worker pool draining the gateway
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub count: usize,
    pub on_failure: ErrorHandling,
}

/// What the chain caller does with a record whose traversal failed
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ErrorHandling {
    Drop,
    DeadLetter,
    Retry { max_attempts: u32, delay_ms: u64 },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SinkConfig {
    #[serde(rename = "type")]
    pub kind: SinkKind,
    pub include_metadata: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Stdout,
    None,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level ("trace", "debug", "info", "warn", "error")
    pub level: String,
    /// Log format ("json", "pretty")
    pub format: String,
}

// Default value functions
fn default_lookup_timeout_ms() -> u64 { 5000 }
fn default_asset_id_field() -> &'static str { "asset_id" }
fn default_user_id_field() -> &'static str { "user_id" }
pub const DEFAULT_THREAT_INTEL_TYPES: [i64; 7] = [1, 2, 4, 5, 7, 8, 23];

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            events_path: "/events".to_string(),
            request_timeout_secs: 30,
            max_body_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            buffer_capacity: 100,
            poll_timeout_ms: 30_000,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_lookup_timeout_ms(),
            connect_timeout_ms: 2000,
            pool_max_idle_per_host: 32,
            max_error_body_bytes: 1024,
        }
    }
}

impl Default for CategoryFilterConfig {
    fn default() -> Self {
        Self {
            field: "category".to_string(),
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl Default for PayloadTaggerConfig {
    fn default() -> Self {
        Self {
            tag_fields: vec![
                "class_uid".to_string(),
                "severity_id".to_string(),
                "category_uid".to_string(),
            ],
            add_timestamp_tag: true,
            add_source_tag: false,
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 4,
            on_failure: ErrorHandling::Drop,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Stdout,
            include_metadata: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl EnricherConfig {
    pub fn timeout(&self, fallback_ms: u64) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(fallback_ms))
    }

    pub fn asset_id_field(&self) -> &str {
        self.id_field.as_deref().unwrap_or(default_asset_id_field())
    }

    pub fn user_id_field(&self) -> &str {
        self.id_field.as_deref().unwrap_or(default_user_id_field())
    }
}

impl ThreatIntelConfig {
    pub fn timeout(&self, fallback_ms: u64) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(fallback_ms))
    }

    pub fn eligible_types(&self) -> Vec<i64> {
        self.eligible_types
            .clone()
            .unwrap_or_else(|| DEFAULT_THREAT_INTEL_TYPES.to_vec())
    }
}

impl ProcessorConfig {
    /// Unit name as used in logs, metrics and error markers.
    pub fn name(&self) -> &'static str {
        match self {
            ProcessorConfig::AssetEnricher(_) => "asset_enricher",
            ProcessorConfig::UserEnricher(_) => "user_enricher",
            ProcessorConfig::ThreatIntelEnricher(_) => "threat_intel_enricher",
            ProcessorConfig::CategoryFilter(_) => "category_filter",
            ProcessorConfig::PayloadTagger(_) => "payload_tagger",
        }
    }
}

impl PipelineConfig {
    /// Layers an optional YAML/TOML file and `SIEM__`-prefixed environment
    /// variables over the defaults, then validates.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(PipelineError::config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            let format = match path.extension().and_then(|e| e.to_str()) {
                Some("yaml") | Some("yml") => FileFormat::Yaml,
                Some("toml") => FileFormat::Toml,
                Some("json") => FileFormat::Json,
                _ => {
                    return Err(PipelineError::config(
                        "Unsupported config file format. Use .yaml, .toml or .json",
                    ))
                }
            };
            builder = builder.add_source(File::from(path).format(format));
        }

        builder = builder.add_source(
            Environment::with_prefix("SIEM")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: PipelineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| PipelineError::config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML document directly (no environment layering).
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(content)
            .map_err(|e| PipelineError::config(format!("Failed to parse YAML config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ingestion.max_batch_size == 0 {
            return Err(PipelineError::config("ingestion.max_batch_size must be greater than 0"));
        }
        if self.ingestion.buffer_capacity == 0 {
            return Err(PipelineError::config("ingestion.buffer_capacity must be greater than 0"));
        }
        if self.workers.count == 0 {
            return Err(PipelineError::config("workers.count must be greater than 0"));
        }
        if !self.server.events_path.starts_with('/') {
            return Err(PipelineError::config("server.events_path must start with '/'"));
        }
        if ["/health", "/metrics", "/stats"].contains(&self.server.events_path.as_str()) {
            return Err(PipelineError::config(format!(
                "server.events_path {} collides with a built-in route",
                self.server.events_path
            )));
        }
        if let ErrorHandling::Retry { max_attempts: 0, .. } = self.workers.on_failure {
            return Err(PipelineError::config(
                "workers.on_failure.retry.max_attempts must be greater than 0",
            ));
        }

        for (index, processor) in self.processors.iter().enumerate() {
            let endpoint = match processor {
                ProcessorConfig::AssetEnricher(c) | ProcessorConfig::UserEnricher(c) => {
                    Some(&c.endpoint)
                }
                ProcessorConfig::ThreatIntelEnricher(c) => Some(&c.endpoint),
                _ => None,
            };
            if let Some(endpoint) = endpoint {
                if endpoint.trim().is_empty() {
                    return Err(PipelineError::config(format!(
                        "processors[{}] ({}) requires a non-empty endpoint",
                        index,
                        processor.name()
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.ingestion.poll_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.ingestion.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.server.bind_address.port(), 8080);
        assert_eq!(config.server.events_path, "/events");
        assert_eq!(config.ingestion.max_batch_size, 100);
        assert_eq!(config.ingestion.buffer_capacity, 100);
        assert_eq!(config.lookup.default_timeout_ms, 5000);
        assert!(config.processors.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_processor_chain_keeps_order() {
        let yaml = r#"
ingestion:
  max_batch_size: 10
processors:
  - type: asset_enricher
    endpoint: http://assets/asset
    id_field: device.uid
  - type: threat_intel_enricher
    endpoint: http://intel/ioc
    timeout_ms: 250
  - type: category_filter
    include: [security]
  - type: payload_tagger
workers:
  count: 2
  on_failure:
    policy: retry
    max_attempts: 3
    delay_ms: 10
"#;
        let config = PipelineConfig::from_yaml_str(yaml).unwrap();
        let names: Vec<_> = config.processors.iter().map(ProcessorConfig::name).collect();
        assert_eq!(
            names,
            vec!["asset_enricher", "threat_intel_enricher", "category_filter", "payload_tagger"]
        );
        assert_eq!(config.ingestion.max_batch_size, 10);
        assert_eq!(config.ingestion.buffer_capacity, 100);
        match &config.processors[2] {
            ProcessorConfig::CategoryFilter(c) => {
                assert_eq!(c.field, "category");
                assert_eq!(c.include, vec!["security".to_string()]);
            }
            other => panic!("unexpected processor {:?}", other),
        }
        match &config.processors[3] {
            ProcessorConfig::PayloadTagger(c) => assert!(c.add_timestamp_tag),
            other => panic!("unexpected processor {:?}", other),
        }
        assert_eq!(
            config.workers.on_failure,
            ErrorHandling::Retry { max_attempts: 3, delay_ms: 10 }
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.ingestion.buffer_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.processors.push(ProcessorConfig::UserEnricher(EnricherConfig {
            endpoint: " ".to_string(),
            id_field: None,
            timeout_ms: None,
        }));
        assert!(matches!(config.validate(), Err(PipelineError::ConfigError(_))));

        let mut config = PipelineConfig::default();
        config.workers.on_failure = ErrorHandling::Retry { max_attempts: 0, delay_ms: 0 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enricher_defaults() {
        let c = EnricherConfig {
            endpoint: "http://x".to_string(),
            id_field: None,
            timeout_ms: None,
        };
        assert_eq!(c.asset_id_field(), "asset_id");
        assert_eq!(c.user_id_field(), "user_id");
        assert_eq!(c.timeout(5000), Duration::from_secs(5));
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  events_path: /ingest\ningestion:\n  buffer_capacity: 7\n"
        )
        .unwrap();
        let config = PipelineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.server.events_path, "/ingest");
        assert_eq!(config.ingestion.buffer_capacity, 7);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = PipelineConfig::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }
}
