//! SIEM Event Processor
//!
//! HTTP ingestion gateway and processor chain for OCSF security events.
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌────────────────────────────┐    ┌────────┐
//! │ HttpReceiver │───▶│   Gateway    │───▶│ ProcessorChain (N workers) │───▶│  Sink  │
//! │ POST /events │    │ bounded buf  │    │ enrich → filter → tag      │    │        │
//! └──────────────┘    └──────────────┘    └────────────────────────────┘    └────────┘
//!                                                      │
//!                                                      ▼
//!                                          asset / user / threat intel
//!                                               lookup services
//! ```
//!
//! Submissions are rejected synchronously when malformed, too large or when
//! the buffer is full. Inside the chain, lookup failures only annotate the
//! record; a unit can still drop a record or fail it, and the worker pool
//! applies the configured failure policy.
//!
//! # Modules
//!
//! - [`config`] - Configuration loading and validation
//! - [`record`] - In-flight event record, metadata sidecar, typed field access
//! - [`lookup`] - Client for external enrichment services
//! - [`ingestion`] - Bounded gateway and HTTP receiver
//! - [`processors`] - Transform units and the processor chain
//! - [`sink`] - Downstream collaborators
//! - [`worker`] - Worker pool and failure policy
//! - [`metrics`] - Prometheus metrics
//! - [`pipeline`] - Composition root
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod ingestion;
pub mod lookup;
pub mod metrics;
pub mod pipeline;
pub mod processors;
pub mod record;
pub mod sink;
pub mod worker;

pub use config::PipelineConfig;
pub use error::{LookupError, PipelineError, Result};
pub use ingestion::IngestionGateway;
pub use pipeline::Pipeline;
pub use processors::{ChainOutcome, Outcome, ProcessorChain, TransformUnit};
pub use record::{EventRecord, Lookup, Metadata};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
