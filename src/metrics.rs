use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static INGEST_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("siem_ingest_events_total", "Events seen by the ingestion gateway by outcome"),
        &["outcome"],
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static INGEST_BUFFER_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("siem_ingest_buffer_depth", "Events waiting in the ingestion buffer")
        .expect("valid metric definition");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static CHAIN_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("siem_chain_events_total", "Processor chain results by outcome"),
        &["outcome"],
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static UNIT_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("siem_unit_events_total", "Transform unit invocations by unit and outcome"),
        &["unit", "outcome"],
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("siem_lookup_total", "External enrichment lookups by service and outcome"),
        &["service", "outcome"],
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn inc_ingest(outcome: &str, n: u64) {
    INGEST_EVENTS_TOTAL.with_label_values(&[outcome]).inc_by(n);
}

pub fn set_buffer_depth(depth: usize) {
    INGEST_BUFFER_DEPTH.set(depth as i64);
}

pub fn inc_chain(outcome: &str) {
    CHAIN_EVENTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn inc_unit(unit: &str, outcome: &str) {
    UNIT_EVENTS_TOTAL.with_label_values(&[unit, outcome]).inc();
}

pub fn inc_lookup(service: &str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    LOOKUP_TOTAL.with_label_values(&[service, outcome]).inc();
}

/// Prometheus text exposition of every registered metric.
pub fn render() -> String {
    // Touch lazies so series exist before the first event.
    Lazy::force(&INGEST_EVENTS_TOTAL);
    Lazy::force(&INGEST_BUFFER_DEPTH);
    Lazy::force(&CHAIN_EVENTS_TOTAL);
    Lazy::force(&UNIT_EVENTS_TOTAL);
    Lazy::force(&LOOKUP_TOTAL);

    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buf) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buf).unwrap_or_default()
}
