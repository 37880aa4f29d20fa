//! Composition root: wires the lookup client, gateway, chain, sink, workers
//! and HTTP receiver together and owns their shutdown order.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::ingestion::{HttpReceiver, IngestionGateway};
use crate::lookup::{HttpLookupClient, LookupService};
use crate::processors::ProcessorChain;
use crate::sink::{self, EventSink};
use crate::worker::{RecordProcessor, WorkerPool};

pub struct Pipeline {
    config: PipelineConfig,
    gateway: Arc<IngestionGateway>,
    chain: Arc<ProcessorChain>,
    processor: Arc<RecordProcessor>,
}

impl Pipeline {
    /// Builds the pipeline with a reqwest lookup client and the configured
    /// sink.
    pub fn build(config: PipelineConfig) -> Result<Self> {
        let client: Arc<dyn LookupService> = Arc::new(HttpLookupClient::new(&config.lookup)?);
        let sink = sink::from_config(&config.sink);
        Ok(Self::with_parts(config, client, sink))
    }

    pub fn with_parts(
        config: PipelineConfig,
        client: Arc<dyn LookupService>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let gateway = Arc::new(IngestionGateway::new(&config.ingestion));
        let chain = Arc::new(ProcessorChain::from_config(
            &config.processors,
            client,
            &config.lookup,
        ));
        let processor = Arc::new(RecordProcessor::new(
            chain.clone(),
            sink,
            config.workers.on_failure.clone(),
        ));

        Self {
            config,
            gateway,
            chain,
            processor,
        }
    }

    pub fn gateway(&self) -> Arc<IngestionGateway> {
        self.gateway.clone()
    }

    pub fn chain(&self) -> Arc<ProcessorChain> {
        self.chain.clone()
    }

    fn receiver(&self) -> HttpReceiver {
        HttpReceiver::new(self.config.server.clone(), self.gateway.clone())
            .with_chain(self.chain.clone())
    }

    pub fn router(&self) -> Router {
        self.receiver().create_router()
    }

    /// Starts the chain workers without an HTTP front end.
    pub fn spawn_workers(&self, cancel: CancellationToken) -> WorkerPool {
        WorkerPool::spawn(
            self.config.workers.count,
            self.gateway.clone(),
            self.processor.clone(),
            self.config.poll_timeout(),
            cancel,
        )
    }

    /// Binds the configured address and runs until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.server.bind_address).await?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Serves on `listener`. On shutdown the receiver stops first, then the
    /// gateway drains into the workers for up to the configured wait.
    pub async fn run_with_listener<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let workers = self.spawn_workers(CancellationToken::new());

        self.receiver().serve(listener, shutdown).await?;

        let report = self.gateway.shutdown(self.config.shutdown_timeout()).await;
        workers.cancel();
        workers.join().await;

        for stats in self.chain.stats() {
            info!(
                "Unit {}: processed={} dropped={} failed={}",
                stats.unit, stats.processed, stats.dropped, stats.failed
            );
        }
        info!(
            "Pipeline stopped (drained: {}, discarded: {})",
            report.drained, report.discarded
        );
        Ok(())
    }
}
