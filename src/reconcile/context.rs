//! # Shared Reconcile Context
//!
//! One instance per control process, handed to every reconcile as an
//! `Arc`. Construction wires the whole dependency graph: the shared HTTP
//! client, the fetcher, fabricator, context stores, build orchestrator,
//! topology renderer and the lifecycle event pipeline.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::Client;

use crate::build::BuildOrchestrator;
use crate::config::OperatorConfig;
use crate::context::{ContextFabricator, ContextStoreSet};
use crate::eventing::circuit::BreakerConfig;
use crate::eventing::{DeliveryPipeline, HttpEventSink, LifecycleEmitter, TopologyRenderer};
use crate::fetch::SourceFetcher;
use crate::models::DlqPolicy;
use crate::Result;

pub struct Ctx {
    pub client: Client,
    pub config: OperatorConfig,
    pub fetcher: SourceFetcher,
    pub fabricator: ContextFabricator,
    pub stores: ContextStoreSet,
    pub orchestrator: BuildOrchestrator,
    pub renderer: TopologyRenderer,
    pub emitter: LifecycleEmitter,
    /// Per-key transient-failure counts driving the requeue backoff.
    pub backoffs: DashMap<String, u32>,
}

impl Ctx {
    pub fn new(client: Client, config: OperatorConfig) -> Result<Self> {
        // One pooled client serves archive downloads and broker publishes.
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| crate::OperatorError::ConfigError(format!("http client: {e}")))?;

        let pipeline = Arc::new(DeliveryPipeline::new(
            Arc::new(HttpEventSink::new(http.clone(), config.broker_url.clone())),
            Arc::new(HttpEventSink::new(http.clone(), config.dlq_broker_url.clone())),
            DlqPolicy::default(),
            BreakerConfig::default(),
        ));

        Ok(Self {
            fetcher: SourceFetcher::new(client.clone(), http),
            fabricator: ContextFabricator::new(config.build.clone()),
            stores: ContextStoreSet::new(client.clone(), &config)?,
            orchestrator: BuildOrchestrator::new(client.clone(), config.build.clone()),
            renderer: TopologyRenderer::new(client.clone(), config.clone()),
            emitter: LifecycleEmitter::new(pipeline),
            backoffs: DashMap::new(),
            client,
            config,
        })
    }
}
