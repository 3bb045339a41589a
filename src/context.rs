//! Shared provider context
//!
//! Everything that used to be process-global state lives here instead: the
//! cluster client, the durable record store handle, the outbound HTTP client,
//! and the GPU reservation counters. The context is constructed once at
//! startup and passed by reference to every component constructor, which
//! preserves single-initialization semantics without hidden globals.

use std::time::Duration;

use crate::accountant::GpuReservations;
use crate::cluster::ClusterClient;
use crate::config::ProviderConfig;
use crate::store::RecordStore;
use crate::upstream::lookup_region;
use crate::Result;

/// Shared handles constructed once at startup
#[derive(Clone)]
pub struct ProviderContext {
    /// Loaded provider configuration
    pub config: ProviderConfig,
    /// Cluster API client
    pub cluster: ClusterClient,
    /// Durable record store
    pub store: RecordStore,
    /// Outbound HTTP client (coordinator, probes, introspection)
    pub http: reqwest::Client,
    /// Process-wide GPU reservation counters
    pub reservations: GpuReservations,
    /// Provider region, resolved best-effort at startup
    pub region: String,
}

impl ProviderContext {
    /// Connect every external collaborator and resolve the region.
    pub async fn initialize(config: ProviderConfig) -> Result<Self> {
        let cluster = ClusterClient::connect().await?;
        let store =
            RecordStore::connect(&config.api.redis_url, &config.api.redis_password).await?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let region = lookup_region(&http).await;

        Ok(Self {
            config,
            cluster,
            store,
            http,
            reservations: GpuReservations::new(),
            region,
        })
    }
}
