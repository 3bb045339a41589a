//! Marketplace coordinator client
//!
//! All outbound reporting goes through here: periodic cluster resource
//! summaries, per-job status updates, and the provider's admission-status
//! heartbeat. Failures never affect local state; callers log and retry on
//! their next tick, with no backoff beyond the tick interval.

use serde::Serialize;
use tracing::debug;

use crate::accountant::{ClusterResource, NodeResource, ProviderStatus};
use crate::lifecycle::JobStatus;
use crate::Result;

/// Client for the upstream marketplace coordinator
#[derive(Clone)]
pub struct MarketplaceClient {
    http: reqwest::Client,
    server_url: String,
    access_token: String,
    node_id: String,
    provider_name: String,
    multi_address: String,
}

impl MarketplaceClient {
    /// Create a coordinator client
    pub fn new(
        http: reqwest::Client,
        server_url: impl Into<String>,
        access_token: impl Into<String>,
        node_id: impl Into<String>,
        provider_name: impl Into<String>,
        multi_address: impl Into<String>,
    ) -> Self {
        Self {
            http,
            server_url: server_url.into(),
            access_token: access_token.into(),
            node_id: node_id.into(),
            provider_name: provider_name.into(),
            multi_address: multi_address.into(),
        }
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, payload: &T) -> Result<()> {
        let url = format!("{}{}", self.server_url, path);
        self.http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Push the cluster resource summary (`POST /cp/summary`)
    pub async fn report_cluster_resource(
        &self,
        region: &str,
        cluster_info: Vec<NodeResource>,
    ) -> Result<()> {
        let payload = ClusterResource {
            node_id: self.node_id.clone(),
            region: region.to_string(),
            cluster_info,
        };
        self.post("/cp/summary", &payload).await?;
        debug!("reported cluster resource summary");
        Ok(())
    }

    /// Push one job's status (`POST /job/status`)
    pub async fn report_job_status(&self, job_uuid: &str, status: JobStatus) -> Result<()> {
        #[derive(Serialize)]
        struct StatusReport<'a> {
            job_uuid: &'a str,
            status: JobStatus,
        }
        self.post(
            "/job/status",
            &StatusReport {
                job_uuid,
                status,
            },
        )
        .await?;
        debug!(job_uuid = %job_uuid, status = %status, "reported job status");
        Ok(())
    }

    /// Push the provider heartbeat with its admission status (`POST /cp`)
    pub async fn push_provider_status(&self, status: ProviderStatus) -> Result<()> {
        #[derive(Serialize)]
        struct ProviderHeartbeat<'a> {
            name: &'a str,
            node_id: &'a str,
            multi_address: &'a str,
            autobid: i32,
            status: String,
        }
        self.post(
            "/cp",
            &ProviderHeartbeat {
                name: &self.provider_name,
                node_id: &self.node_id,
                multi_address: &self.multi_address,
                autobid: 1,
                status: status.to_string(),
            },
        )
        .await
    }
}

/// Best-effort region lookup from public IP geolocation.
///
/// Cached by the caller at startup; any failure falls back to an empty
/// region rather than blocking reporting.
pub async fn lookup_region(http: &reqwest::Client) -> String {
    #[derive(serde::Deserialize, Default)]
    struct IpInfo {
        #[serde(default, rename = "countryCode")]
        country_code: String,
        #[serde(default, rename = "regionName")]
        region_name: String,
    }

    let result = async {
        let ip = http
            .get("https://ipapi.co/ip")
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let info: IpInfo = http
            .get(format!("http://ip-api.com/json/{}", ip.trim()))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok::<IpInfo, reqwest::Error>(info)
    }
    .await;

    match result {
        Ok(info) if !info.region_name.is_empty() => {
            format!("{}-{}", info.region_name.trim(), info.country_code)
        }
        _ => String::new(),
    }
}
