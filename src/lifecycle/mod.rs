//! Job lifecycle management
//!
//! The lifecycle manager owns the authoritative in-memory view of every
//! accepted workload and the two watchdogs that reclaim cluster state:
//!
//! - New jobs and status transitions arrive over a bounded intake channel
//!   and land in a concurrent map keyed by job UUID. The access discipline is
//!   single-writer-per-key: intake inserts and updates, the report tick only
//!   reads, the poll tick and the watchdogs delete.
//! - Every 15 seconds each tracked job's status is reported upstream;
//!   reporting failures are logged and retried next tick, nothing more.
//! - Every 3 minutes each job's poll counter is bumped; jobs past the
//!   retry budget are dropped, and deployed jobs answering 200 on their URL
//!   are retired from tracking (they are the user's problem from then on).
//! - The expiry watchdog scans durable records, tears down workloads past
//!   their expiry (or whose backing Deployment vanished externally), and
//!   deletes the reaped keys in a single batch per scan.
//! - The namespace reclaimer deletes marketplace-managed namespaces with no
//!   pods left, then triggers best-effort container-engine artifact cleanup.
//!
//! A panic inside any watchdog pass is confined to that pass's task and
//! logged; the tickers and the reporting loop keep running.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::accountant::{Accountant, GpuReservations, NodeResource};
use crate::cluster::ClusterClient;
use crate::compiler::{DeployTask, WorkloadCompiler, WorkloadSource};
use crate::hardware::TaskType;
use crate::store::{JobRecord, RecordStore};
use crate::upstream::MarketplaceClient;
use crate::{
    Result, DEPLOY_NAME_PREFIX, EXPIRY_SCAN_INTERVAL, JOB_POLL_INTERVAL, JOB_REPORT_INTERVAL,
    MAX_JOB_POLL_COUNT, NAMESPACE_PREFIX, NAMESPACE_RECLAIM_INTERVAL,
};

/// The namespace a wallet's workloads deploy into
pub fn namespace_for_wallet(wallet_address: &str) -> String {
    format!("{}{}", NAMESPACE_PREFIX, wallet_address.to_lowercase())
}

// =============================================================================
// Job Model
// =============================================================================

/// Deployment progression of a job.
///
/// Forward-only in practice, but not a strict state machine: the Dockerfile
/// and manifest paths skip different subsets. Terminal state is implicit in
/// the record's removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Fetching the workload source
    #[serde(rename = "downloadSource")]
    DownloadSource,
    /// Uploading build results
    #[serde(rename = "uploadResult")]
    UploadResult,
    /// Building the container image
    #[serde(rename = "buildImage")]
    BuildImage,
    /// Pushing the image to the registry
    #[serde(rename = "pushImage")]
    PushImage,
    /// Cluster is pulling the image
    #[serde(rename = "pullImage")]
    PullImage,
    /// Cluster objects created; workload coming up
    #[serde(rename = "deployToK8s")]
    DeployToK8s,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::DownloadSource => "downloadSource",
            JobStatus::UploadResult => "uploadResult",
            JobStatus::BuildImage => "buildImage",
            JobStatus::PushImage => "pushImage",
            JobStatus::PullImage => "pullImage",
            JobStatus::DeployToK8s => "deployToK8s",
        };
        write!(f, "{}", s)
    }
}

/// The lifecycle-tracking record for one workload deployment
#[derive(Clone, Debug)]
pub struct Job {
    /// Job UUID (tracking key)
    pub uuid: String,
    /// Current status
    pub status: JobStatus,
    /// Reachable URL once deployed
    pub url: String,
    /// Poll counter; the job is dropped past the budget
    pub count: u32,
    /// Requester wallet address
    pub wallet_address: String,
    /// Workload (space) UUID
    pub space_uuid: String,
    /// Workload name
    pub space_name: String,
    /// Task type string (`CPU` / `GPU`)
    pub task_type: String,
    /// Cluster Deployment name
    pub deploy_name: String,
    /// Hardware tier description
    pub hardware_desc: String,
    /// Absolute expiry, Unix seconds (0 until deployed)
    pub expire_time: i64,
}

/// Intake messages for the lifecycle manager
#[derive(Clone, Debug)]
pub enum JobUpdate {
    /// Start tracking a new job
    Track(Box<Job>),
    /// Record a status transition (and URL, once known) for a tracked job
    Status {
        /// Job UUID
        job_uuid: String,
        /// New status
        status: JobStatus,
        /// Reachable URL, when the transition established one
        url: Option<String>,
    },
}

/// Concurrent job map with the single-writer-per-key discipline described in
/// the module docs.
#[derive(Clone, Default)]
pub struct JobTracker {
    jobs: Arc<DashMap<String, Job>>,
}

impl JobTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an intake message
    pub fn apply(&self, update: JobUpdate) {
        match update {
            JobUpdate::Track(job) => {
                self.jobs.insert(job.uuid.clone(), *job);
            }
            JobUpdate::Status {
                job_uuid,
                status,
                url,
            } => {
                if let Some(mut job) = self.jobs.get_mut(&job_uuid) {
                    job.status = status;
                    if let Some(url) = url {
                        job.url = url;
                    }
                }
            }
        }
    }

    /// Look up a job by its UUID
    pub fn get(&self, job_uuid: &str) -> Option<Job> {
        self.jobs.get(job_uuid).map(|j| j.clone())
    }

    /// Look up a job by the workload it deploys
    pub fn get_by_space(&self, space_uuid: &str) -> Option<Job> {
        self.jobs
            .iter()
            .find(|entry| entry.space_uuid == space_uuid)
            .map(|entry| entry.clone())
    }

    /// Stop tracking a job
    pub fn remove(&self, job_uuid: &str) {
        self.jobs.remove(job_uuid);
    }

    /// Snapshot of all tracked jobs
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.iter().map(|entry| entry.clone()).collect()
    }

    /// Bump a job's poll counter, returning the new value
    pub fn increment_count(&self, job_uuid: &str) -> Option<u32> {
        self.jobs.get_mut(job_uuid).map(|mut job| {
            job.count += 1;
            job.count
        })
    }

    /// Number of tracked jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the tracker is empty
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Create the bounded intake channel feeding a lifecycle manager
pub fn intake_channel() -> (mpsc::Sender<JobUpdate>, mpsc::Receiver<JobUpdate>) {
    mpsc::channel(64)
}

// =============================================================================
// Poll Disposition
// =============================================================================

/// What the poll tick should do with a job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PollAction {
    /// Past the retry budget; stop tracking
    Drop,
    /// Deployed; probe the URL and retire on 200
    Probe,
    /// Still progressing; keep tracking
    Keep,
}

pub(crate) fn poll_disposition(count: u32, status: JobStatus) -> PollAction {
    if count > MAX_JOB_POLL_COUNT {
        PollAction::Drop
    } else if status == JobStatus::DeployToK8s {
        PollAction::Probe
    } else {
        PollAction::Keep
    }
}

// =============================================================================
// Lifecycle Manager
// =============================================================================

/// Drives intake, status reporting, and completion polling.
pub struct LifecycleManager {
    tracker: JobTracker,
    rx: mpsc::Receiver<JobUpdate>,
    upstream: MarketplaceClient,
    http: reqwest::Client,
}

impl LifecycleManager {
    /// Create a manager over the shared tracker and intake receiver
    pub fn new(
        tracker: JobTracker,
        rx: mpsc::Receiver<JobUpdate>,
        upstream: MarketplaceClient,
        http: reqwest::Client,
    ) -> Self {
        Self {
            tracker,
            rx,
            upstream,
            http,
        }
    }

    /// Run until the intake channel closes.
    pub async fn run(mut self) {
        let mut report = tokio::time::interval(JOB_REPORT_INTERVAL);
        let mut poll = tokio::time::interval(JOB_POLL_INTERVAL);

        loop {
            tokio::select! {
                update = self.rx.recv() => match update {
                    Some(update) => self.tracker.apply(update),
                    None => {
                        info!("lifecycle intake closed; manager stopping");
                        return;
                    }
                },
                _ = report.tick() => self.report_all().await,
                _ = poll.tick() => self.poll_all().await,
            }
        }
    }

    async fn report_all(&self) {
        for job in self.tracker.snapshot() {
            if let Err(e) = self.upstream.report_job_status(&job.uuid, job.status).await {
                warn!(job_uuid = %job.uuid, error = %e, "job status report failed; will retry next tick");
            }
        }
    }

    async fn poll_all(&self) {
        for job in self.tracker.snapshot() {
            let Some(count) = self.tracker.increment_count(&job.uuid) else {
                continue;
            };
            match poll_disposition(count, job.status) {
                PollAction::Drop => {
                    warn!(job_uuid = %job.uuid, count = count, "job exceeded poll budget; dropping");
                    self.tracker.remove(&job.uuid);
                }
                PollAction::Probe => {
                    let Ok(response) = self.http.get(&job.url).send().await else {
                        continue;
                    };
                    if response.status() == reqwest::StatusCode::OK {
                        info!(job_uuid = %job.uuid, url = %job.url, "workload answering; retiring job from tracking");
                        self.tracker.remove(&job.uuid);
                    }
                }
                PollAction::Keep => {}
            }
        }
    }
}

// =============================================================================
// Expiry Watchdog
// =============================================================================

/// Why a durable record is being reaped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReapReason {
    /// The workload's allotted duration has passed
    Expired,
    /// The backing Deployment no longer exists
    Orphaned,
}

/// Decide whether a record should be reaped.
///
/// Externally deleted deployments are treated exactly like expiry, so a
/// record never outlives its backing Deployment by more than one scan.
pub(crate) fn classify_record(
    record: &JobRecord,
    now: i64,
    deployment_exists: bool,
) -> Option<ReapReason> {
    if now > record.expire_time {
        Some(ReapReason::Expired)
    } else if !deployment_exists {
        Some(ReapReason::Orphaned)
    } else {
        None
    }
}

/// Spawn the expiry watchdog ticker.
pub fn spawn_expiry_watchdog(cluster: ClusterClient, store: RecordStore) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EXPIRY_SCAN_INTERVAL);
        loop {
            ticker.tick().await;
            let pass = tokio::spawn(expiry_scan(cluster.clone(), store.clone()));
            if let Err(join_err) = pass.await {
                error!(error = %join_err, "expiry scan panicked; watchdog keeps running");
            }
        }
    })
}

async fn expiry_scan(cluster: ClusterClient, store: RecordStore) {
    let keys = match store.record_keys().await {
        Ok(keys) => keys,
        Err(e) => {
            error!(error = %e, "failed to enumerate durable records");
            return;
        }
    };

    let now = Utc::now().timestamp();
    // Keys are deleted in one batch at the end of the pass to bound the
    // number of store round-trips.
    let mut reap: Vec<String> = Vec::new();

    for key in keys {
        let record = match store.load(&key).await {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(e) => {
                error!(key = %key, error = %e, "failed to load durable record");
                continue;
            }
        };

        let namespace = namespace_for_wallet(&record.wallet_address);
        let deploy_name = if record.deploy_name.is_empty() {
            format!("{}{}", DEPLOY_NAME_PREFIX, record.space_uuid)
        } else {
            record.deploy_name.clone()
        };

        let deployment_exists = match cluster.deployment_exists(&namespace, &deploy_name).await {
            Ok(exists) => exists,
            Err(e) => {
                error!(key = %key, error = %e, "failed to check backing deployment");
                continue;
            }
        };

        match classify_record(&record, now, deployment_exists) {
            Some(ReapReason::Expired) => {
                info!(
                    key = %key,
                    namespace = %namespace,
                    expire_time = record.expire_time,
                    "workload expired; tearing down"
                );
                match cluster.teardown_workload(&namespace, &record.space_uuid).await {
                    Ok(()) => {
                        reap.push(key);
                        reap.push(record.space_uuid.clone());
                    }
                    Err(e) => {
                        error!(key = %key, error = %e, "teardown failed; record kept for next scan")
                    }
                }
            }
            Some(ReapReason::Orphaned) => {
                info!(key = %key, "backing deployment gone; reaping orphaned record");
                reap.push(key);
                reap.push(record.space_uuid.clone());
            }
            None => {}
        }
    }

    if !reap.is_empty() {
        match store.remove_keys(reap.clone()).await {
            Ok(()) => info!(keys = ?reap, "reaped durable records"),
            Err(e) => error!(error = %e, "failed to delete reaped record keys"),
        }
    }
}

// =============================================================================
// Namespace Reclamation
// =============================================================================

/// Best-effort cleanup of unused local images and stopped containers,
/// delegated to the container engine.
#[async_trait]
pub trait ArtifactCleaner: Send + Sync {
    /// Remove unused build artifacts
    async fn clean(&self) -> Result<()>;
}

/// Cleaner shelling out to the local container engine CLI
pub struct EngineArtifactCleaner;

#[async_trait]
impl ArtifactCleaner for EngineArtifactCleaner {
    async fn clean(&self) -> Result<()> {
        for args in [
            vec!["image", "prune", "-f"],
            vec!["container", "prune", "-f"],
        ] {
            let status = tokio::process::Command::new("docker")
                .args(&args)
                .status()
                .await
                .map_err(|e| crate::Error::deploy(format!("container engine unavailable: {}", e)))?;
            if !status.success() {
                warn!(args = ?args, code = ?status.code(), "artifact prune exited nonzero");
            }
        }
        Ok(())
    }
}

/// Spawn the namespace-reclamation ticker.
pub fn spawn_namespace_reclaimer(
    cluster: ClusterClient,
    cleaner: Arc<dyn ArtifactCleaner>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(NAMESPACE_RECLAIM_INTERVAL);
        loop {
            ticker.tick().await;
            let pass = tokio::spawn(reclaim_pass(cluster.clone(), cleaner.clone()));
            if let Err(join_err) = pass.await {
                error!(error = %join_err, "namespace reclamation panicked; watchdog keeps running");
            }
        }
    })
}

async fn reclaim_pass(cluster: ClusterClient, cleaner: Arc<dyn ArtifactCleaner>) {
    let namespaces = match cluster.list_namespaces().await {
        Ok(namespaces) => namespaces,
        Err(e) => {
            error!(error = %e, "failed to list namespaces");
            return;
        }
    };

    for namespace in namespaces {
        if !namespace.starts_with(NAMESPACE_PREFIX) {
            continue;
        }
        match cluster.has_pods(&namespace, None).await {
            Ok(false) => {
                if let Err(e) = cluster.delete_namespace(&namespace).await {
                    error!(namespace = %namespace, error = %e, "failed to delete empty namespace");
                } else {
                    info!(namespace = %namespace, "reclaimed empty namespace");
                }
            }
            Ok(true) => {}
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "failed to list pods in namespace");
            }
        }
    }

    if let Err(e) = cleaner.clean().await {
        warn!(error = %e, "artifact cleanup failed");
    }
}

// =============================================================================
// Provider Agent
// =============================================================================

/// A workload deployment request from the intake layer
#[derive(Clone, Debug)]
pub struct DeployRequest {
    /// Lifecycle job UUID
    pub job_uuid: String,
    /// Workload (space) UUID
    pub space_uuid: String,
    /// Workload name
    pub space_name: String,
    /// Requester wallet address
    pub wallet_address: String,
    /// Hardware tier description string
    pub hardware_desc: String,
    /// Allotted runtime in seconds
    pub duration: i64,
    /// What to deploy
    pub source: WorkloadSource,
}

/// The interface exposed to the request-intake layer: deploy, delete,
/// inspect, snapshot.
pub struct ProviderAgent {
    compiler: Arc<WorkloadCompiler>,
    cluster: ClusterClient,
    store: RecordStore,
    accountant: Accountant,
    reservations: GpuReservations,
    tracker: JobTracker,
    intake: mpsc::Sender<JobUpdate>,
    domain: String,
}

impl ProviderAgent {
    /// Assemble the agent from its collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        compiler: Arc<WorkloadCompiler>,
        cluster: ClusterClient,
        store: RecordStore,
        accountant: Accountant,
        reservations: GpuReservations,
        tracker: JobTracker,
        intake: mpsc::Sender<JobUpdate>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            compiler,
            cluster,
            store,
            accountant,
            reservations,
            tracker,
            intake,
            domain: domain.into(),
        }
    }

    /// Deploy a workload; returns its reachable URL.
    pub async fn deploy(&self, request: DeployRequest) -> Result<String> {
        let host_name = format!("{}.{}", random_subdomain(10), self.domain);
        let task = DeployTask::new(
            &request.job_uuid,
            &host_name,
            &request.wallet_address,
            &request.hardware_desc,
            request.duration,
        )?
        .with_space(&request.space_uuid, &request.space_name);

        let job = Job {
            uuid: request.job_uuid.clone(),
            status: JobStatus::DownloadSource,
            url: String::new(),
            count: 0,
            wallet_address: request.wallet_address.clone(),
            space_uuid: request.space_uuid.clone(),
            space_name: request.space_name.clone(),
            task_type: task.hardware.task_type().to_string(),
            deploy_name: task.deploy_name(),
            hardware_desc: request.hardware_desc.clone(),
            expire_time: Utc::now().timestamp() + request.duration,
        };
        if self.intake.send(JobUpdate::Track(Box::new(job))).await.is_err() {
            warn!(job_uuid = %request.job_uuid, "lifecycle intake closed");
        }

        // Reserve the GPU for the window between acceptance and the pod's
        // request becoming visible to the accountant.
        let gpu_model = (task.hardware.task_type() == TaskType::Gpu)
            .then(|| task.hardware.gpu_model.clone());
        if let Some(model) = &gpu_model {
            self.reservations.reserve(model);
        }

        let result = self.compiler.deploy(&task, &request.source).await;

        if let Some(model) = &gpu_model {
            self.reservations.release(model);
        }
        result
    }

    /// Tear down a workload and drop its durable record and tracking entry.
    pub async fn delete(&self, space_uuid: &str) -> Result<()> {
        let record = self.store.load_by_space(space_uuid).await?;
        let namespace = match &record {
            Some(record) => namespace_for_wallet(&record.wallet_address),
            None => {
                warn!(space_uuid = %space_uuid, "delete requested for unknown workload");
                return Ok(());
            }
        };

        self.cluster.teardown_workload(&namespace, space_uuid).await?;
        self.store.remove(space_uuid).await?;
        if let Some(job) = self.tracker.get_by_space(space_uuid) {
            self.tracker.remove(&job.uuid);
        }
        info!(space_uuid = %space_uuid, "workload deleted on request");
        Ok(())
    }

    /// Current status of a workload's job, if tracked
    pub fn status(&self, space_uuid: &str) -> Option<JobStatus> {
        self.tracker.get_by_space(space_uuid).map(|job| job.status)
    }

    /// Current per-node cluster snapshot
    pub async fn cluster_snapshot(&self) -> Result<Vec<NodeResource>> {
        self.accountant.snapshot().await
    }
}

/// Random lowercase-alphanumeric subdomain for a workload hostname
pub fn random_subdomain(length: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(uuid: &str, status: JobStatus) -> Job {
        Job {
            uuid: uuid.to_string(),
            status,
            url: format!("https://{}.cp.example.dev", uuid),
            count: 0,
            wallet_address: "0xabc".into(),
            space_uuid: format!("space-{}", uuid),
            space_name: "demo".into(),
            task_type: "GPU".into(),
            deploy_name: format!("deploy-space-{}", uuid),
            hardware_desc: "Nvidia 3080·CPU 8 vCPU·Memory 32 GiB".into(),
            expire_time: 0,
        }
    }

    fn record(space_uuid: &str, expire_time: i64) -> JobRecord {
        JobRecord {
            wallet_address: "0xabc".into(),
            space_name: "demo".into(),
            expire_time,
            space_uuid: space_uuid.into(),
            job_uuid: "job-1".into(),
            task_type: "GPU".into(),
            deploy_name: format!("deploy-{}", space_uuid),
            hardware: "Nvidia 3080·CPU 8 vCPU·Memory 32 GiB".into(),
            url: "https://x.cp.example.dev".into(),
        }
    }

    // =========================================================================
    // Tracker
    // =========================================================================

    #[test]
    fn tracker_applies_track_then_status() {
        let tracker = JobTracker::new();
        tracker.apply(JobUpdate::Track(Box::new(job("j1", JobStatus::DownloadSource))));
        assert_eq!(tracker.len(), 1);

        tracker.apply(JobUpdate::Status {
            job_uuid: "j1".into(),
            status: JobStatus::DeployToK8s,
            url: Some("https://new.cp.example.dev".into()),
        });

        let tracked = tracker.get("j1").unwrap();
        assert_eq!(tracked.status, JobStatus::DeployToK8s);
        assert_eq!(tracked.url, "https://new.cp.example.dev");
    }

    #[test]
    fn status_for_unknown_job_is_ignored() {
        let tracker = JobTracker::new();
        tracker.apply(JobUpdate::Status {
            job_uuid: "ghost".into(),
            status: JobStatus::PullImage,
            url: None,
        });
        assert!(tracker.is_empty());
    }

    #[test]
    fn tracker_finds_jobs_by_space() {
        let tracker = JobTracker::new();
        tracker.apply(JobUpdate::Track(Box::new(job("j1", JobStatus::PullImage))));
        let found = tracker.get_by_space("space-j1").unwrap();
        assert_eq!(found.uuid, "j1");
        assert!(tracker.get_by_space("space-zz").is_none());
    }

    #[test]
    fn increment_count_is_per_key() {
        let tracker = JobTracker::new();
        tracker.apply(JobUpdate::Track(Box::new(job("j1", JobStatus::PullImage))));
        assert_eq!(tracker.increment_count("j1"), Some(1));
        assert_eq!(tracker.increment_count("j1"), Some(2));
        assert_eq!(tracker.increment_count("missing"), None);
    }

    // =========================================================================
    // Poll Disposition
    // =========================================================================

    #[test]
    fn poll_budget_drops_stuck_jobs() {
        assert_eq!(
            poll_disposition(MAX_JOB_POLL_COUNT + 1, JobStatus::PullImage),
            PollAction::Drop
        );
        assert_eq!(
            poll_disposition(MAX_JOB_POLL_COUNT + 1, JobStatus::DeployToK8s),
            PollAction::Drop
        );
    }

    #[test]
    fn deployed_jobs_are_probed_others_kept() {
        assert_eq!(
            poll_disposition(3, JobStatus::DeployToK8s),
            PollAction::Probe
        );
        assert_eq!(poll_disposition(3, JobStatus::BuildImage), PollAction::Keep);
    }

    // =========================================================================
    // Expiry Classification
    // =========================================================================

    #[test]
    fn past_expiry_is_reaped_even_with_live_deployment() {
        let now = 1_700_000_000;
        let expired = record("s1", now - 10);
        assert_eq!(
            classify_record(&expired, now, true),
            Some(ReapReason::Expired)
        );
    }

    #[test]
    fn missing_deployment_is_reaped_before_expiry() {
        let now = 1_700_000_000;
        let live = record("s1", now + 3600);
        assert_eq!(
            classify_record(&live, now, false),
            Some(ReapReason::Orphaned)
        );
    }

    #[test]
    fn live_unexpired_record_is_kept() {
        let now = 1_700_000_000;
        let live = record("s1", now + 3600);
        assert_eq!(classify_record(&live, now, true), None);
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        // expire_time == now is not yet expired; the next scan catches it
        let now = 1_700_000_000;
        let edge = record("s1", now);
        assert_eq!(classify_record(&edge, now, true), None);
    }

    // =========================================================================
    // Status Wire Format
    // =========================================================================

    #[test]
    fn job_status_serializes_in_wire_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::DeployToK8s).unwrap(),
            "\"deployToK8s\""
        );
        assert_eq!(
            serde_json::to_string(&JobStatus::DownloadSource).unwrap(),
            "\"downloadSource\""
        );
        assert_eq!(JobStatus::PushImage.to_string(), "pushImage");
    }

    // =========================================================================
    // Naming
    // =========================================================================

    #[test]
    fn namespace_lowercases_the_wallet() {
        assert_eq!(namespace_for_wallet("0xAbCd"), "stratos-ns-0xabcd");
    }

    #[test]
    fn subdomains_are_lowercase_alphanumeric() {
        let sub = random_subdomain(10);
        assert_eq!(sub.len(), 10);
        assert!(sub
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
