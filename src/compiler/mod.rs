//! Workload compilation into cluster objects
//!
//! The compiler turns an accepted workload into a concrete, isolated set of
//! cluster objects. Three workload sources share one entry point and one
//! state machine:
//!
//! ```text
//! prior objects removed -> namespace ensured -> deployment created
//!     -> service created -> ingress created
//!     -> (optional) model assets fetching -> ready
//! ```
//!
//! Each edge records a job status transition. A failure aborts the remaining
//! edges and surfaces the error without rolling back what was already
//! created; cleanup is the expiry watchdog's responsibility, not the
//! compiler's. On reaching ready the compiler writes the durable record with
//! `expire_time = now + duration`, clearing any previous record for the same
//! workload id first.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, ExecAction, Namespace,
    PodSpec, PodTemplateSpec, Probe, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::cluster::ClusterClient;
use crate::hardware::HardwareTier;
use crate::lifecycle::{JobStatus, JobUpdate};
use crate::manifest::{self, ContainerSpec, ModelAsset};
use crate::store::{JobRecord, RecordStore};
use crate::{
    Error, Result, CONTAINER_NAME_PREFIX, DEPLOY_NAME_PREFIX, INFERENCE_CONTAINER_PORT,
    INGRESS_NAME_PREFIX, MANAGED_BY, SERVICE_NAME_PREFIX, WORKLOAD_LABEL,
};

// =============================================================================
// Deploy Task and Sources
// =============================================================================

/// What to deploy: the three workload flavors the marketplace sends.
#[derive(Clone, Debug)]
pub enum WorkloadSource {
    /// A pre-built image plus the build descriptor its exposed port is read
    /// from
    Image {
        /// Image reference
        image: String,
        /// Dockerfile the `EXPOSE` directive is parsed out of
        dockerfile: PathBuf,
    },
    /// A compose-like deployment manifest
    Manifest {
        /// Path to the manifest file
        path: PathBuf,
    },
    /// A model-inference request
    ModelInference {
        /// Path to the model settings file (`{"model_id": ...}`)
        setting_path: PathBuf,
    },
}

/// Identity and resources of one deploy operation.
///
/// Built once per accepted job; the [`WorkloadSource`] is passed separately
/// to [`WorkloadCompiler::deploy`].
#[derive(Clone, Debug)]
pub struct DeployTask {
    /// Lifecycle job UUID
    pub job_uuid: String,
    /// Externally supplied hostname the ingress binds to
    pub host_name: String,
    /// Requester wallet address
    pub wallet_address: String,
    /// Workload (space) UUID
    pub space_uuid: String,
    /// Human-readable workload name
    pub space_name: String,
    /// Allotted runtime in seconds
    pub duration: i64,
    /// Resolved hardware tier
    pub hardware: HardwareTier,
    /// Raw tier description, persisted verbatim
    pub hardware_desc: String,
}

impl DeployTask {
    /// Build a task, resolving the hardware tier from its description.
    pub fn new(
        job_uuid: impl Into<String>,
        host_name: impl Into<String>,
        wallet_address: impl Into<String>,
        hardware_desc: impl Into<String>,
        duration: i64,
    ) -> Result<Self> {
        let hardware_desc = hardware_desc.into();
        Ok(Self {
            job_uuid: job_uuid.into(),
            host_name: host_name.into(),
            wallet_address: wallet_address.into(),
            space_uuid: String::new(),
            space_name: String::new(),
            duration,
            hardware: HardwareTier::parse(&hardware_desc)?,
            hardware_desc,
        })
    }

    /// Attach the workload identity
    pub fn with_space(
        mut self,
        space_uuid: impl Into<String>,
        space_name: impl Into<String>,
    ) -> Self {
        self.space_uuid = space_uuid.into();
        self.space_name = space_name.into();
        self
    }

    /// Namespace this workload deploys into: one per wallet address
    pub fn namespace(&self) -> String {
        crate::lifecycle::namespace_for_wallet(&self.wallet_address)
    }

    /// Deployment name for this workload
    pub fn deploy_name(&self) -> String {
        format!("{}{}", DEPLOY_NAME_PREFIX, self.space_uuid)
    }

    /// The reachable URL once deployed
    pub fn url(&self) -> String {
        format!("https://{}", self.host_name)
    }
}

// =============================================================================
// Model Introspection Seam
// =============================================================================

/// Resolved description of an inference model
#[derive(Clone, Debug, Deserialize)]
pub struct ModelInfo {
    /// Model identifier
    pub model_id: String,
    /// Inference task (e.g. `text-generation`)
    pub task: String,
    /// Serving framework the base image is selected by
    pub framework: String,
}

/// External model-introspection collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelResolver: Send + Sync {
    /// Resolve a model identifier into its serving description
    async fn resolve(&self, model_id: &str) -> Result<ModelInfo>;
}

/// Resolver backed by an HTTP introspection endpoint
pub struct HttpModelResolver {
    http: reqwest::Client,
    base_url: String,
}

impl HttpModelResolver {
    /// Create a resolver against an introspection service base URL
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ModelResolver for HttpModelResolver {
    async fn resolve(&self, model_id: &str) -> Result<ModelInfo> {
        let url = format!("{}/model_info", self.base_url);
        let info = self
            .http
            .get(url)
            .query(&[("model_id", model_id)])
            .send()
            .await?
            .error_for_status()?
            .json::<ModelInfo>()
            .await?;
        Ok(info)
    }
}

// =============================================================================
// Compiler
// =============================================================================

/// Compiles workload sources into running cluster object sets.
pub struct WorkloadCompiler {
    cluster: ClusterClient,
    store: RecordStore,
    http: reqwest::Client,
    resolver: Arc<dyn ModelResolver>,
    status: mpsc::Sender<JobUpdate>,
    registry: String,
}

impl WorkloadCompiler {
    /// Create a compiler.
    ///
    /// `registry` prefixes inference base images; empty means the default
    /// local image naming.
    pub fn new(
        cluster: ClusterClient,
        store: RecordStore,
        http: reqwest::Client,
        resolver: Arc<dyn ModelResolver>,
        status: mpsc::Sender<JobUpdate>,
        registry: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            store,
            http,
            resolver,
            status,
            registry: registry.into(),
        }
    }

    /// Deploy a workload and return its reachable URL.
    pub async fn deploy(&self, task: &DeployTask, source: &WorkloadSource) -> Result<String> {
        match source {
            WorkloadSource::Image { image, dockerfile } => {
                let port = extract_exposed_port(dockerfile)?;
                self.prepare(task).await?;
                let container = image_container(task, image, port, marketplace_env(task));
                self.roll_out(task, vec![container], Vec::new(), port, Vec::new())
                    .await
            }
            WorkloadSource::Manifest { path } => self.deploy_manifest(task, path).await,
            WorkloadSource::ModelInference { setting_path } => {
                self.deploy_model_inference(task, setting_path).await
            }
        }
    }

    /// Clear the previous incarnation and ensure the namespace.
    ///
    /// At most one live deployment per workload id: the prior
    /// Deployment/ReplicaSet set and durable record are removed before
    /// anything new is created (re-deploy semantics, not create-or-update).
    async fn prepare(&self, task: &DeployTask) -> Result<()> {
        let namespace = task.namespace();
        self.cluster
            .teardown_workload(&namespace, &task.space_uuid)
            .await?;
        self.store.remove(&task.space_uuid).await?;
        self.cluster
            .ensure_namespace(&namespace_object(task))
            .await?;
        Ok(())
    }

    async fn deploy_manifest(&self, task: &DeployTask, path: &Path) -> Result<String> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::deploy(format!("failed to read manifest {:?}: {}", path, e)))?;
        let mut specs = manifest::parse(&bytes)?;
        if specs.is_empty() {
            return Err(Error::format("manifest declares no deployment units"));
        }
        if specs.len() > 1 {
            warn!(
                space_uuid = %task.space_uuid,
                ignored = specs.len() - 1,
                "manifest declares multiple deployment units; deploying the primary only"
            );
        }
        let primary = specs.remove(0);

        self.prepare(task).await?;

        // Service port: the primary's first declared port, or the first
        // dependency port when the workload is driven purely by its
        // dependencies.
        let port = primary
            .ports
            .first()
            .or_else(|| primary.depends.iter().flat_map(|d| d.ports.first()).next())
            .map(|p| p.container_port)
            .ok_or_else(|| Error::deploy("manifest exposes no port to bind the service to"))?;

        let mut containers = Vec::new();
        for dep in &primary.depends {
            containers.push(dependency_container(task, dep));
        }

        let (volumes, mounts) = match &primary.config_file {
            Some(mount) => {
                let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
                let config_map = config_map_object(task, base_dir, &mount.name)?;
                self.cluster
                    .create_config_map(&task.namespace(), &config_map)
                    .await?;
                config_volume(task, &mount.name, &mount.path)
            }
            None => (Vec::new(), Vec::new()),
        };

        containers.push(primary_container(task, &primary, mounts));

        self.roll_out(task, containers, volumes, port, primary.models.clone())
            .await
    }

    async fn deploy_model_inference(&self, task: &DeployTask, setting_path: &Path) -> Result<String> {
        #[derive(Deserialize)]
        struct ModelSetting {
            model_id: String,
        }
        let raw = std::fs::read(setting_path).map_err(|e| {
            Error::deploy(format!(
                "failed to read model settings {:?}: {}",
                setting_path, e
            ))
        })?;
        let setting: ModelSetting = serde_json::from_slice(&raw)
            .map_err(|e| Error::deploy(format!("model settings are not valid JSON: {}", e)))?;

        let info = self.resolver.resolve(&setting.model_id).await?;
        let image = inference_image(&self.registry, &info.framework);

        self.prepare(task).await?;

        let mut env = marketplace_env(task);
        env.push(env_var("TASK", &info.task));
        env.push(env_var("MODEL_ID", &info.model_id));

        // Inference images declare no ports; the container port is fixed.
        let container = image_container(task, &image, INFERENCE_CONTAINER_PORT, env);
        self.roll_out(
            task,
            vec![container],
            Vec::new(),
            INFERENCE_CONTAINER_PORT,
            Vec::new(),
        )
        .await
    }

    /// The shared tail of every deploy path; [`Self::prepare`] has already
    /// run.
    async fn roll_out(
        &self,
        task: &DeployTask,
        containers: Vec<Container>,
        volumes: Vec<Volume>,
        port: i32,
        models: Vec<ModelAsset>,
    ) -> Result<String> {
        let namespace = task.namespace();

        let deployment = deployment_object(task, containers, volumes);
        let created = self.cluster.create_deployment(&namespace, &deployment).await?;
        let deploy_name = created
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| task.deploy_name());
        self.update_status(task, JobStatus::PullImage, None).await;
        info!(namespace = %namespace, deployment = %deploy_name, "created deployment");

        let service = service_object(task, port);
        let created_service = self.cluster.create_service(&namespace, &service).await?;
        let cluster_ip = created_service
            .spec
            .as_ref()
            .and_then(|s| s.cluster_ip.clone())
            .unwrap_or_default();
        let service_host = format!("http://{}:{}", cluster_ip, port);
        info!(namespace = %namespace, service = %format!("{}{}", SERVICE_NAME_PREFIX, task.space_uuid), "created service");

        let ingress = ingress_object(task, port);
        self.cluster.create_ingress(&namespace, &ingress).await?;
        self.update_status(task, JobStatus::DeployToK8s, Some(task.url()))
            .await;
        info!(namespace = %namespace, host = %task.host_name, "created ingress");

        if !models.is_empty() {
            self.spawn_model_fetches(task, &service_host, models);
        }

        let expire_time = Utc::now().timestamp() + task.duration;
        let record = JobRecord {
            wallet_address: task.wallet_address.clone(),
            space_name: task.space_name.clone(),
            expire_time,
            space_uuid: task.space_uuid.clone(),
            job_uuid: task.job_uuid.clone(),
            task_type: task.hardware.task_type().to_string(),
            deploy_name,
            hardware: task.hardware_desc.clone(),
            url: task.url(),
        };
        self.store.save(&record, task.duration.max(0) as u64).await?;

        Ok(task.url())
    }

    /// Fetch declared model assets into the running container, off the deploy
    /// path. Waits for the workload to answer first; failures are logged and
    /// abandoned.
    fn spawn_model_fetches(&self, task: &DeployTask, service_host: &str, models: Vec<ModelAsset>) {
        let cluster = self.cluster.clone();
        let http = self.http.clone();
        let namespace = task.namespace();
        let space_uuid = task.space_uuid.clone();
        let service_host = service_host.to_string();

        tokio::spawn(async move {
            let pod_name = match cluster
                .wait_for_workload_ready(&http, &namespace, &space_uuid, &service_host)
                .await
            {
                Ok(name) => name,
                Err(e) => {
                    error!(space_uuid = %space_uuid, error = %e, "workload never became ready; skipping model fetch");
                    return;
                }
            };
            for asset in models {
                let target = format!("{}/{}", asset.dir.trim_end_matches('/'), asset.name);
                let command = vec![
                    "wget".to_string(),
                    asset.url.clone(),
                    "-O".to_string(),
                    target.clone(),
                ];
                match cluster.exec_in_pod(&namespace, &pod_name, command).await {
                    Ok(()) => info!(space_uuid = %space_uuid, target = %target, "fetched model asset"),
                    Err(e) => {
                        error!(space_uuid = %space_uuid, url = %asset.url, error = %e, "model asset fetch failed")
                    }
                }
            }
        });
    }

    async fn update_status(&self, task: &DeployTask, status: JobStatus, url: Option<String>) {
        let update = JobUpdate::Status {
            job_uuid: task.job_uuid.clone(),
            status,
            url,
        };
        if self.status.send(update).await.is_err() {
            warn!(job_uuid = %task.job_uuid, "lifecycle intake closed; status update dropped");
        }
    }
}

// =============================================================================
// Object Builders
// =============================================================================

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Marketplace-injected environment: appended to whatever the workload
/// declares so the container can call back with results.
fn marketplace_env(task: &DeployTask) -> Vec<EnvVar> {
    vec![
        env_var("wallet_address", &task.wallet_address),
        env_var("space_uuid", &task.space_uuid),
        env_var("space_name", &task.space_name),
        env_var("job_uuid", &task.job_uuid),
        env_var("result_url", &task.host_name),
    ]
}

fn workload_labels(task: &DeployTask) -> std::collections::BTreeMap<String, String> {
    let mut labels = std::collections::BTreeMap::new();
    labels.insert(WORKLOAD_LABEL.to_string(), task.space_uuid.clone());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    );
    labels
}

fn namespace_object(task: &DeployTask) -> Namespace {
    let mut labels = std::collections::BTreeMap::new();
    labels.insert(
        "stratos.dev/wallet".to_string(),
        task.wallet_address.to_lowercase(),
    );
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    );
    Namespace {
        metadata: ObjectMeta {
            name: Some(task.namespace()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn deployment_object(task: &DeployTask, containers: Vec<Container>, volumes: Vec<Volume>) -> Deployment {
    let labels = workload_labels(task);
    let mut selector = std::collections::BTreeMap::new();
    selector.insert(WORKLOAD_LABEL.to_string(), task.space_uuid.clone());

    let node_selector = task.hardware.node_selector();

    Deployment {
        metadata: ObjectMeta {
            name: Some(task.deploy_name()),
            namespace: Some(task.namespace()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    node_selector: if node_selector.is_empty() {
                        None
                    } else {
                        Some(node_selector)
                    },
                    containers,
                    volumes: if volumes.is_empty() {
                        None
                    } else {
                        Some(volumes)
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Container for the single-image (Dockerfile) and inference paths
fn image_container(task: &DeployTask, image: &str, port: i32, env: Vec<EnvVar>) -> Container {
    Container {
        name: format!("{}{}", CONTAINER_NAME_PREFIX, task.space_uuid),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            container_port: port,
            ..Default::default()
        }]),
        env: Some(env),
        resources: Some(task.hardware.resource_requirements()),
        ..Default::default()
    }
}

/// The manifest path's primary container: declared env plus marketplace
/// injection, with the hostname rewrite for `NEXTAUTH_URL`.
fn primary_container(task: &DeployTask, spec: &ContainerSpec, mounts: Vec<VolumeMount>) -> Container {
    let mut env = spec.env.clone();
    for var in &mut env {
        if var.name.contains("NEXTAUTH_URL") {
            var.value = Some(task.url());
            break;
        }
    }
    env.extend(marketplace_env(task));

    Container {
        name: format!("{}-{}", task.space_uuid, spec.name),
        image: Some(spec.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: non_empty(spec.command.clone()),
        args: non_empty(spec.args.clone()),
        env: Some(env),
        ports: non_empty(spec.ports.clone()),
        resources: Some(task.hardware.resource_requirements()),
        volume_mounts: non_empty(mounts),
        ..Default::default()
    }
}

/// A dependency container, gated by an exec readiness probe built from the
/// dependency's declared ready-command.
fn dependency_container(task: &DeployTask, spec: &ContainerSpec) -> Container {
    Container {
        name: format!("{}-{}", task.space_uuid, spec.name),
        image: Some(spec.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: non_empty(spec.command.clone()),
        args: non_empty(spec.args.clone()),
        env: non_empty(spec.env.clone()),
        ports: non_empty(spec.ports.clone()),
        readiness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: non_empty(spec.ready_cmd.clone()),
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(5),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service_object(task: &DeployTask, port: i32) -> Service {
    let mut selector = std::collections::BTreeMap::new();
    selector.insert(WORKLOAD_LABEL.to_string(), task.space_uuid.clone());

    Service {
        metadata: ObjectMeta {
            name: Some(format!("{}{}", SERVICE_NAME_PREFIX, task.space_uuid)),
            namespace: Some(task.namespace()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn ingress_object(task: &DeployTask, port: i32) -> Ingress {
    let mut annotations = std::collections::BTreeMap::new();
    annotations.insert(
        "nginx.ingress.kubernetes.io/use-regex".to_string(),
        "true".to_string(),
    );

    Ingress {
        metadata: ObjectMeta {
            name: Some(format!("{}{}", INGRESS_NAME_PREFIX, task.space_uuid)),
            namespace: Some(task.namespace()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some("nginx".to_string()),
            rules: Some(vec![IngressRule {
                host: Some(task.host_name.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/*".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: format!("{}{}", SERVICE_NAME_PREFIX, task.space_uuid),
                                port: Some(ServiceBackendPort {
                                    number: Some(port),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn config_map_object(task: &DeployTask, base_dir: &Path, file_name: &str) -> Result<ConfigMap> {
    let path = base_dir.join(file_name);
    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::deploy(format!("failed to read config file {:?}: {}", path, e)))?;

    let mut data = std::collections::BTreeMap::new();
    data.insert(file_name.to_string(), content);

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_volume_name(&task.space_uuid, file_name)),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

fn config_volume(task: &DeployTask, file_name: &str, mount_path: &str) -> (Vec<Volume>, Vec<VolumeMount>) {
    let name = config_volume_name(&task.space_uuid, file_name);
    let volumes = vec![Volume {
        name: name.clone(),
        config_map: Some(ConfigMapVolumeSource {
            name: name.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let mounts = vec![VolumeMount {
        name,
        mount_path: mount_path.to_string(),
        ..Default::default()
    }];
    (volumes, mounts)
}

fn config_volume_name(space_uuid: &str, file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    format!("{}-{}", space_uuid, stem)
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// Base image an inference framework is served from
fn inference_image(registry: &str, framework: &str) -> String {
    if registry.is_empty() {
        format!("stratos/inference-{}:v1.0", framework)
    } else {
        format!("{}/inference-{}:v1.0", registry.trim_end_matches('/'), framework)
    }
}

/// Parse the first `EXPOSE` directive out of a Dockerfile.
pub fn extract_exposed_port(dockerfile: &Path) -> Result<i32> {
    let content = std::fs::read_to_string(dockerfile)
        .map_err(|e| Error::deploy(format!("unable to open Dockerfile {:?}: {}", dockerfile, e)))?;

    let digits = Regex::new(r"\d+").expect("static regex");
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("EXPOSE") {
            if let Some(found) = digits.find(trimmed) {
                return found
                    .as_str()
                    .parse::<i32>()
                    .map_err(|e| Error::deploy(format!("bad EXPOSE port: {}", e)));
            }
        }
    }
    Err(Error::deploy("no exposed port found in Dockerfile"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> DeployTask {
        DeployTask::new(
            "job-1",
            "a1b2c3.cp.example.dev",
            "0xAbCd",
            "Nvidia 3080·CPU 8 vCPU·Memory 32 GiB",
            3600,
        )
        .unwrap()
        .with_space("9b2459b1", "demo-space")
    }

    // =========================================================================
    // Naming
    // =========================================================================

    #[test]
    fn namespace_derives_from_lowercased_wallet() {
        let task = task();
        assert_eq!(task.namespace(), "stratos-ns-0xabcd");
        assert_eq!(task.deploy_name(), "deploy-9b2459b1");
        assert_eq!(task.url(), "https://a1b2c3.cp.example.dev");
    }

    // =========================================================================
    // Deployment Objects
    // =========================================================================

    #[test]
    fn deployment_carries_workload_label_and_node_selector() {
        let task = task();
        let container = image_container(&task, "app:1", 3000, marketplace_env(&task));
        let deployment = deployment_object(&task, vec![container], Vec::new());

        let selector = deployment
            .spec
            .as_ref()
            .unwrap()
            .selector
            .match_labels
            .as_ref()
            .unwrap();
        assert_eq!(selector.get(WORKLOAD_LABEL), Some(&"9b2459b1".to_string()));

        let pod_spec = deployment.spec.unwrap().template.spec.unwrap();
        let node_selector = pod_spec.node_selector.unwrap();
        assert_eq!(node_selector.get("NVIDIA-3080"), Some(&"true".to_string()));
    }

    #[test]
    fn cpu_tier_gets_no_node_selector() {
        let task = DeployTask::new(
            "job-1",
            "host",
            "0xAbCd",
            "CPU only·CPU 4 vCPU·Memory 16 GiB",
            600,
        )
        .unwrap()
        .with_space("id", "name");

        let container = image_container(&task, "app:1", 80, Vec::new());
        let deployment = deployment_object(&task, vec![container], Vec::new());
        assert!(deployment
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .node_selector
            .is_none());
    }

    #[test]
    fn marketplace_env_is_injected() {
        let task = task();
        let env = marketplace_env(&task);
        let names: Vec<&str> = env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "wallet_address",
                "space_uuid",
                "space_name",
                "job_uuid",
                "result_url"
            ]
        );
    }

    #[test]
    fn primary_container_rewrites_nextauth_url() {
        let task = task();
        let spec = ContainerSpec {
            name: "app".into(),
            image: "app:1".into(),
            env: vec![EnvVar {
                name: "NEXTAUTH_URL".into(),
                value: Some("http://localhost:3000".into()),
                ..Default::default()
            }],
            ..Default::default()
        };

        let container = primary_container(&task, &spec, Vec::new());
        let env = container.env.unwrap();
        let nextauth = env.iter().find(|e| e.name == "NEXTAUTH_URL").unwrap();
        assert_eq!(nextauth.value.as_deref(), Some("https://a1b2c3.cp.example.dev"));
        assert!(env.iter().any(|e| e.name == "wallet_address"));
    }

    #[test]
    fn dependency_container_has_exec_readiness_probe() {
        let task = task();
        let spec = ContainerSpec {
            name: "db".into(),
            image: "postgres:15".into(),
            ready_cmd: vec!["pg_isready".into()],
            ..Default::default()
        };

        let container = dependency_container(&task, &spec);
        assert_eq!(container.name, "9b2459b1-db");
        let probe = container.readiness_probe.unwrap();
        assert_eq!(probe.initial_delay_seconds, Some(5));
        assert_eq!(probe.period_seconds, Some(5));
        assert_eq!(probe.exec.unwrap().command.unwrap(), vec!["pg_isready"]);
    }

    // =========================================================================
    // Service and Ingress
    // =========================================================================

    #[test]
    fn service_selects_the_workload_label() {
        let task = task();
        let service = service_object(&task, 3000);
        assert_eq!(
            service.metadata.name.as_deref(),
            Some("svc-9b2459b1")
        );
        let spec = service.spec.unwrap();
        assert_eq!(
            spec.selector.unwrap().get(WORKLOAD_LABEL),
            Some(&"9b2459b1".to_string())
        );
        assert_eq!(spec.ports.unwrap()[0].port, 3000);
    }

    #[test]
    fn ingress_binds_the_hostname_to_the_service() {
        let task = task();
        let ingress = ingress_object(&task, 3000);
        assert_eq!(ingress.metadata.name.as_deref(), Some("ing-9b2459b1"));

        let spec = ingress.spec.unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));
        let rule = &spec.rules.unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("a1b2c3.cp.example.dev"));
        let path = &rule.http.as_ref().unwrap().paths[0];
        assert_eq!(path.path_type, "Prefix");
        let backend = path.backend.service.as_ref().unwrap();
        assert_eq!(backend.name, "svc-9b2459b1");
        assert_eq!(backend.port.as_ref().unwrap().number, Some(3000));
    }

    // =========================================================================
    // Dockerfile EXPOSE
    // =========================================================================

    #[test]
    fn extracts_first_expose_directive() {
        let dir = tempfile::tempdir().unwrap();
        let dockerfile = dir.path().join("Dockerfile");
        std::fs::write(
            &dockerfile,
            "FROM node:20\nWORKDIR /app\nEXPOSE 3000\nEXPOSE 9090\nCMD [\"node\"]\n",
        )
        .unwrap();
        assert_eq!(extract_exposed_port(&dockerfile).unwrap(), 3000);
    }

    #[test]
    fn missing_expose_is_a_deploy_error() {
        let dir = tempfile::tempdir().unwrap();
        let dockerfile = dir.path().join("Dockerfile");
        std::fs::write(&dockerfile, "FROM scratch\n").unwrap();
        let err = extract_exposed_port(&dockerfile).unwrap_err();
        assert!(err.to_string().contains("no exposed port"));
    }

    // =========================================================================
    // Inference Images
    // =========================================================================

    #[test]
    fn inference_image_uses_registry_when_configured() {
        assert_eq!(
            inference_image("", "diffusers"),
            "stratos/inference-diffusers:v1.0"
        );
        assert_eq!(
            inference_image("registry.example/", "diffusers"),
            "registry.example/inference-diffusers:v1.0"
        );
    }

    #[tokio::test]
    async fn resolved_framework_selects_the_inference_image() {
        let mut resolver = MockModelResolver::new();
        resolver.expect_resolve().returning(|model_id| {
            Ok(ModelInfo {
                model_id: model_id.to_string(),
                task: "text-generation".into(),
                framework: "transformers".into(),
            })
        });

        let info = resolver.resolve("org/model").await.unwrap();
        assert_eq!(info.task, "text-generation");
        assert_eq!(
            inference_image("", &info.framework),
            "stratos/inference-transformers:v1.0"
        );
    }

    #[test]
    fn config_volume_names_strip_the_extension() {
        assert_eq!(config_volume_name("abc", "app.ini"), "abc-app");
        let task = task();
        let (volumes, mounts) = config_volume(&task, "app.ini", "/etc/app");
        assert_eq!(volumes[0].name, "9b2459b1-app");
        assert_eq!(mounts[0].mount_path, "/etc/app");
        assert_eq!(
            Some(volumes[0].config_map.as_ref().unwrap().name.as_str()),
            Some("9b2459b1-app")
        );
    }
}
