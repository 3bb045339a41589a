//! Cluster resource accounting and admission policy
//!
//! The accountant inventories node capacity and per-node GPU attachment, nets
//! out what running workloads already consume, and evaluates the configured
//! [`ResourcePolicy`](crate::config::ResourcePolicy) into a binary admission
//! verdict. It also produces the per-node [`NodeResource`] snapshot the agent
//! reports upstream on every summary tick.
//!
//! Usage is the sum of container resource **requests** over Running-phase
//! pods, not limits. GPU model attribution comes from the node-selector label
//! each pod was scheduled with, because the device-plugin resource name
//! (`nvidia.com/gpu`) is undifferentiated by model. This assumes at most one
//! GPU-model label per pod spec; pods carrying several would be attributed to
//! an arbitrary one, so the compiler never emits more than one.
//!
//! GPU telemetry is out-of-band: the last log line of each node's
//! resource-exporter pod, parsed as JSON. Per model,
//! `remaining = attached - (running_on_cluster + reserved_by_this_process)`;
//! the reservation counters cover deploys accepted but not yet visible as
//! running pods.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cluster::ClusterClient;
use crate::config::ResourcePolicy;
use crate::{Error, Result};

/// The device-plugin resource name workload containers request GPUs under
pub const GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";

// =============================================================================
// Admission Status
// =============================================================================

/// The provider's self-reported availability
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderStatus {
    /// Free capacity satisfies the policy; the provider advertises itself
    Active,
    /// Capacity below policy (or policy unconfigured); provider stays quiet
    Inactive,
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderStatus::Active => write!(f, "Active"),
            ProviderStatus::Inactive => write!(f, "Inactive"),
        }
    }
}

// =============================================================================
// Snapshot Types
// =============================================================================

/// Availability of one physical GPU unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuUnitStatus {
    /// The unit is free for new workloads
    Available,
    /// The unit is consumed or reserved
    Occupied,
}

/// One GPU unit in a node's inventory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDetail {
    /// Model name as reported by the exporter
    pub product_name: String,
    /// Availability after netting out usage and reservations
    pub status: GpuUnitStatus,
}

/// A node's GPU inventory
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuSummary {
    /// Driver version reported by the exporter
    #[serde(default)]
    pub driver_version: String,
    /// CUDA version reported by the exporter
    #[serde(default)]
    pub cuda_version: String,
    /// Number of physically attached units
    #[serde(default)]
    pub attached_gpus: i64,
    /// Per-unit inventory
    #[serde(default)]
    pub details: Vec<GpuDetail>,
}

/// Total/used/free figures for one resource, formatted for reporting
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFigures {
    /// Total allocatable
    pub total: String,
    /// Consumed by Running-phase pod requests
    pub used: String,
    /// Remaining
    pub free: String,
}

/// Point-in-time snapshot of one cluster node.
///
/// Recomputed on every accounting pass from live cluster state plus
/// best-effort GPU telemetry; never persisted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeResource {
    /// Machine identity from node info
    pub machine_id: String,
    /// CPU architecture
    pub model: String,
    /// Physical CPU figures
    pub cpu: ResourceFigures,
    /// vCPU figures (identical to CPU on bare clusters)
    pub vcpu: ResourceFigures,
    /// Memory figures
    pub memory: ResourceFigures,
    /// Ephemeral storage figures
    pub storage: ResourceFigures,
    /// GPU inventory with per-unit availability
    pub gpu: GpuSummary,
}

/// The cluster-wide summary pushed to the coordinator
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterResource {
    /// Provider node id
    pub node_id: String,
    /// Provider region, best-effort geolocation
    pub region: String,
    /// Per-node snapshots
    pub cluster_info: Vec<NodeResource>,
}

// =============================================================================
// GPU Reservations
// =============================================================================

/// Process-wide counters of GPUs reserved by accepted-but-not-yet-running
/// deploys, keyed by normalized model name.
///
/// The lifecycle manager reserves at job acceptance and releases once the
/// deploy completes (the pod's request is counted by the cluster from then
/// on) or fails.
#[derive(Clone, Default)]
pub struct GpuReservations(Arc<DashMap<String, i64>>);

impl GpuReservations {
    /// Create an empty reservation table
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve one unit of a model
    pub fn reserve(&self, model: &str) {
        *self.0.entry(normalize_model(model)).or_insert(0) += 1;
    }

    /// Release one unit of a model
    pub fn release(&self, model: &str) {
        let key = normalize_model(model);
        if let Some(mut count) = self.0.get_mut(&key) {
            *count = (*count - 1).max(0);
        }
        self.0.remove_if(&key, |_, count| *count <= 0);
    }

    /// Units currently reserved for a model
    pub fn reserved(&self, model: &str) -> i64 {
        self.0
            .get(&normalize_model(model))
            .map(|c| *c)
            .unwrap_or(0)
    }
}

/// Canonical model key: spaces become hyphens, `Nvidia` becomes `NVIDIA`
pub fn normalize_model(model: &str) -> String {
    model.trim().replace(' ', "-").replace("Nvidia", "NVIDIA")
}

// =============================================================================
// Telemetry Parsing
// =============================================================================

/// GPU telemetry as emitted by the node-local exporter
#[derive(Clone, Debug, Default, Deserialize)]
pub struct GpuTelemetry {
    /// Driver version
    #[serde(default)]
    pub driver_version: String,
    /// CUDA version
    #[serde(default)]
    pub cuda_version: String,
    /// Number of physically attached units
    #[serde(default)]
    pub attached_gpus: i64,
    /// Per-unit details, in the exporter's enumeration order
    #[serde(default)]
    pub details: Vec<TelemetryDetail>,
}

/// One GPU unit as reported by the exporter
#[derive(Clone, Debug, Deserialize)]
pub struct TelemetryDetail {
    /// Model name, e.g. `NVIDIA GeForce RTX 3080`
    pub product_name: String,
}

/// Parse one exporter log line.
pub fn parse_gpu_telemetry(line: &str) -> Result<GpuTelemetry> {
    #[derive(Deserialize)]
    struct Envelope {
        gpu: GpuTelemetry,
    }
    let envelope: Envelope = serde_json::from_str(line.trim())
        .map_err(|e| Error::telemetry(format!("exporter line is not valid JSON: {}", e)))?;
    Ok(envelope.gpu)
}

// =============================================================================
// Per-Node Usage
// =============================================================================

/// Resources consumed on one node by Running-phase pod requests
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeUsage {
    /// CPU cores
    pub cpu: i64,
    /// Memory bytes
    pub memory: i64,
    /// Ephemeral storage bytes
    pub storage: i64,
    /// GPU units by normalized model name
    pub gpu: HashMap<String, i64>,
}

/// Sum the requests of every pod scheduled to `node`.
pub fn node_usage(pods: &[Pod], node: &Node) -> NodeUsage {
    let node_name = node.metadata.name.as_deref().unwrap_or_default();
    let mut usage = NodeUsage::default();

    for pod in pods {
        let on_node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .map(|n| n == node_name)
            .unwrap_or(false);
        if !on_node {
            continue;
        }

        usage.cpu += request_in_pod(pod, "cpu");
        usage.memory += request_in_pod(pod, "memory");
        usage.storage += request_in_pod(pod, "ephemeral-storage");

        let (model, count) = gpu_in_pod(pod);
        if let Some(model) = model {
            *usage.gpu.entry(model).or_insert(0) += count;
        }
    }
    usage
}

fn request_in_pod(pod: &Pod, resource: &str) -> i64 {
    let Some(spec) = pod.spec.as_ref() else {
        return 0;
    };
    spec.containers
        .iter()
        .filter_map(|c| c.resources.as_ref())
        .filter_map(|r| r.requests.as_ref())
        .filter_map(|requests| requests.get(resource))
        .map(parse_quantity)
        .sum()
}

/// GPU request of a pod plus the model it was scheduled against.
///
/// The model is whichever single node-selector label key is present; the pod
/// spec never carries more than one (see module docs).
pub fn gpu_in_pod(pod: &Pod) -> (Option<String>, i64) {
    let count = request_in_pod(pod, GPU_RESOURCE_NAME);
    let model = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_selector.as_ref())
        .and_then(|selector| selector.keys().find(|k| !k.is_empty()).cloned())
        .map(|k| normalize_model(&k));
    (model, count)
}

/// Parse a Kubernetes quantity string into base units, rounding up.
///
/// CPU quantities come out in whole cores, memory and storage in bytes.
pub fn parse_quantity(quantity: &Quantity) -> i64 {
    let s = quantity.0.trim();
    if s.is_empty() {
        return 0;
    }
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-' && c != '+')
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let Ok(value) = number.parse::<f64>() else {
        return 0;
    };
    let multiplier: f64 = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        _ => return 0,
    };
    (value * multiplier).ceil() as i64
}

// =============================================================================
// Policy Evaluation
// =============================================================================

/// Cluster-wide free capacity, summed over all nodes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterFree {
    /// Free CPU cores
    pub cpu: i64,
    /// Free memory bytes
    pub memory_bytes: i64,
    /// Free ephemeral storage bytes
    pub storage_bytes: i64,
}

/// Evaluate the admission policy against free capacity and per-model
/// remaining GPU counts.
///
/// The verdict is `Active` only when both hold:
/// - some GPU model has `remaining > quota` for a policy entry with a
///   nonzero quota (a zero quota closes the model, which is what keeps the
///   unconfigured all-zero default `Inactive` regardless of capacity), and
/// - free CPU, memory, and storage each meet their floor.
///
/// Spare GPU capacity never waives the base-resource floors.
pub fn evaluate_policy(
    policy: &ResourcePolicy,
    free: &ClusterFree,
    remaining_gpu: &HashMap<String, i64>,
) -> ProviderStatus {
    let gpu_eligible = policy.gpu.iter().any(|entry| {
        entry.quota > 0
            && remaining_gpu
                .get(&normalize_model(&entry.name))
                .copied()
                .unwrap_or(0)
                > entry.quota
    });

    let floors_met = free.cpu >= policy.cpu.quota
        && free.memory_bytes >= policy.memory.bytes()
        && free.storage_bytes >= policy.storage.bytes();

    if gpu_eligible && floors_met {
        ProviderStatus::Active
    } else {
        ProviderStatus::Inactive
    }
}

/// Annotate telemetry details with availability.
///
/// The first `remaining[model]` units of each model (in telemetry enumeration
/// order, which is stable but otherwise arbitrary) are `Available`; the rest
/// are `Occupied`. Best-effort signal, not a hard allocator.
pub fn annotate_gpu_details(
    details: &[TelemetryDetail],
    remaining: &HashMap<String, i64>,
) -> Vec<GpuDetail> {
    let mut granted: HashMap<String, i64> = HashMap::new();
    details
        .iter()
        .map(|detail| {
            let model = normalize_model(&detail.product_name);
            let quota = remaining.get(&model).copied().unwrap_or(0);
            let taken = granted.entry(model).or_insert(0);
            let status = if *taken < quota {
                *taken += 1;
                GpuUnitStatus::Available
            } else {
                GpuUnitStatus::Occupied
            };
            GpuDetail {
                product_name: detail.product_name.clone(),
                status,
            }
        })
        .collect()
}

// =============================================================================
// Accountant
// =============================================================================

/// The cluster resource accountant
#[derive(Clone)]
pub struct Accountant {
    cluster: ClusterClient,
    reservations: GpuReservations,
}

impl Accountant {
    /// Create an accountant over a cluster client and the shared reservation
    /// table
    pub fn new(cluster: ClusterClient, reservations: GpuReservations) -> Self {
        Self {
            cluster,
            reservations,
        }
    }

    /// Produce the per-node snapshot for external reporting.
    ///
    /// Node/pod list failures are fatal to the pass; one node's unparseable
    /// telemetry only blanks that node's GPU inventory.
    pub async fn snapshot(&self) -> Result<Vec<NodeResource>> {
        let pods = self.cluster.running_pods().await?;
        let nodes = self.cluster.list_nodes().await?;
        let telemetry = self.cluster.gpu_telemetry_lines().await?;

        let mut snapshot = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let usage = node_usage(&pods, node);
            let mut resource = node_figures(node, &usage);

            let node_name = node.metadata.name.as_deref().unwrap_or_default();
            if let Some(line) = telemetry.get(node_name) {
                match parse_gpu_telemetry(line) {
                    Ok(gpu) => {
                        let remaining = self.remaining_on_node(&gpu, &usage);
                        resource.gpu = GpuSummary {
                            driver_version: gpu.driver_version.clone(),
                            cuda_version: gpu.cuda_version.clone(),
                            attached_gpus: gpu.attached_gpus,
                            details: annotate_gpu_details(&gpu.details, &remaining),
                        };
                    }
                    Err(e) => {
                        warn!(node = %node_name, error = %e, "skipping GPU inventory for node");
                    }
                }
            }
            snapshot.push(resource);
        }
        Ok(snapshot)
    }

    /// Evaluate the admission policy against current cluster state.
    pub async fn admission_status(&self, policy: &ResourcePolicy) -> Result<ProviderStatus> {
        let pods = self.cluster.running_pods().await?;
        let nodes = self.cluster.list_nodes().await?;
        let telemetry = self.cluster.gpu_telemetry_lines().await?;

        let mut free = ClusterFree::default();
        let mut running_gpu: HashMap<String, i64> = HashMap::new();
        for node in &nodes {
            let usage = node_usage(&pods, node);
            let (cpu_total, mem_total, storage_total) = allocatable(node);
            free.cpu += cpu_total - usage.cpu;
            free.memory_bytes += mem_total - usage.memory;
            free.storage_bytes += storage_total - usage.storage;
            for (model, count) in usage.gpu {
                *running_gpu.entry(model).or_insert(0) += count;
            }
        }

        let mut attached: HashMap<String, i64> = HashMap::new();
        for (node_name, line) in &telemetry {
            match parse_gpu_telemetry(line) {
                Ok(gpu) => {
                    for detail in &gpu.details {
                        *attached
                            .entry(normalize_model(&detail.product_name))
                            .or_insert(0) += 1;
                    }
                }
                Err(e) => {
                    warn!(node = %node_name, error = %e, "skipping GPU telemetry for node");
                }
            }
        }

        let mut remaining: HashMap<String, i64> = HashMap::new();
        for (model, count) in attached {
            let consumed = running_gpu.get(&model).copied().unwrap_or(0)
                + self.reservations.reserved(&model);
            remaining.insert(model, (count - consumed).max(0));
        }

        Ok(evaluate_policy(policy, &free, &remaining))
    }

    /// Apply each telemetry-reported GPU model as a node label so workload
    /// node selectors can match. Errors are logged per node and skipped.
    pub async fn sync_node_gpu_labels(&self) -> Result<()> {
        let telemetry = self.cluster.gpu_telemetry_lines().await?;
        for (node_name, line) in &telemetry {
            let gpu = match parse_gpu_telemetry(line) {
                Ok(gpu) => gpu,
                Err(e) => {
                    warn!(node = %node_name, error = %e, "skipping node label sync");
                    continue;
                }
            };
            for detail in &gpu.details {
                if let Err(e) = self.cluster.label_node(node_name, &detail.product_name).await {
                    warn!(
                        node = %node_name,
                        gpu = %detail.product_name,
                        error = %e,
                        "failed to apply GPU node label"
                    );
                }
            }
        }
        info!("node GPU label sync finished");
        Ok(())
    }

    /// Per-model remaining counts for one node's inventory
    fn remaining_on_node(&self, gpu: &GpuTelemetry, usage: &NodeUsage) -> HashMap<String, i64> {
        let mut attached: HashMap<String, i64> = HashMap::new();
        for detail in &gpu.details {
            *attached
                .entry(normalize_model(&detail.product_name))
                .or_insert(0) += 1;
        }
        attached
            .into_iter()
            .map(|(model, count)| {
                let consumed =
                    usage.gpu.get(&model).copied().unwrap_or(0) + self.reservations.reserved(&model);
                (model, (count - consumed).max(0))
            })
            .collect()
    }
}

fn allocatable(node: &Node) -> (i64, i64, i64) {
    let Some(allocatable) = node.status.as_ref().and_then(|s| s.allocatable.as_ref()) else {
        return (0, 0, 0);
    };
    let get = |name: &str| allocatable.get(name).map(parse_quantity).unwrap_or(0);
    (get("cpu"), get("memory"), get("ephemeral-storage"))
}

fn node_figures(node: &Node, usage: &NodeUsage) -> NodeResource {
    let (cpu_total, mem_total, storage_total) = allocatable(node);
    let info = node.status.as_ref().and_then(|s| s.node_info.as_ref());

    let cpu = ResourceFigures {
        total: cpu_total.to_string(),
        used: usage.cpu.to_string(),
        free: (cpu_total - usage.cpu).to_string(),
    };

    NodeResource {
        machine_id: info.map(|i| i.machine_id.clone()).unwrap_or_default(),
        model: info.map(|i| i.architecture.clone()).unwrap_or_default(),
        vcpu: cpu.clone(),
        cpu,
        memory: gib_figures(mem_total, usage.memory),
        storage: gib_figures(storage_total, usage.storage),
        gpu: GpuSummary::default(),
    }
}

fn gib_figures(total_bytes: i64, used_bytes: i64) -> ResourceFigures {
    let gib = |bytes: i64| format!("{:.2} GiB", bytes as f64 / (1024.0 * 1024.0 * 1024.0));
    ResourceFigures {
        total: gib(total_bytes),
        used: gib(used_bytes),
        free: gib(total_bytes - used_bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CpuQuota, GpuQuota, SizedQuota};
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
    use std::collections::BTreeMap;

    fn quantity_map(entries: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect()
    }

    fn running_pod(node: &str, requests: &[(&str, &str)], selector: Option<&str>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                node_selector: selector.map(|key| {
                    let mut map = BTreeMap::new();
                    map.insert(key.to_string(), "true".to_string());
                    map
                }),
                containers: vec![Container {
                    name: "main".to_string(),
                    resources: Some(ResourceRequirements {
                        requests: Some(quantity_map(requests)),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node_named(name: &str, cpu: &str, memory: &str, storage: &str) -> Node {
        use k8s_openapi::api::core::v1::{NodeStatus, NodeSystemInfo};
        Node {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                allocatable: Some(quantity_map(&[
                    ("cpu", cpu),
                    ("memory", memory),
                    ("ephemeral-storage", storage),
                ])),
                node_info: Some(NodeSystemInfo {
                    machine_id: format!("{}-machine", name),
                    architecture: "amd64".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // =========================================================================
    // Quantity Parsing
    // =========================================================================

    #[test]
    fn parses_quantities_in_base_units() {
        assert_eq!(parse_quantity(&Quantity("8".into())), 8);
        assert_eq!(parse_quantity(&Quantity("500m".into())), 1); // rounds up
        assert_eq!(parse_quantity(&Quantity("32Gi".into())), 32 * 1024 * 1024 * 1024);
        assert_eq!(parse_quantity(&Quantity("4G".into())), 4_000_000_000);
        assert_eq!(parse_quantity(&Quantity("10240Mi".into())), 10 * 1024 * 1024 * 1024);
        assert_eq!(parse_quantity(&Quantity("".into())), 0);
        assert_eq!(parse_quantity(&Quantity("bogus".into())), 0);
    }

    // =========================================================================
    // Usage Attribution
    // =========================================================================

    #[test]
    fn usage_sums_requests_of_pods_on_the_node() {
        let node = node_named("gpu-1", "16", "64Gi", "500Gi");
        let pods = vec![
            running_pod(
                "gpu-1",
                &[("cpu", "4"), ("memory", "8Gi"), ("ephemeral-storage", "10Gi")],
                None,
            ),
            running_pod("gpu-1", &[("cpu", "2"), ("memory", "4Gi")], None),
            // scheduled elsewhere; must not count
            running_pod("gpu-2", &[("cpu", "8")], None),
        ];

        let usage = node_usage(&pods, &node);
        assert_eq!(usage.cpu, 6);
        assert_eq!(usage.memory, 12 * 1024 * 1024 * 1024);
        assert_eq!(usage.storage, 10 * 1024 * 1024 * 1024);
    }

    #[test]
    fn gpu_usage_is_attributed_by_node_selector_label() {
        let node = node_named("gpu-1", "16", "64Gi", "500Gi");
        let pods = vec![running_pod(
            "gpu-1",
            &[(GPU_RESOURCE_NAME, "1")],
            Some("NVIDIA-3080"),
        )];

        let usage = node_usage(&pods, &node);
        assert_eq!(usage.gpu.get("NVIDIA-3080"), Some(&1));

        // a GPU request with no selector has no model to attribute to
        let pods = vec![running_pod("gpu-1", &[(GPU_RESOURCE_NAME, "1")], None)];
        assert!(node_usage(&pods, &node).gpu.is_empty());
    }

    // =========================================================================
    // Telemetry
    // =========================================================================

    const EXPORTER_LINE: &str = r#"{"gpu": {"driver_version": "535.104", "cuda_version": "12.2",
        "attached_gpus": 2, "details": [
            {"product_name": "NVIDIA GeForce RTX 3080"},
            {"product_name": "NVIDIA GeForce RTX 3080"}
        ]}}"#;

    #[test]
    fn parses_exporter_line() {
        let gpu = parse_gpu_telemetry(EXPORTER_LINE).unwrap();
        assert_eq!(gpu.attached_gpus, 2);
        assert_eq!(gpu.details.len(), 2);
        assert_eq!(gpu.driver_version, "535.104");
    }

    #[test]
    fn garbage_telemetry_is_a_telemetry_error() {
        let err = parse_gpu_telemetry("panic: exporter crashed").unwrap_err();
        assert!(matches!(err, Error::Telemetry(_)));
    }

    #[test]
    fn availability_marks_first_remaining_units_in_order() {
        let gpu = parse_gpu_telemetry(EXPORTER_LINE).unwrap();
        let mut remaining = HashMap::new();
        remaining.insert("NVIDIA-GeForce-RTX-3080".to_string(), 1i64);

        let details = annotate_gpu_details(&gpu.details, &remaining);
        assert_eq!(details[0].status, GpuUnitStatus::Available);
        assert_eq!(details[1].status, GpuUnitStatus::Occupied);

        // zero remaining marks every unit occupied
        let details = annotate_gpu_details(&gpu.details, &HashMap::new());
        assert!(details.iter().all(|d| d.status == GpuUnitStatus::Occupied));
    }

    // =========================================================================
    // Reservations
    // =========================================================================

    #[test]
    fn reservations_count_and_release() {
        let reservations = GpuReservations::new();
        reservations.reserve("NVIDIA 3080");
        reservations.reserve("NVIDIA 3080");
        assert_eq!(reservations.reserved("NVIDIA-3080"), 2);

        reservations.release("NVIDIA-3080");
        assert_eq!(reservations.reserved("NVIDIA 3080"), 1);

        reservations.release("NVIDIA 3080");
        reservations.release("NVIDIA 3080"); // over-release stays at zero
        assert_eq!(reservations.reserved("NVIDIA-3080"), 0);
    }

    // =========================================================================
    // Policy Evaluation
    // =========================================================================

    fn policy(cpu: i64, mem: i64, storage: i64, gpu: &[(&str, i64)]) -> ResourcePolicy {
        ResourcePolicy {
            cpu: CpuQuota { quota: cpu },
            memory: SizedQuota {
                quota: mem,
                unit: "GiB".into(),
            },
            storage: SizedQuota {
                quota: storage,
                unit: "GiB".into(),
            },
            gpu: gpu
                .iter()
                .map(|(name, quota)| GpuQuota {
                    name: name.to_string(),
                    quota: *quota,
                })
                .collect(),
        }
    }

    const GIB: i64 = 1024 * 1024 * 1024;

    #[test]
    fn capacity_above_quota_is_active() {
        let policy = policy(4, 16, 20, &[("NVIDIA-3080", 1)]);
        let free = ClusterFree {
            cpu: 8,
            memory_bytes: 32 * GIB,
            storage_bytes: 100 * GIB,
        };
        let mut remaining = HashMap::new();
        remaining.insert("NVIDIA-3080".to_string(), 2i64);

        assert_eq!(
            evaluate_policy(&policy, &free, &remaining),
            ProviderStatus::Active
        );
    }

    #[test]
    fn low_cpu_turns_the_verdict_inactive() {
        let policy = policy(4, 16, 20, &[("NVIDIA-3080", 1)]);
        let free = ClusterFree {
            cpu: 2,
            memory_bytes: 32 * GIB,
            storage_bytes: 100 * GIB,
        };
        let mut remaining = HashMap::new();
        remaining.insert("NVIDIA-3080".to_string(), 2i64);

        assert_eq!(
            evaluate_policy(&policy, &free, &remaining),
            ProviderStatus::Inactive
        );
    }

    #[test]
    fn all_zero_policy_is_inactive_regardless_of_capacity() {
        let zero = policy(0, 0, 0, &[("NVIDIA-3080", 0), ("NVIDIA-4090", 0)]);
        let free = ClusterFree {
            cpu: 128,
            memory_bytes: 512 * GIB,
            storage_bytes: 4096 * GIB,
        };
        let mut remaining = HashMap::new();
        remaining.insert("NVIDIA-3080".to_string(), 8i64);
        remaining.insert("NVIDIA-4090".to_string(), 8i64);

        assert_eq!(
            evaluate_policy(&zero, &free, &remaining),
            ProviderStatus::Inactive
        );
        assert_eq!(
            evaluate_policy(&ResourcePolicy::default(), &free, &remaining),
            ProviderStatus::Inactive
        );
    }

    #[test]
    fn gpu_capacity_does_not_waive_base_floors() {
        let policy = policy(64, 16, 20, &[("NVIDIA-3080", 1)]);
        let free = ClusterFree {
            cpu: 8, // below the 64-core floor
            memory_bytes: 32 * GIB,
            storage_bytes: 100 * GIB,
        };
        let mut remaining = HashMap::new();
        remaining.insert("NVIDIA-3080".to_string(), 4i64);

        assert_eq!(
            evaluate_policy(&policy, &free, &remaining),
            ProviderStatus::Inactive
        );
    }

    #[test]
    fn policy_names_match_after_vendor_normalization() {
        let policy = policy(0, 0, 0, &[("Nvidia 3080", 1)]);
        let free = ClusterFree::default();
        let mut remaining = HashMap::new();
        remaining.insert("NVIDIA-3080".to_string(), 2i64);

        assert_eq!(
            evaluate_policy(&policy, &free, &remaining),
            ProviderStatus::Active
        );
    }

    // =========================================================================
    // Figures
    // =========================================================================

    #[test]
    fn node_figures_report_total_used_free() {
        let node = node_named("worker-1", "16", "64Gi", "500Gi");
        let usage = NodeUsage {
            cpu: 4,
            memory: 16 * GIB,
            storage: 100 * GIB,
            gpu: HashMap::new(),
        };

        let resource = node_figures(&node, &usage);
        assert_eq!(resource.machine_id, "worker-1-machine");
        assert_eq!(resource.model, "amd64");
        assert_eq!(resource.cpu.total, "16");
        assert_eq!(resource.cpu.free, "12");
        assert_eq!(resource.vcpu, resource.cpu);
        assert_eq!(resource.memory.total, "64.00 GiB");
        assert_eq!(resource.memory.used, "16.00 GiB");
        assert_eq!(resource.memory.free, "48.00 GiB");
        assert_eq!(resource.storage.free, "400.00 GiB");
    }
}
