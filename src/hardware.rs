//! Hardware-tier description parsing
//!
//! A hardware tier is a named bundle of CPU/memory/GPU amounts offered to
//! requesters, resolved from the human-readable description string the
//! marketplace sends with each job, e.g.
//! `"Nvidia 3080·CPU 8 vCPU·Memory 32 GiB"`. The tier is immutable and is
//! looked up once at job acceptance time; the compiler derives container
//! resource requirements and the GPU node-selector label from it.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

use crate::accountant::GPU_RESOURCE_NAME;
use crate::{Error, Result};

/// Whether a tier is CPU-only or carries a GPU
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    /// CPU-only workload
    #[serde(rename = "CPU")]
    Cpu,
    /// GPU workload
    #[serde(rename = "GPU")]
    Gpu,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::Cpu => write!(f, "CPU"),
            TaskType::Gpu => write!(f, "GPU"),
        }
    }
}

/// A resource amount with its unit, as declared by the tier description
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Amount {
    /// Number of units
    pub quantity: i64,
    /// Unit name (`vCPU`, `Gi`, ...)
    pub unit: String,
}

/// A resolved hardware tier
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HardwareTier {
    /// CPU cores
    pub cpu: Amount,
    /// Memory
    pub memory: Amount,
    /// Ephemeral storage
    pub storage: Amount,
    /// GPU units (0 or 1) of `gpu_model`
    pub gpu_quantity: i64,
    /// GPU model name, empty for CPU tiers
    pub gpu_model: String,
}

/// Ephemeral storage granted to every workload, independent of the tier
const STORAGE_GI: i64 = 30;

impl HardwareTier {
    /// Parse a tier from its description string.
    ///
    /// The description is `·`-separated: GPU model (or `CPU ...`), CPU count,
    /// memory size. A first segment containing `CPU` yields a CPU-only tier;
    /// anything else is taken as a GPU model name with quantity 1, with the
    /// `Nvidia` vendor prefix normalized to `NVIDIA`.
    pub fn parse(description: &str) -> Result<Self> {
        let segments: Vec<&str> = description.split('·').collect();
        if segments.len() < 3 {
            return Err(Error::config(format!(
                "malformed hardware description: {:?}",
                description
            )));
        }

        let (gpu_quantity, gpu_model) = if segments[0].contains("CPU") {
            (0, String::new())
        } else {
            (1, segments[0].trim().replace("Nvidia", "NVIDIA"))
        };

        let cpu = parse_amount(segments[1], "CPU")?;
        let mut memory = parse_amount(segments[2], "Memory")?;
        // "GiB" on the wire, "Gi" as a Kubernetes quantity suffix
        memory.unit = memory.unit.replace('B', "");

        Ok(Self {
            cpu,
            memory,
            storage: Amount {
                quantity: STORAGE_GI,
                unit: "Gi".to_string(),
            },
            gpu_quantity,
            gpu_model,
        })
    }

    /// The task type this tier implies
    pub fn task_type(&self) -> TaskType {
        if self.gpu_quantity > 0 {
            TaskType::Gpu
        } else {
            TaskType::Cpu
        }
    }

    /// Node-selector labels for this tier.
    ///
    /// GPU tiers select on the model label the accountant's label-sync pass
    /// applies to nodes (`<model-with-hyphens>: "true"`); CPU tiers return an
    /// empty selector and schedule anywhere.
    pub fn node_selector(&self) -> BTreeMap<String, String> {
        gpu_node_selector(&self.gpu_model)
    }

    /// Container resource requirements for this tier.
    ///
    /// Requests and limits are set identically; the accountant sums requests,
    /// so what a workload asks for is exactly what it is accounted as using.
    pub fn resource_requirements(&self) -> ResourceRequirements {
        let mut resources: BTreeMap<String, Quantity> = BTreeMap::new();
        resources.insert("cpu".to_string(), Quantity(self.cpu.quantity.to_string()));
        resources.insert(
            "memory".to_string(),
            Quantity(format!("{}{}", self.memory.quantity, self.memory.unit)),
        );
        resources.insert(
            "ephemeral-storage".to_string(),
            Quantity(format!("{}{}", self.storage.quantity, self.storage.unit)),
        );
        resources.insert(
            GPU_RESOURCE_NAME.to_string(),
            Quantity(self.gpu_quantity.to_string()),
        );

        ResourceRequirements {
            requests: Some(resources.clone()),
            limits: Some(resources),
            ..Default::default()
        }
    }
}

/// Parse one `"<label> <count> <unit>"` segment
fn parse_amount(segment: &str, label: &str) -> Result<Amount> {
    let parts: Vec<&str> = segment.trim().split_whitespace().collect();
    if parts.len() < 3 {
        return Err(Error::config(format!(
            "malformed {} segment in hardware description: {:?}",
            label, segment
        )));
    }
    let quantity = parts[1].parse::<i64>().map_err(|_| {
        Error::config(format!(
            "non-numeric {} quantity in hardware description: {:?}",
            label, parts[1]
        ))
    })?;
    Ok(Amount {
        quantity,
        unit: parts[2].to_string(),
    })
}

/// Build the node-selector map for a GPU model name.
///
/// Spaces become hyphens to form a legal label key; an empty model yields an
/// empty selector.
pub fn gpu_node_selector(model: &str) -> BTreeMap<String, String> {
    let mut selector = BTreeMap::new();
    if !model.is_empty() {
        selector.insert(model.replace(' ', "-"), "true".to_string());
    }
    selector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_description_yields_gpu_task_with_one_unit() {
        let tier = HardwareTier::parse("Nvidia 3080·CPU 8 vCPU·Memory 32 GiB").unwrap();
        assert_eq!(tier.task_type(), TaskType::Gpu);
        assert_eq!(tier.gpu_quantity, 1);
        assert_eq!(tier.gpu_model, "NVIDIA 3080");
        assert_eq!(tier.cpu.quantity, 8);
        assert_eq!(tier.cpu.unit, "vCPU");
        assert_eq!(tier.memory.quantity, 32);
        assert_eq!(tier.memory.unit, "Gi");
    }

    #[test]
    fn cpu_description_yields_cpu_task_with_no_gpu() {
        let tier = HardwareTier::parse("CPU only·CPU 4 vCPU·Memory 16 GiB").unwrap();
        assert_eq!(tier.task_type(), TaskType::Cpu);
        assert_eq!(tier.gpu_quantity, 0);
        assert!(tier.gpu_model.is_empty());
        assert!(tier.node_selector().is_empty());
    }

    #[test]
    fn gpu_selector_replaces_spaces_with_hyphens() {
        let tier = HardwareTier::parse("Nvidia 3080 Ti·CPU 8 vCPU·Memory 32 GiB").unwrap();
        let selector = tier.node_selector();
        assert_eq!(selector.get("NVIDIA-3080-Ti"), Some(&"true".to_string()));
    }

    #[test]
    fn requirements_match_requests_and_limits() {
        let tier = HardwareTier::parse("Nvidia 3080·CPU 8 vCPU·Memory 32 GiB").unwrap();
        let reqs = tier.resource_requirements();
        let requests = reqs.requests.unwrap();
        let limits = reqs.limits.unwrap();
        assert_eq!(requests, limits);
        assert_eq!(requests.get("cpu").unwrap().0, "8");
        assert_eq!(requests.get("memory").unwrap().0, "32Gi");
        assert_eq!(requests.get("ephemeral-storage").unwrap().0, "30Gi");
        assert_eq!(requests.get(GPU_RESOURCE_NAME).unwrap().0, "1");
    }

    #[test]
    fn malformed_description_is_a_configuration_error() {
        assert!(HardwareTier::parse("Nvidia 3080").is_err());
        assert!(HardwareTier::parse("Nvidia 3080·CPU eight vCPU·Memory 32 GiB").is_err());
    }
}
