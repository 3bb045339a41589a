//! Typed wrapper over the Kubernetes API
//!
//! All cluster access goes through [`ClusterClient`]: namespace, deployment,
//! service, ingress and configmap CRUD, pod queries, node labeling, GPU
//! exporter log collection, and full workload teardown. Objects are built by
//! the compiler; this module only applies, queries, and deletes them, always
//! scoped by the `stratos.dev/workload=<uuid>` label.

use std::collections::HashMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result, WORKLOAD_LABEL};

/// Namespace the GPU resource exporter daemonset runs in
const EXPORTER_NAMESPACE: &str = "kube-system";

/// Label selector matching the GPU resource exporter pods
const EXPORTER_SELECTOR: &str = "app=resource-exporter";

/// Steps and interval for the teardown settling wait
const TEARDOWN_WAIT_STEPS: u32 = 20;
const TEARDOWN_WAIT_INTERVAL: Duration = Duration::from_secs(3);

/// Steps and interval for pod readiness polling
const READY_WAIT_STEPS: u32 = 120;
const READY_WAIT_INTERVAL: Duration = Duration::from_secs(10);

/// The label selector string for a workload id
pub fn workload_selector(space_uuid: &str) -> String {
    format!("{}={}", WORKLOAD_LABEL, space_uuid)
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Handle to the cluster API. Cheap to clone.
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    /// Wrap an existing kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster config or the local kubeconfig
    pub async fn connect() -> Result<Self> {
        Ok(Self {
            client: Client::try_default().await?,
        })
    }

    // =========================================================================
    // Namespaces
    // =========================================================================

    /// Create the namespace if it does not exist.
    ///
    /// Idempotent: an existing namespace (or a creation race lost to another
    /// deploy) is not an error. Any other failure is fatal to the caller's
    /// deploy.
    pub async fn ensure_namespace(&self, namespace: &Namespace) -> Result<()> {
        let name = namespace
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::deploy("namespace object has no name"))?;
        let api: Api<Namespace> = Api::all(self.client.clone());

        match api.get(name).await {
            Ok(_) => return Ok(()),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }

        match api.create(&PostParams::default(), namespace).await {
            Ok(created) => {
                info!(namespace = %created.metadata.name.as_deref().unwrap_or(name), "created namespace");
                Ok(())
            }
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List all namespace names in the cluster
    pub async fn list_namespaces(&self) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    /// Delete a namespace outright
    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Workload Objects
    // =========================================================================

    /// Create a Deployment in the namespace
    pub async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), deployment).await?)
    }

    /// Delete a Deployment by name, tolerating absence
    pub async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a Deployment with this name currently exists
    pub async fn deployment_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Images referenced by a Deployment's pod template
    pub async fn deployment_images(&self, namespace: &str, name: &str) -> Result<Vec<String>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = match api.get(name).await {
            Ok(d) => d,
            Err(e) if is_not_found(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let containers = deployment
            .spec
            .and_then(|s| s.template.spec)
            .map(|s| s.containers)
            .unwrap_or_default();
        Ok(containers.into_iter().map(|c| c.image.unwrap_or_default()).collect())
    }

    /// Delete all ReplicaSets labeled with the workload id
    pub async fn delete_replica_sets(&self, namespace: &str, space_uuid: &str) -> Result<()> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&workload_selector(space_uuid));
        api.delete_collection(&DeleteParams::default(), &lp).await?;
        Ok(())
    }

    /// Delete all Pods labeled with the workload id
    pub async fn delete_pods(&self, namespace: &str, space_uuid: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&workload_selector(space_uuid));
        api.delete_collection(&DeleteParams::default(), &lp).await?;
        Ok(())
    }

    /// Create a Service in the namespace
    pub async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), service).await?)
    }

    /// Delete a Service by name, tolerating absence
    pub async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Create an Ingress in the namespace
    pub async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), ingress).await?)
    }

    /// Delete an Ingress by name, tolerating absence
    pub async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Create a ConfigMap in the namespace
    pub async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), config_map).await?)
    }

    // =========================================================================
    // Pods and Nodes
    // =========================================================================

    /// Whether any pods exist in the namespace, optionally filtered by a
    /// workload id
    pub async fn has_pods(&self, namespace: &str, space_uuid: Option<&str>) -> Result<bool> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = match space_uuid {
            Some(id) => ListParams::default().labels(&workload_selector(id)),
            None => ListParams::default(),
        };
        let list = api.list(&lp).await?;
        Ok(!list.items.is_empty())
    }

    /// Phase of the first pod backing a workload, if one exists
    pub async fn pod_phase(&self, namespace: &str, space_uuid: &str) -> Result<Option<String>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&workload_selector(space_uuid));
        let list = api.list(&lp).await?;
        Ok(list
            .items
            .into_iter()
            .next()
            .and_then(|p| p.status)
            .and_then(|s| s.phase))
    }

    /// All cluster nodes
    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    /// All Running-phase pods across the cluster
    pub async fn running_pods(&self) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default().fields("status.phase=Running");
        Ok(api.list(&lp).await?.items)
    }

    /// Apply a GPU model label to a node, retrying on update conflicts.
    pub async fn label_node(&self, node_name: &str, label_key: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let key = label_key.replace(' ', "-");

        retry_with_backoff(&RetryConfig::with_max_attempts(4), "label_node", || {
            let api = api.clone();
            let key = key.clone();
            async move {
                let mut node = api.get(node_name).await?;
                node.metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .insert(key, "true".to_string());
                node.metadata.managed_fields = None;
                api.replace(node_name, &PostParams::default(), &node)
                    .await?;
                Ok::<_, kube::Error>(())
            }
        })
        .await?;
        Ok(())
    }

    // =========================================================================
    // GPU Telemetry
    // =========================================================================

    /// Collect the last log line of every resource-exporter pod, keyed by the
    /// node the pod runs on.
    ///
    /// One pod's unreadable log degrades that node's GPU visibility only; it
    /// is logged and skipped, never fatal to the pass.
    pub async fn gpu_telemetry_lines(&self) -> Result<HashMap<String, String>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), EXPORTER_NAMESPACE);
        let lp = ListParams::default().labels(EXPORTER_SELECTOR);
        let pods = api.list(&lp).await?;

        let log_params = LogParams {
            tail_lines: Some(1),
            ..Default::default()
        };

        let mut lines = HashMap::new();
        for pod in pods.items {
            let pod_name = pod.metadata.name.clone().unwrap_or_default();
            let node_name = pod.spec.as_ref().and_then(|s| s.node_name.clone());
            let Some(node_name) = node_name else {
                continue;
            };
            match api.logs(&pod_name, &log_params).await {
                Ok(line) => {
                    lines.insert(node_name, line);
                }
                Err(e) => {
                    warn!(
                        pod = %pod_name,
                        node = %node_name,
                        error = %e,
                        "failed to read resource-exporter log; node treated as GPU-free"
                    );
                }
            }
        }
        Ok(lines)
    }

    // =========================================================================
    // Exec and Readiness
    // =========================================================================

    /// Run a command inside a workload container.
    pub async fn exec_in_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        command: Vec<String>,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default().stdout(true).stderr(true);
        let attached = api.exec(pod_name, command, &params).await?;
        attached
            .join()
            .await
            .map_err(|e| Error::deploy(format!("pod exec did not complete: {}", e)))?;
        Ok(())
    }

    /// Wait until the workload answers on its service address and a backing
    /// pod exists; returns the pod name.
    ///
    /// Bounded at 120 steps of 10 seconds; exhausting the budget is fatal to
    /// the deploy (the watchdog reclaims whatever was created).
    pub async fn wait_for_workload_ready(
        &self,
        http: &reqwest::Client,
        namespace: &str,
        space_uuid: &str,
        probe_url: &str,
    ) -> Result<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&workload_selector(space_uuid));

        retry_with_backoff(
            &RetryConfig::fixed(READY_WAIT_STEPS, READY_WAIT_INTERVAL),
            "wait_for_workload_ready",
            || {
                let api = api.clone();
                let lp = lp.clone();
                async move {
                    http.get(probe_url)
                        .send()
                        .await
                        .map_err(|e| Error::deploy(format!("workload not answering yet: {}", e)))?;
                    let pods = api.list(&lp).await?;
                    pods.items
                        .into_iter()
                        .next()
                        .and_then(|p| p.metadata.name)
                        .ok_or_else(|| Error::deploy("no pod scheduled yet"))
                }
            },
        )
        .await
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Tear down every cluster object belonging to a workload: ingress,
    /// service, deployment, replica sets, pods. Waits (bounded) until the
    /// pods are gone so a re-deploy of the same workload id never races its
    /// predecessor.
    pub async fn teardown_workload(&self, namespace: &str, space_uuid: &str) -> Result<()> {
        let ingress_name = format!("{}{}", crate::INGRESS_NAME_PREFIX, space_uuid);
        let service_name = format!("{}{}", crate::SERVICE_NAME_PREFIX, space_uuid);
        let deploy_name = format!("{}{}", crate::DEPLOY_NAME_PREFIX, space_uuid);

        self.delete_ingress(namespace, &ingress_name).await?;
        self.delete_service(namespace, &service_name).await?;
        self.delete_deployment(namespace, &deploy_name).await?;
        self.delete_replica_sets(namespace, space_uuid).await?;
        self.delete_pods(namespace, space_uuid).await?;

        let settled = retry_with_backoff(
            &RetryConfig::fixed(TEARDOWN_WAIT_STEPS, TEARDOWN_WAIT_INTERVAL),
            "teardown_settle",
            || async {
                match self.has_pods(namespace, Some(space_uuid)).await {
                    Ok(false) => Ok(()),
                    Ok(true) => Err(Error::deploy("pods still terminating")),
                    Err(e) => Err(e),
                }
            },
        )
        .await;

        match settled {
            Ok(()) => {
                info!(namespace = %namespace, space_uuid = %space_uuid, "workload teardown finished");
            }
            Err(e) => {
                // Deletion was issued; lingering pods are the reclaimer's problem
                debug!(namespace = %namespace, space_uuid = %space_uuid, error = %e, "teardown settle wait exhausted");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_is_label_equals_uuid() {
        assert_eq!(
            workload_selector("9b2459b1"),
            "stratos.dev/workload=9b2459b1"
        );
    }

    #[test]
    fn not_found_detection_matches_api_code() {
        let err = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "not found".into(),
            reason: "NotFound".into(),
            code: 404,
        });
        assert!(is_not_found(&err));
        assert!(!is_conflict(&err));

        let err = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "exists".into(),
            reason: "AlreadyExists".into(),
            code: 409,
        });
        assert!(is_conflict(&err));
        assert!(!is_not_found(&err));
    }
}
