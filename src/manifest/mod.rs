//! Versioned deployment manifest parsing
//!
//! Multi-service workloads arrive as a compose-like YAML document. The parser
//! decodes the versioned manifest into an ordered list of [`ContainerSpec`],
//! resolving inter-service dependencies: a service named in another service's
//! `depends` list is synthesized as a dependency container (carrying its
//! declared ready-command for the readiness probe) nested under the dependent
//! spec, and is excluded from the top-level result, so a container that
//! exists only to back another service is never independently scheduled.
//!
//! Only manifest version `2.0` is supported. Any other version is a
//! [`Error::Format`] naming the version, and the caller must not attempt
//! partial compilation.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{ContainerPort, EnvVar};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Deserialize;

use crate::{Error, Result};

// =============================================================================
// Parsed Output
// =============================================================================

/// One deployable unit produced by the parser (or constructed directly for
/// single-container Dockerfile workloads). Immutable once built.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerSpec {
    /// Service name the spec was declared under
    pub name: String,
    /// Replica count requested by the deployment unit
    pub count: i32,
    /// Container image reference
    pub image: String,
    /// Entry point override
    pub command: Vec<String>,
    /// Arguments to the entry point
    pub args: Vec<String>,
    /// Environment variables declared by the manifest
    pub env: Vec<EnvVar>,
    /// Exposed container ports; may be empty for dependency-driven services
    pub ports: Vec<ContainerPort>,
    /// Resource limits resolved from the unit's compute profile
    pub resource_limits: BTreeMap<String, Quantity>,
    /// Optional config file mounted into the container via a ConfigMap
    pub config_file: Option<ConfigFileMount>,
    /// Model assets fetched into the running container post-start
    pub models: Vec<ModelAsset>,
    /// Readiness command, set when this spec backs another service
    pub ready_cmd: Vec<String>,
    /// Dependency containers that must become ready before this one
    pub depends: Vec<ContainerSpec>,
}

/// A config file to project into the container filesystem
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigFileMount {
    /// File name relative to the manifest directory
    pub name: String,
    /// Absolute mount path inside the container
    pub path: String,
}

/// A model asset to fetch after the container starts
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ModelAsset {
    /// Source URL
    pub url: String,
    /// Target directory inside the container
    pub dir: String,
    /// Target file name
    pub name: String,
}

/// Parse manifest bytes into the ordered container spec list.
pub fn parse(bytes: &[u8]) -> Result<Vec<ContainerSpec>> {
    let version = detect_version(bytes)?;
    match version.as_str() {
        "2.0" => {
            let manifest: ManifestV2 = serde_yaml::from_slice(bytes)
                .map_err(|e| Error::format(format!("failed to parse manifest: {}", e)))?;
            manifest.into_container_specs()
        }
        other => Err(Error::format(format!(
            "unsupported manifest version: {}",
            other
        ))),
    }
}

fn detect_version(bytes: &[u8]) -> Result<String> {
    #[derive(Deserialize)]
    struct VersionProbe {
        #[serde(default)]
        version: String,
    }
    let probe: VersionProbe = serde_yaml::from_slice(bytes)
        .map_err(|e| Error::format(format!("manifest is not valid YAML: {}", e)))?;
    Ok(probe.version)
}

// =============================================================================
// Manifest Schema (version 2.0)
// =============================================================================

#[derive(Debug, Deserialize)]
struct ManifestV2 {
    #[allow(dead_code)]
    version: String,
    #[serde(default)]
    services: BTreeMap<String, ServiceDecl>,
    #[serde(default)]
    profiles: Profiles,
    #[serde(default)]
    deployment: BTreeMap<String, DeploymentDecl>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceDecl {
    image: String,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    expose: Vec<ExposeDecl>,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default)]
    ready: Vec<String>,
    #[serde(default)]
    models: Vec<ModelAsset>,
    #[serde(default)]
    config_file: Option<ConfigFileDecl>,
}

#[derive(Debug, Deserialize)]
struct ExposeDecl {
    port: i32,
}

#[derive(Debug, Deserialize)]
struct ConfigFileDecl {
    name: String,
    path: String,
}

#[derive(Debug, Default, Deserialize)]
struct Profiles {
    #[serde(default)]
    compute: BTreeMap<String, ComputeProfile>,
}

#[derive(Debug, Deserialize)]
struct ComputeProfile {
    #[serde(default)]
    resources: ProfileResources,
}

#[derive(Debug, Default, Deserialize)]
struct ProfileResources {
    #[serde(default)]
    cpu: UnitsDecl,
    #[serde(default)]
    memory: SizeDecl,
    #[serde(default)]
    storage: SizeDecl,
}

#[derive(Debug, Default, Deserialize)]
struct UnitsDecl {
    #[serde(default)]
    units: String,
}

#[derive(Debug, Default, Deserialize)]
struct SizeDecl {
    #[serde(default)]
    size: String,
}

#[derive(Debug, Deserialize)]
struct DeploymentDecl {
    #[serde(default)]
    profile: String,
    #[serde(default = "default_count")]
    count: i32,
}

fn default_count() -> i32 {
    1
}

impl ManifestV2 {
    fn into_container_specs(self) -> Result<Vec<ContainerSpec>> {
        if self.services.is_empty() {
            return Err(Error::format("at least one service must be defined"));
        }

        // Names consumed as someone's dependency never appear top-level,
        // even when they also carry their own deployment entry.
        let dependency_names: BTreeSet<&String> = self
            .services
            .values()
            .flat_map(|s| s.depends.iter())
            .collect();

        let mut specs = Vec::new();
        for (name, unit) in &self.deployment {
            if dependency_names.contains(name) {
                continue;
            }
            let service = self.services.get(name).ok_or_else(|| {
                Error::format(format!(
                    "deployment unit {:?} names a service that is not declared",
                    name
                ))
            })?;

            let mut spec = self.build_spec(name, service, Some(unit))?;
            for dep_name in &service.depends {
                let dep_service = self.services.get(dep_name).ok_or_else(|| {
                    Error::format(format!(
                        "service {:?} depends on undeclared service {:?}",
                        name, dep_name
                    ))
                })?;
                spec.depends.push(self.build_spec(dep_name, dep_service, None)?);
            }
            specs.push(spec);
        }
        Ok(specs)
    }

    fn build_spec(
        &self,
        name: &str,
        service: &ServiceDecl,
        unit: Option<&DeploymentDecl>,
    ) -> Result<ContainerSpec> {
        let env = service
            .env
            .iter()
            .map(|declared| {
                let (key, value) = declared.trim().split_once('=').ok_or_else(|| {
                    Error::format(format!(
                        "service {:?} env entry {:?} is not KEY=VALUE",
                        name, declared
                    ))
                })?;
                Ok(EnvVar {
                    name: key.to_string(),
                    value: Some(value.to_string()),
                    ..Default::default()
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let ports = service
            .expose
            .iter()
            .map(|e| ContainerPort {
                container_port: e.port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect();

        let resource_limits = unit
            .map(|u| self.profile_limits(&u.profile))
            .unwrap_or_default();

        Ok(ContainerSpec {
            name: name.to_string(),
            count: unit.map(|u| u.count).unwrap_or(1),
            image: service.image.clone(),
            command: service.command.clone(),
            args: service.args.clone(),
            env,
            ports,
            resource_limits,
            config_file: service.config_file.as_ref().map(|c| ConfigFileMount {
                name: c.name.clone(),
                path: c.path.clone(),
            }),
            models: service.models.clone(),
            ready_cmd: service.ready.clone(),
            depends: Vec::new(),
        })
    }

    fn profile_limits(&self, profile: &str) -> BTreeMap<String, Quantity> {
        let mut limits = BTreeMap::new();
        if let Some(compute) = self.profiles.compute.get(profile) {
            if !compute.resources.cpu.units.is_empty() {
                limits.insert(
                    "cpu".to_string(),
                    Quantity(compute.resources.cpu.units.clone()),
                );
            }
            if !compute.resources.memory.size.is_empty() {
                limits.insert(
                    "memory".to_string(),
                    Quantity(compute.resources.memory.size.clone()),
                );
            }
            if !compute.resources.storage.size.is_empty() {
                limits.insert(
                    "ephemeral-storage".to_string(),
                    Quantity(compute.resources.storage.size.clone()),
                );
            }
        }
        limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
version: "2.0"
services:
  app:
    image: registry.example/app:1.4
    command: ["node"]
    args: ["server.js"]
    env:
      - NODE_ENV=production
      - NEXTAUTH_URL=http://localhost:3000
    expose:
      - port: 3000
    depends: ["db"]
  db:
    image: postgres:15
    env:
      - POSTGRES_PASSWORD=secret
    expose:
      - port: 5432
    ready: ["pg_isready", "-U", "postgres"]
profiles:
  compute:
    small:
      resources:
        cpu:
          units: "2"
        memory:
          size: 4Gi
        storage:
          size: 10Gi
deployment:
  app:
    profile: small
    count: 1
"#;

    #[test]
    fn dependency_is_nested_not_top_level() {
        let specs = parse(MANIFEST.as_bytes()).unwrap();
        assert_eq!(specs.len(), 1);

        let app = &specs[0];
        assert_eq!(app.name, "app");
        assert_eq!(app.depends.len(), 1);

        let db = &app.depends[0];
        assert_eq!(db.name, "db");
        assert_eq!(db.image, "postgres:15");
        assert_eq!(db.ready_cmd, vec!["pg_isready", "-U", "postgres"]);
        assert_eq!(db.ports[0].container_port, 5432);

        // db never appears as its own top-level unit
        assert!(!specs.iter().any(|s| s.name == "db"));
    }

    #[test]
    fn primary_spec_carries_profile_limits_and_env() {
        let specs = parse(MANIFEST.as_bytes()).unwrap();
        let app = &specs[0];
        assert_eq!(app.count, 1);
        assert_eq!(app.command, vec!["node"]);
        assert_eq!(app.resource_limits.get("cpu").unwrap().0, "2");
        assert_eq!(app.resource_limits.get("memory").unwrap().0, "4Gi");
        assert_eq!(
            app.resource_limits.get("ephemeral-storage").unwrap().0,
            "10Gi"
        );
        assert!(app
            .env
            .iter()
            .any(|e| e.name == "NODE_ENV" && e.value.as_deref() == Some("production")));
    }

    #[test]
    fn unsupported_version_names_the_version() {
        let manifest = "version: \"3.1\"\nservices:\n  app:\n    image: x\n";
        let err = parse(manifest.as_bytes()).unwrap_err();
        match err {
            Error::Format(msg) => assert!(msg.contains("3.1"), "message was {:?}", msg),
            other => panic!("expected Format error, got {:?}", other),
        }
    }

    #[test]
    fn service_without_ports_or_dependencies_is_valid() {
        let manifest = r#"
version: "2.0"
services:
  worker:
    image: worker:latest
deployment:
  worker:
    count: 2
"#;
        let specs = parse(manifest.as_bytes()).unwrap();
        assert_eq!(specs.len(), 1);
        assert!(specs[0].ports.is_empty());
        assert!(specs[0].depends.is_empty());
        assert_eq!(specs[0].count, 2);
    }

    #[test]
    fn missing_services_section_is_a_format_error() {
        let manifest = "version: \"2.0\"\ndeployment:\n  app:\n    count: 1\n";
        assert!(parse(manifest.as_bytes()).is_err());
    }

    #[test]
    fn malformed_env_entry_is_a_format_error() {
        let manifest = r#"
version: "2.0"
services:
  app:
    image: x
    env: ["NOT_A_PAIR"]
deployment:
  app:
    count: 1
"#;
        let err = parse(manifest.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("KEY=VALUE"));
    }

    #[test]
    fn unit_deployed_only_as_dependency_is_excluded() {
        // db has its own deployment entry but is also a dependency of app
        let manifest = r#"
version: "2.0"
services:
  app:
    image: app:1
    depends: ["db"]
  db:
    image: postgres:15
deployment:
  app:
    count: 1
  db:
    count: 1
"#;
        let specs = parse(manifest.as_bytes()).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "app");
    }
}
