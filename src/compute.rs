//! Worker pods for operations
//!
//! An adapter's `init` returns a [`ComputeSpec`]; the engine hands it to a
//! [`ComputeProvisioner`], which makes sure exactly one worker exists for
//! the operation and reports when it is ready to accept calls.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HTTPGetAction,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, Probe, ResourceRequirements, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::adapter::ObjectKey;
use crate::crd::ContainerSpec;
use crate::{Error, Result, MANAGED_BY_LABEL, MANAGED_BY_VALUE};

/// Name of the data volume inside the worker pod
const DATA_VOLUME_NAME: &str = "data";

/// Where a worker's data volume comes from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataSource {
    /// An existing volume claim, by name
    Claim(String),
    /// Scratch space that lives as long as the pod
    Scratch,
}

impl DataSource {
    /// Claim name, if the data lives on a claim
    pub fn claim_name(&self) -> Option<&str> {
        match self {
            Self::Claim(name) => Some(name),
            Self::Scratch => None,
        }
    }
}

/// Volume the worker mounts
#[derive(Clone, Debug, PartialEq)]
pub struct ComputeVolume {
    /// Where the volume is mounted in the worker container
    pub mount_path: String,
    /// Source of the volume (normally a claim)
    pub source: DataSource,
    /// Mount read-only
    pub read_only: bool,
    /// Make the mount group-writable before the agent starts
    pub update_permissions: bool,
}

/// Description of the worker unit an operation needs
///
/// Produced fresh by every `init` call and never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct ComputeSpec {
    /// Data volume
    pub volume: ComputeVolume,
    /// Container resource limits
    pub container: ContainerSpec,
    /// Labels applied to the worker pod
    pub labels: BTreeMap<String, String>,
    /// Owner of the worker; deleting it removes the worker
    pub owner: Option<OwnerReference>,
}

/// Readiness of an operation's worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// No worker pod exists
    Absent,
    /// Worker still starting
    Pending,
    /// Worker running and passing its readiness probe
    Ready {
        /// Address the worker's agent answers on (the pod IP)
        endpoint: String,
    },
    /// Worker terminated; carries the termination summary
    Terminated(String),
}

/// Result of [`ComputeProvisioner::ensure`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// The worker already existed
    Existing,
    /// The worker was created by this call
    Created,
}

/// Creates workers and reports their readiness
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComputeProvisioner: Send + Sync {
    /// Create the worker for `key` if it does not exist yet
    async fn ensure(&self, key: &ObjectKey, spec: &ComputeSpec) -> Result<WorkerOutcome>;

    /// Report the worker's readiness
    async fn readiness(&self, key: &ObjectKey) -> Result<Readiness>;
}

/// Name of the worker pod for an operation
pub fn worker_name(operation: &str) -> String {
    format!("{operation}-worker")
}

/// Settings for worker pods
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComputeConfig {
    /// Image running the agent
    pub agent_image: String,
    /// Port the agent listens on
    pub agent_port: u16,
    /// Image used to fix volume permissions
    pub permissions_image: String,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            agent_image: "ghcr.io/oneshot-dev/agent:latest".to_string(),
            agent_port: crate::DEFAULT_AGENT_PORT,
            permissions_image: "busybox:1.36".to_string(),
        }
    }
}

/// Build the worker pod for an operation
pub fn build_worker_pod(key: &ObjectKey, spec: &ComputeSpec, config: &ComputeConfig) -> Pod {
    let mut labels = spec.labels.clone();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

    let mut limits = BTreeMap::new();
    if let Some(cpu) = &spec.container.cpu {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &spec.container.memory {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }

    let mount = VolumeMount {
        name: DATA_VOLUME_NAME.to_string(),
        mount_path: spec.volume.mount_path.clone(),
        read_only: Some(spec.volume.read_only),
        ..Default::default()
    };

    let agent = Container {
        name: "agent".to_string(),
        image: Some(config.agent_image.clone()),
        env: Some(vec![
            EnvVar {
                name: "ONESHOT_OPERATION".to_string(),
                value: Some(key.name.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "ONESHOT_DATA_DIR".to_string(),
                value: Some(spec.volume.mount_path.clone()),
                ..Default::default()
            },
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("agent".to_string()),
            container_port: i32::from(config.agent_port),
            ..Default::default()
        }]),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/health".to_string()),
                port: IntOrString::Int(i32::from(config.agent_port)),
                ..Default::default()
            }),
            period_seconds: Some(5),
            ..Default::default()
        }),
        resources: Some(ResourceRequirements {
            limits: Some(limits.clone()),
            requests: Some(limits),
            ..Default::default()
        }),
        volume_mounts: Some(vec![mount.clone()]),
        ..Default::default()
    };

    let init_containers = spec.volume.update_permissions.then(|| {
        vec![Container {
            name: "volume-permissions".to_string(),
            image: Some(config.permissions_image.clone()),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("chmod -R g+rwX {}", spec.volume.mount_path),
            ]),
            volume_mounts: Some(vec![VolumeMount {
                read_only: Some(false),
                ..mount
            }]),
            ..Default::default()
        }]
    });

    Pod {
        metadata: ObjectMeta {
            name: Some(worker_name(&key.name)),
            namespace: Some(key.namespace.clone()),
            labels: Some(labels),
            owner_references: spec.owner.clone().map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![agent],
            init_containers,
            restart_policy: Some("Never".to_string()),
            volumes: Some(vec![data_volume(&spec.volume)]),
            ..Default::default()
        }),
        status: None,
    }
}

fn data_volume(volume: &ComputeVolume) -> Volume {
    match &volume.source {
        DataSource::Claim(claim) => Volume {
            name: DATA_VOLUME_NAME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.clone(),
                read_only: Some(volume.read_only),
            }),
            ..Default::default()
        },
        DataSource::Scratch => Volume {
            name: DATA_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    }
}

/// Derive readiness from an observed pod
pub fn pod_readiness(pod: &Pod) -> Readiness {
    let Some(status) = pod.status.as_ref() else {
        return Readiness::Pending;
    };

    match status.phase.as_deref() {
        Some("Failed") | Some("Succeeded") => {
            let detail = status
                .message
                .clone()
                .or_else(|| status.reason.clone())
                .unwrap_or_else(|| "agent exited".to_string());
            Readiness::Terminated(format!(
                "phase {}: {}",
                status.phase.as_deref().unwrap_or_default(),
                detail
            ))
        }
        Some("Running") => {
            let ready = status
                .conditions
                .as_ref()
                .map(|conds| {
                    conds
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
                })
                .unwrap_or(false);
            match (ready, status.pod_ip.as_deref()) {
                (true, Some(ip)) if !ip.is_empty() => Readiness::Ready {
                    endpoint: ip.to_string(),
                },
                _ => Readiness::Pending,
            }
        }
        _ => Readiness::Pending,
    }
}

/// Kube-backed provisioner creating one bare pod per operation
pub struct PodProvisioner {
    client: Client,
    config: ComputeConfig,
}

impl PodProvisioner {
    /// Create a provisioner using the given client
    pub fn new(client: Client, config: ComputeConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl ComputeProvisioner for PodProvisioner {
    async fn ensure(&self, key: &ObjectKey, spec: &ComputeSpec) -> Result<WorkerOutcome> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &key.namespace);
        let name = worker_name(&key.name);

        if api.get_opt(&name).await?.is_some() {
            debug!(operation = %key, pod = %name, "worker already exists");
            return Ok(WorkerOutcome::Existing);
        }

        let pod = build_worker_pod(key, spec, &self.config);
        match api.create(&PostParams::default(), &pod).await {
            Ok(_) => {
                info!(operation = %key, pod = %name, "created worker");
                Ok(WorkerOutcome::Created)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(operation = %key, pod = %name, "worker created concurrently");
                Ok(WorkerOutcome::Existing)
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    async fn readiness(&self, key: &ObjectKey) -> Result<Readiness> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api
            .get_opt(&worker_name(&key.name))
            .await?
            .as_ref()
            .map(pod_readiness)
            .unwrap_or(Readiness::Absent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    fn sample_spec(update_permissions: bool) -> ComputeSpec {
        ComputeSpec {
            volume: ComputeVolume {
                mount_path: "/opt/oneshot/backups".to_string(),
                source: DataSource::Claim("nightly".to_string()),
                read_only: false,
                update_permissions,
            },
            container: ContainerSpec {
                cpu: Some("500m".to_string()),
                memory: Some("512Mi".to_string()),
            },
            labels: BTreeMap::from([("oneshot.dev/backup".to_string(), "nightly".to_string())]),
            owner: Some(OwnerReference {
                api_version: "oneshot.dev/v1alpha1".to_string(),
                kind: "Backup".to_string(),
                name: "nightly".to_string(),
                uid: "uid-1".to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }),
        }
    }

    fn pod_with(phase: &str, ready: bool) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: Some("10.42.0.17".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn worker_pod_mounts_claim_and_carries_labels() {
        let key = ObjectKey::new("data", "nightly");
        let pod = build_worker_pod(&key, &sample_spec(false), &ComputeConfig::default());

        assert_eq!(pod.metadata.name.as_deref(), Some("nightly-worker"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("data"));
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["oneshot.dev/backup"], "nightly");
        assert_eq!(labels[MANAGED_BY_LABEL], MANAGED_BY_VALUE);
        assert_eq!(pod.metadata.owner_references.as_ref().unwrap()[0].kind, "Backup");

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert!(spec.init_containers.is_none());
        let volume = &spec.volumes.unwrap()[0];
        assert_eq!(
            volume.persistent_volume_claim.as_ref().unwrap().claim_name,
            "nightly"
        );
        let agent = &spec.containers[0];
        let limits = agent.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["cpu"], Quantity("500m".to_string()));
        assert_eq!(
            agent.volume_mounts.as_ref().unwrap()[0].mount_path,
            "/opt/oneshot/backups"
        );
    }

    #[test]
    fn permission_fix_adds_init_container() {
        let key = ObjectKey::new("data", "nightly");
        let pod = build_worker_pod(&key, &sample_spec(true), &ComputeConfig::default());
        let init = pod.spec.unwrap().init_containers.unwrap();
        assert_eq!(init.len(), 1);
        assert!(init[0].command.as_ref().unwrap()[2].contains("/opt/oneshot/backups"));
    }

    #[test]
    fn scratch_source_uses_empty_dir() {
        let key = ObjectKey::new("data", "nightly");
        let mut spec = sample_spec(false);
        spec.volume.source = DataSource::Scratch;
        let pod = build_worker_pod(&key, &spec, &ComputeConfig::default());
        let volume = &pod.spec.unwrap().volumes.unwrap()[0];
        assert!(volume.empty_dir.is_some());
        assert!(volume.persistent_volume_claim.is_none());
        assert_eq!(spec.volume.source.claim_name(), None);
    }

    #[test]
    fn readiness_requires_running_and_ready() {
        assert_eq!(pod_readiness(&Pod::default()), Readiness::Pending);
        assert_eq!(pod_readiness(&pod_with("Pending", false)), Readiness::Pending);
        assert_eq!(pod_readiness(&pod_with("Running", false)), Readiness::Pending);
        assert_eq!(
            pod_readiness(&pod_with("Running", true)),
            Readiness::Ready {
                endpoint: "10.42.0.17".to_string()
            }
        );
    }

    #[test]
    fn ready_pod_without_address_is_pending() {
        let mut pod = pod_with("Running", true);
        pod.status.as_mut().unwrap().pod_ip = None;
        assert_eq!(pod_readiness(&pod), Readiness::Pending);
    }

    #[test]
    fn terminated_pod_reports_reason() {
        let mut pod = pod_with("Failed", false);
        pod.status.as_mut().unwrap().reason = Some("Evicted".to_string());
        match pod_readiness(&pod) {
            Readiness::Terminated(msg) => assert!(msg.contains("Evicted")),
            other => panic!("expected Terminated, got {other:?}"),
        }
    }
}
