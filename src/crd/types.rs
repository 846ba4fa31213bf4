//! Supporting types shared by every operation CRD

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of an operation resource
///
/// Serialized as the bare variant name; this string is the persisted
/// `status.phase` contract.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum OperationPhase {
    /// Volume and worker are being provisioned
    #[default]
    Initializing,
    /// The agent accepted the operation and is executing it
    Running,
    /// The agent reported successful completion
    Succeeded,
    /// The operation failed; `status.reason` explains why
    Failed,
}

impl OperationPhase {
    /// Returns true for phases the engine never leaves
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

impl std::str::FromStr for OperationPhase {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Initializing" => Ok(Self::Initializing),
            "Running" => Ok(Self::Running),
            "Succeeded" => Ok(Self::Succeeded),
            "Failed" => Ok(Self::Failed),
            _ => Err(crate::Error::configuration(format!(
                "invalid phase: {s}, expected one of: Initializing, Running, Succeeded, Failed"
            ))),
        }
    }
}

/// Volume override for an operation's claim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Requested size as a Kubernetes quantity (e.g. "10Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,

    /// Storage class for the claim; unset uses the platform default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

/// Resource limits for the worker container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// CPU limit (e.g. "500m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory limit (e.g. "512Mi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Default CPU limit for worker containers
pub const DEFAULT_CONTAINER_CPU: &str = "500m";

/// Default memory limit for worker containers
pub const DEFAULT_CONTAINER_MEMORY: &str = "512Mi";

impl ContainerSpec {
    /// Fill unset limits with the operator defaults
    pub fn apply_defaults(&mut self) {
        if self.cpu.is_none() {
            self.cpu = Some(DEFAULT_CONTAINER_CPU.to_string());
        }
        if self.memory.is_none() {
            self.memory = Some(DEFAULT_CONTAINER_MEMORY.to_string());
        }
    }
}

/// Selection of cluster resources an operation acts on
///
/// Unset lists mean "everything of that kind". Sent to the agent as
/// `resourceFilter`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFilter {
    /// Cache names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caches: Option<Vec<String>>,

    /// Cache configuration templates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templates: Option<Vec<String>>,

    /// Counter names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<Vec<String>>,

    /// Protobuf schema names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto_schemas: Option<Vec<String>>,

    /// Server task names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<String>>,
}

/// Status shared by every operation CRD
///
/// `reason` and `volumeRef` are always serialized so a merge patch that
/// moves the operation out of Failed also clears the old reason.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    /// Current phase of the operation lifecycle
    #[serde(default)]
    pub phase: OperationPhase,

    /// Cause of failure; empty unless the operation failed
    #[serde(default)]
    pub reason: String,

    /// Claim backing the operation, empty until provisioned
    #[serde(default)]
    pub volume_ref: String,

    /// Generation of the spec the phase was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl OperationStatus {
    /// Create a status with the given phase and empty reason
    pub fn with_phase(phase: OperationPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }
}
