//! Volume claim provisioning
//!
//! Each operation owns one claim named exactly like the operation, so the
//! claim can be found without an index. A claim is created once and never
//! resized: if one already exists, it is used as-is even when its size or
//! class differs from the operation's spec.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result, MANAGED_BY_LABEL, MANAGED_BY_VALUE};

/// Claim size used when an operation does not override it
pub const DEFAULT_VOLUME_SIZE: &str = "1Gi";

const QUANTITY_FORMAT: &str =
    "quantities must match the regular expression '^([+-]?[0-9.]+)([eEinumkKMGTP]*[-+]?[0-9]*)$'";

/// Storage defaults injected into the provisioner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageConfig {
    /// Claim size used when no override is given
    pub default_size: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_size: DEFAULT_VOLUME_SIZE.to_string(),
        }
    }
}

/// Everything needed to ensure one operation's claim
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeRequest {
    /// Namespace of the operation
    pub namespace: String,
    /// Claim name, equal to the operation name
    pub name: String,
    /// Requested size override
    pub storage: Option<String>,
    /// Storage class override; `None` uses the platform default
    pub storage_class: Option<String>,
    /// Owner reference to the operation resource
    pub owner: OwnerReference,
    /// Labels applied to the claim
    pub labels: BTreeMap<String, String>,
}

/// Result of [`StorageProvisioner::ensure_volume`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeOutcome {
    /// A claim with the requested name already existed
    Existing,
    /// The claim was created by this call
    Created,
}

/// Minimal claim access used by the provisioner
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VolumeClient: Send + Sync {
    /// Fetch a claim, `Ok(None)` if it does not exist
    async fn get_claim(&self, namespace: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>>;

    /// Create a claim
    async fn create_claim(&self, namespace: &str, claim: &PersistentVolumeClaim) -> Result<()>;
}

/// Kube-backed [`VolumeClient`]
pub struct KubeVolumeClient {
    client: Client,
}

impl KubeVolumeClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VolumeClient for KubeVolumeClient {
    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_claim(&self, namespace: &str, claim: &PersistentVolumeClaim) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), claim).await?;
        Ok(())
    }
}

/// Ensures the per-operation volume claim exists
pub struct StorageProvisioner<C> {
    volumes: C,
    default_size: Quantity,
}

impl<C: VolumeClient> StorageProvisioner<C> {
    /// Create a provisioner, validating the configured default size
    pub fn new(volumes: C, config: StorageConfig) -> Result<Self> {
        let default_size = parse_quantity(&config.default_size).map_err(|msg| {
            Error::configuration_for_field("operator", "defaultVolumeSize", msg)
        })?;
        Ok(Self {
            volumes,
            default_size,
        })
    }

    /// Make sure the claim for `request` exists
    ///
    /// An invalid size override is a configuration error and nothing is
    /// created. Losing a creation race counts as success.
    pub async fn ensure_volume(&self, request: &VolumeRequest) -> Result<VolumeOutcome> {
        if self
            .volumes
            .get_claim(&request.namespace, &request.name)
            .await?
            .is_some()
        {
            debug!(namespace = %request.namespace, claim = %request.name, "claim already exists");
            return Ok(VolumeOutcome::Existing);
        }

        let size = match &request.storage {
            Some(raw) => parse_quantity(raw).map_err(|msg| {
                Error::configuration_for_field(&request.name, "spec.volume.storage", msg)
            })?,
            None => self.default_size.clone(),
        };

        let claim = build_claim(request, size);
        match self.volumes.create_claim(&request.namespace, &claim).await {
            Ok(()) => {
                info!(namespace = %request.namespace, claim = %request.name, "created claim");
                Ok(VolumeOutcome::Created)
            }
            Err(e) if e.is_already_exists() => {
                debug!(namespace = %request.namespace, claim = %request.name, "claim created concurrently");
                Ok(VolumeOutcome::Existing)
            }
            Err(e) => Err(e),
        }
    }
}

/// Build a ReadWriteOnce claim owned by the operation
pub fn build_claim(request: &VolumeRequest, size: Quantity) -> PersistentVolumeClaim {
    let mut labels = request.labels.clone();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(request.name.clone()),
            namespace: Some(request.namespace.clone()),
            labels: Some(labels),
            owner_references: Some(vec![request.owner.clone()]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), size)])),
                ..Default::default()
            }),
            storage_class_name: request
                .storage_class
                .clone()
                .filter(|class| !class.is_empty()),
            ..Default::default()
        }),
        status: None,
    }
}

/// Validate a Kubernetes quantity string for use as a claim size
///
/// Accepts a decimal number followed by an optional binary suffix
/// (`Ki`..`Ei`), decimal suffix (`n`, `u`, `m`, `k`, `M`..`E`) or
/// exponent (`e3`, `E-2`). Sizes must be strictly positive.
pub fn parse_quantity(raw: &str) -> std::result::Result<Quantity, String> {
    let s = raw.trim();
    let invalid = || format!("invalid quantity {raw:?}: {QUANTITY_FORMAT}");

    let number_end = s
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '+' || *c == '-'))))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(number_end);

    let digits = number.trim_start_matches(['+', '-']);
    if digits.is_empty() || digits == "." || digits.matches('.').count() > 1 {
        return Err(invalid());
    }
    if !valid_suffix(suffix) {
        return Err(invalid());
    }

    let value: f64 = digits.parse().map_err(|_| invalid())?;
    if number.starts_with('-') || value <= 0.0 {
        return Err(format!("invalid quantity {raw:?}: size must be positive"));
    }

    Ok(Quantity(s.to_string()))
}

fn valid_suffix(suffix: &str) -> bool {
    const BINARY: [&str; 6] = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];
    const DECIMAL: [&str; 9] = ["n", "u", "m", "", "k", "M", "G", "T", "P"];

    if BINARY.contains(&suffix) || DECIMAL.contains(&suffix) || suffix == "E" {
        return true;
    }
    match suffix.strip_prefix(['e', 'E']) {
        Some(exp) => {
            let exp = exp.strip_prefix(['+', '-']).unwrap_or(exp);
            !exp.is_empty() && exp.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}
