//! ClusterProvision CRD types
//!
//! A `ClusterProvision` is one attempt at running the installer for a cluster.
//! The stage lives in the spec because the installer itself advances it from
//! Initializing to Provisioning; everything the controller observes (job
//! reference, conditions) lives in the status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

// =============================================================================
// Stage
// =============================================================================

/// Lifecycle stage of a provision attempt
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ProvisionStage {
    /// The install job has not yet handed off to provisioning
    #[default]
    Initializing,
    /// The installer is creating infrastructure
    Provisioning,
    /// The install job finished successfully
    Complete,
    /// The attempt failed; see the Failed condition
    Failed,
}

impl ProvisionStage {
    /// Complete and Failed never revert
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// CRD
// =============================================================================

/// One try at running the installer job for a cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "keel.dev",
    version = "v1alpha1",
    kind = "ClusterProvision",
    plural = "clusterprovisions",
    shortname = "cprov",
    namespaced,
    status = "ClusterProvisionStatus",
    printcolumn = r#"{"name":"Stage","type":"string","jsonPath":".spec.stage"}"#,
    printcolumn = r#"{"name":"Job","type":"string","jsonPath":".status.jobRef.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterProvisionSpec {
    /// Name of the cluster deployment this attempt provisions
    #[serde(default)]
    pub cluster_deployment: String,

    /// Attempt number, starting at zero
    #[serde(default)]
    pub attempt: u32,

    /// Current lifecycle stage
    #[serde(default)]
    pub stage: ProvisionStage,
}

/// Reference to the backing job, by name within the attempt's namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct JobReference {
    /// Job name
    pub name: String,
}

/// Observed state of a ClusterProvision
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterProvisionStatus {
    /// The backing job, once created or adopted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_ref: Option<JobReference>,

    /// Status conditions, at most one per type
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ClusterProvision {
    /// Current stage
    pub fn stage(&self) -> ProvisionStage {
        self.spec.stage
    }

    /// Name of the referenced job, if any
    pub fn job_ref_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.job_ref.as_ref())
            .map(|r| r.name.as_str())
    }

    /// Status conditions (empty when no status has been written)
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// Mutable status, creating an empty one if needed
    pub fn status_mut(&mut self) -> &mut ClusterProvisionStatus {
        self.status.get_or_insert_with(Default::default)
    }
}
