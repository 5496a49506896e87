//! Custom Resource Definitions for keel

mod provision;
mod types;

pub use provision::{
    ClusterProvision, ClusterProvisionSpec, ClusterProvisionStatus, JobReference, ProvisionStage,
};
pub use types::{condition_types, find_condition, set_condition, Condition, ConditionStatus};
