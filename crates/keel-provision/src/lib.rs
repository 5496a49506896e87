//! ClusterProvision controller
//!
//! Runs the install job of one provisioning attempt to completion:
//! - Job creation gated by [`Expectations`], or adoption of a labelled job
//! - Job outcome mapped to the attempt's stage and conditions
//! - Install pod health checks after a grace period
//! - Retention and cleanup of the job once the attempt is complete

#![deny(missing_docs)]

pub mod client;
pub mod controller;
pub mod expectations;
pub mod failure;
pub mod job;
pub mod observe;

pub use client::{KubeProvisionClient, ProvisionClient};
pub use controller::{
    error_policy, job_to_provision, reconcile, AttemptKey, Context, ProvisionReconciler,
    ReconcileOutcome, ReconcilerSettings, JOB_RETENTION, POD_STATUS_CHECK_DELAY,
};
pub use expectations::Expectations;
pub use failure::{FailureReason, FailureReasonResolver, JobConditionReason, UnknownFailureReason};
pub use job::InstallerSettings;
