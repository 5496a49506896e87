//! Failure reasons for failed install jobs
//!
//! Which reason a failed job maps to is a policy decision (install logs, pod
//! exit codes, cloud errors...), so it sits behind [`FailureReasonResolver`].
//! When no resolver has anything specific to say the attempt fails with
//! [`UNKNOWN_FAILURE_REASON`].

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;

use crate::observe::job_failure;

/// Reason recorded when nothing more specific is known
pub const UNKNOWN_FAILURE_REASON: &str = "UnknownError";

/// Reason and message for a Failed condition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureReason {
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

impl FailureReason {
    /// The fallback reason
    pub fn unknown() -> Self {
        Self {
            reason: UNKNOWN_FAILURE_REASON.to_string(),
            message: "install job failed for an unknown reason".to_string(),
        }
    }
}

/// Maps a failed job (and its pods) to a specific failure reason
pub trait FailureReasonResolver: Send + Sync {
    /// `None` means "nothing specific"; the caller falls back to [`FailureReason::unknown`]
    fn resolve(&self, job: &Job, pods: &[Pod]) -> Option<FailureReason>;
}

/// Resolver that never knows better than [`UNKNOWN_FAILURE_REASON`]
pub struct UnknownFailureReason;

impl FailureReasonResolver for UnknownFailureReason {
    fn resolve(&self, _job: &Job, _pods: &[Pod]) -> Option<FailureReason> {
        None
    }
}

/// Resolver that reports the reason the job controller put on the `Failed`
/// condition (e.g. `BackoffLimitExceeded`, `DeadlineExceeded`)
pub struct JobConditionReason;

impl FailureReasonResolver for JobConditionReason {
    fn resolve(&self, job: &Job, _pods: &[Pod]) -> Option<FailureReason> {
        let (reason, message) = job_failure(job)?;
        if reason.is_empty() {
            return None;
        }
        Some(FailureReason { reason, message })
    }
}

/// Resolve with fallback to the unknown reason
pub fn resolve_failure(
    resolver: &dyn FailureReasonResolver,
    job: &Job,
    pods: &[Pod],
) -> FailureReason {
    resolver
        .resolve(job, pods)
        .unwrap_or_else(FailureReason::unknown)
}
