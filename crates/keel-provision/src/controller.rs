//! ClusterProvision controller implementation
//!
//! Drives one provision attempt's install job through a state machine:
//! Initializing → Provisioning → Complete/Failed
//!
//! Every reconcile re-reads the attempt, its job and the job's pods, so the
//! controller is safe to run repeatedly on the same key. Job creation is
//! gated by [`Expectations`]; status writes go first and stage writes second,
//! so a recorded failure reason is never lost to a half-applied transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use keel_common::crd::{
    condition_types, find_condition, set_condition, ClusterProvision, ConditionStatus,
    JobReference, ProvisionStage,
};
use keel_common::events::{actions, reasons as event_reasons, EventPublisher, NoopEventPublisher};
use keel_common::{Error, CLUSTER_PROVISION_NAME_LABEL, JOB_TYPE_LABEL, JOB_TYPE_PROVISION};

use crate::client::ProvisionClient;
use crate::expectations::Expectations;
use crate::failure::{
    resolve_failure, FailureReason, FailureReasonResolver, UnknownFailureReason,
    UNKNOWN_FAILURE_REASON,
};
use crate::job::{build_installer_job, InstallerSettings};
use crate::observe::{
    attempt_namespace, job_state, observe_job, observe_pods, pod_phase, JobObservation, JobState,
};

/// Grace period after job creation before the install pod is inspected
pub const POD_STATUS_CHECK_DELAY: Duration = Duration::from_secs(10 * 60);

/// How long the job of a completed attempt is kept for inspection
pub const JOB_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Condition reasons written by the controller
pub mod reasons {
    /// Provisioning attempt has no job and never had one recorded
    pub const NO_JOB_REFERENCE: &str = "NoJobReference";
    /// The referenced job disappeared
    pub const JOB_NOT_FOUND: &str = "JobNotFound";
    /// The job completed before the installer handed off to provisioning
    pub const INITIALIZATION_NOT_COMPLETE: &str = "InitializationNotComplete";
    /// Zero or several install pods exist
    pub const INSTALL_POD_MISSING: &str = "InstallPodMissing";
    /// The install pod never left Pending
    pub const POD_IN_PENDING_PHASE: &str = "PodInPendingPhase";
    /// A single install pod is past Pending
    pub const INSTALL_POD_HEALTHY: &str = "InstallPodHealthy";
    /// The controller created the job
    pub const JOB_CREATED: &str = "JobCreated";
    /// The controller adopted an existing job
    pub const JOB_ADOPTED: &str = "JobAdopted";
    /// The job finished successfully
    pub const INSTALL_JOB_COMPLETE: &str = "InstallJobComplete";
    /// No valid install job can be built for the attempt
    pub const INVALID_INSTALL_JOB: &str = "InvalidInstallJob";
}

/// Namespaced name identifying an attempt; also the expectations key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttemptKey {
    /// Namespace of the attempt
    pub namespace: String,
    /// Name of the attempt
    pub name: String,
}

impl AttemptKey {
    /// Create a key from parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an existing attempt
    pub fn for_provision(provision: &ClusterProvision) -> Result<Self, Error> {
        Ok(Self::new(attempt_namespace(provision)?, provision.name_any()))
    }
}

impl std::fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What the caller should do after a successful reconcile
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Re-run after this long; `None` leaves it to the caller's resync policy
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    /// No explicit requeue
    pub fn done() -> Self {
        Self::default()
    }

    /// Requeue after the given duration
    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }
}

/// Tunables of the state machine
#[derive(Clone, Debug)]
pub struct ReconcilerSettings {
    /// Installer job settings
    pub installer: InstallerSettings,
    /// Grace period before pod health is inspected
    pub pod_status_check_delay: Duration,
    /// Retention of a completed attempt's job, counted from the attempt's creation
    pub job_retention: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            installer: InstallerSettings::default(),
            pod_status_check_delay: POD_STATUS_CHECK_DELAY,
            job_retention: JOB_RETENTION,
        }
    }
}

/// The provision state machine
pub struct ProvisionReconciler {
    client: Arc<dyn ProvisionClient>,
    expectations: Arc<Expectations>,
    events: Arc<dyn EventPublisher>,
    failure_reasons: Arc<dyn FailureReasonResolver>,
    settings: ReconcilerSettings,
}

impl ProvisionReconciler {
    /// Create a reconciler with no-op events and the unknown-reason resolver
    pub fn new(
        client: Arc<dyn ProvisionClient>,
        expectations: Arc<Expectations>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            client,
            expectations,
            events: Arc::new(NoopEventPublisher),
            failure_reasons: Arc::new(UnknownFailureReason),
            settings,
        }
    }

    /// Publish Kubernetes Events through the given publisher
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Derive failure reasons of failed jobs with the given resolver
    pub fn with_failure_reasons(mut self, resolver: Arc<dyn FailureReasonResolver>) -> Self {
        self.failure_reasons = resolver;
        self
    }

    /// Shared expectations tracker
    pub fn expectations(&self) -> &Arc<Expectations> {
        &self.expectations
    }

    /// Reconcile the attempt with the given key
    pub async fn reconcile(&self, key: &AttemptKey) -> Result<ReconcileOutcome, Error> {
        self.reconcile_at(key, Utc::now()).await
    }

    /// Reconcile as of `now`
    #[instrument(skip_all, fields(attempt = %key))]
    pub async fn reconcile_at(
        &self,
        key: &AttemptKey,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, Error> {
        let Some(provision) = self.client.get_provision(&key.namespace, &key.name).await? else {
            debug!("attempt no longer exists");
            self.expectations.delete_expectations(&key.to_string());
            return Ok(ReconcileOutcome::done());
        };

        let stage = provision.stage();
        if stage.is_terminal() {
            self.expectations.delete_expectations(&key.to_string());
        }

        match stage {
            ProvisionStage::Complete => self.apply_retention(key, provision, now).await,
            ProvisionStage::Failed => {
                debug!("attempt failed; keeping job for diagnosis");
                Ok(ReconcileOutcome::done())
            }
            ProvisionStage::Initializing | ProvisionStage::Provisioning => {
                self.reconcile_active(key, provision, now).await
            }
        }
    }

    async fn reconcile_active(
        &self,
        key: &AttemptKey,
        provision: ClusterProvision,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, Error> {
        match observe_job(self.client.as_ref(), &provision).await? {
            JobObservation::Absent if provision.stage() == ProvisionStage::Provisioning => {
                self.fail(
                    provision,
                    reasons::NO_JOB_REFERENCE,
                    "attempt is provisioning but has no install job",
                    now,
                )
                .await
            }
            JobObservation::Absent => self.create_job(key, provision, now).await,
            JobObservation::Adoptable(job) => self.adopt_job(provision, job, now).await,
            JobObservation::ReferencedMissing { name } => {
                if !self.expectations.satisfied_expectations(&key.to_string()) {
                    debug!(job = %name, "referenced job not visible yet; creation in flight");
                    return Ok(ReconcileOutcome::done());
                }
                self.fail_lost_job(provision, &name, now).await
            }
            JobObservation::Referenced(job) => self.reconcile_job(key, provision, job, now).await,
        }
    }

    async fn create_job(
        &self,
        key: &AttemptKey,
        provision: ClusterProvision,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, Error> {
        let expectations_key = key.to_string();
        if !self.expectations.satisfied_expectations(&expectations_key) {
            debug!("job creation already in flight");
            return Ok(ReconcileOutcome::done());
        }

        let job = match build_installer_job(&provision, &self.settings.installer) {
            Ok(job) => job,
            Err(Error::Validation { message, .. }) => {
                return self
                    .fail(provision, reasons::INVALID_INSTALL_JOB, &message, now)
                    .await;
            }
            Err(e) => return Err(e),
        };
        let created = self.client.create_job(&key.namespace, &job).await?;
        self.expectations.expect_creations(&expectations_key, 1);

        let job_name = created.name_any();
        info!(job = %job_name, "created install job");

        let mut updated = provision;
        let status = updated.status_mut();
        status.job_ref = Some(JobReference {
            name: job_name.clone(),
        });
        set_condition(
            &mut status.conditions,
            condition_types::JOB_CREATED,
            ConditionStatus::True,
            reasons::JOB_CREATED,
            &format!("created install job {job_name}"),
            now,
        );
        let updated = self.client.update_provision_status(&updated).await?;

        self.publish(
            &updated,
            EventType::Normal,
            event_reasons::JOB_CREATED,
            actions::PROVISION,
            format!("Created install job {job_name}"),
        )
        .await;
        Ok(ReconcileOutcome::done())
    }

    async fn adopt_job(
        &self,
        provision: ClusterProvision,
        job: Job,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, Error> {
        let job_name = job.name_any();
        info!(job = %job_name, "adopting existing install job");

        let mut updated = provision;
        let status = updated.status_mut();
        status.job_ref = Some(JobReference {
            name: job_name.clone(),
        });
        set_condition(
            &mut status.conditions,
            condition_types::JOB_CREATED,
            ConditionStatus::True,
            reasons::JOB_ADOPTED,
            &format!("adopted install job {job_name}"),
            now,
        );
        let updated = self.client.update_provision_status(&updated).await?;

        self.publish(
            &updated,
            EventType::Normal,
            event_reasons::JOB_ADOPTED,
            actions::PROVISION,
            format!("Adopted install job {job_name}"),
        )
        .await;
        Ok(ReconcileOutcome::done())
    }

    async fn reconcile_job(
        &self,
        key: &AttemptKey,
        provision: ClusterProvision,
        job: Job,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, Error> {
        match job_state(&job) {
            JobState::Complete if provision.stage() == ProvisionStage::Provisioning => {
                self.complete(provision, now).await
            }
            JobState::Complete => {
                self.fail(
                    provision,
                    reasons::INITIALIZATION_NOT_COMPLETE,
                    "install job completed before initialization finished",
                    now,
                )
                .await
            }
            JobState::Failed => {
                let failure = match recorded_failure(&provision)
                    .filter(|f| f.reason != UNKNOWN_FAILURE_REASON)
                {
                    Some(recorded) => {
                        debug!(reason = %recorded.reason, "job failed; keeping recorded failure reason");
                        recorded
                    }
                    None => {
                        let pods = observe_pods(self.client.as_ref(), &key.namespace, &job).await?;
                        resolve_failure(self.failure_reasons.as_ref(), &job, &pods)
                    }
                };
                self.fail(provision, &failure.reason, &failure.message, now)
                    .await
            }
            JobState::Active => self.check_install_pod(key, provision, &job, now).await,
        }
    }

    async fn check_install_pod(
        &self,
        key: &AttemptKey,
        provision: ClusterProvision,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, Error> {
        let Some(job_created) = job.metadata.creation_timestamp.as_ref().map(|t| t.0) else {
            return Ok(ReconcileOutcome::done());
        };
        if !elapsed_at_least(job_created, now, self.settings.pod_status_check_delay) {
            return Ok(ReconcileOutcome::done());
        }

        let pods = observe_pods(self.client.as_ref(), &key.namespace, job).await?;
        let job_name = job.name_any();

        match single_pod(&pods) {
            None => {
                warn!(job = %job_name, pods = pods.len(), "expected exactly one install pod");
                let changed = self
                    .set_pod_stuck(
                        provision,
                        ConditionStatus::True,
                        reasons::INSTALL_POD_MISSING,
                        &format!("found {} install pods for job {job_name}", pods.len()),
                        now,
                    )
                    .await?;
                if let Some(updated) = changed {
                    self.publish(
                        &updated,
                        EventType::Warning,
                        event_reasons::INSTALL_POD_STUCK,
                        actions::RECONCILE,
                        format!("Found {} install pods for job {job_name}", pods.len()),
                    )
                    .await;
                }
                Err(Error::InstallPodStuck {
                    attempt: key.to_string(),
                    job: job_name,
                    pods: pods.len(),
                })
            }
            Some(pod) if pod_phase(pod) == "Pending" => {
                warn!(job = %job_name, pod = %pod.name_any(), "install pod stuck in Pending");
                let changed = self
                    .set_pod_stuck(
                        provision,
                        ConditionStatus::True,
                        reasons::POD_IN_PENDING_PHASE,
                        &format!("install pod {} is in Pending phase", pod.name_any()),
                        now,
                    )
                    .await?;
                if let Some(updated) = changed {
                    self.publish(
                        &updated,
                        EventType::Warning,
                        event_reasons::INSTALL_POD_STUCK,
                        actions::RECONCILE,
                        format!("Install pod {} is stuck in Pending", pod.name_any()),
                    )
                    .await;
                }
                Ok(ReconcileOutcome::done())
            }
            Some(pod) => {
                let stuck = find_condition(provision.conditions(), condition_types::INSTALL_POD_STUCK)
                    .is_some_and(|c| c.is_true());
                if stuck {
                    info!(pod = %pod.name_any(), phase = %pod_phase(pod), "install pod recovered");
                    self.set_pod_stuck(
                        provision,
                        ConditionStatus::False,
                        reasons::INSTALL_POD_HEALTHY,
                        &format!("install pod {} is {}", pod.name_any(), pod_phase(pod)),
                        now,
                    )
                    .await?;
                }
                Ok(ReconcileOutcome::done())
            }
        }
    }

    /// Returns the written object when the condition changed
    async fn set_pod_stuck(
        &self,
        provision: ClusterProvision,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ClusterProvision>, Error> {
        let mut updated = provision;
        let changed = set_condition(
            &mut updated.status_mut().conditions,
            condition_types::INSTALL_POD_STUCK,
            status,
            reason,
            message,
            now,
        );
        if !changed {
            return Ok(None);
        }
        Ok(Some(self.client.update_provision_status(&updated).await?))
    }

    async fn complete(
        &self,
        provision: ClusterProvision,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, Error> {
        let mut updated = provision;
        let conditions = &mut updated.status_mut().conditions;
        let mut changed = set_condition(
            conditions,
            condition_types::COMPLETED,
            ConditionStatus::True,
            reasons::INSTALL_JOB_COMPLETE,
            "install job completed successfully",
            now,
        );
        if find_condition(conditions, condition_types::INSTALL_POD_STUCK).is_some() {
            changed |= set_condition(
                conditions,
                condition_types::INSTALL_POD_STUCK,
                ConditionStatus::False,
                reasons::INSTALL_JOB_COMPLETE,
                "install job completed successfully",
                now,
            );
        }
        if changed {
            updated = self.client.update_provision_status(&updated).await?;
        }
        let updated = self
            .client
            .update_provision_stage(&updated, ProvisionStage::Complete)
            .await?;

        info!("provisioning complete");
        self.publish(
            &updated,
            EventType::Normal,
            event_reasons::PROVISION_COMPLETE,
            actions::RECONCILE,
            "Install job completed successfully".to_string(),
        )
        .await;
        Ok(ReconcileOutcome::done())
    }

    async fn fail(
        &self,
        provision: ClusterProvision,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, Error> {
        let mut updated = provision;
        let changed = set_condition(
            &mut updated.status_mut().conditions,
            condition_types::FAILED,
            ConditionStatus::True,
            reason,
            message,
            now,
        );
        if changed {
            updated = self.client.update_provision_status(&updated).await?;
        }
        self.mark_failed(updated, reason, message).await
    }

    /// The referenced job is gone. An already-recorded failure reason wins
    /// over the generic one: it usually explains why the job went away.
    async fn fail_lost_job(
        &self,
        provision: ClusterProvision,
        job_name: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, Error> {
        match recorded_failure(&provision) {
            Some(recorded) => {
                debug!(job = %job_name, reason = %recorded.reason, "job gone; keeping recorded failure reason");
                self.fail(provision, &recorded.reason, &recorded.message, now)
                    .await
            }
            None => {
                self.fail(
                    provision,
                    reasons::JOB_NOT_FOUND,
                    &format!("install job {job_name} not found"),
                    now,
                )
                .await
            }
        }
    }

    async fn mark_failed(
        &self,
        provision: ClusterProvision,
        reason: &str,
        message: &str,
    ) -> Result<ReconcileOutcome, Error> {
        if provision.stage() == ProvisionStage::Failed {
            return Ok(ReconcileOutcome::done());
        }
        let updated = self
            .client
            .update_provision_stage(&provision, ProvisionStage::Failed)
            .await?;

        warn!(reason = %reason, message = %message, "provision attempt failed");
        self.publish(
            &updated,
            EventType::Warning,
            event_reasons::PROVISION_FAILED,
            actions::RECONCILE,
            format!("{reason}: {message}"),
        )
        .await;
        Ok(ReconcileOutcome::done())
    }

    /// Keep the job of a completed attempt for a day after the attempt was
    /// created, then remove it and the reference.
    async fn apply_retention(
        &self,
        key: &AttemptKey,
        provision: ClusterProvision,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, Error> {
        let Some(job_name) = provision.job_ref_name().map(str::to_string) else {
            return Ok(ReconcileOutcome::done());
        };

        let created = provision
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or(now);
        let retention = TimeDelta::from_std(self.settings.job_retention).map_err(|e| {
            Error::internal_with_context("retention", format!("invalid job retention: {e}"))
        })?;
        let expiry = created + retention;

        if now < expiry {
            let wait = (expiry - now).to_std().map_err(|e| {
                Error::internal_with_context("retention", format!("invalid requeue: {e}"))
            })?;
            debug!(job = %job_name, wait_secs = wait.as_secs(), "retaining job of completed attempt");
            return Ok(ReconcileOutcome::requeue(wait));
        }

        self.client.delete_job(&key.namespace, &job_name).await?;
        info!(job = %job_name, "deleted install job after retention window");

        let mut updated = provision;
        updated.status_mut().job_ref = None;
        let updated = self.client.update_provision_status(&updated).await?;

        self.publish(
            &updated,
            EventType::Normal,
            event_reasons::JOB_CLEANED_UP,
            actions::DELETE,
            format!("Deleted install job {job_name} after retention window"),
        )
        .await;
        Ok(ReconcileOutcome::done())
    }

    async fn publish(
        &self,
        provision: &ClusterProvision,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        self.events
            .publish(&provision.object_ref(&()), type_, reason, action, Some(note))
            .await;
    }
}

/// Reason and message of a Failed condition already on the attempt
fn recorded_failure(provision: &ClusterProvision) -> Option<FailureReason> {
    find_condition(provision.conditions(), condition_types::FAILED)
        .filter(|c| !c.reason.is_empty())
        .map(|c| FailureReason {
            reason: c.reason.clone(),
            message: c.message.clone(),
        })
}

fn elapsed_at_least(since: DateTime<Utc>, now: DateTime<Utc>, delay: Duration) -> bool {
    (now - since).to_std().is_ok_and(|elapsed| elapsed >= delay)
}

fn single_pod(pods: &[Pod]) -> Option<&Pod> {
    match pods {
        [pod] => Some(pod),
        _ => None,
    }
}

// =============================================================================
// kube-runtime adapter
// =============================================================================

/// Shared context for the ClusterProvision controller
pub struct Context {
    /// The state machine
    pub reconciler: ProvisionReconciler,
    /// Requeue interval when the state machine does not ask for one
    pub resync_interval: Duration,
}

/// Reconcile a ClusterProvision delivered by the controller runtime
pub async fn reconcile(provision: Arc<ClusterProvision>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = AttemptKey::for_provision(&provision)?;
    let outcome = ctx.reconciler.reconcile(&key).await?;
    Ok(Action::requeue(
        outcome.requeue_after.unwrap_or(ctx.resync_interval),
    ))
}

/// Error policy for ClusterProvision reconciliation
pub fn error_policy(provision: Arc<ClusterProvision>, error: &Error, _ctx: Arc<Context>) -> Action {
    let attempt = provision.name_any();
    if error.is_conflict() {
        debug!(attempt = %attempt, "stale write; retrying with fresh state");
        return Action::requeue(Duration::from_secs(1));
    }
    match error {
        Error::InstallPodStuck { .. } => {
            warn!(attempt = %attempt, error = %error, "install pod stuck");
            Action::requeue(Duration::from_secs(15))
        }
        _ => {
            error!(?error, attempt = %attempt, "provision reconciliation failed");
            Action::requeue(Duration::from_secs(30))
        }
    }
}

/// Map a watched job to its attempt, noting that the job is now visible.
///
/// Jobs without the provision labels map to nothing. Seeing a job more than
/// once is harmless: the outstanding count never drops below zero.
pub fn job_to_provision(job: &Job, expectations: &Expectations) -> Option<ObjectRef<ClusterProvision>> {
    let labels = job.labels();
    if labels.get(JOB_TYPE_LABEL).map(String::as_str) != Some(JOB_TYPE_PROVISION) {
        return None;
    }
    let attempt = labels.get(CLUSTER_PROVISION_NAME_LABEL)?;
    let namespace = job.namespace()?;

    expectations.creation_observed(&AttemptKey::new(namespace.as_str(), attempt.as_str()).to_string());
    Some(ObjectRef::new(attempt).within(&namespace))
}

#[cfg(test)]
mod tests;
