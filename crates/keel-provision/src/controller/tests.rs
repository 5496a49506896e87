use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::TimeZone;
use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{ObjectReference, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use kube::error::ErrorResponse;

use keel_common::crd::{ClusterProvisionSpec, Condition};

use super::*;
use crate::client::MockProvisionClient;
use crate::failure::JobConditionReason;

const NS: &str = "clusters";
const ATTEMPT: &str = "mycluster-0";
const JOB: &str = "mycluster-0-provision";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn after(d: Duration) -> DateTime<Utc> {
    t0() + TimeDelta::from_std(d).unwrap()
}

fn key() -> AttemptKey {
    AttemptKey::new(NS, ATTEMPT)
}

fn api_error(code: u16, reason: &str) -> Error {
    Error::from(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} from fake api server"),
        reason: reason.to_string(),
        code,
    }))
}

fn attempt(stage: ProvisionStage) -> ClusterProvision {
    let mut provision = ClusterProvision::new(
        ATTEMPT,
        ClusterProvisionSpec {
            cluster_deployment: "mycluster".to_string(),
            attempt: 0,
            stage,
        },
    );
    provision.metadata.namespace = Some(NS.to_string());
    provision.metadata.uid = Some("attempt-uid".to_string());
    provision.metadata.creation_timestamp = Some(Time(t0()));
    provision
}

fn with_job_ref(mut provision: ClusterProvision, name: &str) -> ClusterProvision {
    provision.status_mut().job_ref = Some(JobReference {
        name: name.to_string(),
    });
    provision
}

fn with_condition(
    mut provision: ClusterProvision,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
) -> ClusterProvision {
    let mut condition = Condition::new(type_, status, reason, "recorded earlier");
    condition.last_transition_time = t0();
    provision.status_mut().conditions.push(condition);
    provision
}

fn labelled_job(name: &str, created: DateTime<Utc>) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NS.to_string()),
            labels: Some(BTreeMap::from([
                (CLUSTER_PROVISION_NAME_LABEL.to_string(), ATTEMPT.to_string()),
                (JOB_TYPE_LABEL.to_string(), JOB_TYPE_PROVISION.to_string()),
            ])),
            creation_timestamp: Some(Time(created)),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn job_condition(type_: &str, reason: Option<&str>) -> JobStatus {
    JobStatus {
        conditions: Some(vec![JobCondition {
            type_: type_.to_string(),
            status: "True".to_string(),
            reason: reason.map(str::to_string),
            message: Some("from the job controller".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn pod(name: &str, phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NS.to_string()),
            labels: Some(BTreeMap::from([("job-name".to_string(), JOB.to_string())])),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// In-memory cluster
// =============================================================================

#[derive(Default)]
struct ClusterState {
    provisions: BTreeMap<String, ClusterProvision>,
    jobs: BTreeMap<String, Job>,
    pods: Vec<Pod>,
    next_version: u64,
    job_creations: usize,
    status_writes: usize,
    stage_writes: usize,
    job_deletions: Vec<String>,
}

impl ClusterState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// API server stand-in that enforces resourceVersion preconditions
#[derive(Default)]
struct FakeCluster {
    state: Mutex<ClusterState>,
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => false,
        })
}

impl FakeCluster {
    fn with_provision(provision: ClusterProvision) -> Arc<Self> {
        let cluster = Self::default();
        cluster.put_provision(provision);
        Arc::new(cluster)
    }

    fn put_provision(&self, mut provision: ClusterProvision) {
        let mut state = self.state.lock().unwrap();
        provision.metadata.resource_version = Some(state.bump());
        state.provisions.insert(provision.name_any(), provision);
    }

    fn put_job(&self, job: Job) {
        self.state.lock().unwrap().jobs.insert(job.name_any(), job);
    }

    fn set_job_status(&self, name: &str, status: JobStatus) {
        let mut state = self.state.lock().unwrap();
        state.jobs.get_mut(name).unwrap().status = Some(status);
    }

    fn remove_job(&self, name: &str) {
        self.state.lock().unwrap().jobs.remove(name);
    }

    fn put_pod(&self, pod: Pod) {
        self.state.lock().unwrap().pods.push(pod);
    }

    fn provision(&self) -> ClusterProvision {
        self.provision_named(ATTEMPT)
    }

    fn provision_named(&self, name: &str) -> ClusterProvision {
        self.state.lock().unwrap().provisions[name].clone()
    }

    fn jobs(&self) -> Vec<Job> {
        self.state.lock().unwrap().jobs.values().cloned().collect()
    }

    fn job_creations(&self) -> usize {
        self.state.lock().unwrap().job_creations
    }

    fn writes(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.status_writes, state.stage_writes)
    }

    fn job_deletions(&self) -> Vec<String> {
        self.state.lock().unwrap().job_deletions.clone()
    }

    fn write_provision(
        &self,
        provision: &ClusterProvision,
        apply: impl FnOnce(&mut ClusterProvision),
    ) -> Result<ClusterProvision, Error> {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        let stored = state
            .provisions
            .get_mut(&provision.name_any())
            .ok_or_else(|| api_error(404, "NotFound"))?;
        if stored.metadata.resource_version != provision.metadata.resource_version {
            return Err(api_error(409, "Conflict"));
        }
        apply(stored);
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }
}

#[async_trait]
impl ProvisionClient for FakeCluster {
    async fn get_provision(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterProvision>, Error> {
        Ok(self.state.lock().unwrap().provisions.get(name).cloned())
    }

    async fn update_provision_status(
        &self,
        provision: &ClusterProvision,
    ) -> Result<ClusterProvision, Error> {
        let status = provision.status.clone();
        let updated = self.write_provision(provision, |stored| stored.status = status)?;
        self.state.lock().unwrap().status_writes += 1;
        Ok(updated)
    }

    async fn update_provision_stage(
        &self,
        provision: &ClusterProvision,
        stage: ProvisionStage,
    ) -> Result<ClusterProvision, Error> {
        let updated = self.write_provision(provision, |stored| stored.spec.stage = stage)?;
        self.state.lock().unwrap().stage_writes += 1;
        Ok(updated)
    }

    async fn get_job(&self, _namespace: &str, name: &str) -> Result<Option<Job>, Error> {
        Ok(self.state.lock().unwrap().jobs.get(name).cloned())
    }

    async fn list_jobs(&self, _namespace: &str, selector: &str) -> Result<Vec<Job>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|job| matches_selector(job.labels(), selector))
            .cloned()
            .collect())
    }

    async fn create_job(&self, _namespace: &str, job: &Job) -> Result<Job, Error> {
        let mut state = self.state.lock().unwrap();
        let name = job.name_any();
        if state.jobs.contains_key(&name) {
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut created = job.clone();
        created.metadata.creation_timestamp = Some(Time(t0()));
        created.metadata.resource_version = Some(state.bump());
        state.jobs.insert(name, created.clone());
        state.job_creations += 1;
        Ok(created)
    }

    async fn delete_job(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.jobs.remove(name);
        state.pods.retain(|p| p.labels().get("job-name").map(String::as_str) != Some(name));
        state.job_deletions.push(name.to_string());
        Ok(())
    }

    async fn list_pods(&self, _namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|pod| matches_selector(pod.labels(), selector))
            .cloned()
            .collect())
    }
}

/// Captures published event reasons
#[derive(Default)]
struct RecordingEvents {
    reasons: Mutex<Vec<String>>,
}

impl RecordingEvents {
    fn reasons(&self) -> Vec<String> {
        self.reasons.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.reasons.lock().unwrap().push(reason.to_string());
    }
}

struct Harness {
    cluster: Arc<FakeCluster>,
    events: Arc<RecordingEvents>,
    reconciler: ProvisionReconciler,
}

impl Harness {
    fn new(provision: ClusterProvision) -> Self {
        let cluster = FakeCluster::with_provision(provision);
        let events = Arc::new(RecordingEvents::default());
        let reconciler = ProvisionReconciler::new(
            cluster.clone(),
            Arc::new(Expectations::new()),
            ReconcilerSettings::default(),
        )
        .with_events(events.clone());
        Self {
            cluster,
            events,
            reconciler,
        }
    }

    async fn run_at(&self, now: DateTime<Utc>) -> Result<ReconcileOutcome, Error> {
        self.reconciler.reconcile_at(&key(), now).await
    }

    fn condition(&self, type_: &str) -> Option<Condition> {
        find_condition(self.cluster.provision().conditions(), type_).cloned()
    }

    fn observe_creation(&self) {
        self.reconciler
            .expectations()
            .creation_observed(&key().to_string());
    }
}

fn assert_failed(h: &Harness, reason: &str) {
    let provision = h.cluster.provision();
    assert_eq!(provision.stage(), ProvisionStage::Failed);
    let failed = h.condition(condition_types::FAILED).expect("Failed condition");
    assert_eq!(failed.status, ConditionStatus::True);
    assert_eq!(failed.reason, reason);
}

// =============================================================================
// Job creation and adoption
// =============================================================================

#[tokio::test]
async fn new_attempt_gets_install_job() {
    let h = Harness::new(attempt(ProvisionStage::Initializing));

    let outcome = h.run_at(t0()).await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::done());
    let jobs = h.cluster.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].name_any(), JOB);

    let provision = h.cluster.provision();
    assert_eq!(provision.job_ref_name(), Some(JOB));
    assert_eq!(provision.stage(), ProvisionStage::Initializing);
    let created = h.condition(condition_types::JOB_CREATED).unwrap();
    assert_eq!(created.reason, reasons::JOB_CREATED);
    assert_eq!(h.events.reasons(), vec![event_reasons::JOB_CREATED]);
    assert!(!h
        .reconciler
        .expectations()
        .satisfied_expectations(&key().to_string()));
}

#[tokio::test]
async fn repeated_reconciles_create_one_job() {
    let h = Harness::new(attempt(ProvisionStage::Initializing));

    for _ in 0..3 {
        h.run_at(t0()).await.unwrap();
    }

    assert_eq!(h.cluster.job_creations(), 1);
    assert_eq!(h.cluster.provision().stage(), ProvisionStage::Initializing);
}

#[tokio::test]
async fn unobserved_creation_blocks_second_create_after_lost_reference() {
    // a create was issued but the job is not visible yet
    let h = Harness::new(attempt(ProvisionStage::Initializing));
    h.reconciler
        .expectations()
        .expect_creations(&key().to_string(), 1);

    h.run_at(t0()).await.unwrap();

    assert_eq!(h.cluster.job_creations(), 0);
    assert_eq!(h.cluster.provision().job_ref_name(), None);
}

#[tokio::test]
async fn overlong_attempt_name_fails_without_creating_a_job() {
    let name = format!("{}-0", "mycluster".repeat(7));
    let mut provision = attempt(ProvisionStage::Initializing);
    provision.metadata.name = Some(name.clone());
    let cluster = FakeCluster::with_provision(provision);
    let reconciler = ProvisionReconciler::new(
        cluster.clone(),
        Arc::new(Expectations::new()),
        ReconcilerSettings::default(),
    );
    let key = AttemptKey::new(NS, &name);

    let outcome = reconciler.reconcile_at(&key, t0()).await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::done());
    assert_eq!(cluster.job_creations(), 0);
    let failed = cluster.provision_named(&name);
    assert_eq!(failed.stage(), ProvisionStage::Failed);
    let condition = find_condition(failed.conditions(), condition_types::FAILED).unwrap();
    assert_eq!(condition.status, ConditionStatus::True);
    assert_eq!(condition.reason, reasons::INVALID_INSTALL_JOB);

    // terminal: later reconciles neither write nor retry the create
    let writes = cluster.writes();
    reconciler.reconcile_at(&key, after(Duration::from_secs(30))).await.unwrap();
    assert_eq!(cluster.writes(), writes);
    assert_eq!(cluster.job_creations(), 0);
}

#[tokio::test]
async fn labelled_job_is_adopted() {
    let h = Harness::new(attempt(ProvisionStage::Initializing));
    h.cluster.put_job(labelled_job("out-of-band", t0()));

    h.run_at(t0()).await.unwrap();

    assert_eq!(h.cluster.job_creations(), 0);
    assert_eq!(h.cluster.provision().job_ref_name(), Some("out-of-band"));
    let created = h.condition(condition_types::JOB_CREATED).unwrap();
    assert_eq!(created.reason, reasons::JOB_ADOPTED);
    assert_eq!(h.events.reasons(), vec![event_reasons::JOB_ADOPTED]);
}

#[tokio::test]
async fn oldest_labelled_job_wins_adoption() {
    let h = Harness::new(attempt(ProvisionStage::Initializing));
    h.cluster
        .put_job(labelled_job("newer", after(Duration::from_secs(60))));
    h.cluster.put_job(labelled_job("older", t0()));

    h.run_at(t0()).await.unwrap();

    assert_eq!(h.cluster.provision().job_ref_name(), Some("older"));
}

#[tokio::test]
async fn provisioning_without_job_fails() {
    let h = Harness::new(attempt(ProvisionStage::Provisioning));

    h.run_at(t0()).await.unwrap();

    assert_failed(&h, reasons::NO_JOB_REFERENCE);
    assert_eq!(h.cluster.job_creations(), 0);
    assert_eq!(h.events.reasons(), vec![event_reasons::PROVISION_FAILED]);
}

// =============================================================================
// Lost jobs
// =============================================================================

#[tokio::test]
async fn missing_job_waits_while_creation_is_in_flight() {
    let h = Harness::new(attempt(ProvisionStage::Initializing));
    h.run_at(t0()).await.unwrap();
    h.cluster.remove_job(JOB);

    let outcome = h.run_at(t0()).await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::done());
    assert_eq!(h.cluster.provision().stage(), ProvisionStage::Initializing);
    assert!(h.condition(condition_types::FAILED).is_none());
}

#[tokio::test]
async fn missing_job_fails_once_creation_was_observed() {
    let h = Harness::new(attempt(ProvisionStage::Initializing));
    h.run_at(t0()).await.unwrap();
    h.observe_creation();
    h.cluster.remove_job(JOB);

    h.run_at(t0()).await.unwrap();

    assert_failed(&h, reasons::JOB_NOT_FOUND);
}

#[tokio::test]
async fn missing_job_keeps_recorded_failure_reason() {
    let provision = with_condition(
        with_job_ref(attempt(ProvisionStage::Provisioning), JOB),
        condition_types::FAILED,
        ConditionStatus::False,
        "AWSInsufficientCapacity",
    );
    let h = Harness::new(provision);

    h.run_at(t0()).await.unwrap();

    assert_failed(&h, "AWSInsufficientCapacity");
    assert_eq!(
        h.condition(condition_types::FAILED).unwrap().message,
        "recorded earlier"
    );
}

#[tokio::test]
async fn failed_job_keeps_recorded_failure_reason() {
    let provision = with_condition(
        with_job_ref(attempt(ProvisionStage::Provisioning), JOB),
        condition_types::FAILED,
        ConditionStatus::True,
        "AWSInsufficientCapacity",
    );
    let h = Harness::new(provision);
    h.cluster.put_job(labelled_job(JOB, t0()));
    h.cluster
        .set_job_status(JOB, job_condition("Failed", Some("BackoffLimitExceeded")));

    h.run_at(t0()).await.unwrap();

    assert_failed(&h, "AWSInsufficientCapacity");
    assert_eq!(
        h.condition(condition_types::FAILED).unwrap().message,
        "recorded earlier"
    );
}

#[tokio::test]
async fn failed_job_refines_a_recorded_unknown_reason() {
    let provision = with_condition(
        with_job_ref(attempt(ProvisionStage::Provisioning), JOB),
        condition_types::FAILED,
        ConditionStatus::False,
        crate::failure::UNKNOWN_FAILURE_REASON,
    );
    let h = Harness::new(provision);
    let reconciler = ProvisionReconciler::new(
        h.cluster.clone(),
        Arc::new(Expectations::new()),
        ReconcilerSettings::default(),
    )
    .with_failure_reasons(Arc::new(JobConditionReason));
    h.cluster.put_job(labelled_job(JOB, t0()));
    h.cluster
        .set_job_status(JOB, job_condition("Failed", Some("DeadlineExceeded")));

    reconciler.reconcile_at(&key(), t0()).await.unwrap();

    assert_failed(&h, "DeadlineExceeded");
}

// =============================================================================
// Job outcomes
// =============================================================================

#[tokio::test]
async fn completed_job_completes_provisioning_attempt() {
    let h = Harness::new(with_job_ref(attempt(ProvisionStage::Provisioning), JOB));
    h.cluster.put_job(labelled_job(JOB, t0()));
    h.cluster.set_job_status(JOB, job_condition("Complete", None));

    h.run_at(t0()).await.unwrap();

    let provision = h.cluster.provision();
    assert_eq!(provision.stage(), ProvisionStage::Complete);
    assert!(h.condition(condition_types::COMPLETED).unwrap().is_true());
    assert!(h.condition(condition_types::FAILED).is_none());
    assert_eq!(h.events.reasons(), vec![event_reasons::PROVISION_COMPLETE]);
}

#[tokio::test]
async fn completion_clears_stale_stuck_condition() {
    let provision = with_condition(
        with_job_ref(attempt(ProvisionStage::Provisioning), JOB),
        condition_types::INSTALL_POD_STUCK,
        ConditionStatus::True,
        reasons::POD_IN_PENDING_PHASE,
    );
    let h = Harness::new(provision);
    h.cluster.put_job(labelled_job(JOB, t0()));
    h.cluster.set_job_status(JOB, job_condition("Complete", None));

    h.run_at(t0()).await.unwrap();

    let stuck = h.condition(condition_types::INSTALL_POD_STUCK).unwrap();
    assert_eq!(stuck.status, ConditionStatus::False);
    assert_eq!(h.cluster.provision().stage(), ProvisionStage::Complete);
}

#[tokio::test]
async fn completed_job_before_handoff_fails() {
    let h = Harness::new(with_job_ref(attempt(ProvisionStage::Initializing), JOB));
    h.cluster.put_job(labelled_job(JOB, t0()));
    h.cluster.set_job_status(JOB, job_condition("Complete", None));

    h.run_at(t0()).await.unwrap();

    assert_failed(&h, reasons::INITIALIZATION_NOT_COMPLETE);
}

#[tokio::test]
async fn failed_job_fails_with_unknown_reason() {
    let h = Harness::new(with_job_ref(attempt(ProvisionStage::Provisioning), JOB));
    h.cluster.put_job(labelled_job(JOB, t0()));
    h.cluster
        .set_job_status(JOB, job_condition("Failed", Some("BackoffLimitExceeded")));

    h.run_at(t0()).await.unwrap();

    assert_failed(&h, crate::failure::UNKNOWN_FAILURE_REASON);
}

#[tokio::test]
async fn failed_job_uses_configured_resolver() {
    let h = Harness::new(with_job_ref(attempt(ProvisionStage::Initializing), JOB));
    let reconciler = ProvisionReconciler::new(
        h.cluster.clone(),
        Arc::new(Expectations::new()),
        ReconcilerSettings::default(),
    )
    .with_failure_reasons(Arc::new(JobConditionReason));
    h.cluster.put_job(labelled_job(JOB, t0()));
    h.cluster
        .set_job_status(JOB, job_condition("Failed", Some("DeadlineExceeded")));

    reconciler.reconcile_at(&key(), t0()).await.unwrap();

    assert_failed(&h, "DeadlineExceeded");
}

#[tokio::test]
async fn failed_attempt_is_left_alone() {
    let h = Harness::new(with_job_ref(attempt(ProvisionStage::Failed), JOB));
    h.cluster.put_job(labelled_job(JOB, t0()));

    let outcome = h.run_at(after(JOB_RETENTION * 2)).await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::done());
    assert_eq!(h.cluster.writes(), (0, 0));
    assert!(h.cluster.job_deletions().is_empty());
}

#[tokio::test]
async fn reconciling_failure_twice_writes_once() {
    let h = Harness::new(attempt(ProvisionStage::Provisioning));

    h.run_at(t0()).await.unwrap();
    h.run_at(t0()).await.unwrap();

    assert_eq!(h.cluster.writes(), (1, 1));
    assert_eq!(h.events.reasons().len(), 1);
}

// =============================================================================
// Install pod health
// =============================================================================

fn running_attempt() -> Harness {
    let h = Harness::new(with_job_ref(attempt(ProvisionStage::Provisioning), JOB));
    h.cluster.put_job(labelled_job(JOB, t0()));
    h
}

#[tokio::test]
async fn pods_are_not_checked_before_grace_period() {
    let h = running_attempt();

    let outcome = h
        .run_at(after(POD_STATUS_CHECK_DELAY - Duration::from_secs(1)))
        .await;

    assert!(outcome.is_ok());
    assert!(h.condition(condition_types::INSTALL_POD_STUCK).is_none());
}

#[tokio::test]
async fn missing_pod_marks_stuck_and_errors() {
    let h = running_attempt();

    let result = h.run_at(after(POD_STATUS_CHECK_DELAY)).await;

    assert!(matches!(result, Err(Error::InstallPodStuck { pods: 0, .. })));
    let stuck = h.condition(condition_types::INSTALL_POD_STUCK).unwrap();
    assert!(stuck.is_true());
    assert_eq!(stuck.reason, reasons::INSTALL_POD_MISSING);
    assert_eq!(h.cluster.provision().stage(), ProvisionStage::Provisioning);
}

#[tokio::test]
async fn duplicate_pods_mark_stuck_and_error() {
    let h = running_attempt();
    h.cluster.put_pod(pod("installer-a", "Running"));
    h.cluster.put_pod(pod("installer-b", "Running"));

    let result = h.run_at(after(POD_STATUS_CHECK_DELAY)).await;

    assert!(matches!(result, Err(Error::InstallPodStuck { pods: 2, .. })));
    assert_eq!(
        h.condition(condition_types::INSTALL_POD_STUCK).unwrap().reason,
        reasons::INSTALL_POD_MISSING
    );
}

#[tokio::test]
async fn repeated_missing_pod_writes_condition_once() {
    let h = running_attempt();

    let _ = h.run_at(after(POD_STATUS_CHECK_DELAY)).await;
    let second = h.run_at(after(POD_STATUS_CHECK_DELAY * 2)).await;

    assert!(second.is_err());
    assert_eq!(h.cluster.writes(), (1, 0));
    assert_eq!(h.events.reasons(), vec![event_reasons::INSTALL_POD_STUCK]);
}

#[tokio::test]
async fn pending_pod_marks_stuck() {
    let h = running_attempt();
    h.cluster.put_pod(pod("installer", "Pending"));

    h.run_at(after(POD_STATUS_CHECK_DELAY)).await.unwrap();

    let stuck = h.condition(condition_types::INSTALL_POD_STUCK).unwrap();
    assert!(stuck.is_true());
    assert_eq!(stuck.reason, reasons::POD_IN_PENDING_PHASE);
}

#[tokio::test]
async fn running_pod_leaves_attempt_untouched() {
    let h = running_attempt();
    h.cluster.put_pod(pod("installer", "Running"));

    h.run_at(after(POD_STATUS_CHECK_DELAY)).await.unwrap();

    assert!(h.condition(condition_types::INSTALL_POD_STUCK).is_none());
    assert_eq!(h.cluster.writes(), (0, 0));
}

#[tokio::test]
async fn recovered_pod_clears_stuck_condition() {
    let provision = with_condition(
        with_job_ref(attempt(ProvisionStage::Provisioning), JOB),
        condition_types::INSTALL_POD_STUCK,
        ConditionStatus::True,
        reasons::POD_IN_PENDING_PHASE,
    );
    let h = Harness::new(provision);
    h.cluster.put_job(labelled_job(JOB, t0()));
    h.cluster.put_pod(pod("installer", "Running"));

    h.run_at(after(POD_STATUS_CHECK_DELAY)).await.unwrap();

    let stuck = h.condition(condition_types::INSTALL_POD_STUCK).unwrap();
    assert_eq!(stuck.status, ConditionStatus::False);
    assert_eq!(stuck.reason, reasons::INSTALL_POD_HEALTHY);
    assert_eq!(stuck.last_transition_time, after(POD_STATUS_CHECK_DELAY));
}

// =============================================================================
// Retention
// =============================================================================

#[tokio::test]
async fn completed_job_is_retained_until_expiry() {
    let h = Harness::new(with_job_ref(attempt(ProvisionStage::Complete), JOB));
    h.cluster.put_job(labelled_job(JOB, t0()));

    let outcome = h.run_at(after(Duration::from_secs(3600))).await.unwrap();

    assert_eq!(
        outcome,
        ReconcileOutcome::requeue(JOB_RETENTION - Duration::from_secs(3600))
    );
    assert!(h.cluster.job_deletions().is_empty());
}

#[tokio::test]
async fn expired_job_is_deleted_and_reference_cleared() {
    let h = Harness::new(with_job_ref(attempt(ProvisionStage::Complete), JOB));
    h.cluster.put_job(labelled_job(JOB, t0()));

    h.run_at(after(JOB_RETENTION)).await.unwrap();

    assert_eq!(h.cluster.job_deletions(), vec![JOB.to_string()]);
    assert!(h.cluster.jobs().is_empty());
    let provision = h.cluster.provision();
    assert_eq!(provision.job_ref_name(), None);
    assert_eq!(provision.stage(), ProvisionStage::Complete);
    assert_eq!(h.events.reasons(), vec![event_reasons::JOB_CLEANED_UP]);
}

#[tokio::test]
async fn completed_attempt_without_job_needs_nothing() {
    let h = Harness::new(attempt(ProvisionStage::Complete));

    let outcome = h.run_at(after(JOB_RETENTION * 3)).await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::done());
    assert_eq!(h.cluster.writes(), (0, 0));
}

#[tokio::test]
async fn deleted_attempt_drops_expectations() {
    let cluster = Arc::new(FakeCluster::default());
    let expectations = Arc::new(Expectations::new());
    expectations.expect_creations(&key().to_string(), 1);
    let reconciler =
        ProvisionReconciler::new(cluster, expectations.clone(), ReconcilerSettings::default());

    let outcome = reconciler.reconcile_at(&key(), t0()).await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::done());
    assert!(expectations.satisfied_expectations(&key().to_string()));
}

#[tokio::test]
async fn terminal_attempts_drop_expectations() {
    for stage in [ProvisionStage::Failed, ProvisionStage::Complete] {
        let expectations = Arc::new(Expectations::new());
        expectations.expect_creations(&key().to_string(), 1);
        let reconciler = ProvisionReconciler::new(
            FakeCluster::with_provision(attempt(stage)),
            expectations.clone(),
            ReconcilerSettings::default(),
        );

        reconciler.reconcile_at(&key(), t0()).await.unwrap();

        assert!(
            expectations.satisfied_expectations(&key().to_string()),
            "{stage:?}"
        );
    }
}

// =============================================================================
// Write failures
// =============================================================================

fn mock_reconciler(mock: MockProvisionClient) -> (ProvisionReconciler, Arc<Expectations>) {
    let expectations = Arc::new(Expectations::new());
    let reconciler = ProvisionReconciler::new(
        Arc::new(mock),
        expectations.clone(),
        ReconcilerSettings::default(),
    );
    (reconciler, expectations)
}

#[tokio::test]
async fn conflict_on_status_write_skips_stage_write() {
    let mut mock = MockProvisionClient::new();
    mock.expect_get_provision()
        .returning(|_, _| Ok(Some(attempt(ProvisionStage::Provisioning))));
    mock.expect_list_jobs().returning(|_, _| Ok(vec![]));
    mock.expect_update_provision_status()
        .returning(|_| Err(api_error(409, "Conflict")));
    mock.expect_update_provision_stage().never();
    let (reconciler, _) = mock_reconciler(mock);

    let err = reconciler.reconcile_at(&key(), t0()).await.unwrap_err();

    assert!(err.is_conflict());
}

#[tokio::test]
async fn failed_create_records_no_expectation() {
    let mut mock = MockProvisionClient::new();
    mock.expect_get_provision()
        .returning(|_, _| Ok(Some(attempt(ProvisionStage::Initializing))));
    mock.expect_list_jobs().returning(|_, _| Ok(vec![]));
    mock.expect_create_job()
        .returning(|_, _| Err(api_error(500, "InternalError")));
    mock.expect_update_provision_status().never();
    let (reconciler, expectations) = mock_reconciler(mock);

    assert!(reconciler.reconcile_at(&key(), t0()).await.is_err());
    assert!(expectations.satisfied_expectations(&key().to_string()));
}

#[tokio::test]
async fn failed_reference_write_keeps_expectation() {
    let mut mock = MockProvisionClient::new();
    mock.expect_get_provision()
        .returning(|_, _| Ok(Some(attempt(ProvisionStage::Initializing))));
    mock.expect_list_jobs().returning(|_, _| Ok(vec![]));
    mock.expect_create_job()
        .times(1)
        .returning(|_, job| Ok(job.clone()));
    mock.expect_update_provision_status()
        .returning(|_| Err(api_error(500, "InternalError")));
    let (reconciler, expectations) = mock_reconciler(mock);

    assert!(reconciler.reconcile_at(&key(), t0()).await.is_err());
    assert!(!expectations.satisfied_expectations(&key().to_string()));

    // a retry must not create a second job
    assert!(reconciler.reconcile_at(&key(), t0()).await.is_ok());
}

#[tokio::test]
async fn read_errors_propagate() {
    let mut mock = MockProvisionClient::new();
    mock.expect_get_provision()
        .returning(|_, _| Err(api_error(503, "ServiceUnavailable")));
    let (reconciler, _) = mock_reconciler(mock);

    let err = reconciler.reconcile_at(&key(), t0()).await.unwrap_err();

    assert_eq!(err.api_code(), Some(503));
}

// =============================================================================
// Runtime adapter
// =============================================================================

fn context() -> Arc<Context> {
    Arc::new(Context {
        reconciler: ProvisionReconciler::new(
            Arc::new(MockProvisionClient::new()),
            Arc::new(Expectations::new()),
            ReconcilerSettings::default(),
        ),
        resync_interval: Duration::from_secs(300),
    })
}

#[test]
fn error_policy_retries_conflicts_quickly() {
    let action = error_policy(
        Arc::new(attempt(ProvisionStage::Provisioning)),
        &api_error(409, "Conflict"),
        context(),
    );
    assert_eq!(action, Action::requeue(Duration::from_secs(1)));
}

#[test]
fn error_policy_backs_off_stuck_pods() {
    let error = Error::InstallPodStuck {
        attempt: key().to_string(),
        job: JOB.to_string(),
        pods: 0,
    };
    let action = error_policy(Arc::new(attempt(ProvisionStage::Provisioning)), &error, context());
    assert_eq!(action, Action::requeue(Duration::from_secs(15)));
}

#[test]
fn error_policy_backs_off_other_errors() {
    let action = error_policy(
        Arc::new(attempt(ProvisionStage::Provisioning)),
        &Error::internal("boom"),
        context(),
    );
    assert_eq!(action, Action::requeue(Duration::from_secs(30)));
}

#[test]
fn labelled_job_maps_to_attempt_and_is_observed() {
    let expectations = Expectations::new();
    expectations.expect_creations(&key().to_string(), 1);

    let target = job_to_provision(&labelled_job(JOB, t0()), &expectations).unwrap();

    assert_eq!(target.name, ATTEMPT);
    assert_eq!(target.namespace.as_deref(), Some(NS));
    assert!(expectations.satisfied_expectations(&key().to_string()));
}

#[test]
fn unlabelled_job_maps_to_nothing() {
    let expectations = Expectations::new();
    let mut job = labelled_job(JOB, t0());
    job.metadata.labels = Some(BTreeMap::from([(
        JOB_TYPE_LABEL.to_string(),
        "deprovision".to_string(),
    )]));
    assert!(job_to_provision(&job, &expectations).is_none());
}

#[test]
fn attempt_key_displays_namespaced_name() {
    assert_eq!(key().to_string(), "clusters/mycluster-0");
    let provision = attempt(ProvisionStage::Initializing);
    assert_eq!(AttemptKey::for_provision(&provision).unwrap(), key());
}
