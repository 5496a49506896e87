//! Controller runner - builds the ClusterProvision controller future

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use keel_common::crd::ClusterProvision;
use keel_common::events::KubeEventPublisher;
use keel_common::PROVISION_JOB_SELECTOR;
use keel_provision::{
    error_policy, job_to_provision, reconcile, Context, Expectations, FailureReasonResolver,
    JobConditionReason, KubeProvisionClient, ProvisionReconciler, UnknownFailureReason,
};

use crate::cli::{ControllerArgs, FailureReasonSource};

/// Name reported on published Events
pub const CONTROLLER_NAME: &str = "keel-provision-controller";

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so the API server closes idle watches before the client gives up.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn failure_resolver(source: FailureReasonSource) -> Arc<dyn FailureReasonResolver> {
    match source {
        FailureReasonSource::Unknown => Arc::new(UnknownFailureReason),
        FailureReasonSource::JobCondition => Arc::new(JobConditionReason),
    }
}

/// Build the ClusterProvision controller future
///
/// Labelled provision jobs are watched as well: every job event marks the
/// creation as observed and re-triggers the owning attempt.
pub fn build_provision_controller(
    client: Client,
    args: &ControllerArgs,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let expectations = Arc::new(Expectations::new());
    let reconciler = ProvisionReconciler::new(
        Arc::new(KubeProvisionClient::new(client.clone())),
        expectations.clone(),
        args.reconciler_settings(),
    )
    .with_events(Arc::new(KubeEventPublisher::new(
        client.clone(),
        CONTROLLER_NAME,
    )))
    .with_failure_reasons(failure_resolver(args.failure_reasons));

    let ctx = Arc::new(Context {
        reconciler,
        resync_interval: args.resync_interval(),
    });

    let (provisions, jobs): (Api<ClusterProvision>, Api<Job>) = match &args.watch_namespace {
        Some(ns) => {
            tracing::info!(namespace = %ns, "- ClusterProvision controller (namespaced)");
            (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client, ns),
            )
        }
        None => {
            tracing::info!("- ClusterProvision controller");
            (Api::all(client.clone()), Api::all(client))
        }
    };

    Box::pin(
        Controller::new(
            provisions,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .watches(
            jobs,
            WatcherConfig::default()
                .labels(PROVISION_JOB_SELECTOR)
                .timeout(WATCH_TIMEOUT_SECS),
            move |job| job_to_provision(&job, &expectations),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("ClusterProvision")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
