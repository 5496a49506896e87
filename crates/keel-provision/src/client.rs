//! Cluster access for the provision controller
//!
//! Everything the reconciler reads or writes goes through [`ProvisionClient`]
//! so the state machine can be exercised against an in-memory cluster in
//! tests while production talks to the API server.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use keel_common::crd::{ClusterProvision, ProvisionStage};
use keel_common::{Error, FIELD_MANAGER};

/// Trait abstracting Kubernetes operations on attempts, jobs and pods
///
/// Writes to a ClusterProvision are conditional on the resourceVersion of the
/// object passed in; a stale object fails with a 409 conflict.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProvisionClient: Send + Sync {
    /// Get a ClusterProvision, `None` if it does not exist
    async fn get_provision(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterProvision>, Error>;

    /// Write the status of a ClusterProvision, returning the updated object
    async fn update_provision_status(
        &self,
        provision: &ClusterProvision,
    ) -> Result<ClusterProvision, Error>;

    /// Write the stage of a ClusterProvision, returning the updated object
    async fn update_provision_stage(
        &self,
        provision: &ClusterProvision,
        stage: ProvisionStage,
    ) -> Result<ClusterProvision, Error>;

    /// Get a Job by name, `None` if it does not exist
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error>;

    /// List Jobs matching a label selector
    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>, Error>;

    /// Create a Job
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, Error>;

    /// Delete a Job and its pods; deleting a missing Job succeeds
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// List Pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeProvisionClient {
    client: Client,
}

impl KubeProvisionClient {
    /// Create a new KubeProvisionClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn provisions(&self, provision: &ClusterProvision) -> Result<Api<ClusterProvision>, Error> {
        let namespace = provision.namespace().ok_or_else(|| {
            Error::validation_for(provision.name_any(), "ClusterProvision has no namespace")
        })?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }
}

/// Merge patch pinned to the object's resourceVersion
fn conditional_patch(provision: &ClusterProvision, body: Value) -> Value {
    let mut patch = body;
    if let Some(rv) = provision.resource_version() {
        patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
    }
    patch
}

fn status_body(provision: &ClusterProvision) -> Result<Value, Error> {
    let status = provision.status.clone().unwrap_or_default();
    let mut body = serde_json::to_value(&status)?;
    // a merge patch only clears jobRef when it is sent as an explicit null
    if status.job_ref.is_none() {
        body["jobRef"] = Value::Null;
    }
    Ok(serde_json::json!({ "status": body }))
}

#[async_trait]
impl ProvisionClient for KubeProvisionClient {
    async fn get_provision(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterProvision>, Error> {
        let api: Api<ClusterProvision> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_provision_status(
        &self,
        provision: &ClusterProvision,
    ) -> Result<ClusterProvision, Error> {
        let api = self.provisions(provision)?;
        let patch = conditional_patch(provision, status_body(provision)?);
        let updated = api
            .patch_status(
                &provision.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(updated)
    }

    async fn update_provision_stage(
        &self,
        provision: &ClusterProvision,
        stage: ProvisionStage,
    ) -> Result<ClusterProvision, Error> {
        let api = self.provisions(provision)?;
        let patch = conditional_patch(
            provision,
            serde_json::json!({ "spec": { "stage": stage } }),
        );
        let updated = api
            .patch(
                &provision.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(updated)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let jobs = api.list(&ListParams::default().labels(selector)).await?;
        Ok(jobs.items)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), job).await?)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await.map_err(Error::from) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(job = %name, namespace = %namespace, "job already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        Ok(pods.items)
    }
}
