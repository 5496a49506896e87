//! Events attached to ClusterProvision objects
//!
//! Job creation, adoption, pod trouble and the terminal stages are reported
//! as core/v1 Events so operators can follow an attempt with
//! `kubectl describe clusterprovision`. Publishing never fails a reconcile;
//! a rejected Event is only logged.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Sink for attempt Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Attach an Event to `resource_ref`. `reason` and `action` come from
    /// [`reasons`] and [`actions`]; `note` is free text for humans.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publishes through the API server
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `controller_name` becomes the Event's reporting component; the pod
    /// name (from `POD_NAME`) the reporting instance when set
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

fn attempt_event(type_: EventType, reason: &str, action: &str, note: Option<String>) -> Event {
    Event {
        type_,
        reason: reason.to_string(),
        note,
        action: action.to_string(),
        secondary: None,
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = attempt_event(type_, reason, action, note);
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                object = ?resource_ref.name,
                reason,
                error = %e,
                "event rejected by the API server"
            );
        }
    }
}

/// Drops every Event; for callers that do not report
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons
pub mod reasons {
    /// A backing job was created for the attempt
    pub const JOB_CREATED: &str = "ProvisionJobCreated";
    /// A pre-existing job was adopted by the attempt
    pub const JOB_ADOPTED: &str = "ProvisionJobAdopted";
    /// The attempt entered the Failed stage
    pub const PROVISION_FAILED: &str = "ProvisionFailed";
    /// The attempt entered the Complete stage
    pub const PROVISION_COMPLETE: &str = "ProvisionComplete";
    /// The install pod is missing, duplicated or pending
    pub const INSTALL_POD_STUCK: &str = "InstallPodStuck";
    /// The job of a completed attempt was removed after the retention window
    pub const JOB_CLEANED_UP: &str = "ProvisionJobCleanedUp";
}

/// Event actions
pub mod actions {
    /// Stage and condition updates
    pub const RECONCILE: &str = "Reconcile";
    /// Creating or adopting the backing job
    pub const PROVISION: &str = "Provision";
    /// Deleting the backing job
    pub const DELETE: &str = "Delete";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_events_carry_reason_and_note() {
        let event = attempt_event(
            EventType::Warning,
            reasons::INSTALL_POD_STUCK,
            actions::RECONCILE,
            Some("found 2 install pods".to_string()),
        );
        assert!(matches!(event.type_, EventType::Warning));
        assert_eq!(event.reason, "InstallPodStuck");
        assert_eq!(event.action, "Reconcile");
        assert_eq!(event.note.as_deref(), Some("found 2 install pods"));
        assert!(event.secondary.is_none());
    }

    #[tokio::test]
    async fn noop_publisher_accepts_events() {
        let publisher: &dyn EventPublisher = &NoopEventPublisher;
        publisher
            .publish(
                &ObjectReference::default(),
                EventType::Normal,
                reasons::PROVISION_COMPLETE,
                actions::RECONCILE,
                None,
            )
            .await;
    }
}
