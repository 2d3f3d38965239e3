//! Node-scoped event publishing.
//!
//! Events are advisory: failures to publish are logged and retried a few
//! times but never fail a reconcile.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ObjectMeta, PostParams};
use tracing::warn;

pub const REASON_DEVICE_REMOVED: &str = "DeviceRemoved";
pub const REASON_INVENTORY_CHANGED: &str = "InventoryChanged";
pub const REASON_DETECTION_UNAVAILABLE: &str = "DetectionUnavailable";

const COMPONENT: &str = "gpu-inventory-controller";
const PUBLISH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

impl EventSeverity {
    fn as_str(&self) -> &'static str {
        match self {
            EventSeverity::Normal => "Normal",
            EventSeverity::Warning => "Warning",
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, node: &Node, severity: EventSeverity, reason: &str, message: &str);
}

#[async_trait]
impl<T: EventSink + ?Sized> EventSink for std::sync::Arc<T> {
    async fn publish(&self, node: &Node, severity: EventSeverity, reason: &str, message: &str) {
        (**self).publish(node, severity, reason, message).await
    }
}

/// Publishes core/v1 Events referencing the node.
pub struct NodeEventRecorder {
    events: Api<Event>,
}

impl NodeEventRecorder {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        NodeEventRecorder {
            events: Api::namespaced(client, namespace),
        }
    }

    fn event_for(node: &Node, severity: EventSeverity, reason: &str, message: &str) -> Event {
        let node_name = node.metadata.name.clone().unwrap_or_default();
        let now = Time(Utc::now());
        Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", node_name)),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Node".to_string()),
                name: Some(node_name),
                uid: node.metadata.uid.clone(),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some(severity.as_str().to_string()),
            source: Some(EventSource {
                component: Some(COMPONENT.to_string()),
                ..Default::default()
            }),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            ..Default::default()
        }
    }
}

#[async_trait]
impl EventSink for NodeEventRecorder {
    async fn publish(&self, node: &Node, severity: EventSeverity, reason: &str, message: &str) {
        let event = Self::event_for(node, severity, reason, message);
        let mut delay = std::time::Duration::from_millis(100);
        for attempt in 1..=PUBLISH_ATTEMPTS {
            match self.events.create(&PostParams::default(), &event).await {
                Ok(_) => return,
                Err(err) if attempt == PUBLISH_ATTEMPTS => {
                    warn!(reason, error = %err, "giving up publishing event");
                }
                Err(err) => {
                    warn!(reason, error = %err, attempt, "retrying event publish");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records published events for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<(EventSeverity, String, String)>>,
    }

    impl RecordingSink {
        pub fn reasons(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(_, reason, _)| reason.clone())
                .collect()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish(
            &self,
            _node: &Node,
            severity: EventSeverity,
            reason: &str,
            message: &str,
        ) {
            self.events.lock().unwrap().push((
                severity,
                reason.to_string(),
                message.to_string(),
            ));
        }
    }
}
