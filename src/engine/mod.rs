//! Narrow capability interface to the container engine.
//!
//! The arbitration logic only ever talks to an [`Engine`]. The Docker
//! Engine API implementation lives in [`docker_api`]; tests use the
//! in-memory engine from `fake`.

pub mod docker_api;
pub mod events;
pub mod transport;

#[cfg(test)]
pub(crate) mod fake;

use crate::config::{ProxySettings, ROLE_LEISURE_MINER, ROLE_PROXY, ROLE_WORKER};
use crate::error::ProxyError;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::mpsc;

/// A running container as reported by the engine's list call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDescriptor {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub labels: HashMap<String, String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Everything needed to create the miner container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub cap_add: Vec<String>,
    pub auto_remove: bool,
}

/// Kind of object an engine notification is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    Container,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Start,
    Destroy,
    Kill,
    Other(String),
}

impl EventAction {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "start" => EventAction::Start,
            "destroy" => EventAction::Destroy,
            "kill" => EventAction::Kill,
            other => EventAction::Other(other.to_string()),
        }
    }
}

/// What the container that triggered an event is, judged by its role label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorRole {
    /// Edge work.
    Worker,
    /// This controller's own container.
    Proxy,
    LeisureMiner,
    Other,
}

impl ActorRole {
    fn from_label_value(value: &str) -> Option<Self> {
        match value {
            ROLE_WORKER => Some(ActorRole::Worker),
            ROLE_PROXY => Some(ActorRole::Proxy),
            ROLE_LEISURE_MINER => Some(ActorRole::LeisureMiner),
            _ => None,
        }
    }
}

/// Classifies containers by their role label.
///
/// The role key is looked up exactly. With `substring_keys` set, any label
/// whose key contains the role key is also considered, which is how older
/// deployments were matched.
#[derive(Debug, Clone)]
pub struct RoleMatcher {
    key: String,
    substring_keys: bool,
}

impl RoleMatcher {
    pub fn new(key: impl Into<String>, substring_keys: bool) -> Self {
        Self {
            key: key.into(),
            substring_keys,
        }
    }

    pub fn from_settings(settings: &ProxySettings) -> Self {
        Self::new(settings.role_label_key.clone(), settings.legacy_label_matching)
    }

    pub fn role(&self, labels: &HashMap<String, String>) -> ActorRole {
        if let Some(role) = labels
            .get(&self.key)
            .and_then(|v| ActorRole::from_label_value(v))
        {
            return role;
        }

        if self.substring_keys {
            return labels
                .iter()
                .filter(|(k, _)| k.contains(&self.key))
                .find_map(|(_, v)| ActorRole::from_label_value(v))
                .unwrap_or(ActorRole::Other);
        }

        ActorRole::Other
    }
}

/// Normalized engine notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub resource_kind: ResourceKind,
    pub action: EventAction,
    pub actor_role: ActorRole,
    pub actor_id: String,
    /// Engine timestamp in seconds since the epoch, 0 when absent.
    pub time: i64,
}

/// The two channels of an event subscription: decoded events and stream errors.
pub struct EventSubscription {
    pub events: mpsc::Receiver<LifecycleEvent>,
    pub errors: mpsc::Receiver<ProxyError>,
}

/// Engine operations consumed by the arbitration core.
pub trait Engine: Send + Sync + 'static {
    /// Engine-wide metadata labels, each formatted as `key=value`.
    fn host_labels(&self) -> impl Future<Output = Result<Vec<String>, ProxyError>> + Send;

    /// Currently running containers.
    fn list_containers(
        &self,
    ) -> impl Future<Output = Result<Vec<ContainerDescriptor>, ProxyError>> + Send;

    /// Pull an image, draining the progress stream to completion.
    fn pull_image(&self, reference: &str) -> impl Future<Output = Result<(), ProxyError>> + Send;

    /// Create a container and return its identifier.
    fn create_container(
        &self,
        spec: &CreateContainerSpec,
    ) -> impl Future<Output = Result<String, ProxyError>> + Send;

    fn start_container(&self, id: &str) -> impl Future<Output = Result<(), ProxyError>> + Send;

    /// Stop a container. Already stopped or missing containers count as success.
    fn stop_container(&self, id: &str) -> impl Future<Output = Result<(), ProxyError>> + Send;

    /// Open the event feed for the lifetime of the returned receivers.
    fn subscribe_events(&self) -> EventSubscription;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn exact_key_lookup() {
        let roles = RoleMatcher::new("com.massgrid.type", false);
        assert_eq!(roles.role(&labels(&[("com.massgrid.type", "worker")])), ActorRole::Worker);
        assert_eq!(roles.role(&labels(&[("com.massgrid.type", "proxy")])), ActorRole::Proxy);
        assert_eq!(
            roles.role(&labels(&[("com.massgrid.type", "leisureminer")])),
            ActorRole::LeisureMiner
        );
        assert_eq!(roles.role(&labels(&[("com.massgrid.type", "db")])), ActorRole::Other);
        assert_eq!(roles.role(&HashMap::new()), ActorRole::Other);
    }

    #[test]
    fn prefixed_key_needs_legacy_matching() {
        let prefixed = labels(&[("io.edge.com.massgrid.type", "worker")]);
        assert_eq!(
            RoleMatcher::new("com.massgrid.type", false).role(&prefixed),
            ActorRole::Other
        );
        assert_eq!(
            RoleMatcher::new("com.massgrid.type", true).role(&prefixed),
            ActorRole::Worker
        );
    }

    #[test]
    fn role_value_is_matched_exactly() {
        let roles = RoleMatcher::new("com.massgrid.type", true);
        assert_eq!(
            roles.role(&labels(&[("com.massgrid.type", "workers")])),
            ActorRole::Other
        );
    }

    #[test]
    fn container_descriptor_tolerates_null_labels() {
        let json = r#"[{"Id": "abc", "Names": ["/leisureMiner"], "Labels": null, "State": "running"}]"#;
        let containers: Vec<ContainerDescriptor> = serde_json::from_str(json).unwrap();
        assert_eq!(containers[0].id, "abc");
        assert_eq!(containers[0].names, vec!["/leisureMiner"]);
        assert!(containers[0].labels.is_empty());
    }

    #[test]
    fn event_action_parse() {
        assert_eq!(EventAction::parse("start"), EventAction::Start);
        assert_eq!(EventAction::parse("destroy"), EventAction::Destroy);
        assert_eq!(EventAction::parse("kill"), EventAction::Kill);
        assert_eq!(EventAction::parse("die"), EventAction::Other("die".into()));
    }
}
