use crate::engine::{EventAction, LifecycleEvent, ResourceKind, RoleMatcher};
use serde::Deserialize;
use std::collections::HashMap;

/// One record of the engine's `/events` stream.
#[derive(Debug, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "Type", default)]
    pub kind: Option<String>,
    #[serde(rename = "Action", default)]
    pub action: Option<String>,
    /// Pre-1.22 engines only send `status`.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "Actor", default)]
    pub actor: Option<EventActor>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub time: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventActor {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Attributes", default)]
    pub attributes: Option<HashMap<String, String>>,
}

impl EngineEvent {
    /// Normalize into a [`LifecycleEvent`], classifying the actor by its role label.
    pub fn into_lifecycle(self, roles: &RoleMatcher) -> LifecycleEvent {
        let resource_kind = match self.kind.as_deref() {
            Some("container") | None => ResourceKind::Container,
            Some(other) => ResourceKind::Other(other.to_string()),
        };
        let action = self
            .action
            .or(self.status)
            .map(|a| EventAction::parse(&a))
            .unwrap_or_else(|| EventAction::Other(String::new()));

        let actor = self.actor.unwrap_or_default();
        let attributes = actor.attributes.unwrap_or_default();
        let actor_id = if actor.id.is_empty() {
            self.id.unwrap_or_default()
        } else {
            actor.id
        };

        LifecycleEvent {
            resource_kind,
            action,
            actor_role: roles.role(&attributes),
            actor_id,
            time: self.time.unwrap_or(0),
        }
    }
}

/// One record of an image pull progress stream.
#[derive(Debug, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}
