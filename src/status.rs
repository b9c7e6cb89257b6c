use crate::engine::{ActorRole, ContainerDescriptor, Engine, RoleMatcher};
use crate::error::ProxyError;
use std::fmt;
use std::sync::Arc;

/// Which workloads are running right now, as reported by the engine.
///
/// Built fresh for every decision and never cached. Activity is derived
/// from the presence of an id, so the flags cannot disagree with the ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostStatus {
    pub miner_container_id: Option<String>,
    pub edge_work_container_id: Option<String>,
}

impl HostStatus {
    pub fn mining_active(&self) -> bool {
        self.miner_container_id.is_some()
    }

    pub fn edge_work_active(&self) -> bool {
        self.edge_work_container_id.is_some()
    }

    pub fn is_idle(&self) -> bool {
        !self.mining_active() && !self.edge_work_active()
    }

    /// Classify a container list. When several containers match a category
    /// the last one listed wins.
    pub fn classify(containers: &[ContainerDescriptor], miner_name: &str, roles: &RoleMatcher) -> Self {
        let mut status = HostStatus::default();
        for container in containers {
            if is_miner(container, miner_name) {
                status.miner_container_id = Some(container.id.clone());
            }
            if roles.role(&container.labels) == ActorRole::Worker {
                status.edge_work_container_id = Some(container.id.clone());
            }
        }
        status
    }
}

fn is_miner(container: &ContainerDescriptor, miner_name: &str) -> bool {
    container.names.iter().any(|n| n.contains(miner_name))
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mining={} ({}) edge_work={} ({})",
            self.mining_active(),
            self.miner_container_id.as_deref().unwrap_or("-"),
            self.edge_work_active(),
            self.edge_work_container_id.as_deref().unwrap_or("-"),
        )
    }
}

/// Produces [`HostStatus`] snapshots from the engine's live container list.
pub struct StatusTracker<E> {
    engine: Arc<E>,
    miner_name: String,
    roles: RoleMatcher,
}

impl<E: Engine> StatusTracker<E> {
    pub fn new(engine: Arc<E>, miner_name: impl Into<String>, roles: RoleMatcher) -> Self {
        Self {
            engine,
            miner_name: miner_name.into(),
            roles,
        }
    }

    pub async fn snapshot(&self) -> Result<HostStatus, ProxyError> {
        let containers = self.engine.list_containers().await?;
        let status = HostStatus::classify(&containers, &self.miner_name, &self.roles);
        tracing::debug!("Host status: {status}");
        Ok(status)
    }

    /// Every listed miner container, in list order.
    pub async fn miner_ids(&self) -> Result<Vec<String>, ProxyError> {
        let containers = self.engine.list_containers().await?;
        Ok(containers
            .into_iter()
            .filter(|c| is_miner(c, &self.miner_name))
            .map(|c| c.id)
            .collect())
    }
}
