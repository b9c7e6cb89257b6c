//! Starting and stopping the leisure miner.
//!
//! Every mutation runs under one transition lock and does not release it
//! until the engine reports the new state, so a directive never acts on a
//! status that an earlier directive is still changing. The lock is the only
//! in-process coordination; whether a miner exists is always read back from
//! the engine.

use crate::config::{MinerConfig, ProxySettings, ROLE_LEISURE_MINER};
use crate::engine::{CreateContainerSpec, Engine, RoleMatcher};
use crate::error::ProxyError;
use crate::status::{HostStatus, StatusTracker};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// What a lifecycle event asks the controller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    StartMiner,
    StopMiner,
    /// Start the miner only if the host is idle; stop it if edge work is running.
    Reconcile,
    NoOp,
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Directive::StartMiner => "start-miner",
            Directive::StopMiner => "stop-miner",
            Directive::Reconcile => "reconcile",
            Directive::NoOp => "no-op",
        };
        f.write_str(name)
    }
}

/// Result of a directive that completed without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MinerOutcome {
    Started(String),
    AlreadyRunning(String),
    /// Edge work holds the host; the miner was not started.
    Yielded(String),
    Stopped(Vec<String>),
    NotRunning,
    Skipped,
}

impl fmt::Display for MinerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MinerOutcome::Started(id) => write!(f, "miner {id} started"),
            MinerOutcome::AlreadyRunning(id) => write!(f, "miner {id} already running"),
            MinerOutcome::Yielded(id) => write!(f, "edge work {id} active, miner not started"),
            MinerOutcome::Stopped(ids) => write!(f, "miner stopped ({})", ids.join(", ")),
            MinerOutcome::NotRunning => write!(f, "no miner running"),
            MinerOutcome::Skipped => write!(f, "nothing to do"),
        }
    }
}

pub struct LifecycleController<E> {
    engine: Arc<E>,
    tracker: StatusTracker<E>,
    config: MinerConfig,
    settings: ProxySettings,
    transition: Mutex<()>,
}

impl<E: Engine> LifecycleController<E> {
    pub fn new(engine: Arc<E>, config: MinerConfig, settings: ProxySettings) -> Self {
        let tracker = StatusTracker::new(
            engine.clone(),
            settings.miner_name.clone(),
            RoleMatcher::from_settings(&settings),
        );
        Self {
            engine,
            tracker,
            config,
            settings,
            transition: Mutex::new(()),
        }
    }

    pub fn tracker(&self) -> &StatusTracker<E> {
        &self.tracker
    }

    pub async fn apply(&self, directive: Directive) -> Result<MinerOutcome, ProxyError> {
        match directive {
            Directive::StartMiner => self.ensure_miner_running().await,
            Directive::StopMiner => self.ensure_miner_stopped().await,
            Directive::Reconcile => self.reconcile().await,
            Directive::NoOp => Ok(MinerOutcome::Skipped),
        }
    }

    /// Container definition for the miner.
    pub fn miner_spec(&self) -> CreateContainerSpec {
        CreateContainerSpec {
            name: self.settings.miner_name.clone(),
            image: self.settings.image.clone(),
            env: self.config.env(&self.settings.baseline_env),
            labels: HashMap::from([(
                self.settings.role_label_key.clone(),
                ROLE_LEISURE_MINER.to_string(),
            )]),
            cap_add: self.settings.cap_add.clone(),
            auto_remove: true,
        }
    }

    /// Stop every running miner and wait until the engine no longer lists one.
    ///
    /// A no-op when no miner is running.
    pub async fn ensure_miner_stopped(&self) -> Result<MinerOutcome, ProxyError> {
        let _transition = self.transition.lock().await;

        let deadline = Instant::now() + self.settings.barrier_timeout;
        let mut stopped: Vec<String> = Vec::new();
        let mut requested: HashSet<String> = HashSet::new();

        loop {
            let miners = self.tracker.miner_ids().await?;
            if miners.is_empty() {
                if stopped.is_empty() {
                    return Ok(MinerOutcome::NotRunning);
                }
                tracing::info!("Miner stopped: {}", stopped.join(", "));
                return Ok(MinerOutcome::Stopped(stopped));
            }

            // Newest listing first; a stuck one must not hold up the rest.
            let mut sent = false;
            for id in miners.iter().rev() {
                if requested.insert(id.clone()) {
                    tracing::info!("Stopping miner {id}");
                    self.engine.stop_container(id).await?;
                    stopped.push(id.clone());
                    sent = true;
                }
            }
            if sent {
                continue;
            }

            if Instant::now() >= deadline {
                return Err(ProxyError::BarrierTimeout(format!(
                    "miner {} to disappear after stop",
                    miners.join(", ")
                )));
            }
            tokio::time::sleep(self.settings.barrier_poll_interval).await;
        }
    }

    /// Start the miner unless one is already running or edge work holds the host.
    pub async fn ensure_miner_running(&self) -> Result<MinerOutcome, ProxyError> {
        // Only edge work short-circuits here. A listed miner may be one that
        // an in-flight stop is still removing, so that is decided under the lock.
        let status = self.tracker.snapshot().await?;
        if let Some(id) = status.edge_work_container_id {
            let outcome = MinerOutcome::Yielded(id);
            tracing::info!("Not starting miner: {outcome}");
            return Ok(outcome);
        }

        tracing::info!("Pulling miner image {}", self.settings.image);
        self.engine.pull_image(&self.settings.image).await?;

        let _transition = self.transition.lock().await;

        let status = self.tracker.snapshot().await?;
        if let Some(outcome) = Self::blocks_start(&status) {
            tracing::info!("Not starting miner: {outcome}");
            return Ok(outcome);
        }

        let spec = self.miner_spec();
        tracing::info!(
            "Creating miner {} from {} with env {:?}",
            spec.name,
            spec.image,
            spec.env
        );
        let id = self.engine.create_container(&spec).await?;
        self.engine.start_container(&id).await?;

        self.await_miner_visible(&id).await?;
        tracing::info!("Miner {id} running");
        Ok(MinerOutcome::Started(id))
    }

    /// Bring the host to a consistent state: mine when idle, never mine
    /// alongside edge work.
    pub async fn reconcile(&self) -> Result<MinerOutcome, ProxyError> {
        let status = self.tracker.snapshot().await?;
        tracing::info!("Reconciling: {status}");

        match (status.mining_active(), status.edge_work_active()) {
            (false, false) => self.ensure_miner_running().await,
            (true, true) => {
                tracing::warn!("Miner and edge work are both running, stopping miner");
                self.ensure_miner_stopped().await
            }
            _ => Ok(Self::blocks_start(&status).unwrap_or(MinerOutcome::Skipped)),
        }
    }

    fn blocks_start(status: &HostStatus) -> Option<MinerOutcome> {
        if let Some(id) = &status.edge_work_container_id {
            return Some(MinerOutcome::Yielded(id.clone()));
        }
        status
            .miner_container_id
            .as_ref()
            .map(|id| MinerOutcome::AlreadyRunning(id.clone()))
    }

    async fn await_miner_visible(&self, id: &str) -> Result<(), ProxyError> {
        let deadline = Instant::now() + self.settings.barrier_timeout;
        loop {
            if self.tracker.snapshot().await?.mining_active() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProxyError::BarrierTimeout(format!(
                    "miner {id} to appear after start"
                )));
            }
            tokio::time::sleep(self.settings.barrier_poll_interval).await;
        }
    }
}
