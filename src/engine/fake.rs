//! In-memory engine for tests.

use crate::engine::{
    ContainerDescriptor, CreateContainerSpec, Engine, EventSubscription, LifecycleEvent,
};
use crate::error::ProxyError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeState {
    host_labels: Vec<String>,
    running: Vec<ContainerDescriptor>,
    pulls: Vec<String>,
    created: Vec<(String, CreateContainerSpec)>,
    started: Vec<String>,
    stopped: Vec<String>,
    fail_pull: bool,
    fail_create: bool,
    fail_list: bool,
    stop_error: Option<String>,
    /// Containers that survive a stop call.
    stuck: Vec<String>,
    subscription: Option<EventSubscription>,
}

pub struct FakeEngine {
    state: Mutex<FakeState>,
    next_id: AtomicUsize,
    create_delay: Duration,
}

pub struct FakeFeed {
    pub events: mpsc::Sender<LifecycleEvent>,
    pub errors: mpsc::Sender<ProxyError>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::with_create_delay(Duration::ZERO)
    }

    /// Engine whose create call takes `delay` before the container shows up.
    pub fn with_create_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            next_id: AtomicUsize::new(1),
            create_delay: delay,
        }
    }

    pub fn set_host_labels(&self, labels: &[&str]) {
        self.state.lock().unwrap().host_labels = labels.iter().map(|s| s.to_string()).collect();
    }

    /// Add a running container with the given name and labels; returns its id.
    pub fn run_container(&self, name: &str, labels: &[(&str, &str)]) -> String {
        let id = format!("c{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let container = ContainerDescriptor {
            id: id.clone(),
            names: vec![format!("/{name}")],
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.state.lock().unwrap().running.push(container);
        id
    }

    pub fn run_edge_work(&self, name: &str) -> String {
        self.run_container(name, &[("com.massgrid.type", "worker")])
    }

    pub fn fail_pull(&self, fail: bool) {
        self.state.lock().unwrap().fail_pull = fail;
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    pub fn fail_list(&self, fail: bool) {
        self.state.lock().unwrap().fail_list = fail;
    }

    pub fn fail_stop(&self, message: &str) {
        self.state.lock().unwrap().stop_error = Some(message.to_string());
    }

    pub fn make_stuck(&self, id: &str) {
        self.state.lock().unwrap().stuck.push(id.to_string());
    }

    /// Let a stuck container finish exiting.
    pub fn release(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.stuck.retain(|s| s != id);
        state.running.retain(|c| c.id != id);
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().running.iter().map(|c| c.id.clone()).collect()
    }

    pub fn running_named(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .running
            .iter()
            .filter(|c| c.names.iter().any(|n| n.contains(name)))
            .count()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state.lock().unwrap().pulls.clone()
    }

    pub fn created(&self) -> Vec<CreateContainerSpec> {
        self.state
            .lock()
            .unwrap()
            .created
            .iter()
            .map(|(_, spec)| spec.clone())
            .collect()
    }

    pub fn started(&self) -> Vec<String> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped.clone()
    }

    /// Prepare the channels handed out by the next `subscribe_events` call.
    pub fn feed(&self) -> FakeFeed {
        let (events_tx, events) = mpsc::channel(64);
        let (errors_tx, errors) = mpsc::channel(64);
        self.state.lock().unwrap().subscription = Some(EventSubscription { events, errors });
        FakeFeed {
            events: events_tx,
            errors: errors_tx,
        }
    }
}

impl Engine for FakeEngine {
    async fn host_labels(&self) -> Result<Vec<String>, ProxyError> {
        let state = self.state.lock().unwrap();
        if state.fail_list {
            return Err(ProxyError::EngineUnavailable("fake engine offline".into()));
        }
        Ok(state.host_labels.clone())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerDescriptor>, ProxyError> {
        let state = self.state.lock().unwrap();
        if state.fail_list {
            return Err(ProxyError::EngineUnavailable("fake engine offline".into()));
        }
        Ok(state.running.clone())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), ProxyError> {
        let mut state = self.state.lock().unwrap();
        state.pulls.push(reference.to_string());
        if state.fail_pull {
            return Err(ProxyError::ImagePullFailed(format!("{reference}: not found")));
        }
        Ok(())
    }

    async fn create_container(&self, spec: &CreateContainerSpec) -> Result<String, ProxyError> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(ProxyError::CreateFailed(format!("{}: conflict", spec.name)));
        }
        let id = format!("m{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        state.created.push((id.clone(), spec.clone()));
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), ProxyError> {
        let mut state = self.state.lock().unwrap();
        let spec = state
            .created
            .iter()
            .find(|(created_id, _)| created_id == id)
            .map(|(_, spec)| spec.clone())
            .ok_or_else(|| ProxyError::StartFailed(format!("{id}: no such container")))?;
        state.started.push(id.to_string());
        state.running.push(ContainerDescriptor {
            id: id.to_string(),
            names: vec![format!("/{}", spec.name)],
            labels: spec.labels.clone(),
        });
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), ProxyError> {
        let mut state = self.state.lock().unwrap();
        state.stopped.push(id.to_string());
        if let Some(message) = &state.stop_error {
            return Err(ProxyError::StopFailed(format!("{id}: {message}")));
        }
        if !state.stuck.iter().any(|s| s == id) {
            state.running.retain(|c| c.id != id);
        }
        Ok(())
    }

    fn subscribe_events(&self) -> EventSubscription {
        self.state
            .lock()
            .unwrap()
            .subscription
            .take()
            .unwrap_or_else(|| {
                let (_, events) = mpsc::channel(1);
                let (_, errors) = mpsc::channel(1);
                EventSubscription { events, errors }
            })
    }
}
