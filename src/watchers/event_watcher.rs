use crate::config::ProxySettings;
use crate::engine::{ActorRole, Engine, EventAction, EventSubscription, LifecycleEvent, ResourceKind};
use crate::error::ProxyError;
use crate::lifecycle::{Directive, LifecycleController, MinerOutcome};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::Instrument;
use uuid::Uuid;

/// Map an engine event to the directive it calls for.
pub fn decide(event: &LifecycleEvent) -> Directive {
    if event.resource_kind != ResourceKind::Container {
        return Directive::NoOp;
    }
    match (&event.action, event.actor_role) {
        // Edge work arrived: mining must yield.
        (EventAction::Start, ActorRole::Worker) => Directive::StopMiner,
        (EventAction::Destroy, ActorRole::Worker) => Directive::StartMiner,
        // This proxy is being shut down.
        (EventAction::Kill, ActorRole::Proxy) => Directive::StopMiner,
        _ => Directive::NoOp,
    }
}

struct DirectiveReport {
    id: Uuid,
    directive: Directive,
    result: Result<MinerOutcome, ProxyError>,
}

/// Listens to engine events and runs the resulting directives as
/// supervised background tasks.
pub struct EventWatcher<E> {
    engine: Arc<E>,
    controller: Arc<LifecycleController<E>>,
    idle_timeout: Duration,
    permits: Arc<Semaphore>,
    in_flight: JoinSet<DirectiveReport>,
}

impl<E: Engine> EventWatcher<E> {
    pub fn new(
        engine: Arc<E>,
        controller: Arc<LifecycleController<E>>,
        settings: &ProxySettings,
    ) -> Self {
        Self {
            engine,
            controller,
            idle_timeout: settings.idle_timeout,
            permits: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
            in_flight: JoinSet::new(),
        }
    }

    /// Spawn a directive without waiting for it. Returns `None` for no-ops.
    pub fn dispatch(&mut self, directive: Directive) -> Option<Uuid> {
        if directive == Directive::NoOp {
            return None;
        }

        let id = Uuid::new_v4();
        let controller = self.controller.clone();
        let permits = self.permits.clone();
        let span = tracing::info_span!("directive", %id, %directive);

        self.in_flight.spawn(
            async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                let result = controller.apply(directive).await;
                DirectiveReport {
                    id,
                    directive,
                    result,
                }
            }
            .instrument(span),
        );
        Some(id)
    }

    /// Number of directives spawned and not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn handle_event(&mut self, event: LifecycleEvent) {
        tracing::debug!(
            "Engine event: {:?} {:?} actor={} role={:?} at {}",
            event.resource_kind,
            event.action,
            event.actor_id,
            event.actor_role,
            format_event_time(event.time)
        );

        let directive = decide(&event);
        if directive == Directive::NoOp {
            return;
        }
        tracing::info!(
            "Container {} ({:?}) {:?}: dispatching {directive}",
            event.actor_id,
            event.actor_role,
            event.action
        );
        self.dispatch(directive);
    }

    fn report(result: Result<DirectiveReport, JoinError>) {
        match result {
            Ok(DirectiveReport {
                id,
                directive,
                result: Ok(outcome),
            }) => tracing::info!("Directive {directive} ({id}) done: {outcome}"),
            Ok(DirectiveReport {
                id,
                directive,
                result: Err(e),
            }) => tracing::error!("Directive {directive} ({id}) failed: {e}"),
            Err(e) => tracing::error!("Directive task aborted: {e}"),
        }
    }

    async fn drain(&mut self) {
        while let Some(result) = self.in_flight.join_next().await {
            Self::report(result);
        }
    }

    /// Run until `shutdown` resolves, then wait for in-flight directives.
    ///
    /// Stream errors and failed directives are logged and never end the loop.
    /// Returns an error only if the event subscription itself goes away.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), ProxyError> {
        let EventSubscription {
            mut events,
            mut errors,
        } = self.engine.subscribe_events();
        let mut errors_open = true;
        tokio::pin!(shutdown);

        tracing::info!("Watching engine events");

        let closed = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    // The proxy's own kill event lands together with the signal.
                    while let Ok(event) = events.try_recv() {
                        self.handle_event(event);
                    }
                    tracing::info!(
                        "Shutting down, waiting for {} in-flight directive(s)",
                        self.in_flight.len()
                    );
                    break false;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break true,
                },
                error = errors.recv(), if errors_open => match error {
                    Some(e) => tracing::warn!("Engine event stream error: {e}"),
                    None => errors_open = false,
                },
                Some(result) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    Self::report(result);
                }
                _ = tokio::time::sleep(self.idle_timeout) => {
                    tracing::info!(
                        "No engine events for {}s, {} directive(s) in flight",
                        self.idle_timeout.as_secs(),
                        self.in_flight.len()
                    );
                }
            }
        };

        self.drain().await;

        if closed {
            return Err(ProxyError::EngineUnavailable(
                "engine event subscription closed".to_string(),
            ));
        }
        Ok(())
    }
}

fn format_event_time(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|d| d.to_rfc3339())
        .unwrap_or_default()
}
