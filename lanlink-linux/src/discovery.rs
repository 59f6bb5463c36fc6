//! Discovery engine: one actor task owns the scan session, the endpoint set and the poll
//! timer. Handles talk to it over a command channel; browse passes and validations report
//! back over an internal channel tagged with the session generation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use lanlink_core::policy::is_stale;
use lanlink_core::{
    BrowseEvent, DiscoveredEndpoint, EndpointKey, EndpointSet, PollingPolicy, PowerState,
    PowerStateProvider, ServiceEndpoint, TickDecision,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::browser::{BrowseStream, ServiceBrowser};
use crate::validator::EndpointValidator;

const SNAPSHOT_CHANNEL: usize = 16;

pub type SnapshotStream = BoxStream<'static, Vec<DiscoveredEndpoint>>;

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// Shortest poll interval the host allows.
    pub min_poll_interval: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            min_poll_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Idle,
    Scanning,
    /// Backgrounded; ticks suppressed until foreground.
    Paused,
    /// Last browse pass failed; the next tick retries.
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("discovery engine has shut down")]
    Closed,
}

enum Command {
    Start { user_initiated: bool },
    Stop,
    PowerChanged,
    Subscribe(oneshot::Sender<(Vec<DiscoveredEndpoint>, broadcast::Receiver<Vec<DiscoveredEndpoint>>)>),
    Snapshot(oneshot::Sender<Vec<DiscoveredEndpoint>>),
    Status(oneshot::Sender<EngineStatus>),
}

enum Internal {
    Browse {
        generation: u64,
        pass: u64,
        event: BrowseEvent,
    },
    PassEnded {
        generation: u64,
        pass: u64,
        error: Option<String>,
    },
    Validated {
        generation: u64,
        service: ServiceEndpoint,
        ok: bool,
    },
}

/// Cloneable handle. The actor stops when the last handle is dropped.
#[derive(Clone)]
pub struct DiscoveryEngine {
    commands: mpsc::UnboundedSender<Command>,
}

impl DiscoveryEngine {
    pub fn spawn(
        browser: Arc<dyn ServiceBrowser>,
        validator: Arc<dyn EndpointValidator>,
        power: Arc<dyn PowerStateProvider>,
        settings: DiscoverySettings,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(SNAPSHOT_CHANNEL);
        let power_state = power.snapshot();
        let actor = Actor {
            browser,
            validator,
            power,
            settings,
            endpoints: EndpointSet::new(),
            updates,
            internal_tx,
            session: None,
            generation: 0,
            passes: 0,
            power_state,
            status: EngineStatus::Idle,
        };
        tokio::spawn(actor.run(command_rx, internal_rx));
        Self { commands }
    }

    fn send(&self, cmd: Command) -> Result<(), EngineError> {
        self.commands.send(cmd).map_err(|_| EngineError::Closed)
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Replace any running scan. A user-initiated scan starts from an empty set.
    pub fn start_discovery(&self, user_initiated: bool) -> Result<(), EngineError> {
        self.send(Command::Start { user_initiated })
    }

    /// Cancel browsing and polling; the endpoint set is kept.
    pub fn stop_discovery(&self) -> Result<(), EngineError> {
        self.send(Command::Stop)
    }

    /// Re-read the power provider and react to lifecycle or low-power changes.
    pub fn notify_power_changed(&self) -> Result<(), EngineError> {
        self.send(Command::PowerChanged)
    }

    /// Current snapshot first, then every published snapshot. Lagging subscribers skip
    /// ahead to newer snapshots.
    pub async fn subscribe(&self) -> Result<SnapshotStream, EngineError> {
        let (current, rx) = self.ask(Command::Subscribe).await?;
        let rest = BroadcastStream::new(rx).filter_map(|r| async move { r.ok() });
        Ok(stream::once(async move { current }).chain(rest).boxed())
    }

    pub async fn snapshot(&self) -> Result<Vec<DiscoveredEndpoint>, EngineError> {
        self.ask(Command::Snapshot).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.ask(Command::Status).await
    }
}

struct ScanSession {
    generation: u64,
    user_initiated: bool,
    /// Keys with a validation in flight.
    pending: HashSet<EndpointKey>,
    token: CancellationToken,
    pass: Option<BrowsePass>,
    paused: bool,
    next_tick: Option<Instant>,
    last_poll: Option<Instant>,
    last_successful_poll: Option<Instant>,
}

struct BrowsePass {
    id: u64,
    token: CancellationToken,
}

impl ScanSession {
    fn end_pass(&mut self) {
        if let Some(pass) = self.pass.take() {
            pass.token.cancel();
        }
    }
}

struct Actor {
    browser: Arc<dyn ServiceBrowser>,
    validator: Arc<dyn EndpointValidator>,
    power: Arc<dyn PowerStateProvider>,
    settings: DiscoverySettings,
    endpoints: EndpointSet,
    updates: broadcast::Sender<Vec<DiscoveredEndpoint>>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    session: Option<ScanSession>,
    generation: u64,
    passes: u64,
    power_state: PowerState,
    status: EngineStatus,
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            let next_tick = self.session.as_ref().and_then(|s| s.next_tick);
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => break,
                },
                Some(msg) = internal.recv() => self.on_internal(msg),
                _ = sleep_until_opt(next_tick) => self.tick(),
            }
        }
        self.cancel_session();
        tracing::debug!("discovery engine stopped");
    }

    fn policy(&self, user_initiated: bool) -> PollingPolicy {
        PollingPolicy::for_state(&self.power_state, user_initiated, self.settings.min_poll_interval)
    }

    fn publish(&self) {
        let _ = self.updates.send(self.endpoints.snapshot());
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { user_initiated } => self.start(user_initiated),
            Command::Stop => self.stop(),
            Command::PowerChanged => self.power_changed(),
            Command::Subscribe(reply) => {
                let _ = reply.send((self.endpoints.snapshot(), self.updates.subscribe()));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.endpoints.snapshot());
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status.clone());
            }
        }
    }

    fn start(&mut self, user_initiated: bool) {
        self.cancel_session();
        self.power_state = self.power.snapshot();
        if user_initiated && self.endpoints.clear() {
            self.publish();
        }
        self.generation += 1;
        tracing::info!(generation = self.generation, user_initiated, "discovery started");
        self.session = Some(ScanSession {
            generation: self.generation,
            user_initiated,
            pending: HashSet::new(),
            token: CancellationToken::new(),
            pass: None,
            paused: false,
            next_tick: None,
            last_poll: None,
            last_successful_poll: None,
        });
        self.status = EngineStatus::Scanning;
        self.tick();
    }

    fn stop(&mut self) {
        if self.cancel_session() {
            tracing::info!(endpoints = self.endpoints.len(), "discovery stopped");
        }
        self.status = EngineStatus::Idle;
    }

    fn cancel_session(&mut self) -> bool {
        match self.session.take() {
            Some(mut session) => {
                session.end_pass();
                session.token.cancel();
                true
            }
            None => false,
        }
    }

    fn tick(&mut self) {
        self.power_state = self.power.snapshot();
        let Some(user_initiated) = self.session.as_ref().map(|s| s.user_initiated) else {
            return;
        };
        let policy = self.policy(user_initiated);
        let now = Instant::now();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let since_last = session.last_poll.map(|t| now.duration_since(t));
        match policy.decide_tick(since_last) {
            TickDecision::Suppressed => {
                session.end_pass();
                session.paused = true;
                session.next_tick = None;
                self.status = EngineStatus::Paused;
                tracing::debug!("tick suppressed in background");
            }
            TickDecision::Skip => {
                session.next_tick = policy.interval.map(|i| now + i);
                tracing::debug!("tick skipped, last poll too recent");
            }
            TickDecision::Run => {
                session.last_poll = Some(now);
                session.next_tick = policy.interval.map(|i| now + i);
                self.start_pass(policy.browse_timeout);
            }
        }
    }

    fn start_pass(&mut self, timeout: Option<Duration>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.end_pass();
        self.passes += 1;
        let id = self.passes;
        let token = session.token.child_token();
        session.pass = Some(BrowsePass {
            id,
            token: token.clone(),
        });
        self.status = EngineStatus::Scanning;
        tracing::debug!(generation = session.generation, pass = id, "browse pass started");
        tokio::spawn(run_pass(
            self.browser.browse(),
            self.internal_tx.clone(),
            session.generation,
            id,
            token,
            timeout,
        ));
    }

    fn power_changed(&mut self) {
        let previous = std::mem::replace(&mut self.power_state, self.power.snapshot());
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let current = &self.power_state;
        if previous.in_background != current.in_background {
            if current.in_background {
                self.to_background();
            } else {
                self.to_foreground();
            }
        } else if previous.low_power_mode != current.low_power_mode {
            if session.paused {
                return;
            }
            let interval = self.policy(session.user_initiated).interval;
            tracing::info!(low_power = current.low_power_mode, ?interval, "poll interval recomputed");
            if let Some(session) = self.session.as_mut() {
                session.next_tick = interval.map(|i| Instant::now() + i);
            }
        }
    }

    fn to_background(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.user_initiated {
            return;
        }
        session.end_pass();
        session.paused = true;
        session.next_tick = None;
        self.status = EngineStatus::Paused;
        tracing::info!("discovery paused in background");
    }

    fn to_foreground(&mut self) {
        let count = self.endpoints.len();
        let now = Instant::now();
        let Some(session) = self.session.as_mut().filter(|s| s.paused) else {
            return;
        };
        session.paused = false;
        let user_initiated = session.user_initiated;
        let since = session.last_successful_poll.map(|t| now.duration_since(t));
        self.status = EngineStatus::Scanning;
        if is_stale(count, since) {
            tracing::info!("discovery resumed, rescanning");
            self.tick();
        } else {
            tracing::info!("discovery resumed");
            let interval = self.policy(user_initiated).interval;
            if let Some(session) = self.session.as_mut() {
                session.next_tick = interval.map(|i| now + i);
            }
        }
    }

    fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Browse {
                generation,
                pass,
                event,
            } => self.on_browse(generation, pass, event),
            Internal::PassEnded {
                generation,
                pass,
                error,
            } => self.on_pass_ended(generation, pass, error),
            Internal::Validated {
                generation,
                service,
                ok,
            } => self.on_validated(generation, service, ok),
        }
    }

    fn on_browse(&mut self, generation: u64, pass: u64, event: BrowseEvent) {
        let Some(user_initiated) = self
            .session
            .as_ref()
            .filter(|s| s.generation == generation)
            .filter(|s| s.pass.as_ref().is_some_and(|p| p.id == pass))
            .map(|s| s.user_initiated)
        else {
            return;
        };
        let policy = self.policy(user_initiated);
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match event {
            BrowseEvent::Added(service) => {
                let key = service.key();
                if self.endpoints.contains(&key) || session.pending.contains(&key) {
                    tracing::debug!(endpoint = %key, "already known");
                    return;
                }
                if policy.budget_exhausted(self.endpoints.len() + session.pending.len()) {
                    tracing::debug!(endpoint = %key, "validation budget reached");
                    return;
                }
                session.pending.insert(key);
                let validator = self.validator.clone();
                let tx = self.internal_tx.clone();
                let probe = policy.probe;
                tokio::spawn(async move {
                    let ok = validator.validate(&service, probe).await;
                    let _ = tx.send(Internal::Validated {
                        generation,
                        service,
                        ok,
                    });
                });
            }
            BrowseEvent::Removed(service) => {
                let key = service.key();
                session.pending.remove(&key);
                if self.endpoints.remove(&key).is_some() {
                    tracing::info!(endpoint = %key, "endpoint removed");
                    self.publish();
                }
            }
        }
    }

    fn on_pass_ended(&mut self, generation: u64, pass: u64, error: Option<String>) {
        let Some(session) = self.session.as_mut().filter(|s| s.generation == generation) else {
            return;
        };
        match error {
            Some(reason) if session.pass.as_ref().is_some_and(|p| p.id == pass) => {
                tracing::warn!(error = %reason, "browse failed");
                session.pass = None;
                self.status = EngineStatus::Failed(reason);
            }
            Some(_) => {}
            None => session.last_successful_poll = Some(Instant::now()),
        }
    }

    fn on_validated(&mut self, generation: u64, service: ServiceEndpoint, ok: bool) {
        let key = service.key();
        let Some(session) = self.session.as_mut().filter(|s| s.generation == generation) else {
            tracing::debug!(endpoint = %key, "dropping result of superseded scan");
            return;
        };
        if !session.pending.remove(&key) {
            return;
        }
        if !ok {
            tracing::debug!(endpoint = %key, "validation failed");
            return;
        }
        if self.endpoints.insert(DiscoveredEndpoint::validated(&service)) {
            tracing::info!(endpoint = %key, name = %service.name, "endpoint discovered");
            self.publish();
        }
    }
}

async fn run_pass(
    mut events: BrowseStream,
    tx: mpsc::UnboundedSender<Internal>,
    generation: u64,
    pass: u64,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) {
    let deadline = timeout.map(|t| Instant::now() + t);
    let error = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break None,
            _ = sleep_until_opt(deadline) => break None,
            next = events.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                if tx
                    .send(Internal::Browse {
                        generation,
                        pass,
                        event,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        }
    };
    let _ = tx.send(Internal::PassEnded {
        generation,
        pass,
        error,
    });
}
