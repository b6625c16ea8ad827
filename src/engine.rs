//! ==============================================================================
//! engine.rs - realtime reconciliation engine
//! ==============================================================================
//!
//! purpose:
//!     for one (location, token) pair, keep a live push feed, merge it with
//!     the slower fleet status poll, and publish a single consistent view:
//!     is the location alive, and what are its latest readings.
//!
//! architecture:
//!
//! ```text
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                  reconciler task (single owner)               │
//!     │                                                               │
//!     │   commands ──┐                                                │
//!     │   auth     ──┤                                                │
//!     │   inbox    ──┼──> select! ──> LocationState / FleetStatus ──> watch
//!     │   1s tick  ──┤                                                │
//!     │   2s tick  ──┘                                                │
//!     └───────▲───────────────────────▲───────────────────────────────┘
//!             │ frames (epoch n)      │ poll outcomes (epoch n)
//!       ┌─────┴──────┐          ┌─────┴──────┐
//!       │ push task  │          │ poll task  │   aborted + respawned on
//!       │ (socket)   │          │ (5s cycle) │   every identity change
//!       └────────────┘          └────────────┘
//! ```
//!
//! isolation:
//!     every identity change (location or token) aborts both helper tasks,
//!     bumps the epoch and rebuilds the per-location state. anything already
//!     queued in the inbox for an older epoch is discarded on arrival.
//!
//! relationships:
//!     - uses: liveness.rs, series.rs, fleet.rs, domain.rs, aqi.rs
//!     - seams: push.rs (PushConnector), api.rs (StatusSource), auth.rs
//!
//! ==============================================================================

use chrono::{DateTime, Local, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::{ApiError, StatusSource};
use crate::aqi::{self, AqiBand};
use crate::auth::AuthContext;
use crate::domain::{Category, LocationStatus, Reading, RealtimeEnvelope};
use crate::fleet::{FleetStatus, SelectionChange, Selector};
use crate::liveness::{ConnectionPhase, LivenessState, LivenessTracker, LivenessWindows};
use crate::push::{PushConnector, PushError};
use crate::series::{MetricSeries, DEFAULT_CAPACITY};

// ==============================================================================
// configuration and snapshot
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    pub windows: LivenessWindows,
    pub soft_tick: Duration,
    pub strict_tick: Duration,
    pub poll_interval: Duration,
    pub history_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            windows: LivenessWindows::default(),
            soft_tick: Duration::from_millis(1_000),
            strict_tick: Duration::from_millis(2_000),
            poll_interval: Duration::from_millis(5_000),
            history_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// read-only view handed to the rendering layer
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub location_id: String,
    pub authenticated: bool,
    pub phase: ConnectionPhase,
    pub liveness: LivenessState,
    /// push liveness when available, polled status otherwise
    pub system_online: bool,
    pub last_message_time: Option<DateTime<Utc>>,
    pub latest_air: Option<Reading>,
    pub latest_water: Option<Reading>,
    pub air_quality_index: Option<u16>,
    pub air_quality_band: Option<AqiBand>,
    pub air: MetricSeries,
    pub water: MetricSeries,
    pub fleet: Vec<LocationStatus>,
}

impl EngineSnapshot {
    fn empty(config: &EngineConfig) -> Self {
        Self {
            location_id: String::new(),
            authenticated: false,
            phase: ConnectionPhase::Idle,
            liveness: LivenessState::default(),
            system_online: false,
            last_message_time: None,
            latest_air: None,
            latest_water: None,
            air_quality_index: None,
            air_quality_band: None,
            air: MetricSeries::air(config.history_capacity),
            water: MetricSeries::water(config.history_capacity),
            fleet: Vec::new(),
        }
    }
}

// ==============================================================================
// per-location state
// ==============================================================================
// everything here is discarded when the active location changes.

#[derive(Debug, Clone)]
pub struct LocationState {
    pub liveness: LivenessTracker,
    pub air: MetricSeries,
    pub water: MetricSeries,
    pub latest_air: Option<Reading>,
    pub latest_water: Option<Reading>,
}

impl LocationState {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            liveness: LivenessTracker::new(config.windows),
            air: MetricSeries::air(config.history_capacity),
            water: MetricSeries::water(config.history_capacity),
            latest_air: None,
            latest_water: None,
        }
    }

    /// fold one parsed envelope in. `now` feeds the liveness timers, `wall`
    /// labels history (receipt time, HH:MM).
    pub fn apply(&mut self, envelope: &RealtimeEnvelope, now: Instant, wall: DateTime<Local>) {
        let received_at = wall.with_timezone(&Utc);
        self.liveness.record_message(now, received_at);

        let label = wall.format("%H:%M").to_string();
        match envelope.category() {
            Category::Heartbeat => {}
            Category::Air => {
                self.air.push(label, &envelope.payload);
                self.liveness.record_air(now);
                self.latest_air = Some(Reading::from_envelope(envelope, received_at));
            }
            Category::Water => {
                self.water.push(label, &envelope.payload);
                if envelope.is_dead_zero() {
                    debug!(device = %envelope.device_id, "all-zero water reading, not counted as liveness");
                } else {
                    self.liveness.record_water(now);
                }
                self.latest_water = Some(Reading::from_envelope(envelope, received_at));
            }
        }
    }
}

// ==============================================================================
// handle
// ==============================================================================

#[derive(Debug)]
enum Command {
    Select(String),
    Stop,
}

/// cloneable control + read handle
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<EngineSnapshot>,
}

impl EngineHandle {
    /// change the active location; an empty id makes the push side inert
    pub fn select(&self, location_id: impl Into<String>) {
        let _ = self.commands.send(Command::Select(location_id.into()));
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshots.clone()
    }
}

/// owns the reconciler task. the engine runs until `stop` is called or the
/// last command sender is gone, which includes every cloned `EngineHandle`;
/// dropping this value alone detaches the task.
#[derive(Debug)]
pub struct RealtimeEngine {
    handle: EngineHandle,
    task: JoinHandle<()>,
}

impl RealtimeEngine {
    pub fn spawn<P, S>(
        config: EngineConfig,
        auth: AuthContext,
        connector: P,
        status_source: S,
        initial_location: impl Into<String>,
    ) -> Self
    where
        P: PushConnector,
        S: StatusSource,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(EngineSnapshot::empty(&config));

        let reconciler = Reconciler::new(
            config,
            Arc::new(connector),
            Arc::new(status_source),
            inbox_tx,
            snapshot_tx,
            initial_location.into(),
        );
        let task = tokio::spawn(reconciler.run(command_rx, inbox_rx, auth.subscribe()));

        Self {
            handle: EngineHandle { commands: command_tx, snapshots: snapshot_rx },
            task,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn select(&self, location_id: impl Into<String>) {
        self.handle.select(location_id);
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.handle.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.handle.subscribe()
    }

    /// close the socket, stop polling and wait for the task to finish
    pub async fn stop(self) {
        let _ = self.handle.commands.send(Command::Stop);
        if let Err(e) = self.task.await {
            warn!(error = %e, "reconciler task ended abnormally");
        }
    }
}

// ==============================================================================
// reconciler
// ==============================================================================

enum PushEvent {
    Opened,
    Frame(String),
    Failed(PushError),
    Closed,
}

enum Inbound {
    Push { epoch: u64, event: PushEvent },
    Poll { epoch: u64, outcome: Result<Vec<LocationStatus>, ApiError> },
}

impl Inbound {
    fn epoch(&self) -> u64 {
        match self {
            Self::Push { epoch, .. } | Self::Poll { epoch, .. } => *epoch,
        }
    }
}

struct Reconciler<P, S> {
    config: EngineConfig,
    connector: Arc<P>,
    status_source: Arc<S>,
    inbox: mpsc::UnboundedSender<Inbound>,
    snapshots: watch::Sender<EngineSnapshot>,

    location_id: String,
    token: Option<String>,
    epoch: u64,
    push_task: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
    soft: Interval,
    strict: Interval,

    state: LocationState,
    fleet: FleetStatus,
    selector: Selector,
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl<P: PushConnector, S: StatusSource> Reconciler<P, S> {
    fn new(
        config: EngineConfig,
        connector: Arc<P>,
        status_source: Arc<S>,
        inbox: mpsc::UnboundedSender<Inbound>,
        snapshots: watch::Sender<EngineSnapshot>,
        location_id: String,
    ) -> Self {
        Self {
            soft: ticker(config.soft_tick),
            strict: ticker(config.strict_tick),
            state: LocationState::new(&config),
            config,
            connector,
            status_source,
            inbox,
            snapshots,
            location_id,
            token: None,
            epoch: 0,
            push_task: None,
            poll_task: None,
            fleet: FleetStatus::default(),
            selector: Selector::default(),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbox: mpsc::UnboundedReceiver<Inbound>,
        mut auth: watch::Receiver<Option<String>>,
    ) {
        self.token = auth.borrow_and_update().clone();
        self.restart();
        self.publish();

        let mut auth_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Select(location_id)) => self.select(location_id),
                    Some(Command::Stop) | None => break,
                },
                changed = auth.changed(), if auth_open => match changed {
                    Ok(()) => {
                        let token = auth.borrow_and_update().clone();
                        self.change_token(token);
                    }
                    Err(_) => {
                        debug!("auth context dropped, keeping current token");
                        auth_open = false;
                    }
                },
                Some(inbound) = inbox.recv() => self.handle_inbound(inbound),
                _ = self.soft.tick() => {
                    let now = Instant::now();
                    self.state.liveness.soft_check(now);
                    self.state.liveness.category_check(now);
                }
                _ = self.strict.tick() => {
                    self.state.liveness.strict_check(Instant::now());
                }
            }
            self.publish();
        }

        self.teardown();
        self.state.liveness.idle();
        self.publish();
        info!("reconciliation engine stopped");
    }

    // --------------------------------------------------------------------------
    // identity changes
    // --------------------------------------------------------------------------

    fn select(&mut self, location_id: String) {
        if location_id == self.location_id {
            return;
        }
        info!(from = %self.location_id, to = %location_id, "location selected");
        self.location_id = location_id;
        self.restart();
    }

    /// new token = new session: fleet status and the initial-selection latch
    /// belong to the old one
    fn change_token(&mut self, token: Option<String>) {
        if token == self.token {
            return;
        }
        info!(authenticated = token.is_some(), "auth token changed");
        self.token = token;
        self.fleet.clear();
        self.selector = Selector::default();
        self.restart();
    }

    fn teardown(&mut self) {
        if let Some(task) = self.push_task.take() {
            task.abort();
        }
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.epoch += 1;
    }

    /// stop everything for the old identity, then start fresh for the current one
    fn restart(&mut self) {
        self.teardown();
        self.state = LocationState::new(&self.config);
        self.soft.reset();
        self.strict.reset();

        let Some(token) = self.token.clone() else {
            info!("no auth token, engine idle");
            return;
        };
        self.spawn_poll(token.clone());

        if self.location_id.is_empty() {
            debug!("no location selected, push channel idle");
            return;
        }
        self.spawn_push(token);
    }

    fn spawn_push(&mut self, token: String) {
        let connector = self.connector.clone();
        let inbox = self.inbox.clone();
        let epoch = self.epoch;
        let location_id = self.location_id.clone();
        self.state.liveness.connecting();

        self.push_task = Some(tokio::spawn(async move {
            let last = match connector.connect(&location_id, &token).await {
                Ok(mut frames) => {
                    if inbox.send(Inbound::Push { epoch, event: PushEvent::Opened }).is_err() {
                        return;
                    }
                    loop {
                        match frames.next().await {
                            Some(Ok(text)) => {
                                let event = PushEvent::Frame(text);
                                if inbox.send(Inbound::Push { epoch, event }).is_err() {
                                    return;
                                }
                            }
                            Some(Err(e)) => break PushEvent::Failed(e),
                            None => break PushEvent::Closed,
                        }
                    }
                }
                Err(e) => PushEvent::Failed(e),
            };
            let _ = inbox.send(Inbound::Push { epoch, event: last });
        }));
    }

    fn spawn_poll(&mut self, token: String) {
        let source = self.status_source.clone();
        let inbox = self.inbox.clone();
        let epoch = self.epoch;
        let period = self.config.poll_interval;

        self.poll_task = Some(tokio::spawn(async move {
            let mut cycle = ticker(period);
            loop {
                cycle.tick().await;
                let outcome = source.fetch_status(&token).await;
                if inbox.send(Inbound::Poll { epoch, outcome }).is_err() {
                    return;
                }
            }
        }));
    }

    // --------------------------------------------------------------------------
    // inbound events
    // --------------------------------------------------------------------------

    fn handle_inbound(&mut self, inbound: Inbound) {
        if inbound.epoch() != self.epoch {
            debug!(stale = inbound.epoch(), current = self.epoch, "discarding event from previous identity");
            return;
        }
        match inbound {
            Inbound::Push { event, .. } => self.handle_push(event),
            Inbound::Poll { outcome, .. } => self.handle_poll(outcome),
        }
    }

    fn handle_push(&mut self, event: PushEvent) {
        match event {
            PushEvent::Opened => {
                info!(location = %self.location_id, "push channel open");
                self.state.liveness.opened();
            }
            PushEvent::Frame(text) => match RealtimeEnvelope::parse(&text) {
                Ok(envelope) => {
                    if !envelope.location_id.is_empty() && envelope.location_id != self.location_id {
                        debug!(got = %envelope.location_id, "dropping message for another location");
                        return;
                    }
                    self.state.apply(&envelope, Instant::now(), Local::now());
                }
                Err(e) => warn!(error = %e, "dropping push message"),
            },
            PushEvent::Failed(e) => {
                warn!(location = %self.location_id, error = %e, "push channel failed");
                self.state.liveness.closed();
            }
            PushEvent::Closed => {
                info!(location = %self.location_id, "push channel closed");
                self.state.liveness.closed();
            }
        }
    }

    fn handle_poll(&mut self, outcome: Result<Vec<LocationStatus>, ApiError>) {
        let statuses = match outcome {
            Ok(statuses) => statuses,
            Err(e) => {
                // keep the previous map; one bad poll must not take the fleet offline
                warn!(error = %e, unauthorized = e.is_unauthorized(), "status poll failed");
                return;
            }
        };

        self.fleet.apply(&statuses);
        if let Some(change) = self.selector.decide(&self.location_id, &statuses) {
            match &change {
                SelectionChange::Failover { from, to } => {
                    warn!(%from, %to, "selected location offline, failing over")
                }
                SelectionChange::Initial { to } => info!(%to, "initial location selected"),
            }
            self.location_id = change.target().to_string();
            self.restart();
        }
    }

    // --------------------------------------------------------------------------
    // snapshot
    // --------------------------------------------------------------------------

    fn system_online(&self) -> bool {
        self.state.liveness.state().is_live || self.fleet.is_online(&self.location_id).unwrap_or(false)
    }

    fn publish(&self) {
        let state = &self.state;
        let air_quality_index = state.latest_air.as_ref().map(|r| aqi::air_quality_index(&r.values));
        let snapshot = EngineSnapshot {
            location_id: self.location_id.clone(),
            authenticated: self.token.is_some(),
            phase: state.liveness.phase(),
            liveness: state.liveness.state(),
            system_online: self.system_online(),
            last_message_time: state.liveness.last_message_time(),
            latest_air: state.latest_air.clone(),
            latest_water: state.latest_water.clone(),
            air_quality_index,
            air_quality_band: air_quality_index.map(AqiBand::classify),
            air: state.air.clone(),
            water: state.water.clone(),
            fleet: self.fleet.iter().cloned().collect(),
        };
        self.snapshots.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::FrameStream;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct NeverConnects;

    #[async_trait]
    impl PushConnector for NeverConnects {
        async fn connect(&self, _: &str, _: &str) -> Result<FrameStream, PushError> {
            Err(PushError::InvalidUrl("test".into()))
        }
    }

    struct NoStatus;

    #[async_trait]
    impl StatusSource for NoStatus {
        async fn fetch_status(&self, _: &str) -> Result<Vec<LocationStatus>, ApiError> {
            Ok(Vec::new())
        }
    }

    fn wall() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, 1, 14, 7, 0).unwrap()
    }

    fn envelope(json: &str) -> RealtimeEnvelope {
        RealtimeEnvelope::parse(json).unwrap()
    }

    #[test]
    fn heartbeat_touches_only_liveness() {
        let mut state = LocationState::new(&EngineConfig::default());
        state.apply(&envelope(r#"{"type":"heartbeat","location_id":"loc-1"}"#), Instant::now(), wall());

        assert!(state.air.is_empty());
        assert!(state.water.is_empty());
        assert!(state.liveness.state().is_live);
        assert!(state.liveness.last_message_time().is_some());
    }

    #[test]
    fn air_reading_is_labelled_with_receipt_time() {
        let mut state = LocationState::new(&EngineConfig::default());
        state.apply(
            &envelope(r#"{"type":"aqi_camera","timestamp":"1999-01-01T00:00:00","data":{"pm25":42}}"#),
            Instant::now(),
            wall(),
        );

        assert_eq!(*state.air.labels(), vec!["14:07".to_string()]);
        assert_eq!(*state.air.values("pm25").unwrap(), vec![42.0]);
        assert!(!state.liveness.state().is_air_offline);
        assert!(state.liveness.state().is_water_offline);
    }

    #[test]
    fn dead_zero_water_is_recorded_but_not_live() {
        let mut state = LocationState::new(&EngineConfig::default());
        state.apply(
            &envelope(r#"{"type":"water_sensor","data":{"level":0,"ph":0,"turbidity":0}}"#),
            Instant::now(),
            wall(),
        );

        assert_eq!(state.water.len(), 1);
        assert!(state.latest_water.is_some());
        assert!(state.liveness.state().is_water_offline);
        assert!(state.liveness.state().is_live);
    }

    #[tokio::test]
    async fn stale_epoch_events_are_discarded() {
        let config = EngineConfig::default();
        let (inbox_tx, _inbox_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _snapshot_rx) = watch::channel(EngineSnapshot::empty(&config));
        let mut reconciler = Reconciler::new(
            config,
            Arc::new(NeverConnects),
            Arc::new(NoStatus),
            inbox_tx,
            snapshot_tx,
            "loc-a".into(),
        );
        reconciler.token = Some("t1".into());
        reconciler.restart();
        let old_epoch = reconciler.epoch;

        reconciler.select("loc-b".into());
        assert_ne!(reconciler.epoch, old_epoch);

        let frame = r#"{"type":"aqi","location_id":"loc-a","data":{"pm25":99}}"#;
        reconciler.handle_inbound(Inbound::Push {
            epoch: old_epoch,
            event: PushEvent::Frame(frame.to_string()),
        });
        reconciler.handle_inbound(Inbound::Push { epoch: old_epoch, event: PushEvent::Opened });

        assert!(reconciler.state.air.is_empty());
        assert!(reconciler.state.liveness.last_message_time().is_none());
        assert!(!reconciler.state.liveness.state().is_push_connected);
        reconciler.teardown();
    }

    #[tokio::test]
    async fn message_for_other_location_is_ignored() {
        let config = EngineConfig::default();
        let (inbox_tx, _inbox_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _snapshot_rx) = watch::channel(EngineSnapshot::empty(&config));
        let mut reconciler = Reconciler::new(
            config,
            Arc::new(NeverConnects),
            Arc::new(NoStatus),
            inbox_tx,
            snapshot_tx,
            "loc-b".into(),
        );
        let epoch = reconciler.epoch;
        reconciler.handle_inbound(Inbound::Push {
            epoch,
            event: PushEvent::Frame(r#"{"type":"aqi","location_id":"loc-a","data":{"pm25":1}}"#.into()),
        });
        assert!(reconciler.state.air.is_empty());
        assert!(reconciler.state.liveness.last_message_time().is_none());
    }
}
