//! ==============================================================================
//! liveness.rs - push-channel liveness derivation
//! ==============================================================================
//!
//! purpose:
//!     turns message arrival times into the flags the dashboard renders:
//!     live, offline, and per-category (air / water) offline.
//!
//! the two windows differ:
//!
//! ```text
//!     soft check   (1s tick)   live    = last message < 20s ago
//!     strict check (2s tick)   offline = last message > 30s ago
//!                              live    = last message < 30s ago
//!
//!     between 20s and 30s of silence the two checks disagree about `is_live`
//!     and it flips on each tick. the engine runs both ticks independently.
//! ```
//!
//! relationships:
//!     - used by: engine.rs (one tracker per active location)
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessWindows {
    pub soft: Duration,
    pub strict: Duration,
    pub category: Duration,
}

impl Default for LivenessWindows {
    fn default() -> Self {
        Self {
            soft: Duration::from_millis(20_000),
            strict: Duration::from_millis(30_000),
            category: Duration::from_millis(30_000),
        }
    }
}

/// push connection lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
}

/// derived flags, recomputed on ticks and on message arrival
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LivenessState {
    pub is_push_connected: bool,
    pub is_live: bool,
    pub is_offline: bool,
    pub is_air_offline: bool,
    pub is_water_offline: bool,
}

impl Default for LivenessState {
    fn default() -> Self {
        Self {
            is_push_connected: false,
            is_live: false,
            is_offline: true,
            is_air_offline: true,
            is_water_offline: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LivenessTracker {
    windows: LivenessWindows,
    phase: ConnectionPhase,
    last_message: Option<Instant>,
    last_message_wall: Option<DateTime<Utc>>,
    last_air: Option<Instant>,
    last_water: Option<Instant>,
    state: LivenessState,
}

impl LivenessTracker {
    pub fn new(windows: LivenessWindows) -> Self {
        Self {
            windows,
            phase: ConnectionPhase::Idle,
            last_message: None,
            last_message_wall: None,
            last_air: None,
            last_water: None,
            state: LivenessState::default(),
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn last_message_time(&self) -> Option<DateTime<Utc>> {
        self.last_message_wall
    }

    // --------------------------------------------------------------------------
    // connection transitions
    // --------------------------------------------------------------------------

    pub fn connecting(&mut self) {
        self.phase = ConnectionPhase::Connecting;
        self.state.is_push_connected = false;
    }

    pub fn opened(&mut self) {
        self.phase = ConnectionPhase::Open;
        self.state.is_push_connected = true;
    }

    /// explicit close or error: not live right away, no waiting for the timeout
    pub fn closed(&mut self) {
        self.phase = ConnectionPhase::Closed;
        self.state.is_push_connected = false;
        self.state.is_live = false;
    }

    /// intentional teardown
    pub fn idle(&mut self) {
        self.closed();
        self.phase = ConnectionPhase::Idle;
    }

    // --------------------------------------------------------------------------
    // message arrival
    // --------------------------------------------------------------------------

    /// any parsed message, heartbeats included
    pub fn record_message(&mut self, now: Instant, wall: DateTime<Utc>) {
        self.last_message = Some(now);
        self.last_message_wall = Some(wall);
        self.state.is_live = true;
    }

    pub fn record_air(&mut self, now: Instant) {
        self.last_air = Some(now);
        self.category_check(now);
    }

    pub fn record_water(&mut self, now: Instant) {
        self.last_water = Some(now);
        self.category_check(now);
    }

    // --------------------------------------------------------------------------
    // periodic checks
    // --------------------------------------------------------------------------

    pub fn soft_check(&mut self, now: Instant) {
        self.state.is_live = match self.last_message {
            Some(at) => now.saturating_duration_since(at) < self.windows.soft,
            None => false,
        };
    }

    pub fn strict_check(&mut self, now: Instant) {
        let Some(at) = self.last_message else {
            self.state.is_offline = true;
            return;
        };
        let silence = now.saturating_duration_since(at);
        self.state.is_offline = silence > self.windows.strict;
        self.state.is_live = silence < self.windows.strict;
    }

    pub fn category_check(&mut self, now: Instant) {
        self.state.is_air_offline = stale(self.last_air, now, self.windows.category);
        self.state.is_water_offline = stale(self.last_water, now, self.windows.category);
    }
}

fn stale(last: Option<Instant>, now: Instant, window: Duration) -> bool {
    match last {
        Some(at) => now.saturating_duration_since(at) > window,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn tracker() -> LivenessTracker {
        LivenessTracker::new(LivenessWindows::default())
    }

    #[test]
    fn starts_offline_and_not_live() {
        let mut t = tracker();
        t.strict_check(Instant::now());
        t.soft_check(Instant::now());
        let state = t.state();
        assert!(state.is_offline);
        assert!(!state.is_live);
        assert!(state.is_air_offline && state.is_water_offline);
    }

    #[test]
    fn soft_window_is_twenty_seconds() {
        let mut t = tracker();
        let start = Instant::now();
        t.record_message(start, Utc::now());
        assert!(t.state().is_live);

        t.soft_check(start + Duration::from_millis(19_999));
        assert!(t.state().is_live);
        t.soft_check(start + secs(20));
        assert!(!t.state().is_live);
    }

    #[test]
    fn strict_window_is_thirty_seconds() {
        let mut t = tracker();
        let start = Instant::now();
        t.record_message(start, Utc::now());

        t.strict_check(start + secs(25));
        assert!(!t.state().is_offline);
        assert!(t.state().is_live);

        t.strict_check(start + secs(30));
        assert!(!t.state().is_offline);

        t.strict_check(start + Duration::from_millis(30_001));
        assert!(t.state().is_offline);
        assert!(!t.state().is_live);
    }

    #[test]
    fn checks_disagree_between_windows() {
        let mut t = tracker();
        let start = Instant::now();
        t.record_message(start, Utc::now());

        t.soft_check(start + secs(25));
        assert!(!t.state().is_live);
        t.strict_check(start + secs(26));
        assert!(t.state().is_live);
    }

    #[test]
    fn close_drops_live_immediately() {
        let mut t = tracker();
        let start = Instant::now();
        t.opened();
        t.record_message(start, Utc::now());
        assert!(t.state().is_push_connected);

        t.closed();
        assert_eq!(t.phase(), ConnectionPhase::Closed);
        assert!(!t.state().is_push_connected);
        assert!(!t.state().is_live);
    }

    #[test]
    fn categories_age_independently() {
        let mut t = tracker();
        let start = Instant::now();
        t.record_air(start);
        assert!(!t.state().is_air_offline);
        assert!(t.state().is_water_offline);

        t.record_water(start + secs(20));
        t.category_check(start + secs(31));
        assert!(t.state().is_air_offline);
        assert!(!t.state().is_water_offline);
    }
}
