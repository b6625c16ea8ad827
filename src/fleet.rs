//! fleet status map and the auto-selection / failover rules applied to each
//! poll of `/api/locations/status`.

use std::collections::HashMap;

use crate::domain::LocationStatus;

/// latest polled status per location, in the order of the last response
#[derive(Debug, Clone, Default)]
pub struct FleetStatus {
    statuses: HashMap<String, LocationStatus>,
    order: Vec<String>,
}

impl FleetStatus {
    /// store one poll result. each returned record replaces its predecessor
    /// wholesale; locations missing from the response keep their last record.
    pub fn apply(&mut self, poll: &[LocationStatus]) {
        let mut order: Vec<String> = poll.iter().map(|s| s.location_id.clone()).collect();
        order.extend(
            self.order
                .drain(..)
                .filter(|id| !poll.iter().any(|s| &s.location_id == id)),
        );
        for status in poll {
            self.statuses.insert(status.location_id.clone(), status.clone());
        }
        self.order = order;
    }

    pub fn is_online(&self, location_id: &str) -> Option<bool> {
        self.statuses.get(location_id).map(|s| s.online)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocationStatus> {
        self.order.iter().filter_map(|id| self.statuses.get(id))
    }

    pub fn clear(&mut self) {
        self.statuses.clear();
        self.order.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionChange {
    /// selected location went offline while another one is online
    Failover { from: String, to: String },
    /// first poll of the session resolved an empty or unknown selection
    Initial { to: String },
}

impl SelectionChange {
    pub fn target(&self) -> &str {
        match self {
            Self::Failover { to, .. } | Self::Initial { to } => to,
        }
    }
}

/// one-shot latch for the initial selection; lives for one auth session
#[derive(Debug, Clone, Default)]
pub struct Selector {
    initial_done: bool,
}

impl Selector {
    /// decide whether a poll result moves the selection.
    /// "first online" is the first record in response order with online=true.
    pub fn decide(&mut self, selected: &str, poll: &[LocationStatus]) -> Option<SelectionChange> {
        let first_online = poll.iter().find(|s| s.online);
        let current = poll.iter().find(|s| s.location_id == selected);

        if let (Some(current), Some(target)) = (current, first_online) {
            if !current.online {
                return Some(SelectionChange::Failover {
                    from: selected.to_string(),
                    to: target.location_id.clone(),
                });
            }
        }

        if self.initial_done {
            return None;
        }
        self.initial_done = true;

        if selected.is_empty() || current.is_none() {
            return first_online.map(|s| SelectionChange::Initial { to: s.location_id.clone() });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(id: &str, online: bool) -> LocationStatus {
        LocationStatus {
            location_id: id.to_string(),
            name: id.to_string(),
            online,
            last_seen: None,
            coordinates: None,
        }
    }

    #[test]
    fn fails_over_to_first_online() {
        let mut selector = Selector::default();
        let poll = [status("a", false), status("b", false), status("c", true), status("d", true)];
        assert_eq!(
            selector.decide("a", &poll),
            Some(SelectionChange::Failover { from: "a".into(), to: "c".into() })
        );
    }

    #[test]
    fn no_failover_when_nothing_else_is_online() {
        let mut selector = Selector::default();
        let poll = [status("a", false), status("b", false)];
        assert_eq!(selector.decide("a", &poll), None);
        // latch spent: an empty selection is no longer filled in
        assert_eq!(selector.decide("", &[status("c", true)]), None);
    }

    #[test]
    fn failover_settles_once_target_is_selected() {
        let mut selector = Selector::default();
        let poll = [status("a", false), status("b", true)];
        assert!(selector.decide("a", &poll).is_some());
        assert_eq!(selector.decide("b", &poll), None);
        assert_eq!(selector.decide("b", &poll), None);
    }

    #[test]
    fn initial_selection_fires_once() {
        let mut selector = Selector::default();
        let poll = [status("a", false), status("b", true)];
        assert_eq!(
            selector.decide("", &poll),
            Some(SelectionChange::Initial { to: "b".into() })
        );
        assert_eq!(selector.decide("", &poll), None);
    }

    #[test]
    fn initial_replaces_unknown_selection() {
        let mut selector = Selector::default();
        let poll = [status("a", true)];
        assert_eq!(selector.decide("gone", &poll).map(|c| c.target().to_string()), Some("a".into()));
    }

    #[test]
    fn latch_consumed_even_without_switch() {
        let mut selector = Selector::default();
        assert_eq!(selector.decide("a", &[status("a", true)]), None);
        assert_eq!(selector.decide("", &[status("b", true)]), None);
    }

    #[test]
    fn apply_overwrites_records_wholesale() {
        let mut fleet = FleetStatus::default();
        let mut first = status("a", true);
        first.last_seen = Some("2025-01-01T10:00:00".into());
        fleet.apply(&[first, status("b", true)]);
        fleet.apply(&[status("a", false)]);

        let a = fleet.iter().find(|s| s.location_id == "a").unwrap();
        assert!(!a.online);
        assert_eq!(a.last_seen, None);
        assert_eq!(fleet.is_online("b"), Some(true));
        let order: Vec<_> = fleet.iter().map(|s| s.location_id.as_str()).collect();
        assert_eq!(order, ["a", "b"]);
    }
}
