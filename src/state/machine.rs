//! Per-source health state machine.
//!
//! Pure state plus a capped transition log; no I/O. Entry hooks only log.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of transition records kept per source.
pub const DEFAULT_HISTORY_CAP: usize = 100;

/// Health state of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    /// Never fetched, or reset.
    Unknown,
    Active,
    /// Administratively paused; becomes `Disabled` if left alone too long.
    Inactive,
    /// At least one recent failure without a success since.
    Failing,
    Blacklisted,
    Maintenance,
    Disabled,
}

impl SourceState {
    pub const ALL: [SourceState; 7] = [
        Self::Unknown,
        Self::Active,
        Self::Inactive,
        Self::Failing,
        Self::Blacklisted,
        Self::Maintenance,
        Self::Disabled,
    ];

    /// Whether a source in this state is fetched in a round.
    pub fn is_fetchable(&self) -> bool {
        !matches!(self, Self::Blacklisted | Self::Disabled | Self::Maintenance)
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Failing => write!(f, "failing"),
            Self::Blacklisted => write!(f, "blacklisted"),
            Self::Maintenance => write!(f, "maintenance"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Externally signalled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceEvent {
    Enable,
    Disable,
    Success,
    Failure,
    Blacklist,
    Whitelist,
    MaintenanceStart,
    MaintenanceEnd,
    Reset,
}

impl fmt::Display for SourceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enable => write!(f, "enable"),
            Self::Disable => write!(f, "disable"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Blacklist => write!(f, "blacklist"),
            Self::Whitelist => write!(f, "whitelist"),
            Self::MaintenanceStart => write!(f, "maintenance_start"),
            Self::MaintenanceEnd => write!(f, "maintenance_end"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

/// Free-form annotations attached to a transition (`reason`, `error`, ...).
pub type TransitionData = BTreeMap<String, String>;

/// One immutable history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: SourceState,
    pub to: SourceState,
    pub event: SourceEvent,
    pub at: DateTime<Utc>,
    /// `true` for system-imposed transitions that bypassed the table.
    pub forced: bool,
    pub data: TransitionData,
}

/// Transition table. `None` means the event is not accepted in `from`.
pub fn next_state(from: SourceState, event: SourceEvent) -> Option<SourceState> {
    use SourceEvent as E;
    use SourceState as S;

    match (from, event) {
        (_, E::Reset) => Some(S::Unknown),
        (_, E::Blacklist) => Some(S::Blacklisted),
        (_, E::MaintenanceStart) => Some(S::Maintenance),
        (S::Blacklisted, E::Whitelist) => Some(S::Unknown),
        (S::Blacklisted, _) => None,
        (S::Maintenance, E::MaintenanceEnd) => Some(S::Active),
        (S::Maintenance, E::Disable) => Some(S::Disabled),
        (S::Maintenance, _) => None,
        (S::Disabled, E::Enable) => Some(S::Active),
        (S::Disabled, _) => None,
        (S::Unknown | S::Inactive, E::Enable) => Some(S::Active),
        (S::Unknown | S::Active | S::Inactive | S::Failing, E::Success) => Some(S::Active),
        (S::Unknown | S::Active | S::Inactive | S::Failing, E::Failure) => Some(S::Failing),
        (S::Active, E::Disable) => Some(S::Inactive),
        (S::Unknown | S::Inactive | S::Failing, E::Disable) => Some(S::Disabled),
        _ => None,
    }
}

/// State machine for a single source.
#[derive(Debug, Clone)]
pub struct SourceStateMachine {
    source: String,
    state: SourceState,
    entered_at: DateTime<Utc>,
    history: VecDeque<TransitionRecord>,
    history_cap: usize,
    rejected: u64,
}

impl SourceStateMachine {
    pub fn new(source: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::with_history_cap(source, DEFAULT_HISTORY_CAP, now)
    }

    pub fn with_history_cap(source: impl Into<String>, history_cap: usize, now: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            state: SourceState::Unknown,
            entered_at: now,
            history: VecDeque::new(),
            history_cap: history_cap.max(1),
            rejected: 0,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    /// Time spent in the current state as of `now`.
    pub fn time_in_state(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.entered_at)
    }

    /// Oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    pub fn last_transition(&self) -> Option<&TransitionRecord> {
        self.history.back()
    }

    /// Number of events rejected by the table.
    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }

    pub fn can_transition(&self, event: SourceEvent) -> bool {
        next_state(self.state, event).is_some()
    }

    /// Apply `event` now. See [`Self::transition_at`].
    pub fn transition(&mut self, event: SourceEvent, data: TransitionData) -> bool {
        self.transition_at(event, data, Utc::now())
    }

    /// Apply `event` at `now`. Returns `false` and leaves the state untouched
    /// when the table has no entry for the current state.
    pub fn transition_at(&mut self, event: SourceEvent, data: TransitionData, now: DateTime<Utc>) -> bool {
        match next_state(self.state, event) {
            Some(to) => {
                self.apply(to, event, data, false, now);
                true
            }
            None => {
                self.rejected += 1;
                tracing::warn!(
                    source = %self.source,
                    state = %self.state,
                    event = %event,
                    "state: event not accepted in current state"
                );
                false
            }
        }
    }

    /// System-imposed transition that bypasses the table.
    pub fn force_transition_at(
        &mut self,
        to: SourceState,
        event: SourceEvent,
        data: TransitionData,
        now: DateTime<Utc>,
    ) {
        self.apply(to, event, data, true, now);
    }

    fn apply(&mut self, to: SourceState, event: SourceEvent, data: TransitionData, forced: bool, now: DateTime<Utc>) {
        let from = self.state;
        // Self-transitions keep the original entry time; duration rules
        // measure the whole stay.
        if from != to {
            self.on_exit(from);
            self.state = to;
            self.entered_at = now;
            self.on_enter(to, &data);
        }
        if self.history.len() >= self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord {
            from,
            to,
            event,
            at: now,
            forced,
            data,
        });
    }

    fn on_enter(&self, state: SourceState, data: &TransitionData) {
        let reason = data.get("reason").map(String::as_str).unwrap_or("-");
        match state {
            SourceState::Blacklisted | SourceState::Disabled => {
                tracing::warn!(source = %self.source, state = %state, reason, "state: source taken out of rotation");
            }
            SourceState::Failing => {
                tracing::info!(source = %self.source, reason, "state: source failing");
            }
            _ => tracing::debug!(source = %self.source, state = %state, "state: entered"),
        }
    }

    fn on_exit(&self, state: SourceState) {
        tracing::debug!(source = %self.source, state = %state, "state: exited");
    }
}

/// Shorthand for a single-entry [`TransitionData`].
pub fn data(key: &str, value: impl Into<String>) -> TransitionData {
    let mut map = TransitionData::new();
    map.insert(key.to_string(), value.into());
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> SourceStateMachine {
        SourceStateMachine::new("https://src.example/list", Utc::now())
    }

    #[test]
    fn starts_unknown_and_enables() {
        let mut m = machine();
        assert_eq!(m.state(), SourceState::Unknown);
        assert!(m.transition(SourceEvent::Enable, TransitionData::new()));
        assert_eq!(m.state(), SourceState::Active);
        let rec = m.last_transition().unwrap();
        assert_eq!(rec.from, SourceState::Unknown);
        assert_eq!(rec.to, SourceState::Active);
        assert!(!rec.forced);
    }

    #[test]
    fn blacklisted_rejects_failure() {
        let mut m = machine();
        assert!(m.transition(SourceEvent::Blacklist, TransitionData::new()));
        let history_len = m.history().count();
        assert!(!m.transition(SourceEvent::Failure, TransitionData::new()));
        assert_eq!(m.state(), SourceState::Blacklisted);
        assert_eq!(m.history().count(), history_len);
        assert_eq!(m.rejected_count(), 1);
    }

    #[test]
    fn whitelist_and_reset_leave_blacklist() {
        let mut m = machine();
        m.transition(SourceEvent::Blacklist, TransitionData::new());
        assert!(m.transition(SourceEvent::Whitelist, TransitionData::new()));
        assert_eq!(m.state(), SourceState::Unknown);

        m.transition(SourceEvent::Blacklist, TransitionData::new());
        assert!(m.transition(SourceEvent::Reset, TransitionData::new()));
        assert_eq!(m.state(), SourceState::Unknown);
    }

    #[test]
    fn failing_self_transition_keeps_entry_time() {
        let t0 = Utc::now();
        let mut m = SourceStateMachine::new("s", t0);
        m.transition_at(SourceEvent::Enable, TransitionData::new(), t0);
        let t1 = t0 + chrono::Duration::seconds(5);
        assert!(m.transition_at(SourceEvent::Failure, TransitionData::new(), t1));
        let t2 = t1 + chrono::Duration::seconds(60);
        assert!(m.transition_at(SourceEvent::Failure, TransitionData::new(), t2));
        assert_eq!(m.state(), SourceState::Failing);
        assert_eq!(m.entered_at(), t1);
        assert_eq!(m.time_in_state(t2), chrono::Duration::seconds(60));
        assert_eq!(m.history().count(), 3);
    }

    #[test]
    fn failing_recovers_on_success() {
        let mut m = machine();
        m.transition(SourceEvent::Failure, TransitionData::new());
        assert!(m.transition(SourceEvent::Success, TransitionData::new()));
        assert_eq!(m.state(), SourceState::Active);
    }

    #[test]
    fn maintenance_round_trip() {
        let mut m = machine();
        m.transition(SourceEvent::Enable, TransitionData::new());
        assert!(m.transition(SourceEvent::MaintenanceStart, TransitionData::new()));
        assert!(!m.transition(SourceEvent::Success, TransitionData::new()));
        assert!(m.transition(SourceEvent::MaintenanceEnd, TransitionData::new()));
        assert_eq!(m.state(), SourceState::Active);
    }

    #[test]
    fn disable_paths() {
        let mut m = machine();
        m.transition(SourceEvent::Enable, TransitionData::new());
        assert!(m.transition(SourceEvent::Disable, TransitionData::new()));
        assert_eq!(m.state(), SourceState::Inactive);
        assert!(m.transition(SourceEvent::Disable, TransitionData::new()));
        assert_eq!(m.state(), SourceState::Disabled);
        assert!(!m.transition(SourceEvent::Failure, TransitionData::new()));
        assert!(m.transition(SourceEvent::Enable, TransitionData::new()));
        assert_eq!(m.state(), SourceState::Active);
    }

    #[test]
    fn blacklist_and_maintenance_accepted_everywhere_reachable() {
        for state in SourceState::ALL {
            assert_eq!(next_state(state, SourceEvent::Blacklist), Some(SourceState::Blacklisted));
            assert_eq!(next_state(state, SourceEvent::Reset), Some(SourceState::Unknown));
            assert_eq!(
                next_state(state, SourceEvent::MaintenanceStart),
                Some(SourceState::Maintenance)
            );
        }
    }

    #[test]
    fn blacklisted_source_can_enter_maintenance() {
        let now = Utc::now();
        let mut m = SourceStateMachine::new("s", now);
        m.force_transition_at(SourceState::Blacklisted, SourceEvent::Blacklist, TransitionData::new(), now);
        assert!(m.transition_at(SourceEvent::MaintenanceStart, TransitionData::new(), now));
        assert_eq!(m.state(), SourceState::Maintenance);
        assert!(!m.transition_at(SourceEvent::Failure, TransitionData::new(), now));
    }

    #[test]
    fn forced_transition_is_recorded() {
        let now = Utc::now();
        let mut m = SourceStateMachine::new("s", now);
        m.transition_at(SourceEvent::Failure, TransitionData::new(), now);
        m.force_transition_at(
            SourceState::Blacklisted,
            SourceEvent::Blacklist,
            data("reason", "auto_duration"),
            now,
        );
        let rec = m.last_transition().unwrap();
        assert!(rec.forced);
        assert_eq!(rec.to, SourceState::Blacklisted);
        assert_eq!(rec.data.get("reason").map(String::as_str), Some("auto_duration"));
    }

    #[test]
    fn history_is_capped() {
        let now = Utc::now();
        let mut m = SourceStateMachine::with_history_cap("s", 3, now);
        for _ in 0..10 {
            m.transition_at(SourceEvent::Failure, TransitionData::new(), now);
        }
        assert_eq!(m.history().count(), 3);
    }
}
