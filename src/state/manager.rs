//! Owner of every source's state machine.
//!
//! Applies the duration / failure-count auto-transition rules after each
//! accepted event, tracks reliability scores, and decides which sources are
//! fetched in a round. All mutation goes through one mutex; statistics are
//! computed from a snapshot taken under the lock.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::machine::{
    data, SourceEvent, SourceState, SourceStateMachine, TransitionData, TransitionRecord,
    DEFAULT_HISTORY_CAP,
};
use crate::config::SourceDescriptor;

/// Weight of the previous score in the reliability moving average.
const RELIABILITY_DECAY: f64 = 0.8;

/// Limits for the auto-transition rules.
#[derive(Debug, Clone, PartialEq)]
pub struct StatePolicy {
    /// Longest a source may stay `Failing` before it is blacklisted.
    pub failing_max_duration: chrono::Duration,
    /// Sliding window over which failures are counted.
    pub failure_window: chrono::Duration,
    /// Failures within the window that blacklist a `Failing` source.
    pub max_failures: usize,
    /// Longest a source may stay `Inactive` before it is disabled.
    pub inactive_max_duration: chrono::Duration,
    pub history_cap: usize,
}

impl Default for StatePolicy {
    fn default() -> Self {
        Self {
            failing_max_duration: chrono::Duration::seconds(300),
            failure_window: chrono::Duration::minutes(10),
            max_failures: 5,
            inactive_max_duration: chrono::Duration::seconds(1_800),
            history_cap: DEFAULT_HISTORY_CAP,
        }
    }
}

/// Aggregate view over all sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateStats {
    pub sources: usize,
    /// Source count per state name.
    pub by_state: BTreeMap<String, usize>,
    pub total_transitions: u64,
    pub rejected_events: u64,
}

struct SourceEntry {
    descriptor: SourceDescriptor,
    machine: SourceStateMachine,
    reliability: f64,
    failure_times: VecDeque<DateTime<Utc>>,
    transitions: u64,
}

impl SourceEntry {
    fn new(descriptor: SourceDescriptor, policy: &StatePolicy, now: DateTime<Utc>) -> Self {
        let machine = SourceStateMachine::with_history_cap(descriptor.url.clone(), policy.history_cap, now);
        let reliability = descriptor.reliability_score.clamp(0.0, 1.0);
        let mut entry = Self {
            descriptor,
            machine,
            reliability,
            failure_times: VecDeque::new(),
            transitions: 0,
        };
        entry.fire(SourceEvent::Enable, TransitionData::new(), now);
        entry
    }

    fn fire(&mut self, event: SourceEvent, data: TransitionData, now: DateTime<Utc>) -> bool {
        let accepted = self.machine.transition_at(event, data, now);
        if accepted {
            self.transitions += 1;
        }
        accepted
    }

    fn force(&mut self, to: SourceState, event: SourceEvent, reason: &str, now: DateTime<Utc>) {
        self.machine.force_transition_at(to, event, data("reason", reason), now);
        self.transitions += 1;
        self.failure_times.clear();
    }

    fn record_outcome(&mut self, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        self.reliability =
            (RELIABILITY_DECAY * self.reliability + (1.0 - RELIABILITY_DECAY) * outcome).clamp(0.0, 1.0);
    }

    fn note_failure(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        self.failure_times.push_back(now);
        self.prune_failures(now - window);
    }

    fn prune_failures(&mut self, window_start: DateTime<Utc>) {
        while self.failure_times.front().is_some_and(|t| *t < window_start) {
            self.failure_times.pop_front();
        }
    }

    /// Evaluate the auto-transition rules; returns `true` if one fired.
    fn apply_auto_rules(&mut self, policy: &StatePolicy, now: DateTime<Utc>) -> bool {
        match self.machine.state() {
            SourceState::Failing => {
                self.prune_failures(now - policy.failure_window);
                if self.machine.time_in_state(now) > policy.failing_max_duration {
                    self.force(SourceState::Blacklisted, SourceEvent::Blacklist, "auto_duration", now);
                    true
                } else if policy.max_failures > 0 && self.failure_times.len() >= policy.max_failures {
                    self.force(SourceState::Blacklisted, SourceEvent::Blacklist, "auto_failures", now);
                    true
                } else {
                    false
                }
            }
            SourceState::Inactive if self.machine.time_in_state(now) > policy.inactive_max_duration => {
                self.force(SourceState::Disabled, SourceEvent::Disable, "auto_duration", now);
                true
            }
            _ => false,
        }
    }
}

/// Thread-safe registry of per-source state machines.
pub struct StateManager {
    policy: StatePolicy,
    entries: Mutex<HashMap<String, SourceEntry>>,
}

impl StateManager {
    pub fn new(policy: StatePolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &StatePolicy {
        &self.policy
    }

    /// Register a source. New sources start `Unknown` and are enabled at once.
    pub fn register(&self, descriptor: SourceDescriptor) -> SourceState {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let url = descriptor.url.clone();
        entries
            .entry(url)
            .or_insert_with(|| SourceEntry::new(descriptor, &self.policy, now))
            .machine
            .state()
    }

    /// Signal `event` for `source` now. See [`Self::signal_at`].
    pub fn signal(&self, source: &str, event: SourceEvent, data: TransitionData) -> bool {
        self.signal_at(source, event, data, Utc::now())
    }

    /// Signal `event` for `source` at `now`, creating the source lazily.
    ///
    /// `Success` / `Failure` also feed the reliability score and the failure
    /// window, even when the table rejects the event. Returns whether the
    /// event itself was accepted.
    pub fn signal_at(&self, source: &str, event: SourceEvent, data: TransitionData, now: DateTime<Utc>) -> bool {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(source.to_string())
            .or_insert_with(|| SourceEntry::new(SourceDescriptor::from_url(source), &self.policy, now));

        match event {
            SourceEvent::Success => {
                entry.record_outcome(true);
                entry.failure_times.clear();
            }
            SourceEvent::Failure => {
                entry.record_outcome(false);
                if entry.machine.state().is_fetchable() {
                    entry.note_failure(now, self.policy.failure_window);
                }
            }
            SourceEvent::Reset => entry.failure_times.clear(),
            _ => {}
        }

        let accepted = entry.fire(event, data, now);
        if accepted {
            entry.apply_auto_rules(&self.policy, now);
        }
        accepted
    }

    /// Run the auto-transition rules over every source now.
    pub fn check_auto_transitions(&self) -> usize {
        self.check_auto_transitions_at(Utc::now())
    }

    /// Run the auto-transition rules over every source at `now`; returns
    /// how many sources were force-transitioned.
    pub fn check_auto_transitions_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        entries
            .values_mut()
            .map(|entry| entry.apply_auto_rules(&self.policy, now))
            .filter(|fired| *fired)
            .count()
    }

    pub fn state(&self, source: &str) -> Option<SourceState> {
        self.entries.lock().get(source).map(|e| e.machine.state())
    }

    pub fn reliability(&self, source: &str) -> Option<f64> {
        self.entries.lock().get(source).map(|e| e.reliability)
    }

    /// Transition history of `source`, oldest first.
    pub fn history(&self, source: &str) -> Vec<TransitionRecord> {
        self.entries
            .lock()
            .get(source)
            .map(|e| e.machine.history().cloned().collect())
            .unwrap_or_default()
    }

    /// URLs of sources currently in `state`, sorted.
    pub fn sources_by_state(&self, state: SourceState) -> Vec<String> {
        let mut urls: Vec<String> = self
            .entries
            .lock()
            .values()
            .filter(|e| e.machine.state() == state)
            .map(|e| e.descriptor.url.clone())
            .collect();
        urls.sort();
        urls
    }

    /// Sources eligible for fetching, by priority, then by descending
    /// `weight * reliability`.
    pub fn sources_for_round(&self) -> Vec<SourceDescriptor> {
        let entries = self.entries.lock();
        let mut eligible: Vec<(SourceDescriptor, f64)> = entries
            .values()
            .filter(|e| e.machine.state().is_fetchable())
            .map(|e| (e.descriptor.clone(), e.descriptor.weight * e.reliability))
            .collect();
        drop(entries);

        eligible.sort_by(|(a, score_a), (b, score_b)| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| score_b.total_cmp(score_a))
                .then_with(|| a.url.cmp(&b.url))
        });
        eligible.into_iter().map(|(d, _)| d).collect()
    }

    pub fn stats(&self) -> StateStats {
        let entries = self.entries.lock();
        let mut stats = StateStats {
            sources: entries.len(),
            ..StateStats::default()
        };
        for state in SourceState::ALL {
            stats.by_state.insert(state.to_string(), 0);
        }
        for entry in entries.values() {
            *stats.by_state.entry(entry.machine.state().to_string()).or_insert(0) += 1;
            stats.total_transitions += entry.transitions;
            stats.rejected_events += entry.machine.rejected_count();
        }
        stats
    }

    /// Fire `Reset` for a known source. `false` if the source is unknown.
    pub fn reset(&self, source: &str) -> bool {
        if !self.entries.lock().contains_key(source) {
            return false;
        }
        self.signal(source, SourceEvent::Reset, data("reason", "manual"))
    }

    /// Forget a source entirely.
    pub fn remove(&self, source: &str) -> bool {
        self.entries.lock().remove(source).is_some()
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new(StatePolicy::default())
    }
}
