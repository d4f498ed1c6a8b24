//! Event state store: per-hashId alert state and the outgoing event queue
//!
//! Every decision and the matching queue push happen under one lock, which
//! gives a total order of emitted events per hashId.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

use crate::error::JudgeError;
use crate::models::{AlertEvent, EventKind};
use crate::observability::{JudgeMetrics, StructuredLogger};

/// Default bound of the outgoing event queue
pub const DEFAULT_EVENT_CAPACITY: usize = 10_000_000;

/// What the store did with a provisional event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No state change, nothing emitted
    Ignored,
    /// State updated without emitting
    Stored,
    Emitted(EventKind),
}

#[derive(Debug, Clone)]
struct Entry {
    event: AlertEvent,
    /// First sighting of a PULL hashId; sustain is measured from here
    first_trigger_time: i64,
}

impl Entry {
    fn sent_alert(&self) -> bool {
        self.event.last_send && self.event.is_alerting()
    }
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<String, Entry>,
    queue: VecDeque<AlertEvent>,
}

/// Alert state per hashId and the bounded queue of events to deliver.
///
/// PUSH entries live from the first alert until its recovery. PULL entries
/// live while their hashId keeps showing up in the rule's query result.
pub struct EventStateStore {
    state: Mutex<StoreState>,
    capacity: usize,
    metrics: JudgeMetrics,
    logger: StructuredLogger,
}

impl EventStateStore {
    pub fn new(capacity: usize, metrics: JudgeMetrics, logger: StructuredLogger) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            capacity,
            metrics,
            logger,
        }
    }

    /// Apply the PUSH decision table
    pub fn process_push(&self, mut event: AlertEvent, triggered: bool) -> Outcome {
        let mut state = self.state.lock();
        Self::evict_mode_switch(&mut state, &event);

        let prior_alerting = state.entries.get(&event.hash_id).map(|e| e.event.is_alerting());
        let kind = match (prior_alerting, triggered) {
            (None, true) | (Some(false), true) => EventKind::Alert,
            (Some(true), false) => EventKind::Recovery,
            _ => return Outcome::Ignored,
        };

        match kind {
            EventKind::Alert => event.mark_alert(),
            EventKind::Recovery => event.mark_recovery(),
        }
        event.last_send = true;
        self.emit(&mut state, event.clone());
        if kind == EventKind::Recovery {
            // A recovered series behaves exactly like one never seen
            state.entries.remove(&event.hash_id);
        } else {
            let first_trigger_time = event.trigger_time;
            state.entries.insert(
                event.hash_id.clone(),
                Entry {
                    event,
                    first_trigger_time,
                },
            );
        }
        Outcome::Emitted(kind)
    }

    /// Apply the PULL decision table to an event evaluated at `now`
    pub fn process_pull(&self, mut event: AlertEvent, now: i64) -> Outcome {
        let mut state = self.state.lock();
        Self::evict_mode_switch(&mut state, &event);
        event.mark_alert();

        let duration = event.alert_duration;
        let (first_trigger_time, should_emit) = match state.entries.get(&event.hash_id) {
            None => (event.trigger_time, duration == 0),
            Some(prior) => {
                let sustained = duration == 0 || now - prior.first_trigger_time >= duration;
                (prior.first_trigger_time, sustained && !prior.sent_alert())
            }
        };

        let outcome = if should_emit {
            event.last_send = true;
            self.emit(&mut state, event.clone());
            Outcome::Emitted(EventKind::Alert)
        } else {
            event.last_send = state
                .entries
                .get(&event.hash_id)
                .map_or(false, Entry::sent_alert);
            Outcome::Stored
        };

        state.entries.insert(
            event.hash_id.clone(),
            Entry {
                event,
                first_trigger_time,
            },
        );
        outcome
    }

    /// Settle the PULL entries of `rule_id` missing from `keep`.
    ///
    /// Sent alerts old enough are recovered and removed; pending entries
    /// are removed silently. Returns the number of recoveries emitted.
    pub fn resolve_pull(&self, rule_id: i64, keep: &HashSet<String>, now: i64) -> usize {
        let mut state = self.state.lock();

        let stale: Vec<String> = state
            .entries
            .iter()
            .filter(|(hash, e)| e.event.rule_id == rule_id && e.event.is_pull() && !keep.contains(*hash))
            .map(|(hash, _)| hash.clone())
            .collect();

        let mut recovered = 0;
        for hash in stale {
            let Some(entry) = state.entries.get(&hash) else {
                continue;
            };
            if !entry.sent_alert() {
                debug!(rule_id = rule_id, hash_id = %hash, "Pending pull entry vanished, dropped");
                state.entries.remove(&hash);
                continue;
            }
            if now - entry.first_trigger_time < entry.event.alert_duration {
                continue;
            }

            let mut event = entry.event.clone();
            event.mark_recovery();
            event.trigger_time = now;
            state.entries.remove(&hash);
            self.emit(&mut state, event);
            recovered += 1;
        }
        recovered
    }

    /// Drop every PULL entry of a rule this instance no longer evaluates.
    ///
    /// No recovery is emitted; the new owner rebuilds the state. Returns the
    /// number of entries removed.
    pub fn forget_pull_rule(&self, rule_id: i64) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| !(e.event.rule_id == rule_id && e.event.is_pull()));
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(rule_id = rule_id, removed = removed, "PULL state of released rule dropped");
        }
        removed
    }

    fn evict_mode_switch(state: &mut StoreState, event: &AlertEvent) {
        let switched = state
            .entries
            .get(&event.hash_id)
            .map_or(false, |prior| prior.event.is_prome_pull != event.is_prome_pull);
        if switched {
            debug!(hash_id = %event.hash_id, "Datasource mode switched, prior state dropped");
            state.entries.remove(&event.hash_id);
        }
    }

    fn emit(&self, state: &mut StoreState, event: AlertEvent) {
        if let Err((e, event)) = self.enqueue(state, event) {
            debug!(error = %e, "Event not queued");
            self.metrics.inc_event_dropped();
            self.logger.log_event_dropped(&event, self.capacity);
        }
    }

    fn enqueue(
        &self,
        state: &mut StoreState,
        event: AlertEvent,
    ) -> std::result::Result<(), (JudgeError, AlertEvent)> {
        if state.queue.len() >= self.capacity {
            return Err((
                JudgeError::StoreFull {
                    capacity: self.capacity,
                },
                event,
            ));
        }
        self.metrics.inc_event(event.kind().as_str());
        self.logger.log_event_emitted(&event);
        state.queue.push_back(event);
        Ok(())
    }

    /// Take up to `max` events from the head of the queue
    pub fn drain(&self, max: usize) -> Vec<AlertEvent> {
        let mut state = self.state.lock();
        let n = max.min(state.queue.len());
        state.queue.drain(..n).collect()
    }

    /// Events waiting to be drained
    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Tracked hashIds
    pub fn state_len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stored state of a hashId
    pub fn get(&self, hash_id: &str) -> Option<AlertEvent> {
        self.state.lock().entries.get(hash_id).map(|e| e.event.clone())
    }
}
