//! Event-to-action matching and submission.
//!
//! The dispatcher keeps an index from trigger matching keys to enabled
//! actions, rebuilt from the store whenever definitions change. The index
//! is rebuilt completely and then swapped in as one `Arc`, so concurrent
//! event matching never observes a partially rebuilt index.
//!
//! Unknown or malformed events are counted, logged, and dropped, never
//! fatal to the dispatcher.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::actions::coordinator::{Admission, ExecutionCoordinator};
use crate::actions::executor::TriggerContext;
use crate::actions::schedule::CronSchedule;
use crate::actions::store::{ActionFilter, ActionStore};
use crate::actions::types::{normalize_command, Action, MatchKey, Role, Trigger};
use crate::error::StoreError;
use crate::metrics;

/// Where an external event came from.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventSource {
    Chat,
    ChannelPoints,
    Voice,
    Webhook,
    Schedule,
}

/// An external event as delivered by a platform source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformEvent {
    pub source: EventSource,
    pub payload: serde_json::Value,
}

impl PlatformEvent {
    pub fn new(source: EventSource, payload: serde_json::Value) -> Self {
        Self { source, payload }
    }
}

/// Immutable snapshot of the matching state, swapped wholesale on rebuild.
#[derive(Default)]
struct MatchIndex {
    /// Exact-match triggers (chat command, reward id, hook id).
    by_key: HashMap<MatchKey, Vec<Uuid>>,
    /// Voice triggers match by regex, tried in turn.
    voice: Vec<(Uuid, regex::Regex)>,
    /// Scheduled triggers, polled by the schedule checker.
    schedules: Vec<(Uuid, CronSchedule)>,
    /// Snapshots of every indexed action.
    actions: HashMap<Uuid, Action>,
}

struct DispatchState {
    /// Monotonically increasing per-action sequence numbers, in event
    /// arrival order. The coordinator drains queued runs in this order.
    sequences: HashMap<Uuid, u64>,
    /// Last submission time per action, for cooldown predicates.
    last_fired: HashMap<Uuid, DateTime<Utc>>,
}

/// Matches incoming events against registered triggers and submits
/// candidates to the coordinator.
pub struct TriggerDispatcher {
    store: Arc<ActionStore>,
    coordinator: Arc<ExecutionCoordinator>,
    index: RwLock<Arc<MatchIndex>>,
    state: Mutex<DispatchState>,
}

impl TriggerDispatcher {
    pub fn new(store: Arc<ActionStore>, coordinator: Arc<ExecutionCoordinator>) -> Self {
        Self {
            store,
            coordinator,
            index: RwLock::new(Arc::new(MatchIndex::default())),
            state: Mutex::new(DispatchState {
                sequences: HashMap::new(),
                last_fired: HashMap::new(),
            }),
        }
    }

    /// Rebuild the match index from enabled actions.
    ///
    /// Call after every store mutation (create/update/delete/enable
    /// toggle). The new index is built completely before the swap.
    pub async fn rebuild(&self) -> Result<(), StoreError> {
        let actions = self
            .store
            .list(&ActionFilter {
                group: None,
                enabled: Some(true),
            })
            .await?;

        let mut index = MatchIndex::default();
        for action in actions {
            match &action.trigger {
                Trigger::ChatCommand { .. }
                | Trigger::ChannelPoints { .. }
                | Trigger::Webhook { .. } => {
                    if let Some(key) = action.trigger.match_key() {
                        index.by_key.entry(key).or_default().push(action.id);
                    }
                }
                Trigger::VoiceCommand { pattern } => match regex::Regex::new(pattern) {
                    Ok(regex) => index.voice.push((action.id, regex)),
                    Err(e) => {
                        // Store validation should have caught this; skip
                        // rather than poison the whole index.
                        eprintln!(
                            "[dispatcher] skipping action '{}': bad voice pattern: {}",
                            action.name, e
                        );
                        continue;
                    }
                },
                Trigger::Scheduled { cron } => match CronSchedule::new(cron) {
                    Ok(schedule) => index.schedules.push((action.id, schedule)),
                    Err(e) => {
                        eprintln!(
                            "[dispatcher] skipping action '{}': bad cron: {}",
                            action.name, e
                        );
                        continue;
                    }
                },
            }
            index.actions.insert(action.id, action);
        }

        *self.index.write().await = Arc::new(index);
        Ok(())
    }

    /// Match one external event and submit every surviving candidate.
    /// Returns the number of submissions (fan-out across actions is
    /// unordered; within one action, arrival order is preserved by the
    /// sequence number).
    pub async fn handle_event(&self, event: &PlatformEvent) -> usize {
        let index = self.index.read().await.clone();

        let candidates: Vec<Uuid> = match event.source {
            EventSource::Chat => {
                let Some(command) = event.payload.get("command").and_then(|v| v.as_str())
                else {
                    return self.drop_event(event, "missing command");
                };
                index
                    .by_key
                    .get(&MatchKey::Chat(normalize_command(command)))
                    .cloned()
                    .unwrap_or_default()
            }
            EventSource::ChannelPoints => {
                let Some(reward_id) =
                    event.payload.get("reward_id").and_then(|v| v.as_str())
                else {
                    return self.drop_event(event, "missing reward_id");
                };
                index
                    .by_key
                    .get(&MatchKey::Reward(reward_id.to_string()))
                    .cloned()
                    .unwrap_or_default()
            }
            EventSource::Voice => {
                let Some(phrase) = event.payload.get("phrase").and_then(|v| v.as_str())
                else {
                    return self.drop_event(event, "missing phrase");
                };
                index
                    .voice
                    .iter()
                    .filter(|(_, regex)| regex.is_match(phrase))
                    .map(|(id, _)| *id)
                    .collect()
            }
            EventSource::Webhook => {
                let Some(hook_id) = event.payload.get("hook_id").and_then(|v| v.as_str())
                else {
                    return self.drop_event(event, "missing hook_id");
                };
                index
                    .by_key
                    .get(&MatchKey::Hook(hook_id.to_string()))
                    .cloned()
                    .unwrap_or_default()
            }
            EventSource::Schedule => {
                // Schedule firings come from the checker, not the event path.
                return self.drop_event(event, "schedule events are internal");
            }
        };

        let mut submitted = 0;
        for id in candidates {
            let Some(action) = index.actions.get(&id) else {
                continue;
            };
            if !self.passes_runtime_predicates(action, event) {
                continue;
            }
            self.submit_candidate(
                action.clone(),
                &event.source.to_string(),
                event.payload.clone(),
            );
            submitted += 1;
        }
        submitted
    }

    /// Fire every scheduled trigger whose next execution falls inside the
    /// half-open window `(after, now]`. Called by the schedule checker.
    pub async fn fire_due_schedules(&self, after: DateTime<Utc>, now: DateTime<Utc>) -> usize {
        let index = self.index.read().await.clone();
        let mut fired = 0;
        for (id, schedule) in &index.schedules {
            if !schedule.is_due(after, now) {
                continue;
            }
            let Some(action) = index.actions.get(id) else {
                continue;
            };
            let payload = serde_json::json!({ "fired_at": now.to_rfc3339() });
            self.submit_candidate(action.clone(), "schedule", payload);
            fired += 1;
        }
        fired
    }

    /// Number of indexed actions (all trigger kinds).
    pub async fn indexed_count(&self) -> usize {
        self.index.read().await.actions.len()
    }

    /// Per-candidate runtime predicates that exact-key matching cannot
    /// express: cooldown windows and role gates.
    fn passes_runtime_predicates(&self, action: &Action, event: &PlatformEvent) -> bool {
        let Trigger::ChatCommand {
            cooldown_secs,
            required_role,
            ..
        } = &action.trigger
        else {
            return true;
        };

        if *cooldown_secs > 0 {
            let state = self.state.lock().expect("dispatch state lock poisoned");
            if let Some(last) = state.last_fired.get(&action.id) {
                let elapsed = (Utc::now() - *last).num_seconds();
                if elapsed < *cooldown_secs as i64 {
                    return false;
                }
            }
        }

        if let Some(required) = required_role {
            // An absent or unrecognized role is treated as the lowest tier.
            let role = event
                .payload
                .get("role")
                .and_then(|v| v.as_str())
                .and_then(|s| Role::from_str(s).ok())
                .unwrap_or(Role::Viewer);
            if role < *required {
                return false;
            }
        }

        true
    }

    /// Assign the next per-action sequence number and hand the snapshot to
    /// the coordinator.
    fn submit_candidate(
        &self,
        action: Action,
        source: &str,
        payload: serde_json::Value,
    ) -> Admission {
        let sequence = {
            let mut state = self.state.lock().expect("dispatch state lock poisoned");
            state.last_fired.insert(action.id, Utc::now());
            let counter = state.sequences.entry(action.id).or_insert(0);
            *counter += 1;
            *counter
        };
        let ctx = TriggerContext::new(source, payload);
        self.coordinator.submit(action, sequence, ctx)
    }

    fn drop_event(&self, event: &PlatformEvent, reason: &str) -> usize {
        eprintln!(
            "[dispatcher] dropping {} event: {}",
            event.source, reason
        );
        metrics::record_event_dropped(&event.source.to_string());
        0
    }
}

/// Background loop that fires due scheduled triggers and keeps the match
/// index fresh.
pub struct ScheduleChecker {
    dispatcher: Arc<TriggerDispatcher>,
    tick_secs: u64,
}

impl ScheduleChecker {
    pub fn new(dispatcher: Arc<TriggerDispatcher>, tick_secs: u64) -> Self {
        Self {
            dispatcher,
            tick_secs: tick_secs.max(1),
        }
    }

    /// Run indefinitely; spawn as a tokio task.
    pub async fn run(&self) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.tick_secs));
        let mut last_check = Utc::now();

        loop {
            interval.tick().await;

            // Pick up store changes since the last tick.
            if let Err(e) = self.dispatcher.rebuild().await {
                eprintln!("[scheduler] index rebuild failed: {}", e);
                continue;
            }

            let now = Utc::now();
            self.dispatcher.fire_due_schedules(last_check, now).await;
            last_check = now;
        }
    }
}
