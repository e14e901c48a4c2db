//! Admission control and per-action serialization.
//!
//! At most one execution per action id is in flight at a time. Newer
//! submissions for a busy action are queued and drained strictly in
//! increasing sequence-number order, so externally visible side effects of
//! one action never interleave and apply in event-arrival order. Distinct
//! actions run concurrently with no ordering between them.
//!
//! Each action gets its own lane guarded by its own lock; the global map
//! lock is held only long enough to look the lane up, never across a run.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::actions::executor::{ActionExecutor, ExecutionRecord, TriggerContext};
use crate::actions::types::Action;
use crate::metrics;

/// Outcome of submitting a run for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Started immediately.
    Accepted,
    /// The action is busy; the run waits its turn.
    Queued,
    /// Dropped by the backpressure policy.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Queued runs allowed per action while one is in flight. When
    /// exceeded, the oldest queued run is dropped as a capacity rejection.
    pub queue_depth: usize,
    /// Completed execution records kept for the authoring surface.
    pub history_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queue_depth: 4,
            history_capacity: 256,
        }
    }
}

struct PendingRun {
    action: Action,
    sequence: u64,
    ctx: TriggerContext,
    cancel: CancellationToken,
}

struct RunningRun {
    cancel: CancellationToken,
}

#[derive(Default)]
struct Lane {
    running: Option<RunningRun>,
    queue: VecDeque<PendingRun>,
}

/// Per-action run scheduler.
pub struct ExecutionCoordinator {
    executor: Arc<ActionExecutor>,
    config: CoordinatorConfig,
    lanes: Mutex<HashMap<Uuid, Arc<Mutex<Lane>>>>,
    history: Mutex<VecDeque<ExecutionRecord>>,
}

impl ExecutionCoordinator {
    pub fn new(executor: Arc<ActionExecutor>, config: CoordinatorConfig) -> Arc<Self> {
        Arc::new(Self {
            executor,
            config,
            lanes: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        })
    }

    /// Submit one matched run for admission.
    ///
    /// The action is an immutable snapshot taken at match time: a
    /// concurrent edit never changes the sub-action sequence of a run
    /// already admitted or queued.
    pub fn submit(
        self: &Arc<Self>,
        action: Action,
        sequence: u64,
        ctx: TriggerContext,
    ) -> Admission {
        let lane = self.lane(action.id);
        let cancel = CancellationToken::new();

        let mut guard = lane.lock().expect("lane lock poisoned");
        if guard.running.is_none() {
            guard.running = Some(RunningRun {
                cancel: cancel.clone(),
            });
            drop(guard);
            metrics::record_admission("accepted");
            self.spawn_worker(
                lane,
                PendingRun {
                    action,
                    sequence,
                    ctx,
                    cancel,
                },
            );
            return Admission::Accepted;
        }

        if self.config.queue_depth == 0 {
            drop(guard);
            self.report_capacity_rejection(&action, sequence, &ctx);
            metrics::record_admission("rejected");
            return Admission::Rejected;
        }

        // Keep the queue sorted so drains follow event-arrival order even
        // if submissions race in slightly out of order.
        let pos = guard
            .queue
            .iter()
            .position(|p| p.sequence > sequence)
            .unwrap_or(guard.queue.len());
        guard.queue.insert(
            pos,
            PendingRun {
                action,
                sequence,
                ctx,
                cancel,
            },
        );

        let displaced = if guard.queue.len() > self.config.queue_depth {
            guard.queue.pop_front()
        } else {
            None
        };
        drop(guard);

        if let Some(oldest) = displaced {
            let newcomer_was_dropped = oldest.sequence == sequence;
            self.report_capacity_rejection(&oldest.action, oldest.sequence, &oldest.ctx);
            if newcomer_was_dropped {
                metrics::record_admission("rejected");
                return Admission::Rejected;
            }
        }
        metrics::record_admission("queued");
        Admission::Queued
    }

    /// Cancel the running execution (it stops at its next sub-action
    /// boundary) and drop every queued run for the action. Returns how
    /// many runs were affected.
    pub fn cancel(&self, action_id: Uuid) -> usize {
        let lane = {
            let lanes = self.lanes.lock().expect("lanes lock poisoned");
            lanes.get(&action_id).cloned()
        };
        let Some(lane) = lane else { return 0 };

        let (running, drained) = {
            let mut guard = lane.lock().expect("lane lock poisoned");
            let running = if let Some(run) = &guard.running {
                run.cancel.cancel();
                1
            } else {
                0
            };
            let drained: Vec<PendingRun> = guard.queue.drain(..).collect();
            (running, drained)
        };

        let mut affected = running;
        for pending in drained {
            let record =
                ExecutionRecord::new(&pending.action, pending.sequence, &pending.ctx.source)
                    .mark_cancelled(None);
            metrics::record_execution("cancelled", 0.0);
            self.push_history(record);
            affected += 1;
        }
        affected
    }

    /// Most recent execution records, newest first.
    pub fn recent_executions(&self, limit: usize) -> Vec<ExecutionRecord> {
        let history = self.history.lock().expect("history lock poisoned");
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Wait until no run for the action is in flight or queued.
    pub async fn wait_until_idle(&self, action_id: Uuid) {
        loop {
            let idle = {
                let lanes = self.lanes.lock().expect("lanes lock poisoned");
                match lanes.get(&action_id) {
                    Some(lane) => {
                        let guard = lane.lock().expect("lane lock poisoned");
                        guard.running.is_none() && guard.queue.is_empty()
                    }
                    None => true,
                }
            };
            if idle {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    fn lane(&self, action_id: Uuid) -> Arc<Mutex<Lane>> {
        let mut lanes = self.lanes.lock().expect("lanes lock poisoned");
        lanes
            .entry(action_id)
            .or_insert_with(|| Arc::new(Mutex::new(Lane::default())))
            .clone()
    }

    /// One worker per lane: runs the current execution, then drains the
    /// queue in sequence order until the lane is empty.
    fn spawn_worker(self: &Arc<Self>, lane: Arc<Mutex<Lane>>, first: PendingRun) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut current = first;
            loop {
                let started = Instant::now();
                let record = coordinator
                    .executor
                    .execute(
                        &current.action,
                        &current.ctx,
                        current.sequence,
                        &current.cancel,
                    )
                    .await;
                metrics::record_execution(
                    &record.status.to_string(),
                    started.elapsed().as_secs_f64(),
                );
                coordinator.push_history(record);

                let next = {
                    let mut guard = lane.lock().expect("lane lock poisoned");
                    match guard.queue.pop_front() {
                        Some(pending) => {
                            guard.running = Some(RunningRun {
                                cancel: pending.cancel.clone(),
                            });
                            Some(pending)
                        }
                        None => {
                            guard.running = None;
                            None
                        }
                    }
                };
                match next {
                    Some(pending) => current = pending,
                    None => break,
                }
            }
        });
    }

    fn report_capacity_rejection(&self, action: &Action, sequence: u64, ctx: &TriggerContext) {
        eprintln!(
            "[coordinator] capacity rejection: action '{}' seq {} dropped (queue depth {})",
            action.name, sequence, self.config.queue_depth
        );
        metrics::record_capacity_rejection();
        let record = ExecutionRecord::new(action, sequence, &ctx.source)
            .mark_rejected(format!("queue depth {} exceeded", self.config.queue_depth));
        self.push_history(record);
    }

    fn push_history(&self, record: ExecutionRecord) {
        let mut history = self.history.lock().expect("history lock poisoned");
        history.push_back(record);
        while history.len() > self.config.history_capacity {
            history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::executor::ExecutionStatus;
    use crate::actions::handlers::{HandlerEnv, HandlerRegistry};
    use crate::actions::types::{SubAction, Trigger};
    use crate::providers::{ChatSender, LogSoundPlayer};
    use crate::retry::RetryPolicy;
    use crate::variables::VariableStore;
    use crate::vault::VaultStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    struct RecordingChatSender {
        sent: Mutex<Vec<String>>,
    }

    impl RecordingChatSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatSender for RecordingChatSender {
        async fn send(&self, text: &str) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct Fixture {
        coordinator: Arc<ExecutionCoordinator>,
        chat: Arc<RecordingChatSender>,
        _temp: TempDir,
    }

    fn fixture(config: CoordinatorConfig) -> Fixture {
        let temp = TempDir::new().unwrap();
        let variables =
            Arc::new(VariableStore::open(&temp.path().join("variables.db")).unwrap());
        let vault = Arc::new(VaultStore::open(&temp.path().join("vault")).unwrap());
        let chat = RecordingChatSender::new();
        let env = Arc::new(HandlerEnv::new(
            variables,
            chat.clone(),
            Arc::new(LogSoundPlayer),
        ));
        let executor = Arc::new(ActionExecutor::new(
            env,
            vault,
            Arc::new(HandlerRegistry::builtin()),
            RetryPolicy::sub_action_default(),
        ));
        Fixture {
            coordinator: ExecutionCoordinator::new(executor, config),
            chat,
            _temp: temp,
        }
    }

    fn slow_echo_action(delay_millis: u64) -> Action {
        let now = chrono::Utc::now().timestamp();
        Action {
            id: Uuid::new_v4(),
            name: "slow-echo".into(),
            group: None,
            enabled: true,
            trigger: Trigger::ChatCommand {
                command: "!echo".into(),
                cooldown_secs: 0,
                required_role: None,
            },
            sub_actions: vec![
                SubAction::Delay {
                    millis: delay_millis,
                },
                SubAction::SendChatMessage {
                    text: "${event:tag}".into(),
                },
            ],
            created_at: now,
            updated_at: now,
        }
    }

    fn tagged_ctx(tag: &str) -> TriggerContext {
        TriggerContext::new("chat", json!({ "tag": tag }))
    }

    #[tokio::test]
    async fn serializes_runs_in_sequence_order() {
        let f = fixture(CoordinatorConfig::default());
        let action = slow_echo_action(100);

        let first = f
            .coordinator
            .submit(action.clone(), 1, tagged_ctx("first"));
        let second = f
            .coordinator
            .submit(action.clone(), 2, tagged_ctx("second"));
        assert_eq!(first, Admission::Accepted);
        assert_eq!(second, Admission::Queued);

        f.coordinator.wait_until_idle(action.id).await;
        // The second run's side effects never started before the first
        // run terminated.
        assert_eq!(f.chat.sent(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn queue_depth_one_drops_oldest_queued_run() {
        let f = fixture(CoordinatorConfig {
            queue_depth: 1,
            ..Default::default()
        });
        let action = slow_echo_action(200);

        let admissions = vec![
            f.coordinator.submit(action.clone(), 1, tagged_ctx("one")),
            f.coordinator.submit(action.clone(), 2, tagged_ctx("two")),
            f.coordinator.submit(action.clone(), 3, tagged_ctx("three")),
        ];
        assert_eq!(
            admissions,
            vec![Admission::Accepted, Admission::Queued, Admission::Queued]
        );

        f.coordinator.wait_until_idle(action.id).await;

        // Sequence 2 was displaced as a capacity rejection; 1 and 3 ran.
        assert_eq!(f.chat.sent(), vec!["one", "three"]);
        let rejected: Vec<_> = f
            .coordinator
            .recent_executions(16)
            .into_iter()
            .filter(|r| r.status == ExecutionStatus::Rejected)
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].sequence, 2);
    }

    #[tokio::test]
    async fn zero_queue_depth_rejects_submissions_while_busy() {
        let f = fixture(CoordinatorConfig {
            queue_depth: 0,
            ..Default::default()
        });
        let action = slow_echo_action(150);

        assert_eq!(
            f.coordinator.submit(action.clone(), 1, tagged_ctx("one")),
            Admission::Accepted
        );
        assert_eq!(
            f.coordinator.submit(action.clone(), 2, tagged_ctx("two")),
            Admission::Rejected
        );

        f.coordinator.wait_until_idle(action.id).await;
        assert_eq!(f.chat.sent(), vec!["one"]);
    }

    #[tokio::test]
    async fn out_of_order_submissions_drain_in_sequence_order() {
        let f = fixture(CoordinatorConfig::default());
        let action = slow_echo_action(120);

        f.coordinator.submit(action.clone(), 1, tagged_ctx("one"));
        // Later-arriving lower sequence number still drains first.
        f.coordinator.submit(action.clone(), 3, tagged_ctx("three"));
        f.coordinator.submit(action.clone(), 2, tagged_ctx("two"));

        f.coordinator.wait_until_idle(action.id).await;
        assert_eq!(f.chat.sent(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn distinct_actions_run_concurrently() {
        let f = fixture(CoordinatorConfig::default());
        let a = slow_echo_action(250);
        let b = slow_echo_action(250);

        let started = Instant::now();
        f.coordinator.submit(a.clone(), 1, tagged_ctx("a"));
        f.coordinator.submit(b.clone(), 1, tagged_ctx("b"));
        f.coordinator.wait_until_idle(a.id).await;
        f.coordinator.wait_until_idle(b.id).await;

        // Two 250ms runs overlapping; well under the 500ms serial time.
        assert!(started.elapsed() < Duration::from_millis(450));
        let mut sent = f.chat.sent();
        sent.sort();
        assert_eq!(sent, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn cancel_stops_running_and_drops_queued() {
        let f = fixture(CoordinatorConfig::default());
        let action = slow_echo_action(10_000);

        f.coordinator.submit(action.clone(), 1, tagged_ctx("one"));
        f.coordinator.submit(action.clone(), 2, tagged_ctx("two"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let affected = f.coordinator.cancel(action.id);
        assert_eq!(affected, 2);

        f.coordinator.wait_until_idle(action.id).await;
        assert!(f.chat.sent().is_empty());

        let statuses: Vec<ExecutionStatus> = f
            .coordinator
            .recent_executions(16)
            .into_iter()
            .map(|r| r.status)
            .collect();
        assert_eq!(statuses.len(), 2);
        assert!(statuses
            .iter()
            .all(|s| *s == ExecutionStatus::Cancelled));
    }

    #[tokio::test]
    async fn cancel_unknown_action_is_a_no_op() {
        let f = fixture(CoordinatorConfig::default());
        assert_eq!(f.coordinator.cancel(Uuid::new_v4()), 0);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let f = fixture(CoordinatorConfig {
            history_capacity: 3,
            ..Default::default()
        });
        let mut action = slow_echo_action(1);
        action.sub_actions = vec![SubAction::SendChatMessage { text: "x".into() }];

        for seq in 1..=6 {
            f.coordinator
                .submit(action.clone(), seq, tagged_ctx("x"));
            f.coordinator.wait_until_idle(action.id).await;
        }

        let records = f.coordinator.recent_executions(16);
        assert_eq!(records.len(), 3);
        // Newest first.
        assert_eq!(records[0].sequence, 6);
    }
}
