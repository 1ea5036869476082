//! Task state tracker
//!
//! Records the lifecycle of asynchronous agent work so that polls and streams
//! can observe it after the request that created it has gone. Each task keeps
//! an ordered, sequence-numbered event log and enforces the status lattice:
//! once terminal, a task never changes again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_a2a::{RelayError, ResultShape, TaskState};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// The task descriptor the agent first answered with
    Task,
    Status,
    Artifact,
    /// Stands in for events that were coalesced or evicted
    Resync,
    /// The agent answered with a JSON-RPC `error`; always the last event
    Error,
}

#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub seq: u64,
    pub task_id: String,
    pub kind: EventKind,
    pub state: TaskState,
    pub is_final: bool,
    /// Caller-visible JSON-RPC `result`, or the `error` object for
    /// [`EventKind::Error`]
    pub payload: Value,
}

impl TaskEvent {
    /// Whether delivery for a subscription ends after this event
    pub fn ends_stream(&self) -> bool {
        self.is_final || self.state.is_terminal()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: String,
    pub session_id: String,
    pub agent: String,
    pub state: TaskState,
    pub last_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    descriptor: Value,
}

impl TaskSnapshot {
    /// A2A `Task` object reflecting the tracked state.
    pub fn to_task_json(&self) -> Value {
        let mut task = self.descriptor.clone();
        if !task.is_object() {
            task = json!({});
        }
        task["kind"] = json!("task");
        task["id"] = json!(self.task_id);
        task
    }
}

#[derive(Debug, Clone)]
pub enum AppendOutcome {
    Appended(TaskEvent),
    /// The task already finished; nothing changed
    AlreadyTerminal(TaskState),
    /// The reported state is not reachable from the current one; dropped
    Rejected { from: TaskState, to: TaskState },
}

#[derive(Debug, Clone)]
pub enum CancelOutcome {
    Canceled(TaskSnapshot),
    AlreadyTerminal(TaskSnapshot),
}

/// Events a resuming reader has not seen yet
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub events: Vec<TaskEvent>,
    /// Some events after the reader's position were already evicted
    pub gap: bool,
    pub snapshot: TaskSnapshot,
}

struct TaskRecord {
    session_id: String,
    agent: String,
    state: TaskState,
    descriptor: Value,
    events: VecDeque<TaskEvent>,
    last_seq: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    terminal_at: Option<Instant>,
    touched_at: Instant,
    notify: watch::Sender<u64>,
}

impl TaskRecord {
    fn snapshot(&self, task_id: &str) -> TaskSnapshot {
        TaskSnapshot {
            task_id: task_id.to_string(),
            session_id: self.session_id.clone(),
            agent: self.agent.clone(),
            state: self.state,
            last_seq: self.last_seq,
            created_at: self.created_at,
            updated_at: self.updated_at,
            descriptor: self.descriptor.clone(),
        }
    }

    fn push(
        &mut self,
        task_id: &str,
        kind: EventKind,
        state: TaskState,
        is_final: bool,
        payload: Value,
        max_events: usize,
    ) -> TaskEvent {
        self.last_seq += 1;
        let event = TaskEvent {
            seq: self.last_seq,
            task_id: task_id.to_string(),
            kind,
            state,
            is_final,
            payload,
        };
        self.events.push_back(event.clone());
        while self.events.len() > max_events {
            self.events.pop_front();
        }
        self.updated_at = Utc::now();
        self.touched_at = Instant::now();
        self.notify.send_replace(self.last_seq);
        event
    }

    fn set_state(&mut self, next: TaskState, status: Option<&Value>) {
        self.state = next;
        if next.is_terminal() && self.terminal_at.is_none() {
            self.terminal_at = Some(Instant::now());
        }
        let status = status
            .cloned()
            .unwrap_or_else(|| json!({ "state": next.as_str() }));
        if let Some(obj) = self.descriptor.as_object_mut() {
            obj.insert("status".to_string(), status);
        }
    }
}

/// Process-wide task table. Writes take the per-task entry lock, so
/// unrelated tasks never contend.
#[derive(Clone)]
pub struct TaskTracker {
    tasks: Arc<DashMap<String, TaskRecord>>,
    max_events: usize,
}

impl TaskTracker {
    pub fn new(max_events: usize) -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            max_events: max_events.max(1),
        }
    }

    /// Register a task from the descriptor the agent answered with.
    /// Registering an existing id is a no-op returning its snapshot.
    pub fn create(&self, task_id: &str, session_id: &str, agent: &str, descriptor: Value) -> TaskSnapshot {
        let state = match ResultShape::classify(&descriptor) {
            ResultShape::Task { state, .. } => state,
            _ => TaskState::Submitted,
        };
        let max_events = self.max_events;

        let mut created = false;
        let mut entry = self.tasks.entry(task_id.to_string()).or_insert_with(|| {
            created = true;
            let now = Utc::now();
            let (notify, _) = watch::channel(0);
            TaskRecord {
                session_id: session_id.to_string(),
                agent: agent.to_string(),
                state,
                descriptor: descriptor.clone(),
                events: VecDeque::new(),
                last_seq: 0,
                created_at: now,
                updated_at: now,
                terminal_at: state.is_terminal().then(Instant::now),
                touched_at: Instant::now(),
                notify,
            }
        });

        if created {
            entry.push(
                task_id,
                EventKind::Task,
                state,
                state.is_terminal(),
                descriptor,
                max_events,
            );
            info!(
                "Tracking task {} for session {} ({})",
                task_id, session_id, state
            );
        } else {
            debug!("Task {} already tracked", task_id);
        }
        entry.snapshot(task_id)
    }

    /// Append an event. Status changes must follow the lattice; anything
    /// after a terminal state is reported as `AlreadyTerminal`.
    pub fn append(
        &self,
        task_id: &str,
        kind: EventKind,
        state: Option<TaskState>,
        is_final: bool,
        payload: Value,
    ) -> Result<AppendOutcome, RelayError> {
        let mut record = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| RelayError::UnknownTask(task_id.to_string()))?;

        let current = record.state;
        if current.is_terminal() {
            debug!("Ignoring {:?} event for finished task {}", kind, task_id);
            return Ok(AppendOutcome::AlreadyTerminal(current));
        }

        let next = state.unwrap_or(current);
        if !current.can_transition_to(next) {
            warn!(
                "Dropping out-of-order transition {} -> {} for task {}",
                current, next, task_id
            );
            return Ok(AppendOutcome::Rejected {
                from: current,
                to: next,
            });
        }

        if state.is_some() {
            record.set_state(next, payload.get("status"));
        }
        let event = record.push(task_id, kind, next, is_final, payload, self.max_events);
        Ok(AppendOutcome::Appended(event))
    }

    /// Fold an agent's JSON-RPC `result` into the task it refers to.
    /// Returns `None` when the result does not concern a task.
    pub fn apply_result(&self, result: &Value) -> Option<Result<AppendOutcome, RelayError>> {
        let outcome = match ResultShape::classify(result) {
            ResultShape::Task { id, state, .. } => {
                self.append(&id, EventKind::Status, Some(state), state.is_terminal(), result.clone())
            }
            ResultShape::StatusUpdate {
                task_id,
                state,
                is_final,
            } => self.append(&task_id, EventKind::Status, Some(state), is_final, result.clone()),
            ResultShape::ArtifactUpdate { task_id } => {
                self.append(&task_id, EventKind::Artifact, None, false, result.clone())
            }
            ResultShape::Message | ResultShape::Other => return None,
        };
        Some(outcome)
    }

    /// Fail a task with the agent's JSON-RPC `error` object. The error is
    /// recorded as the task's final event so subscribers receive it verbatim.
    pub fn fail(&self, task_id: &str, error: Value) -> Result<AppendOutcome, RelayError> {
        let mut record = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| RelayError::UnknownTask(task_id.to_string()))?;

        if record.state.is_terminal() {
            debug!("Agent error after task {} finished ({})", task_id, record.state);
            return Ok(AppendOutcome::AlreadyTerminal(record.state));
        }

        let status = json!({
            "state": TaskState::Failed.as_str(),
            "timestamp": Utc::now().to_rfc3339(),
        });
        record.set_state(TaskState::Failed, Some(&status));
        let event = record.push(
            task_id,
            EventKind::Error,
            TaskState::Failed,
            true,
            error,
            self.max_events,
        );
        warn!("Task {} failed with an agent error", task_id);
        Ok(AppendOutcome::Appended(event))
    }

    pub fn get(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.tasks.get(task_id).map(|r| r.snapshot(task_id))
    }

    /// Move a task to `canceled`. Idempotent: a finished task is left as is.
    pub fn cancel(&self, task_id: &str) -> Result<CancelOutcome, RelayError> {
        let mut record = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| RelayError::UnknownTask(task_id.to_string()))?;

        if record.state.is_terminal() {
            debug!("Cancel on finished task {} ({})", task_id, record.state);
            return Ok(CancelOutcome::AlreadyTerminal(record.snapshot(task_id)));
        }

        let status = json!({
            "state": TaskState::Canceled.as_str(),
            "timestamp": Utc::now().to_rfc3339(),
        });
        let context_id = record.descriptor.get("contextId").cloned();
        let mut payload = json!({
            "kind": "status-update",
            "taskId": task_id,
            "status": status.clone(),
            "final": true,
        });
        if let Some(context_id) = context_id {
            payload["contextId"] = context_id;
        }

        record.set_state(TaskState::Canceled, Some(&status));
        record.push(
            task_id,
            EventKind::Status,
            TaskState::Canceled,
            true,
            payload,
            self.max_events,
        );
        info!("Canceled task {}", task_id);
        Ok(CancelOutcome::Canceled(record.snapshot(task_id)))
    }

    /// Events with a sequence number greater than `after_seq`.
    pub fn events_after(&self, task_id: &str, after_seq: u64) -> Result<EventBatch, RelayError> {
        let record = self
            .tasks
            .get(task_id)
            .ok_or_else(|| RelayError::UnknownTask(task_id.to_string()))?;

        let oldest = record.events.front().map(|e| e.seq).unwrap_or(record.last_seq + 1);
        let gap = after_seq < record.last_seq && oldest > after_seq + 1;
        let events = record
            .events
            .iter()
            .filter(|e| e.seq > after_seq)
            .cloned()
            .collect();

        Ok(EventBatch {
            events,
            gap,
            snapshot: record.snapshot(task_id),
        })
    }

    /// Receiver notified with the latest sequence number on every append.
    pub fn watch(&self, task_id: &str) -> Option<watch::Receiver<u64>> {
        self.tasks.get(task_id).map(|r| r.notify.subscribe())
    }

    /// Forget tasks that finished longer than `retention` ago, and
    /// unfinished tasks with no event for longer than `stale_after`.
    pub fn evict_expired(&self, retention: Duration, stale_after: Duration) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|task_id, record| match record.terminal_at {
            Some(at) => at.elapsed() <= retention,
            None if record.touched_at.elapsed() > stale_after => {
                warn!("Evicting stale task {} ({})", task_id, record.state);
                false
            }
            None => true,
        });
        let evicted = before.saturating_sub(self.tasks.len());
        if evicted > 0 {
            info!("Evicted {} task(s)", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
