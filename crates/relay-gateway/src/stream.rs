//! Streaming channel manager
//!
//! Each subscription owns a bounded queue fed by a pump task that follows one
//! task's event log. Events reach the caller in production order with strictly
//! increasing sequence numbers. When the caller falls behind, the oldest
//! queued non-terminal events collapse into a single resync event. Dropping
//! the subscription stops the pump; the task itself is unaffected.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::Stream;
use relay_a2a::RelayError;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use crate::tasks::{EventKind, TaskEvent, TaskTracker};

#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(TaskEvent),
    /// No event arrived within the idle window; the stream ends after this
    IdleTimeout(Duration),
}

/// One caller connection's view of a task's events.
pub struct Subscription {
    rx: mpsc::Receiver<StreamItem>,
    _guard: DropGuard,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<StreamItem> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamItem> + Send + 'static {
        futures_util::stream::unfold(self, |mut sub| async move {
            let item = sub.next().await?;
            Some((item, sub))
        })
    }
}

#[derive(Clone)]
pub struct StreamManager {
    tracker: TaskTracker,
    buffer: usize,
    idle_timeout: Duration,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl StreamManager {
    pub fn new(
        tracker: TaskTracker,
        buffer: usize,
        idle_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tracker,
            buffer: buffer.max(2),
            idle_timeout,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown,
        }
    }

    /// Attach to a task, delivering every event after `after_seq`.
    pub fn subscribe(&self, task_id: &str, after_seq: u64) -> Result<Subscription, RelayError> {
        let watch = self
            .tracker
            .watch(task_id)
            .ok_or_else(|| RelayError::UnknownTask(task_id.to_string()))?;

        let (tx, rx) = mpsc::channel(1);
        let token = self.shutdown.child_token();
        let pump = Pump {
            tracker: self.tracker.clone(),
            task_id: task_id.to_string(),
            cursor: after_seq,
            pending: VecDeque::new(),
            capacity: self.buffer,
            idle_timeout: self.idle_timeout,
        };

        let active = self.active.clone();
        active.fetch_add(1, Ordering::SeqCst);
        let cancel = token.clone();
        tokio::spawn(async move {
            let task_id = pump.task_id.clone();
            pump.run(tx, watch, cancel).await;
            active.fetch_sub(1, Ordering::SeqCst);
            debug!("Subscription to task {} released", task_id);
        });

        info!("Opened subscription to task {} after seq {}", task_id, after_seq);
        Ok(Subscription {
            rx,
            _guard: token.drop_guard(),
        })
    }

    /// Subscriptions whose pump is still running
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

struct Pump {
    tracker: TaskTracker,
    task_id: String,
    /// Highest sequence number pulled from the tracker
    cursor: u64,
    pending: VecDeque<TaskEvent>,
    capacity: usize,
    idle_timeout: Duration,
}

impl Pump {
    async fn run(
        mut self,
        tx: mpsc::Sender<StreamItem>,
        mut watch: tokio::sync::watch::Receiver<u64>,
        cancel: CancellationToken,
    ) {
        let mut task_gone = !self.pull();
        let mut deadline = Instant::now() + self.idle_timeout;

        loop {
            if self.pending.is_empty() {
                if task_gone || self.finished() {
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = watch.changed() => {
                        task_gone = changed.is_err() || !self.pull();
                        deadline = Instant::now() + self.idle_timeout;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        debug!("Subscription to task {} idle for {:?}", self.task_id, self.idle_timeout);
                        let _ = tx.send(StreamItem::IdleTimeout(self.idle_timeout)).await;
                        return;
                    }
                }
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                permit = tx.reserve() => {
                    let Ok(permit) = permit else {
                        return;
                    };
                    let Some(event) = self.pending.pop_front() else {
                        continue;
                    };
                    let done = event.state.is_terminal() || (event.is_final && self.pending.is_empty());
                    permit.send(StreamItem::Event(event));
                    if done {
                        return;
                    }
                }
                changed = watch.changed(), if !task_gone => {
                    task_gone = changed.is_err() || !self.pull();
                    deadline = Instant::now() + self.idle_timeout;
                }
            }
        }
    }

    /// Move new events from the tracker into the queue. False once the task is gone.
    fn pull(&mut self) -> bool {
        let batch = match self.tracker.events_after(&self.task_id, self.cursor) {
            Ok(batch) => batch,
            Err(_) => return false,
        };

        if batch.gap {
            if let Some(first) = batch.events.first() {
                let skipped = first.seq.saturating_sub(self.cursor + 1);
                self.pending
                    .push_back(resync(&self.task_id, first.seq - 1, first, skipped));
            }
        }
        for event in batch.events {
            self.cursor = event.seq;
            self.pending.push_back(event);
        }
        self.coalesce();
        true
    }

    /// Whether the task has ended and everything it produced was delivered
    fn finished(&self) -> bool {
        self.tracker
            .get(&self.task_id)
            .is_none_or(|snap| snap.state.is_terminal() && self.cursor >= snap.last_seq)
    }

    fn coalesce(&mut self) {
        if self.pending.len() <= self.capacity {
            return;
        }
        let merge = self.pending.len() - self.capacity + 1;
        let mut skipped = 0u64;
        let mut last = None;
        for _ in 0..merge {
            match self.pending.front() {
                Some(event) if !event.state.is_terminal() => {
                    skipped += 1;
                    last = self.pending.pop_front();
                }
                _ => break,
            }
        }
        if let Some(last) = last {
            debug!(
                "Coalesced {} queued event(s) for task {} into a resync",
                skipped, self.task_id
            );
            self.pending
                .push_front(resync(&self.task_id, last.seq, &last, skipped));
        }
    }
}

/// A status update standing in for `skipped` events up to and including `seq`.
fn resync(task_id: &str, seq: u64, basis: &TaskEvent, skipped: u64) -> TaskEvent {
    TaskEvent {
        seq,
        task_id: task_id.to_string(),
        kind: EventKind::Resync,
        state: basis.state,
        is_final: false,
        payload: json!({
            "kind": "status-update",
            "taskId": task_id,
            "status": { "state": basis.state.as_str() },
            "final": false,
            "metadata": { "relay": { "resync": true, "skipped": skipped } },
        }),
    }
}
