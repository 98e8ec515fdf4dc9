//! Per-run event fan-out.
//!
//! Every subscriber gets its own unbounded ordered queue, so a slow viewer
//! never causes another to miss events. Subscribing and publishing take the
//! same lock: a subscriber's snapshot reflects exactly the events published
//! before it joined, and it receives every event published after.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use super::models::{Artifact, LogEntry, ReviewState, RunId, RunRecord, RunStatus, StageState};

/// How many finished runs keep their last snapshot for late subscribers.
const CLOSED_RETENTION: usize = 256;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub run_id: RunId,
    pub status: RunStatus,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StatusChange {
    pub fn of(run: &RunRecord) -> Self {
        Self {
            run_id: run.run_id,
            status: run.status,
            error: run.error.clone(),
            updated_at: run.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RunEvent {
    Log(LogEntry),
    Stage(StageState),
    Status(StatusChange),
    Artifact(Artifact),
    Review(ReviewState),
}

impl RunEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::Log(_) => "log",
            RunEvent::Stage(_) => "stage",
            RunEvent::Status(_) => "status",
            RunEvent::Artifact(_) => "artifact",
            RunEvent::Review(_) => "review",
        }
    }

    pub fn data(&self) -> serde_json::Result<String> {
        match self {
            RunEvent::Log(entry) => serde_json::to_string(entry),
            RunEvent::Stage(stage) => serde_json::to_string(stage),
            RunEvent::Status(change) => serde_json::to_string(change),
            RunEvent::Artifact(artifact) => serde_json::to_string(artifact),
            RunEvent::Review(review) => serde_json::to_string(review),
        }
    }

    /// A status event carrying a terminal status ends every stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Status(change) if change.status.is_terminal())
    }
}

/// A live view of one run: the state at join time plus every later event.
/// Dropping it unsubscribes.
pub struct Subscription {
    pub snapshot: RunRecord,
    pub receiver: mpsc::UnboundedReceiver<RunEvent>,
}

#[derive(Default)]
struct Channel {
    snapshot: Option<RunRecord>,
    subscribers: Vec<mpsc::UnboundedSender<RunEvent>>,
}

#[derive(Default)]
struct Channels {
    by_run: HashMap<RunId, Channel>,
    closed: VecDeque<RunId>,
}

#[derive(Default)]
pub struct EventBroadcaster {
    inner: Mutex<Channels>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every current subscriber of `run`, recording `run`
    /// as the snapshot for later subscribers.
    pub fn publish(&self, run: &RunRecord, event: RunEvent) {
        let Ok(mut channels) = self.inner.lock() else {
            tracing::error!(run_id = %run.run_id, "event broadcaster lock poisoned");
            return;
        };
        let terminal = event.is_terminal();
        let channel = channels.by_run.entry(run.run_id).or_default();
        channel.snapshot = Some(run.clone());
        channel
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());

        if terminal {
            // Closing the senders ends each stream once it has drained.
            channel.subscribers.clear();
            channels.closed.push_back(run.run_id);
            while channels.closed.len() > CLOSED_RETENTION {
                if let Some(old) = channels.closed.pop_front() {
                    channels.by_run.remove(&old);
                }
            }
        }
    }

    /// Record `run` as the snapshot for a run nothing has been published for.
    pub fn seed(&self, run: &RunRecord) {
        if let Ok(mut channels) = self.inner.lock() {
            let channel = channels.by_run.entry(run.run_id).or_default();
            channel.snapshot.get_or_insert_with(|| run.clone());
        }
    }

    /// Join the event stream of `run_id`.
    ///
    /// `fallback` is used as the snapshot when nothing has been published for
    /// the run yet. A run whose snapshot is already terminal yields a
    /// subscription whose receiver is closed.
    pub fn subscribe(&self, run_id: RunId, fallback: RunRecord) -> Subscription {
        let (tx, receiver) = mpsc::unbounded_channel();
        let Ok(mut channels) = self.inner.lock() else {
            tracing::error!(run_id = %run_id, "event broadcaster lock poisoned");
            return Subscription {
                snapshot: fallback,
                receiver,
            };
        };
        if let Some(channel) = channels.by_run.get_mut(&run_id) {
            let snapshot = channel.snapshot.clone().unwrap_or(fallback);
            if !snapshot.status.is_terminal() {
                channel.subscribers.push(tx);
            }
            return Subscription { snapshot, receiver };
        }

        // Untracked finished runs stay untracked; nothing would ever retire them.
        if !fallback.status.is_terminal() {
            channels.by_run.entry(run_id).or_default().subscribers.push(tx);
        }
        Subscription {
            snapshot: fallback,
            receiver,
        }
    }

    pub fn subscriber_count(&self, run_id: RunId) -> usize {
        self.inner
            .lock()
            .map(|mut channels| {
                channels.by_run.get_mut(&run_id).map_or(0, |c| {
                    c.subscribers.retain(|tx| !tx.is_closed());
                    c.subscribers.len()
                })
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::studio::models::{LogLevel, RunInputs, RunMode};
    use crate::studio::registry;

    fn run() -> RunRecord {
        RunRecord::new("client_a", RunMode::Drift, registry::stages_for(RunMode::Drift), RunInputs::new())
    }

    fn log(run: &mut RunRecord, msg: &str) -> RunEvent {
        let entry = LogEntry::new("Drift Check", LogLevel::Info, msg);
        run.push_log(entry.clone(), 500);
        RunEvent::Log(entry)
    }

    fn messages(rx: &mut mpsc::UnboundedReceiver<RunEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let RunEvent::Log(entry) = event {
                out.push(entry.message);
            }
        }
        out
    }

    #[test]
    fn test_late_subscriber_sees_snapshot_then_live_events() {
        let broadcaster = EventBroadcaster::new();
        let mut r = run();
        for msg in ["one", "two", "three"] {
            let event = log(&mut r, msg);
            broadcaster.publish(&r, event);
        }

        let mut sub = broadcaster.subscribe(r.run_id, run());
        let snapshot_logs: Vec<&str> = sub.snapshot.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(snapshot_logs, vec!["one", "two", "three"]);

        for msg in ["four", "five"] {
            let event = log(&mut r, msg);
            broadcaster.publish(&r, event);
        }
        assert_eq!(messages(&mut sub.receiver), vec!["four", "five"]);
    }

    #[test]
    fn test_every_subscriber_receives_every_event() {
        let broadcaster = EventBroadcaster::new();
        let mut r = run();
        let mut a = broadcaster.subscribe(r.run_id, r.clone());
        let mut b = broadcaster.subscribe(r.run_id, r.clone());
        for i in 0..100 {
            let event = log(&mut r, &format!("line {}", i));
            broadcaster.publish(&r, event);
        }
        let expected: Vec<String> = (0..100).map(|i| format!("line {}", i)).collect();
        assert_eq!(messages(&mut a.receiver), expected);
        assert_eq!(messages(&mut b.receiver), expected);
    }

    #[test]
    fn test_fallback_used_before_first_publish() {
        let broadcaster = EventBroadcaster::new();
        let r = run();
        let sub = broadcaster.subscribe(r.run_id, r.clone());
        assert_eq!(sub.snapshot, r);
        assert_eq!(broadcaster.subscriber_count(r.run_id), 1);
    }

    #[tokio::test]
    async fn test_terminal_status_closes_streams() {
        let broadcaster = EventBroadcaster::new();
        let mut r = run();
        let mut sub = broadcaster.subscribe(r.run_id, r.clone());
        r.transition(RunStatus::Running).unwrap();
        r.transition(RunStatus::Complete).unwrap();
        broadcaster.publish(&r, RunEvent::Status(StatusChange::of(&r)));

        match sub.receiver.recv().await {
            Some(RunEvent::Status(change)) => assert_eq!(change.status, RunStatus::Complete),
            other => panic!("Expected status event, got {:?}", other),
        }
        assert!(sub.receiver.recv().await.is_none());
        assert_eq!(broadcaster.subscriber_count(r.run_id), 0);

        // Joining after the end yields the final snapshot and a closed stream.
        let mut late = broadcaster.subscribe(r.run_id, run());
        assert_eq!(late.snapshot.status, RunStatus::Complete);
        assert!(late.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unseen_finished_run_leaves_no_channel() {
        let broadcaster = EventBroadcaster::new();
        let mut r = run();
        r.transition(RunStatus::Running).unwrap();
        r.transition(RunStatus::Canceled).unwrap();

        for _ in 0..3 {
            let mut sub = broadcaster.subscribe(r.run_id, r.clone());
            assert_eq!(sub.snapshot.status, RunStatus::Canceled);
            assert!(sub.receiver.recv().await.is_none());
        }
        assert!(!broadcaster.inner.lock().unwrap().by_run.contains_key(&r.run_id));
    }

    #[test]
    fn test_seed_does_not_overwrite_published_snapshot() {
        let broadcaster = EventBroadcaster::new();
        let mut r = run();
        let stale = r.clone();
        let event = log(&mut r, "published");
        broadcaster.publish(&r, event);
        broadcaster.seed(&stale);
        let sub = broadcaster.subscribe(r.run_id, run());
        assert_eq!(sub.snapshot.logs.len(), 1);
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let broadcaster = EventBroadcaster::new();
        let mut r = run();
        let sub = broadcaster.subscribe(r.run_id, r.clone());
        drop(sub);
        let event = log(&mut r, "after drop");
        broadcaster.publish(&r, event);
        assert_eq!(broadcaster.subscriber_count(r.run_id), 0);
    }

    #[test]
    fn test_event_names_and_payloads() {
        let entry = LogEntry::new("System", LogLevel::Warn, "careful");
        let event = RunEvent::Log(entry);
        assert_eq!(event.name(), "log");
        let data: serde_json::Value = serde_json::from_str(&event.data().unwrap()).unwrap();
        assert_eq!(data["level"], "warn");
        assert_eq!(data["message"], "careful");
        assert!(!event.is_terminal());
    }
}
