//! Server-sent event stream for one run's live feed.

use std::convert::Infallible;
use std::future::ready;

use axum::response::sse::Event;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::broadcast::{RunEvent, Subscription};
use super::models::{LogEntry, RunRecord};

#[derive(Serialize)]
struct SnapshotPayload<'a> {
    run: &'a RunRecord,
    logs: &'a [LogEntry],
}

pub fn snapshot_event(run: &RunRecord) -> Option<Event> {
    let payload = SnapshotPayload {
        run,
        logs: &run.logs,
    };
    match Event::default().event("snapshot").json_data(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::error!(run_id = %run.run_id, error = %e, "failed to encode snapshot event");
            None
        }
    }
}

pub fn run_event(event: &RunEvent) -> Option<Event> {
    match event.data() {
        Ok(data) => Some(Event::default().event(event.name()).data(data)),
        Err(e) => {
            tracing::error!(event = event.name(), error = %e, "failed to encode run event");
            None
        }
    }
}

/// `snapshot` first, then every live event until a terminal status or
/// until `shutdown` fires.
pub fn event_stream(
    subscription: Subscription,
    shutdown: CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let Subscription { snapshot, receiver } = subscription;
    let head = stream::iter(snapshot_event(&snapshot));

    let live = stream::unfold(Some(receiver), |state| async move {
        let mut receiver = state?;
        let event = receiver.recv().await?;
        let next = if event.is_terminal() { None } else { Some(receiver) };
        Some((event, next))
    })
    .filter_map(|event| ready(run_event(&event)));

    head.chain(live)
        .take_until(shutdown.cancelled_owned())
        .map(Ok::<_, Infallible>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::studio::broadcast::{EventBroadcaster, StatusChange};
    use crate::studio::models::{LogLevel, RunInputs, RunMode, RunStatus};
    use crate::studio::registry;

    fn run() -> RunRecord {
        RunRecord::new("client_acme", RunMode::Drift, registry::stages_for(RunMode::Drift), RunInputs::new())
    }

    #[tokio::test]
    async fn test_stream_ends_after_terminal_status() {
        let broadcaster = EventBroadcaster::new();
        let mut r = run();
        let sub = broadcaster.subscribe(r.run_id, r.clone());
        let stream = event_stream(sub, CancellationToken::new());

        let entry = LogEntry::new("Drift Check", LogLevel::Info, "checking");
        r.push_log(entry.clone(), 500);
        broadcaster.publish(&r, RunEvent::Log(entry));
        r.transition(RunStatus::Running).unwrap();
        r.transition(RunStatus::Complete).unwrap();
        broadcaster.publish(&r, RunEvent::Status(StatusChange::of(&r)));

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_finished_run_yields_only_snapshot() {
        let broadcaster = EventBroadcaster::new();
        let mut r = run();
        r.transition(RunStatus::Canceled).unwrap();
        let sub = broadcaster.subscribe(r.run_id, r.clone());
        let events: Vec<_> = event_stream(sub, CancellationToken::new()).collect().await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_ends_open_stream() {
        let broadcaster = EventBroadcaster::new();
        let r = run();
        let sub = broadcaster.subscribe(r.run_id, r.clone());
        let shutdown = CancellationToken::new();
        let stream = event_stream(sub, shutdown.clone());
        shutdown.cancel();
        let events: Vec<_> = stream.collect().await;
        assert!(events.len() <= 1);
    }
}
