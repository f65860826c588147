//! In-process event bus with per-run topics.
//!
//! Delivery is best-effort to currently connected subscribers: a slow
//! subscriber's broadcast buffer drops its oldest events, and nothing is
//! replayed after reconnect; clients reconcile over REST. `run_completed`
//! is always the last event on a topic; publishing it closes the topic.

use chrono::{DateTime, Utc};
use scholarr_db::runs::RunStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub scholar_count: i64,
    pub new_publication_count: i64,
    pub failed_count: i64,
    pub partial_count: i64,
    pub warnings: Vec<String>,
}

/// Events pushed to connected clients over the run's SSE stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    PublicationDiscovered {
        publication_id: i64,
        scholar_profile_id: i64,
        title: String,
        first_seen_at: DateTime<Utc>,
        pub_url: Option<String>,
    },
    IdentifierUpdated {
        publication_id: i64,
        display_identifier: String,
    },
    RunProgress {
        processed: i64,
        total: i64,
    },
    RunCompleted {
        outcome: RunStatus,
        summary: RunSummary,
    },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunCompleted { .. })
    }
}

#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<i64, broadcast::Sender<RunEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a run's topic, creating it if the run has not published
    /// yet. Subscribers joining after `run_completed` get an immediately
    /// closed stream.
    pub fn subscribe(&self, run_id: i64) -> broadcast::Receiver<RunEvent> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Publish to a run's topic. Nobody listening is fine.
    pub fn publish(&self, run_id: i64, event: RunEvent) {
        let terminal = event.is_terminal();
        let mut topics = self.topics.lock().unwrap();
        if let Some(sender) = topics.get(&run_id) {
            let _ = sender.send(event);
        } else if !terminal {
            // Create the topic so a subscriber attaching mid-run sees
            // subsequent events.
            let sender = broadcast::channel(TOPIC_CAPACITY).0;
            let _ = sender.send(event);
            topics.insert(run_id, sender);
        }
        if terminal {
            topics.remove(&run_id);
            debug!(run_id, "run topic closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(processed: i64) -> RunEvent {
        RunEvent::RunProgress {
            processed,
            total: 10,
        }
    }

    #[tokio::test]
    async fn events_reach_subscriber_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(1);
        bus.publish(1, progress(1));
        bus.publish(1, progress(2));

        assert!(matches!(rx.recv().await.unwrap(), RunEvent::RunProgress { processed: 1, .. }));
        assert!(matches!(rx.recv().await.unwrap(), RunEvent::RunProgress { processed: 2, .. }));
    }

    #[tokio::test]
    async fn run_completed_closes_the_topic() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(7);
        bus.publish(
            7,
            RunEvent::RunCompleted {
                outcome: RunStatus::Success,
                summary: RunSummary {
                    scholar_count: 1,
                    new_publication_count: 0,
                    failed_count: 0,
                    partial_count: 0,
                    warnings: vec![],
                },
            },
        );

        assert!(matches!(rx.recv().await.unwrap(), RunEvent::RunCompleted { .. }));
        // Topic dropped: the stream ends.
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
    }

    #[tokio::test]
    async fn topics_are_isolated_per_run() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe(1);
        let _rx_b = bus.subscribe(2);
        bus.publish(2, progress(5));
        bus.publish(1, progress(1));
        assert!(matches!(rx_a.recv().await.unwrap(), RunEvent::RunProgress { processed: 1, .. }));
    }

    #[test]
    fn events_serialize_with_type_tags() {
        let json = serde_json::to_value(progress(3)).unwrap();
        assert_eq!(json["type"], "run_progress");
        assert_eq!(json["processed"], 3);
    }
}
