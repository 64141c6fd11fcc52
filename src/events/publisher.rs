use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Broadcast publisher for testrun and step lifecycle events
///
/// Publishing never fails for lack of subscribers; slow subscribers lag and
/// lose the oldest events.
///
/// ```rust
/// use serde_json::json;
/// use testmachinery::events::EventPublisher;
///
/// # tokio_test::block_on(async {
/// let publisher = EventPublisher::new(16);
/// let mut receiver = publisher.subscribe();
/// publisher.publish_testrun_event("testrun.submitted", "tm-1", json!({}));
///
/// let event = receiver.recv().await.unwrap();
/// assert_eq!(event.testrun_id, "tm-1");
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

/// Event that has been published
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedEvent {
    pub name: String,
    pub testrun_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    pub context: Value,
    pub published_at: DateTime<Utc>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a testrun scoped event
    pub fn publish_testrun_event(&self, name: &str, testrun_id: &str, context: Value) {
        self.send(PublishedEvent {
            name: name.to_string(),
            testrun_id: testrun_id.to_string(),
            step_name: None,
            context,
            published_at: Utc::now(),
        });
    }

    /// Publish a step scoped event
    pub fn publish_step_event(&self, name: &str, testrun_id: &str, step_name: &str, context: Value) {
        self.send(PublishedEvent {
            name: name.to_string(),
            testrun_id: testrun_id.to_string(),
            step_name: Some(step_name.to_string()),
            context,
            published_at: Utc::now(),
        });
    }

    fn send(&self, event: PublishedEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}
