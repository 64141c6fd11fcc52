//! Lifecycle events for observability consumers. Event names live in
//! [`crate::constants::events`].

pub mod publisher;

pub use publisher::{EventPublisher, PublishedEvent};
