//! Event publishing for transcript completion and incremental updates.
//!
//! Decouples the transcript from whatever observability surface a host
//! process wants (a UI, a log sink, a test harness) the same way an event
//! bus decouples a core library from its presentation layer.

use std::sync::{Arc, Mutex};

use crate::transcript::Transcript;

/// An event published by the conversation.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    /// Published once, during termination, carrying the final transcript.
    TranscriptComplete {
        /// Identifier of the conversation that just terminated.
        conversation_id: String,
        /// The transcript at the moment of termination.
        transcript: Transcript,
    },
    /// Published incrementally as messages accumulate, if a subscriber is
    /// attached.
    TranscriptUpdated {
        /// Identifier of the conversation the update belongs to.
        conversation_id: String,
        /// Rendered transcript text at the moment of the update.
        text: String,
    },
}

/// Trait for publishing conversation events to subscribers.
pub trait EventsManager: Send + Sync {
    /// Publish an event. Implementations must not block the caller for long;
    /// the conversation publishes from its single cooperative executor.
    fn publish(&self, event: ConversationEvent);

    /// Flush any buffered events. Called during termination; implementations
    /// that publish synchronously can leave this as a no-op.
    fn flush(&self) {}
}

/// Type alias for a shared events-manager reference.
pub type EventsManagerRef = Arc<dyn EventsManager>;

/// In-memory events manager for testing: captures every published event.
#[derive(Default)]
pub struct InMemoryEventsManager {
    events: Mutex<Vec<ConversationEvent>>,
}

impl InMemoryEventsManager {
    /// Create a new, empty in-memory manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events published so far, in publish order.
    pub fn events(&self) -> Vec<ConversationEvent> {
        self.events.lock().expect("events mutex poisoned").clone()
    }

    /// Number of events published so far.
    pub fn len(&self) -> usize {
        self.events.lock().expect("events mutex poisoned").len()
    }

    /// Whether no events have been published yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventsManager for InMemoryEventsManager {
    fn publish(&self, event: ConversationEvent) {
        self.events
            .lock()
            .expect("events mutex poisoned")
            .push(event);
    }
}

/// No-op events manager that discards everything published to it.
pub struct NullEventsManager;

impl EventsManager for NullEventsManager {
    fn publish(&self, _event: ConversationEvent) {}
}
