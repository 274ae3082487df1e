//! The append-only conversation transcript: messages, action starts, and
//! action finishes, in the order stages publish them.

use crate::events::{ConversationEvent, EventsManagerRef};

/// Who a [`EventLog::Message`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    /// The human participant.
    Human,
    /// The bot / agent.
    Bot,
}

/// One entry in the transcript.
#[derive(Debug, Clone)]
pub enum EventLog {
    /// A spoken or typed message.
    Message {
        /// Who said it.
        sender: Sender,
        /// The message text. For an in-flight bot message this is updated
        /// in place as the rate-paced emitter advances.
        text: String,
    },
    /// The agent began invoking an action (function/tool call).
    ActionStart {
        /// Name of the action.
        action_type: String,
        /// Serialized input to the action.
        action_input: String,
    },
    /// An action finished and produced output.
    ActionFinish {
        /// Name of the action.
        action_type: String,
        /// Serialized output from the action.
        action_output: String,
    },
}

/// A single rendered entry handed to the agent, after bot-message merging
/// and action bracketing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedEntry {
    /// A human or (merged) bot message.
    Message {
        /// Who said it.
        sender: Sender,
        /// The (possibly merged) text.
        text: String,
    },
    /// A function-call entry derived from an `ActionStart`.
    FunctionCall {
        /// Name of the action.
        name: String,
        /// Serialized input.
        arguments: String,
    },
    /// A function-result entry derived from an `ActionFinish`.
    FunctionResult {
        /// Name of the action.
        name: String,
        /// Serialized output.
        output: String,
    },
}

/// The append-only transcript owned by a conversation.
#[derive(Clone)]
pub struct Transcript {
    events: Vec<EventLog>,
    events_manager: Option<EventsManagerRef>,
    conversation_id: String,
}

impl std::fmt::Debug for Transcript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcript")
            .field("events", &self.events)
            .field("conversation_id", &self.conversation_id)
            .finish_non_exhaustive()
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    /// Create an empty transcript with no events-manager subscription.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            events_manager: None,
            conversation_id: String::new(),
        }
    }

    /// Attach an events-manager subscription, used for publishing complete
    /// and incremental events. Also stamps the conversation id used in
    /// published events.
    pub fn with_events_manager(
        mut self,
        conversation_id: impl Into<String>,
        manager: EventsManagerRef,
    ) -> Self {
        self.conversation_id = conversation_id.into();
        self.events_manager = Some(manager);
        self
    }

    /// Number of entries recorded so far.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the transcript has no entries.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// All entries, in append order.
    pub fn events(&self) -> &[EventLog] {
        &self.events
    }

    /// Append a message and return its index, so callers (e.g. the
    /// SynthesisResults stage) can later mutate it in place as speech is
    /// emitted.
    pub fn add_message(&mut self, sender: Sender, text: impl Into<String>) -> usize {
        self.events.push(EventLog::Message {
            sender,
            text: text.into(),
        });
        self.events.len() - 1
    }

    /// Record that an action started.
    pub fn add_action_start(
        &mut self,
        action_type: impl Into<String>,
        action_input: impl Into<String>,
    ) {
        self.events.push(EventLog::ActionStart {
            action_type: action_type.into(),
            action_input: action_input.into(),
        });
    }

    /// Record that an action finished.
    pub fn add_action_finish(
        &mut self,
        action_type: impl Into<String>,
        action_output: impl Into<String>,
    ) {
        self.events.push(EventLog::ActionFinish {
            action_type: action_type.into(),
            action_output: action_output.into(),
        });
    }

    /// Overwrite the text of the message at `index`. Used by the rate-paced
    /// emitter to reflect how much of an utterance has actually been spoken,
    /// and by cut-off handling to finalize with a trailing `"-"`.
    pub fn set_message_text(&mut self, index: usize, text: impl Into<String>) {
        if let Some(EventLog::Message { text: slot, .. }) = self.events.get_mut(index) {
            *slot = text.into();
        }
    }

    /// Render the transcript for the agent: consecutive bot messages are
    /// merged with a single-space separator, action-starts become
    /// function-call entries, action-finishes become function-result
    /// entries. An optional system preamble and epilogue bracket the
    /// sequence.
    pub fn render(&self, preamble: Option<&str>, epilogue: Option<&str>) -> Vec<RenderedEntry> {
        let mut rendered = Vec::new();
        if let Some(preamble) = preamble {
            rendered.push(RenderedEntry::Message {
                sender: Sender::Bot,
                text: preamble.to_owned(),
            });
        }

        for event in &self.events {
            match event {
                EventLog::Message { sender, text } => {
                    if *sender == Sender::Bot
                        && let Some(RenderedEntry::Message {
                            sender: Sender::Bot,
                            text: prev,
                        }) = rendered.last_mut()
                    {
                        prev.push(' ');
                        prev.push_str(text);
                        continue;
                    }
                    rendered.push(RenderedEntry::Message {
                        sender: *sender,
                        text: text.clone(),
                    });
                }
                EventLog::ActionStart {
                    action_type,
                    action_input,
                } => rendered.push(RenderedEntry::FunctionCall {
                    name: action_type.clone(),
                    arguments: action_input.clone(),
                }),
                EventLog::ActionFinish {
                    action_type,
                    action_output,
                } => rendered.push(RenderedEntry::FunctionResult {
                    name: action_type.clone(),
                    output: action_output.clone(),
                }),
            }
        }

        if let Some(epilogue) = epilogue {
            rendered.push(RenderedEntry::Message {
                sender: Sender::Bot,
                text: epilogue.to_owned(),
            });
        }
        rendered
    }

    /// Render to a flat string (merged bot messages, one line per entry),
    /// primarily for sentiment sampling and logging.
    pub fn to_string_rendered(&self) -> String {
        self.render(None, None)
            .into_iter()
            .map(|entry| match entry {
                RenderedEntry::Message { text, .. } => text,
                RenderedEntry::FunctionCall { name, arguments } => {
                    format!("[call {name}({arguments})]")
                }
                RenderedEntry::FunctionResult { name, output } => {
                    format!("[result {name} -> {output}]")
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Publish a `TranscriptUpdated` event if an events manager is attached.
    /// A no-op otherwise.
    pub fn maybe_publish_update(&self) {
        if let Some(manager) = &self.events_manager {
            manager.publish(ConversationEvent::TranscriptUpdated {
                conversation_id: self.conversation_id.clone(),
                text: self.to_string_rendered(),
            });
        }
    }

    /// Publish a `TranscriptComplete` event if an events manager is
    /// attached, then flush it. Called once, during termination.
    pub fn publish_complete(&self) {
        if let Some(manager) = &self.events_manager {
            manager.publish(ConversationEvent::TranscriptComplete {
                conversation_id: self.conversation_id.clone(),
                transcript: self.clone(),
            });
            manager.flush();
        }
    }
}
