//! The conversation data model: message types passed between pipeline
//! stages, as tagged unions with exhaustive handling at each boundary.

/// A transcription result from the transcriber. Mutated only by the
/// Transcriptions stage (to stamp `is_interrupt`); consumed and discarded.
#[derive(Debug, Clone)]
pub struct Transcription {
    /// The transcribed text.
    pub message: String,
    /// Transcriber confidence in `[0, 1]`.
    pub confidence: f32,
    /// Whether this is a final transcription (vs. partial/streaming).
    pub is_final: bool,
    /// Whether this transcription was judged an interrupt. Stamped by the
    /// Transcriptions stage from `broadcast_interrupt`'s return value.
    pub is_interrupt: bool,
}

impl Transcription {
    /// Construct a partial (non-final) transcription.
    pub fn partial(message: impl Into<String>, confidence: f32) -> Self {
        Self {
            message: message.into(),
            confidence,
            is_final: false,
            is_interrupt: false,
        }
    }

    /// Construct a final transcription at full confidence — the shape used
    /// by `receive_message`, which bypasses the transcriber entirely.
    pub fn final_text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            confidence: 1.0,
            is_final: true,
            is_interrupt: false,
        }
    }

    /// Whether the message is empty once whitespace is stripped.
    pub fn is_blank(&self) -> bool {
        self.message.trim().is_empty()
    }
}

/// Carries a final transcription downstream to the agent, along with the
/// conversation identity it belongs to.
#[derive(Debug, Clone)]
pub struct AgentInput {
    /// Identifier of the conversation this input belongs to.
    pub conversation_id: String,
    /// The final transcription that triggered this turn.
    pub transcription: Transcription,
}

/// A sum type over everything the agent can emit in response to a turn.
#[derive(Debug, Clone)]
pub enum AgentResponse {
    /// A chunk of text to be synthesized and spoken.
    Message {
        /// The text to speak.
        text: String,
        /// Whether this is the first chunk of the agent's reply.
        is_first: bool,
        /// Whether this is the only text chunk the agent will emit for this
        /// turn (no more `Message` responses follow before `EndOfTurn`).
        is_sole_text_chunk: bool,
    },
    /// Play a filler clip while the agent is still thinking. Never
    /// synthesized — dispatched straight to the random-audio manager.
    FillerAudio,
    /// Play a brief acknowledgement clip; used right after the human
    /// interrupts.
    BackTrackingAudio,
    /// Play a silence-filling clip after a reply finishes.
    FollowUpAudio,
    /// Ask the conversation to terminate.
    Stop,
    /// Marks the end of the agent's turn, with no further `Message`
    /// responses to come.
    EndOfTurn,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_transcription_is_not_final() {
        let t = Transcription::partial("um", 0.3);
        assert!(!t.is_final);
        assert!(!t.is_interrupt);
    }

    #[test]
    fn final_text_transcription_has_full_confidence() {
        let t = Transcription::final_text("hello there");
        assert!(t.is_final);
        assert!((t.confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn whitespace_only_message_is_blank() {
        let t = Transcription::partial("   \t\n", 1.0);
        assert!(t.is_blank());
    }
}
