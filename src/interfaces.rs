//! External-interface traits: the transcriber, agent, synthesizer, and
//! output device the conversation consumes but never implements.
//!
//! Concrete engines (an actual STT model, an LLM client, a TTS HTTP client,
//! a speaker sink) live outside this crate; these traits are the seam.
//! Consumers hold `Arc<dyn Trait>` and never see a concrete implementation.

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::pipeline::messages::{AgentResponse, Transcription};
use crate::sentiment::BotSentiment;

/// PCM encoding of audio chunks flowing through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    /// 16-bit signed linear PCM.
    Linear16,
    /// 8-bit mu-law.
    Mulaw,
}

/// Transcriber behaviour relevant to the conversation's interrupt logic.
#[derive(Debug, Clone, Copy)]
pub struct TranscriberConfig {
    /// Minimum confidence for a non-final transcription to be treated as an
    /// interrupt.
    pub min_interrupt_confidence: f32,
    /// Whether the transcriber should be muted while the assistant speaks.
    pub mute_during_speech: bool,
}

/// Agent behaviour the conversation needs to know about up front.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    /// Message to speak immediately after `start()`, if any.
    pub initial_message: Option<String>,
    /// Whether to play a back-tracking clip right after an interrupt.
    pub send_back_tracking_audio: bool,
    /// Whether to enqueue a follow-up clip after each reply.
    pub send_follow_up_audio: bool,
    /// Whether a detected goodbye ends the conversation.
    pub end_conversation_on_goodbye: bool,
    /// Overrides `IdleConfig::allowed_idle_time_seconds` when set.
    pub allowed_idle_time_seconds: Option<u64>,
    /// Whether the conversation should run the sentiment-sampling loop.
    pub track_bot_sentiment: bool,
}

/// Synthesizer behaviour the conversation needs to know about up front.
#[derive(Debug, Clone, Copy)]
pub struct SynthesizerConfig {
    /// Output sample rate in Hz.
    pub sampling_rate: u32,
    /// Output encoding.
    pub audio_encoding: AudioEncoding,
    /// Whether chunks should be WAV-framed.
    pub should_encode_as_wav: bool,
}

/// A boxed, single-use, fallible stream of `(chunk, is_last)` pairs.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<(Vec<u8>, bool)>> + Send>>;

/// The result of a synthesis request: a lazy, single-use chunk generator
/// plus a way to reconstruct how much of the message a given amount of
/// playback time covers (used both by normal completion and by cut-off
/// handling).
pub struct SynthesisResult {
    /// The chunk generator. Consumed exactly once by the rate-paced emitter.
    pub chunks: ChunkStream,
    /// Given seconds of playback already emitted, returns the prefix of the
    /// message text that corresponds to it.
    pub get_message_up_to: Box<dyn Fn(f64) -> String + Send + Sync>,
    /// Whether this result came from the random-audio phrase cache rather
    /// than a fresh synthesis call.
    pub cached: bool,
}

/// Transcriber (consumed). Produces [`Transcription`] values onto the
/// channel passed to `start`.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Start transcribing, pushing results onto `output`.
    async fn start(&self, output: mpsc::Sender<Transcription>) -> Result<()>;

    /// Whether the transcriber has finished initializing.
    async fn ready(&self) -> bool;

    /// Feed raw audio bytes for transcription.
    async fn send_audio(&self, audio: Vec<u8>) -> Result<()>;

    /// Suppress output (e.g. while the assistant is speaking, to avoid
    /// picking up its own voice).
    async fn mute(&self);

    /// Resume output after [`Self::mute`].
    async fn unmute(&self);

    /// Static configuration relevant to interrupt handling.
    fn config(&self) -> TranscriberConfig;

    /// Release resources. Idempotent.
    async fn terminate(&self) -> Result<()>;
}

/// Agent (consumed). Consumes [`crate::pipeline::messages::AgentInput`] and
/// produces [`AgentResponse`] values onto the channel passed to `start`.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Start the agent loop, reading turns from `input` and writing
    /// responses to `output`.
    async fn start(
        &self,
        input: mpsc::Receiver<crate::pipeline::messages::AgentInput>,
        output: mpsc::Sender<AgentResponse>,
    ) -> Result<()>;

    /// Release resources, including any vector-DB backend the agent owns.
    /// Idempotent.
    async fn terminate(&self) -> Result<()>;

    /// Static configuration.
    fn config(&self) -> AgentConfig;

    /// Notify the agent that its last bot message was cut off at `text`, so
    /// its own internal transcript can be truncated to match.
    async fn update_last_bot_message_on_cut_off(&self, text: String);

    /// Race a goodbye-detection pass over `text` against the caller's
    /// budget; the caller applies the timeout (§4.4, §7).
    async fn create_goodbye_detection_task(&self, text: String) -> bool;

    /// Cancel whatever the agent is currently doing for the in-flight turn,
    /// without stopping the agent loop itself.
    async fn cancel_current_task(&self);
}

/// Synthesizer (consumed).
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `message`, requesting chunks of roughly `chunk_size`
    /// samples, optionally coloured by `bot_sentiment`.
    async fn create_speech(
        &self,
        message: &str,
        chunk_size: usize,
        bot_sentiment: Option<BotSentiment>,
    ) -> Result<SynthesisResult>;

    /// Look up a precomputed phrase for the random-audio manager, keyed by
    /// `(voice_id, phrase)`. Implementations are expected to cache these.
    async fn cached_phrase(&self, voice_id: &str, phrase: &str) -> Result<SynthesisResult>;

    /// Warm up the synthesizer (connect, load a model, etc).
    async fn ready_synthesizer(&self) -> Result<()>;

    /// Release resources. Idempotent.
    async fn tear_down(&self) -> Result<()>;

    /// Static configuration.
    fn config(&self) -> SynthesizerConfig;
}

/// Output device (consumed).
#[async_trait]
pub trait OutputDevice: Send + Sync {
    /// Start the device's output loop.
    async fn start(&self) -> Result<()>;

    /// Hand a chunk to the device without waiting for playback.
    async fn consume_nonblocking(&self, chunk: Vec<u8>) -> Result<()>;

    /// Optionally observe transcript events (e.g. a device that also
    /// renders captions). Default: ignore.
    async fn consume_transcript(&self, _event: crate::events::ConversationEvent) {}

    /// Release resources. Idempotent.
    async fn terminate(&self) -> Result<()>;

    /// Expected input sample rate.
    fn sampling_rate(&self) -> u32;

    /// Expected input encoding.
    fn audio_encoding(&self) -> AudioEncoding;
}
