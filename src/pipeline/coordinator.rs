//! The conversation orchestrator: wires the transcriber, agent, synthesizer,
//! and output device into the three pipeline stages described in the data
//! model, plus the rate-paced emitter, idle watchdog, and sentiment loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OnceCell, mpsc, watch};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ConversationConfig;
use crate::error::{ConversationError, Result};
use crate::events::{EventsManagerRef, NullEventsManager};
use crate::interfaces::{
    Agent, AgentConfig, OutputDevice, SynthesisResult, Synthesizer, Transcriber, TranscriberConfig,
};
use crate::pipeline::messages::{AgentInput, AgentResponse, Transcription};
use crate::random_audio::{PhraseBanks, RandomAudioManager};
use crate::sentiment::{BotSentiment, HeuristicSentimentAnalyser, SentimentAnalyser};
use crate::transcript::{Sender as TranscriptSender, Transcript};
use crate::worker::{
    InterruptibleAgentResponseWorker, InterruptibleEvent, InterruptibleEventFactory,
    InterruptionEvent, InterruptQueue, ResponseTracker, WorkerHandle,
};

const TRANSCRIPTION_CHANNEL_SIZE: usize = 16;
const AGENT_INPUT_CHANNEL_SIZE: usize = 8;
const AGENT_RESPONSE_CHANNEL_SIZE: usize = 16;
const SYNTHESIS_CHANNEL_SIZE: usize = 8;

struct ConversationState {
    active: AtomicBool,
    is_human_speaking: AtomicBool,
    current_transcription_is_interrupt: AtomicBool,
    last_action_timestamp: std::sync::Mutex<Instant>,
}

impl ConversationState {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            is_human_speaking: AtomicBool::new(false),
            current_transcription_is_interrupt: AtomicBool::new(false),
            last_action_timestamp: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_action_timestamp.lock().expect("timestamp mutex poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_action_timestamp
            .lock()
            .expect("timestamp mutex poisoned")
            .elapsed()
    }
}

/// Shared state behind a [`Conversation`] handle.
pub struct Inner {
    id: String,
    config: ConversationConfig,
    cancel: CancellationToken,
    state: ConversationState,
    interrupt_queue: InterruptQueue,
    event_factory: InterruptibleEventFactory,
    transcript: Mutex<Transcript>,
    random_audio: Arc<RandomAudioManager>,
    transcriber: Arc<dyn Transcriber>,
    agent: Arc<dyn Agent>,
    synthesizer: Arc<dyn Synthesizer>,
    output_device: Arc<dyn OutputDevice>,
    sentiment_analyser: Arc<dyn SentimentAnalyser>,
    agent_config: AgentConfig,
    transcriber_config: TranscriberConfig,

    transcriptions_tx: mpsc::Sender<Transcription>,
    transcriptions_rx: Mutex<Option<mpsc::Receiver<Transcription>>>,
    agent_response_tx: mpsc::Sender<AgentResponse>,
    agent_response_rx: Mutex<Option<mpsc::Receiver<AgentResponse>>>,
    agent_responses_handle: OnceCell<WorkerHandle>,

    bot_sentiment_tx: watch::Sender<Option<BotSentiment>>,
    bot_sentiment_rx: watch::Receiver<Option<BotSentiment>>,

    terminating: AtomicBool,
}

/// A single interruptible, rate-paced voice conversation between one human
/// and one bot. Cheap to clone; every clone shares the same underlying
/// state.
#[derive(Clone)]
pub struct Conversation(Arc<Inner>);

impl std::ops::Deref for Conversation {
    type Target = Inner;

    fn deref(&self) -> &Inner {
        &self.0
    }
}

/// Builds a [`Conversation`] from its external collaborators and optional
/// configuration overrides.
pub struct ConversationBuilder {
    config: ConversationConfig,
    events_manager: EventsManagerRef,
    sentiment_analyser: Arc<dyn SentimentAnalyser>,
    phrase_banks: PhraseBanks,
    voice_id: String,
}

impl Default for ConversationBuilder {
    fn default() -> Self {
        Self {
            config: ConversationConfig::default(),
            events_manager: Arc::new(NullEventsManager),
            sentiment_analyser: Arc::new(HeuristicSentimentAnalyser),
            phrase_banks: PhraseBanks::default(),
            voice_id: "default".to_owned(),
        }
    }
}

impl ConversationBuilder {
    /// Start building a conversation with defaults for everything optional.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the layered configuration.
    pub fn with_config(mut self, config: ConversationConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach an events-manager subscription for transcript events.
    pub fn with_events_manager(mut self, events_manager: EventsManagerRef) -> Self {
        self.events_manager = events_manager;
        self
    }

    /// Override the sentiment analyser used by the sentiment-sampling loop.
    pub fn with_sentiment_analyser(mut self, analyser: Arc<dyn SentimentAnalyser>) -> Self {
        self.sentiment_analyser = analyser;
        self
    }

    /// Override the random-audio manager's phrase banks.
    pub fn with_phrase_banks(mut self, banks: PhraseBanks) -> Self {
        self.phrase_banks = banks;
        self
    }

    /// Set the voice identifier used for random-audio phrase cache lookups.
    pub fn with_voice_id(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = voice_id.into();
        self
    }

    /// Build the conversation. `id` is used as given, or generated as a
    /// random UUID if `None`. The conversation starts inactive; call
    /// [`Conversation::start`] to bring it up.
    pub fn build(
        self,
        id: Option<String>,
        transcriber: Arc<dyn Transcriber>,
        agent: Arc<dyn Agent>,
        synthesizer: Arc<dyn Synthesizer>,
        output_device: Arc<dyn OutputDevice>,
    ) -> Conversation {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let interrupt_queue = InterruptQueue::new();
        let event_factory = InterruptibleEventFactory::new(interrupt_queue.clone());
        let transcript =
            Transcript::new().with_events_manager(id.clone(), self.events_manager.clone());
        let random_audio = Arc::new(RandomAudioManager::new(
            synthesizer.clone(),
            output_device.clone(),
            self.voice_id,
            self.phrase_banks,
        ));
        let agent_config = agent.config();
        let transcriber_config = transcriber.config();

        let (transcriptions_tx, transcriptions_rx) = mpsc::channel(TRANSCRIPTION_CHANNEL_SIZE);
        let (agent_response_tx, agent_response_rx) = mpsc::channel(AGENT_RESPONSE_CHANNEL_SIZE);
        let (bot_sentiment_tx, bot_sentiment_rx) = watch::channel(None);

        Conversation(Arc::new(Inner {
            id,
            config: self.config,
            cancel: CancellationToken::new(),
            state: ConversationState::new(),
            interrupt_queue,
            event_factory,
            transcript: Mutex::new(transcript),
            random_audio,
            transcriber,
            agent,
            synthesizer,
            output_device,
            sentiment_analyser: self.sentiment_analyser,
            agent_config,
            transcriber_config,
            transcriptions_tx,
            transcriptions_rx: Mutex::new(Some(transcriptions_rx)),
            agent_response_tx,
            agent_response_rx: Mutex::new(Some(agent_response_rx)),
            agent_responses_handle: OnceCell::new(),
            bot_sentiment_tx,
            bot_sentiment_rx,
            terminating: AtomicBool::new(false),
        }))
    }
}

impl Conversation {
    /// Start a builder.
    pub fn builder() -> ConversationBuilder {
        ConversationBuilder::new()
    }

    /// Conversation identifier.
    pub fn id(&self) -> &str {
        &self.0.id
    }

    /// Whether the conversation is currently active (§4.10).
    pub fn is_active(&self) -> bool {
        self.0.state.active.load(Ordering::SeqCst)
    }

    /// Stamp `last_action_timestamp` with the current instant. Shared by the
    /// Transcriptions stage and the convenience entry points below so both
    /// feed the same idle-watchdog bookkeeping.
    pub fn mark_last_action_timestamp(&self) {
        self.0.state.touch();
    }

    /// A snapshot of the transcript as recorded so far.
    pub async fn transcript_snapshot(&self) -> Transcript {
        self.0.transcript.lock().await.clone()
    }

    /// Bring the conversation up: spawns the transcriber, the agent, every
    /// pipeline stage, the idle watchdog and (if configured) the sentiment
    /// loop, then sends the agent's initial message if one is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the conversation has already been started.
    pub async fn start(&self) -> Result<()> {
        let transcriptions_rx = self
            .transcriptions_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ConversationError::Invariant("conversation already started".into()))?;
        let agent_response_rx = self
            .agent_response_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ConversationError::Invariant("conversation already started".into()))?;

        self.output_device.start().await?;
        if !self.transcriber.ready().await {
            return Err(ConversationError::Transcriber(
                "transcriber startup failed".into(),
            ));
        }

        self.state.active.store(true, Ordering::SeqCst);
        self.mark_last_action_timestamp();

        let (agent_input_tx, agent_input_rx) = mpsc::channel(AGENT_INPUT_CHANNEL_SIZE);
        let (wrapped_tx, wrapped_rx) =
            mpsc::channel::<Arc<InterruptibleEvent<AgentResponse>>>(AGENT_RESPONSE_CHANNEL_SIZE);
        let (synthesis_tx, synthesis_rx) = mpsc::channel(SYNTHESIS_CHANNEL_SIZE);

        {
            let transcriber = self.transcriber.clone();
            let tx = self.transcriptions_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = transcriber.start(tx).await {
                    warn!("transcriber stopped: {e}");
                }
            });
        }

        {
            let agent = self.agent.clone();
            let response_tx = self.agent_response_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = agent.start(agent_input_rx, response_tx).await {
                    warn!("agent stopped: {e}");
                }
            });
        }

        tokio::spawn(run_agent_response_relay(
            self.clone(),
            agent_response_rx,
            wrapped_tx,
        ));

        tokio::spawn(run_transcriptions_stage(
            self.clone(),
            transcriptions_rx,
            agent_input_tx,
        ));

        let worker = InterruptibleAgentResponseWorker::new(wrapped_rx, self.cancel.clone());
        let handle = worker.handle();
        let _ = self.agent_responses_handle.set(handle);
        {
            let conv = self.clone();
            tokio::spawn(worker.run(move |response, is_interruptible, tracker| {
                let conv = conv.clone();
                let synthesis_tx = synthesis_tx.clone();
                async move {
                    conv.process_agent_response(response, is_interruptible, tracker, synthesis_tx)
                        .await;
                }
            }));
        }

        tokio::spawn(run_synthesis_results_stage(self.clone(), synthesis_rx));
        tokio::spawn(run_idle_watchdog(self.clone()));
        if self.agent_config.track_bot_sentiment {
            tokio::spawn(run_sentiment_loop(self.clone()));
        }

        self.send_initial_message().await
    }

    /// Feed a finished human message directly to the Transcriptions stage,
    /// bypassing the transcriber entirely (§4.10). Useful for text-driven
    /// exercising of the same orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if the Transcriptions stage has shut down.
    pub async fn receive_message(&self, text: impl Into<String>) -> Result<()> {
        self.mark_last_action_timestamp();
        self.transcriptions_tx
            .send(Transcription::final_text(text))
            .await
            .map_err(|_| ConversationError::Channel("transcriptions queue closed".into()))
    }

    /// Forward a raw audio chunk to the transcriber (§4.10). The transcriber
    /// is the sole source of `Transcription` values derived from audio.
    ///
    /// # Errors
    ///
    /// Propagates whatever error the transcriber returns.
    pub async fn receive_audio(&self, audio: Vec<u8>) -> Result<()> {
        self.mark_last_action_timestamp();
        self.transcriber.send_audio(audio).await
    }

    /// If the agent config carries an initial message, synthesize and speak
    /// it through the rate-paced emitter directly (§4.10).
    ///
    /// # Errors
    ///
    /// Propagates a synthesis failure.
    pub async fn send_initial_message(&self) -> Result<()> {
        let Some(text) = self.agent_config.initial_message.clone() else {
            return Ok(());
        };
        let synthesis = self.create_speech_with_timeout(&text, None).await?;
        let idx = {
            let mut transcript = self.transcript.lock().await;
            transcript.add_message(TranscriptSender::Bot, "")
        };
        let interruption_event = InterruptionEvent::new();
        let (spoken, _cut_off) = self
            .send_speech_to_output(synthesis, interruption_event, Some(idx))
            .await;
        let mut transcript = self.transcript.lock().await;
        transcript.set_message_text(idx, spoken);
        transcript.maybe_publish_update();
        Ok(())
    }

    /// If a random-audio stream is currently active, interrupt that stream
    /// only (§4.10). Exposed for an output device that detects line noise
    /// mid-utterance.
    pub async fn cancel_noise(&self) {
        self.random_audio.stop_active().await;
    }

    /// Drain the interrupt queue and cancel the agent's and the
    /// AgentResponses stage's in-flight tasks (§4.8). Returns whether at
    /// least one queued event was newly interrupted.
    pub async fn broadcast_interrupt(&self) -> bool {
        let interrupted = self.interrupt_queue.broadcast_interrupt().await;
        self.agent.cancel_current_task().await;
        if let Some(handle) = self.agent_responses_handle.get() {
            handle.cancel_current_task().await;
        }
        interrupted
    }

    /// Tear the conversation down in the order required by the termination
    /// protocol (§4.9). Idempotent.
    pub async fn terminate(&self) {
        if self.terminating.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.active.store(false, Ordering::SeqCst);
        self.broadcast_interrupt().await;
        {
            let transcript = self.transcript.lock().await;
            transcript.publish_complete();
        }

        if let Err(e) = self.synthesizer.tear_down().await {
            warn!("synthesizer tear-down failed: {e}");
        }
        if let Err(e) = self.agent.terminate().await {
            warn!("agent termination failed: {e}");
        }
        if let Err(e) = self.output_device.terminate().await {
            warn!("output device termination failed: {e}");
        }
        if let Err(e) = self.transcriber.terminate().await {
            warn!("transcriber termination failed: {e}");
        }

        self.cancel.cancel();
        self.random_audio.terminate().await;
    }

    async fn process_agent_response(
        &self,
        response: AgentResponse,
        is_interruptible: bool,
        tracker: Option<ResponseTracker>,
        synthesis_tx: mpsc::Sender<Arc<InterruptibleEvent<SynthesisResult>>>,
    ) {
        match response {
            AgentResponse::FillerAudio => self.random_audio.send_filler(tracker).await,
            AgentResponse::BackTrackingAudio => self.random_audio.send_back_tracking(tracker).await,
            AgentResponse::FollowUpAudio => self.random_audio.send_follow_up(tracker).await,
            AgentResponse::Stop => {
                if let Some(tracker) = tracker {
                    tracker.mark_complete().await;
                }
                self.terminate().await;
            }
            AgentResponse::EndOfTurn => {
                if let Some(tracker) = tracker {
                    tracker.mark_complete().await;
                }
            }
            AgentResponse::Message { text, .. } => {
                self.random_audio.stop_back_tracking_and_follow_up().await;
                let bot_sentiment = self.bot_sentiment_rx.borrow().clone();
                match self.create_speech_with_timeout(&text, bot_sentiment).await {
                    Ok(synthesis) => {
                        self.random_audio.stop_filler().await;
                        let event = self
                            .event_factory
                            .create_with_tracker(synthesis, is_interruptible, tracker)
                            .await;
                        if synthesis_tx.send(event).await.is_err() {
                            debug!("synthesis results stage gone, dropping response");
                        }
                    }
                    Err(e) => {
                        warn!("synthesis failed: {e}");
                        if let Some(tracker) = tracker {
                            tracker.mark_complete().await;
                        }
                    }
                }
            }
        }
    }

    /// Synthesize `text`, bounding the call to `SynthesizerConfig::request_timeout_seconds`
    /// so a stalled synthesizer network call can't wedge the AgentResponses
    /// stage (§5).
    async fn create_speech_with_timeout(
        &self,
        text: &str,
        bot_sentiment: Option<BotSentiment>,
    ) -> Result<SynthesisResult> {
        let budget = Duration::from_secs(self.config.synthesizer.request_timeout_seconds);
        tokio::time::timeout(
            budget,
            self.synthesizer
                .create_speech(text, self.config.synthesizer.chunk_size, bot_sentiment),
        )
        .await
        .map_err(|_| ConversationError::Synthesizer("request timed out".into()))?
    }

    /// The rate-paced speech emitter (§4.5). Returns the text actually
    /// spoken and whether emission was cut off by an interrupt.
    async fn send_speech_to_output(
        &self,
        mut synthesis: SynthesisResult,
        interruption_event: InterruptionEvent,
        transcript_index: Option<usize>,
    ) -> (String, bool) {
        let seconds_per_chunk = self.config.emitter.text_to_speech_chunk_size_seconds;
        let allowance = self.config.emitter.per_chunk_allowance_seconds;
        let chunk_size = self.config.synthesizer.chunk_size.max(1) as f64;
        let should_mute = self.transcriber_config.mute_during_speech;

        if should_mute {
            self.transcriber.mute().await;
        }

        let mut seconds_spoken = 0.0_f64;
        let mut message_sent = String::new();
        let mut cut_off = false;

        loop {
            if interruption_event.is_set() {
                message_sent = format!("{}-", (synthesis.get_message_up_to)(seconds_spoken));
                cut_off = true;
                break;
            }

            match synthesis.chunks.next().await {
                Some(Ok((chunk, is_last))) => {
                    if interruption_event.is_set() {
                        message_sent = format!("{}-", (synthesis.get_message_up_to)(seconds_spoken));
                        cut_off = true;
                        break;
                    }

                    let start = Instant::now();
                    let speech_length_seconds = seconds_per_chunk * (chunk.len() as f64 / chunk_size);
                    if let Err(e) = self.output_device.consume_nonblocking(chunk).await {
                        warn!("output device rejected chunk: {e}");
                        message_sent = (synthesis.get_message_up_to)(seconds_spoken);
                        break;
                    }
                    self.mark_last_action_timestamp();

                    let elapsed = start.elapsed().as_secs_f64();
                    let sleep_for = (speech_length_seconds - elapsed - allowance).max(0.0);
                    if sleep_for > 0.0 {
                        tokio::time::sleep(Duration::from_secs_f64(sleep_for)).await;
                    }

                    seconds_spoken += speech_length_seconds;
                    let partial = (synthesis.get_message_up_to)(seconds_spoken);
                    if let Some(idx) = transcript_index {
                        self.transcript.lock().await.set_message_text(idx, partial.clone());
                    }

                    if is_last {
                        message_sent = partial;
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!("synthesis chunk error: {e}");
                    message_sent = (synthesis.get_message_up_to)(seconds_spoken);
                    break;
                }
                None => {
                    if seconds_spoken > 0.0 {
                        message_sent = (synthesis.get_message_up_to)(seconds_spoken);
                    }
                    break;
                }
            }
        }

        if should_mute {
            self.transcriber.unmute().await;
        }
        if let Some(idx) = transcript_index {
            self.transcript
                .lock()
                .await
                .set_message_text(idx, message_sent.clone());
        }
        (message_sent, cut_off)
    }
}

async fn run_agent_response_relay(
    conv: Conversation,
    mut raw_rx: mpsc::Receiver<AgentResponse>,
    wrapped_tx: mpsc::Sender<Arc<InterruptibleEvent<AgentResponse>>>,
) {
    loop {
        tokio::select! {
            () = conv.cancel.cancelled() => break,
            item = raw_rx.recv() => {
                let Some(response) = item else { break };
                let interruptible = !matches!(response, AgentResponse::Stop | AgentResponse::EndOfTurn);
                let (event, _wait) = conv.event_factory.create(response, interruptible, true).await;
                if wrapped_tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn run_transcriptions_stage(
    conv: Conversation,
    mut rx: mpsc::Receiver<Transcription>,
    agent_input_tx: mpsc::Sender<AgentInput>,
) {
    loop {
        tokio::select! {
            () = conv.cancel.cancelled() => break,
            item = rx.recv() => {
                let Some(mut transcription) = item else { break };
                conv.mark_last_action_timestamp();
                if transcription.is_blank() {
                    continue;
                }

                let not_mid_utterance = !conv.state.is_human_speaking.load(Ordering::SeqCst);
                let confident_enough =
                    transcription.confidence >= conv.transcriber_config.min_interrupt_confidence;
                if not_mid_utterance && confident_enough {
                    let interrupted = conv.broadcast_interrupt().await;
                    conv.state
                        .current_transcription_is_interrupt
                        .store(interrupted, Ordering::SeqCst);
                    conv.random_audio.stop_filler_and_follow_up().await;
                    if conv.agent_config.send_back_tracking_audio {
                        conv.random_audio.send_back_tracking(None).await;
                    }
                }

                transcription.is_interrupt = conv
                    .state
                    .current_transcription_is_interrupt
                    .load(Ordering::SeqCst);
                conv.state
                    .is_human_speaking
                    .store(!transcription.is_final, Ordering::SeqCst);

                if transcription.is_final {
                    {
                        let mut transcript = conv.transcript.lock().await;
                        transcript.add_message(TranscriptSender::Human, transcription.message.clone());
                        transcript.maybe_publish_update();
                    }
                    let input = AgentInput {
                        conversation_id: conv.id.clone(),
                        transcription,
                    };
                    if agent_input_tx.send(input).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

async fn run_synthesis_results_stage(
    conv: Conversation,
    mut rx: mpsc::Receiver<Arc<InterruptibleEvent<SynthesisResult>>>,
) {
    loop {
        tokio::select! {
            () = conv.cancel.cancelled() => break,
            item = rx.recv() => {
                let Some(event) = item else { break };
                let tracker = event.response_tracker.clone();
                let interruption_event = event.interruption_event.clone();
                let Some(synthesis) = event.take_payload().await else {
                    continue;
                };

                let idx = {
                    let mut transcript = conv.transcript.lock().await;
                    transcript.add_message(TranscriptSender::Bot, "")
                };

                let (spoken, cut_off) = conv
                    .send_speech_to_output(synthesis, interruption_event, Some(idx))
                    .await;

                {
                    let transcript = conv.transcript.lock().await;
                    transcript.maybe_publish_update();
                }
                if let Some(tracker) = &tracker {
                    tracker.mark_complete().await;
                }
                if cut_off {
                    conv.agent.update_last_bot_message_on_cut_off(spoken.clone()).await;
                }

                if conv.agent_config.end_conversation_on_goodbye {
                    let budget = Duration::from_millis(conv.config.goodbye.race_budget_ms);
                    let said_goodbye = tokio::time::timeout(
                        budget,
                        conv.agent.create_goodbye_detection_task(spoken.clone()),
                    )
                    .await
                    .unwrap_or(false);
                    if said_goodbye {
                        conv.terminate().await;
                        continue;
                    }
                }

                if conv.agent_config.send_follow_up_audio
                    && conv.agent_response_tx.send(AgentResponse::FollowUpAudio).await.is_err()
                {
                    debug!("agent response queue gone, dropping follow-up audio request");
                }
            }
        }
    }
}

async fn run_idle_watchdog(conv: Conversation) {
    let tick = Duration::from_secs(conv.config.idle.tick_seconds.max(1));
    let allowed = Duration::from_secs(
        conv.agent_config
            .allowed_idle_time_seconds
            .unwrap_or(conv.config.idle.allowed_idle_time_seconds),
    );
    let mut interval = tokio::time::interval(tick);
    loop {
        tokio::select! {
            () = conv.cancel.cancelled() => break,
            _ = interval.tick() => {
                if conv.state.idle_for() > allowed {
                    conv.terminate().await;
                    break;
                }
            }
        }
    }
}

async fn run_sentiment_loop(conv: Conversation) {
    let tick = Duration::from_secs(conv.config.sentiment.tick_seconds.max(1));
    let mut interval = tokio::time::interval(tick);
    let mut last_text = String::new();
    loop {
        tokio::select! {
            () = conv.cancel.cancelled() => break,
            _ = interval.tick() => {
                let text = conv.transcript.lock().await.to_string_rendered();
                if text != last_text {
                    let sentiment = conv.sentiment_analyser.analyse(&text).await;
                    let _ = conv.bot_sentiment_tx.send(Some(sentiment));
                    last_text = text;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{AudioEncoding, ChunkStream, SynthesizerConfig as IfaceSynthesizerConfig};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio_stream::wrappers::ReceiverStream;

    struct StubTranscriber {
        config: TranscriberConfig,
    }

    #[async_trait]
    impl Transcriber for StubTranscriber {
        async fn start(&self, _output: mpsc::Sender<Transcription>) -> Result<()> {
            Ok(())
        }
        async fn ready(&self) -> bool {
            true
        }
        async fn send_audio(&self, _audio: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn mute(&self) {}
        async fn unmute(&self) {}
        fn config(&self) -> TranscriberConfig {
            self.config
        }
        async fn terminate(&self) -> Result<()> {
            Ok(())
        }
    }

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        async fn start(
            &self,
            mut input: mpsc::Receiver<AgentInput>,
            output: mpsc::Sender<AgentResponse>,
        ) -> Result<()> {
            while let Some(turn) = input.recv().await {
                let _ = output
                    .send(AgentResponse::Message {
                        text: format!("echo: {}", turn.transcription.message),
                        is_first: true,
                        is_sole_text_chunk: true,
                    })
                    .await;
                let _ = output.send(AgentResponse::EndOfTurn).await;
            }
            Ok(())
        }
        async fn terminate(&self) -> Result<()> {
            Ok(())
        }
        fn config(&self) -> AgentConfig {
            AgentConfig::default()
        }
        async fn update_last_bot_message_on_cut_off(&self, _text: String) {}
        async fn create_goodbye_detection_task(&self, _text: String) -> bool {
            false
        }
        async fn cancel_current_task(&self) {}
    }

    struct StubSynthesizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Synthesizer for StubSynthesizer {
        async fn create_speech(
            &self,
            message: &str,
            _chunk_size: usize,
            _bot_sentiment: Option<BotSentiment>,
        ) -> Result<SynthesisResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let full = message.to_owned();
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                let _ = tx.send(Ok((vec![0u8; 8], true))).await;
            });
            let chunks: ChunkStream = Box::pin(ReceiverStream::new(rx));
            let up_to = full.clone();
            Ok(SynthesisResult {
                chunks,
                get_message_up_to: Box::new(move |_seconds| up_to.clone()),
                cached: false,
            })
        }
        async fn cached_phrase(&self, _voice_id: &str, phrase: &str) -> Result<SynthesisResult> {
            let (tx, rx) = mpsc::channel(2);
            let phrase = phrase.to_owned();
            tokio::spawn(async move {
                let _ = tx.send(Ok((vec![1u8; 4], true))).await;
            });
            let chunks: ChunkStream = Box::pin(ReceiverStream::new(rx));
            Ok(SynthesisResult {
                chunks,
                get_message_up_to: Box::new(move |_| phrase.clone()),
                cached: true,
            })
        }
        async fn ready_synthesizer(&self) -> Result<()> {
            Ok(())
        }
        async fn tear_down(&self) -> Result<()> {
            Ok(())
        }
        fn config(&self) -> IfaceSynthesizerConfig {
            IfaceSynthesizerConfig {
                sampling_rate: 24_000,
                audio_encoding: AudioEncoding::Linear16,
                should_encode_as_wav: false,
            }
        }
    }

    struct RecordingOutputDevice {
        chunks: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl OutputDevice for RecordingOutputDevice {
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn consume_nonblocking(&self, chunk: Vec<u8>) -> Result<()> {
            self.chunks.lock().await.push(chunk);
            Ok(())
        }
        async fn terminate(&self) -> Result<()> {
            Ok(())
        }
        fn sampling_rate(&self) -> u32 {
            24_000
        }
        fn audio_encoding(&self) -> AudioEncoding {
            AudioEncoding::Linear16
        }
    }

    fn build_conversation() -> Conversation {
        let transcriber = Arc::new(StubTranscriber {
            config: TranscriberConfig {
                min_interrupt_confidence: 0.5,
                mute_during_speech: false,
            },
        });
        let agent = Arc::new(EchoAgent);
        let synthesizer = Arc::new(StubSynthesizer {
            calls: AtomicUsize::new(0),
        });
        let output_device = Arc::new(RecordingOutputDevice {
            chunks: Mutex::new(Vec::new()),
        });
        let mut config = ConversationConfig::default();
        config.emitter.text_to_speech_chunk_size_seconds = 0.01;
        config.emitter.per_chunk_allowance_seconds = 0.0;
        Conversation::builder().with_config(config).build(
            Some("conv-1".to_owned()),
            transcriber,
            agent,
            synthesizer,
            output_device,
        )
    }

    #[tokio::test]
    async fn receive_message_round_trips_through_echo_agent() {
        let conv = build_conversation();
        conv.start().await.expect("start");
        conv.receive_message("hello there").await.expect("receive");

        tokio::time::sleep(Duration::from_millis(200)).await;

        let snapshot = conv.transcript_snapshot().await;
        let rendered = snapshot.to_string_rendered();
        assert!(rendered.contains("echo: hello there"), "got: {rendered}");
        conv.terminate().await;
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_deactivates() {
        let conv = build_conversation();
        conv.start().await.expect("start");
        assert!(conv.is_active());
        conv.terminate().await;
        conv.terminate().await;
        assert!(!conv.is_active());
    }

    #[tokio::test]
    async fn starting_twice_fails() {
        let conv = build_conversation();
        conv.start().await.expect("first start");
        assert!(conv.start().await.is_err());
        conv.terminate().await;
    }

    #[test]
    fn omitting_an_id_generates_a_distinct_uuid_per_conversation() {
        let transcriber = || {
            Arc::new(StubTranscriber {
                config: TranscriberConfig {
                    min_interrupt_confidence: 0.5,
                    mute_during_speech: false,
                },
            }) as Arc<dyn Transcriber>
        };
        let make = || {
            Conversation::builder().build(
                None,
                transcriber(),
                Arc::new(EchoAgent),
                Arc::new(StubSynthesizer {
                    calls: AtomicUsize::new(0),
                }),
                Arc::new(RecordingOutputDevice {
                    chunks: Mutex::new(Vec::new()),
                }),
            )
        };
        let a = make();
        let b = make();
        assert_ne!(a.id(), b.id());
        assert!(uuid::Uuid::parse_str(a.id()).is_ok());
    }

    #[tokio::test]
    async fn empty_final_transcription_is_dropped() {
        let conv = build_conversation();
        conv.start().await.expect("start");
        conv.receive_message("").await.expect("receive");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = conv.transcript_snapshot().await;
        assert!(snapshot.is_empty());
        conv.terminate().await;
    }

    /// Boundary scenario: a low-confidence transcription does not trigger an
    /// interrupt; a high-confidence one, evaluated against a fresh
    /// not-yet-speaking state, does. Modelled as two independent states
    /// because each scenario in this family starts the human from silence.
    #[tokio::test]
    async fn low_confidence_transcription_alone_does_not_trigger_broadcast() {
        let conv = build_conversation();
        let transcription = Transcription::partial("um", 0.3);
        let not_mid_utterance = !conv.state.is_human_speaking.load(Ordering::SeqCst);
        let confident_enough =
            transcription.confidence >= conv.transcriber_config.min_interrupt_confidence;
        assert!(not_mid_utterance);
        assert!(!confident_enough);
    }

    #[tokio::test]
    async fn sufficiently_confident_transcription_triggers_broadcast() {
        let conv = build_conversation();
        let (event, _wait) = conv.event_factory.create(1u8, true, false).await;
        let transcription = Transcription::partial("stop", 0.9);
        let not_mid_utterance = !conv.state.is_human_speaking.load(Ordering::SeqCst);
        let confident_enough =
            transcription.confidence >= conv.transcriber_config.min_interrupt_confidence;
        assert!(not_mid_utterance && confident_enough);
        assert!(conv.broadcast_interrupt().await);
        assert!(event.is_interrupted());
    }

    struct FiveChunkSynthesizer;

    #[async_trait]
    impl Synthesizer for FiveChunkSynthesizer {
        async fn create_speech(
            &self,
            _message: &str,
            _chunk_size: usize,
            _bot_sentiment: Option<BotSentiment>,
        ) -> Result<SynthesisResult> {
            let (tx, rx) = mpsc::channel(5);
            tokio::spawn(async move {
                for i in 0..5usize {
                    let _ = tx.send(Ok((vec![0u8; 8], i == 4))).await;
                }
            });
            let chunks: ChunkStream = Box::pin(ReceiverStream::new(rx));
            Ok(SynthesisResult {
                chunks,
                get_message_up_to: Box::new(|seconds| format!("spoken-up-to-{seconds:.2}")),
                cached: false,
            })
        }
        async fn cached_phrase(&self, _voice_id: &str, _phrase: &str) -> Result<SynthesisResult> {
            unreachable!("not exercised by this test")
        }
        async fn ready_synthesizer(&self) -> Result<()> {
            Ok(())
        }
        async fn tear_down(&self) -> Result<()> {
            Ok(())
        }
        fn config(&self) -> IfaceSynthesizerConfig {
            IfaceSynthesizerConfig {
                sampling_rate: 24_000,
                audio_encoding: AudioEncoding::Linear16,
                should_encode_as_wav: false,
            }
        }
    }

    /// Boundary scenario 6: the emitter cut off mid-chunk stops sending to
    /// the output device and reports the spoken-so-far text with a trailing
    /// cut-off marker.
    #[tokio::test]
    async fn interrupted_emission_stops_before_remaining_chunks() {
        let transcriber = Arc::new(StubTranscriber {
            config: TranscriberConfig {
                min_interrupt_confidence: 0.5,
                mute_during_speech: false,
            },
        });
        let agent = Arc::new(EchoAgent);
        let synthesizer = Arc::new(FiveChunkSynthesizer);
        let output_device = Arc::new(RecordingOutputDevice {
            chunks: Mutex::new(Vec::new()),
        });
        let mut config = ConversationConfig::default();
        config.emitter.text_to_speech_chunk_size_seconds = 0.05;
        config.emitter.per_chunk_allowance_seconds = 0.0;
        config.synthesizer.chunk_size = 8;
        let conv = Conversation::builder().with_config(config).build(
            Some("conv-cutoff".to_owned()),
            transcriber,
            agent,
            synthesizer,
            output_device.clone(),
        );

        let synthesis = conv
            .synthesizer
            .create_speech("hello", conv.config.synthesizer.chunk_size, None)
            .await
            .expect("create_speech");
        let interruption_event = InterruptionEvent::new();
        let interrupt_after = interruption_event.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(70)).await;
            interrupt_after.set();
        });

        let (spoken, cut_off) = conv
            .send_speech_to_output(synthesis, interruption_event, None)
            .await;

        assert!(cut_off);
        assert!(spoken.ends_with('-'), "got: {spoken}");
        assert!(output_device.chunks.lock().await.len() < 5);
    }
}
