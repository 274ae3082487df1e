//! Owns the three mutually-exclusive ambient audio streams: filler (while
//! the agent is thinking), back-tracking (acknowledging an interrupt), and
//! follow-up (filling silence after a reply). At most one plays at a time;
//! starting a new one cooperatively cancels whichever is active.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::interfaces::{OutputDevice, Synthesizer};
use crate::worker::ResponseTracker;

/// Which ambient stream is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmbientStream {
    /// Played while the agent is still generating a reply.
    Filler,
    /// A brief acknowledgement right after the human interrupts.
    BackTracking,
    /// Fills silence after a reply finishes.
    FollowUp,
}

/// The phrase banks each stream draws from, fetched through the
/// synthesizer's cache keyed by `(voice_id, phrase)`.
#[derive(Debug, Clone)]
pub struct PhraseBanks {
    /// Candidate filler phrases.
    pub filler: Vec<String>,
    /// Candidate back-tracking phrases.
    pub back_tracking: Vec<String>,
    /// Candidate follow-up phrases.
    pub follow_up: Vec<String>,
}

impl Default for PhraseBanks {
    fn default() -> Self {
        Self {
            filler: vec![
                "Let me think about that.".to_owned(),
                "One moment.".to_owned(),
                "Let's see.".to_owned(),
            ],
            back_tracking: vec!["Sorry, go ahead.".to_owned(), "Oh, sure.".to_owned()],
            follow_up: vec![
                "Anything else I can help with?".to_owned(),
                "Let me know if there's more.".to_owned(),
            ],
        }
    }
}

struct ActiveStream {
    kind: AmbientStream,
    generation: u64,
    cancel: CancellationToken,
}

/// Manager for the three ambient audio streams.
pub struct RandomAudioManager {
    synthesizer: Arc<dyn Synthesizer>,
    output_device: Arc<dyn OutputDevice>,
    voice_id: String,
    phrase_banks: PhraseBanks,
    active: Arc<Mutex<Option<ActiveStream>>>,
    next_generation: AtomicU64,
}

impl RandomAudioManager {
    /// Create a manager drawing phrases for `voice_id` through `synthesizer`
    /// and playing them on `output_device`.
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        output_device: Arc<dyn OutputDevice>,
        voice_id: impl Into<String>,
        phrase_banks: PhraseBanks,
    ) -> Self {
        Self {
            synthesizer,
            output_device,
            voice_id: voice_id.into(),
            phrase_banks,
            active: Arc::new(Mutex::new(None)),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Which stream, if any, is currently playing.
    pub async fn active_stream(&self) -> Option<AmbientStream> {
        self.active.lock().await.as_ref().map(|a| a.kind)
    }

    /// Play a filler clip, stopping whatever else is playing first.
    pub async fn send_filler(&self, tracker: Option<ResponseTracker>) {
        let phrase = self.pick(&self.phrase_banks.filler);
        self.play(AmbientStream::Filler, phrase, tracker).await;
    }

    /// Play a back-tracking clip, stopping whatever else is playing first.
    pub async fn send_back_tracking(&self, tracker: Option<ResponseTracker>) {
        let phrase = self.pick(&self.phrase_banks.back_tracking);
        self.play(AmbientStream::BackTracking, phrase, tracker)
            .await;
    }

    /// Play a follow-up clip, stopping whatever else is playing first.
    pub async fn send_follow_up(&self, tracker: Option<ResponseTracker>) {
        let phrase = self.pick(&self.phrase_banks.follow_up);
        self.play(AmbientStream::FollowUp, phrase, tracker).await;
    }

    /// Stop filler and follow-up audio, leaving back-tracking (if playing)
    /// untouched. Used by the Transcriptions stage when a human interrupt is
    /// detected.
    pub async fn stop_filler_and_follow_up(&self) {
        self.stop_if(|kind| matches!(kind, AmbientStream::Filler | AmbientStream::FollowUp))
            .await;
    }

    /// Stop back-tracking and follow-up audio, leaving filler untouched.
    /// Used by the AgentResponses stage before synthesizing a real reply.
    pub async fn stop_back_tracking_and_follow_up(&self) {
        self.stop_if(|kind| matches!(kind, AmbientStream::BackTracking | AmbientStream::FollowUp))
            .await;
    }

    /// Stop filler audio only. Used by the AgentResponses stage right
    /// before handing a synthesized reply to the emitter.
    pub async fn stop_filler(&self) {
        self.stop_if(|kind| matches!(kind, AmbientStream::Filler))
            .await;
    }

    /// Cancel whichever stream is active, if any. `cancel_noise` (§4.10)
    /// delegates here for a narrower, stream-only interrupt.
    pub async fn stop_active(&self) {
        self.stop_if(|_| true).await;
    }

    /// Cancel every stream and refuse to start new ones. Called once,
    /// during termination.
    pub async fn terminate(&self) {
        self.stop_active().await;
    }

    async fn stop_if(&self, predicate: impl Fn(AmbientStream) -> bool) {
        let mut guard = self.active.lock().await;
        if let Some(active) = guard.as_ref()
            && predicate(active.kind)
        {
            active.cancel.cancel();
            *guard = None;
        }
    }

    fn pick(&self, bank: &[String]) -> String {
        bank.choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_default()
    }

    async fn play(&self, kind: AmbientStream, phrase: String, tracker: Option<ResponseTracker>) {
        if phrase.is_empty() {
            if let Some(tracker) = tracker {
                tracker.mark_complete().await;
            }
            return;
        }

        self.stop_active().await;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        *self.active.lock().await = Some(ActiveStream {
            kind,
            generation,
            cancel: cancel.clone(),
        });

        let synthesizer = self.synthesizer.clone();
        let output_device = self.output_device.clone();
        let voice_id = self.voice_id.clone();
        let active = self.active.clone();

        tokio::spawn(async move {
            match synthesizer.cached_phrase(&voice_id, &phrase).await {
                Ok(mut synthesis) => {
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            next = synthesis.chunks.next() => {
                                match next {
                                    Some(Ok((bytes, is_last))) => {
                                        if output_device.consume_nonblocking(bytes).await.is_err() {
                                            break;
                                        }
                                        if is_last {
                                            break;
                                        }
                                    }
                                    _ => break,
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!("random-audio synthesis failed: {e}"),
            }

            let mut guard = active.lock().await;
            if guard.as_ref().is_some_and(|a| a.generation == generation) {
                *guard = None;
            }
            drop(guard);

            if let Some(tracker) = tracker {
                tracker.mark_complete().await;
            }
        });
    }
}
