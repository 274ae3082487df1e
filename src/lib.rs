//! Parley: a real-time, interruptible voice-conversation orchestrator.
//!
//! This crate couples a streaming speech-to-text source, a token-streaming
//! language agent, a text-to-speech engine and an audio output sink into a
//! single duplex conversation. The external collaborators are consumed as
//! traits ([`interfaces`]); this crate owns only the conversation core:
//!
//! - **Worker framework** ([`worker`]): cancellable interruptible events and
//!   the queue-backed task shapes built on top of them.
//! - **Transcript** ([`transcript`]): the append-only event log rendered for
//!   the agent and published to an [`events`] subscriber.
//! - **Collator** ([`collator`]): folds a token stream into sentence-sized
//!   chunks.
//! - **Random-audio manager** ([`random_audio`]): the three mutually
//!   exclusive ambient audio streams.
//! - **Conversation orchestrator** ([`pipeline`]): the three pipeline
//!   stages, the rate-paced emitter, the idle watchdog and the
//!   sentiment-sampling loop.

pub mod collator;
pub mod config;
pub mod error;
pub mod events;
pub mod interfaces;
pub mod pipeline;
pub mod random_audio;
pub mod sentiment;
pub mod transcript;
pub mod worker;

pub use config::ConversationConfig;
pub use error::{ConversationError, Result};
pub use pipeline::coordinator::Conversation;
