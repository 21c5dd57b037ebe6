//! # Transcription
//!
//! Bridges presenter audio to the cloud recognition+translation service:
//! one streaming channel per session, audio frames in, translated-result
//! events out.

pub mod bridge;

pub use bridge::{SessionEventSender, TranscriptionBridge, TranslationEvent};
