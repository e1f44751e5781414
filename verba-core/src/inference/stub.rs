//! Stub backends — deterministic placeholders with no neural runtime.
//!
//! They let the full protocol surface be exercised end-to-end (tests,
//! development builds) before a real inference integration is wired in.

use tracing::debug;

use crate::inference::{
    BackendFactory, ModelSpec, Punctuator, RawResult, Recognizer, VoiceActivity,
};

/// Echo-style recognizer: reports what it was given instead of decoding it.
pub struct StubRecognizer;

impl Recognizer for StubRecognizer {
    fn recognize(&mut self, waveform: &[f32], hotwords: &str) -> anyhow::Result<RawResult> {
        debug!(
            samples = waveform.len(),
            hotwords = %hotwords,
            "StubRecognizer::recognize"
        );
        Ok(RawResult::Text(format!("[stub: {} samples]", waveform.len())))
    }
}

/// Reports no boundary pairs, so the whole waveform is recognized as one
/// segment.
pub struct StubVoiceActivity;

impl VoiceActivity for StubVoiceActivity {
    fn detect(&mut self, _waveform: &[f32]) -> anyhow::Result<RawResult> {
        Ok(RawResult::None)
    }
}

/// Passes text through unpunctuated.
pub struct StubPunctuator;

impl Punctuator for StubPunctuator {
    fn restore(&mut self, text: &str) -> anyhow::Result<RawResult> {
        Ok(RawResult::Text(text.to_string()))
    }
}

/// Factory producing the stubs above for every role.
pub struct StubFactory;

impl BackendFactory for StubFactory {
    fn create_recognizer(&self, spec: &ModelSpec) -> anyhow::Result<Box<dyn Recognizer>> {
        debug!(model = %spec.model_name, backend = spec.backend.as_str(), "stub recognizer");
        Ok(Box::new(StubRecognizer))
    }

    fn create_voice_activity(&self, spec: &ModelSpec) -> anyhow::Result<Box<dyn VoiceActivity>> {
        debug!(model = %spec.model_name, backend = spec.backend.as_str(), "stub voice activity");
        Ok(Box::new(StubVoiceActivity))
    }

    fn create_punctuator(&self, spec: &ModelSpec) -> anyhow::Result<Box<dyn Punctuator>> {
        debug!(model = %spec.model_name, backend = spec.backend.as_str(), "stub punctuator");
        Ok(Box::new(StubPunctuator))
    }
}
