//! Inference backend abstraction.
//!
//! The neural computation itself lives behind three capability traits —
//! [`Recognizer`], [`VoiceActivity`], [`Punctuator`] — materialized by an
//! external [`BackendFactory`]. The engine never interprets model output
//! beyond [`RawResult`], a tagged variant that replaces the shape-varying
//! duck typing different runtimes exhibit: plain strings, `(text, aux)`
//! tuples, keyed records, or nested lists all normalize through
//! [`normalize_text`].

pub mod stub;

use std::path::PathBuf;

use crate::registry::ModelRole;

/// Structurally-variable backend output, captured losslessly at the trait
/// boundary and interpreted nowhere else.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    None,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<RawResult>),
    Map(Vec<(String, RawResult)>),
}

impl RawResult {
    pub fn pair(start_ms: f64, end_ms: f64) -> Self {
        Self::List(vec![Self::Number(start_ms), Self::Number(end_ms)])
    }

    fn get(&self, key: &str) -> Option<&RawResult> {
        match self {
            Self::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

impl From<&str> for RawResult {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Field names probed, in priority order, when a backend returns a keyed
/// structure.
const TEXT_KEYS: &[&str] = &["text", "preds", "pred", "sentence", "transcript"];

/// Collapses any [`RawResult`] into the recognized string.
///
/// Sequence handling mirrors the conventions real backends use: a list
/// whose head is a string and whose tail is not all strings is a
/// `(text, auxiliaryData)` pair and yields the head trimmed; any other
/// list concatenates the normalized form of its elements.
pub fn normalize_text(value: &RawResult) -> String {
    match value {
        RawResult::None => String::new(),
        RawResult::Bool(b) => b.to_string(),
        RawResult::Number(n) => format_number(*n),
        RawResult::Text(text) => text.clone(),
        RawResult::List(items) => {
            if items.len() >= 2 {
                if let RawResult::Text(first) = &items[0] {
                    let tail_has_non_text = items[1..]
                        .iter()
                        .any(|item| !matches!(item, RawResult::Text(_)));
                    if tail_has_non_text {
                        let trimmed = first.trim();
                        if !trimmed.is_empty() {
                            return trimmed.to_string();
                        }
                    }
                }
            }
            items
                .iter()
                .map(normalize_text)
                .filter(|part| !part.is_empty())
                .collect()
        }
        RawResult::Map(_) => {
            for key in TEXT_KEYS {
                if let Some(inner) = value.get(key) {
                    let normalized = normalize_text(inner);
                    if !normalized.is_empty() {
                        return normalized;
                    }
                }
            }
            String::new()
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Closed set of supported backend implementations, resolved once at
/// `init` time. Invalid names are rejected there instead of being
/// re-checked on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    OnnxContextual,
    OnnxParaformer,
    OnnxVad,
    OnnxPunc,
    TorchPunc,
}

impl BackendKind {
    /// Parses a backend name for the given role; `None` for names the
    /// role does not support.
    pub fn parse(role: ModelRole, name: &str) -> Option<Self> {
        let kind = match name {
            "funasr_onnx_contextual" => Self::OnnxContextual,
            "funasr_onnx_paraformer" => Self::OnnxParaformer,
            "funasr_onnx_vad" => Self::OnnxVad,
            "funasr_onnx_punc" => Self::OnnxPunc,
            "funasr_torch_punc" => Self::TorchPunc,
            _ => return None,
        };
        let allowed = match role {
            ModelRole::Asr => matches!(kind, Self::OnnxContextual | Self::OnnxParaformer),
            ModelRole::Vad => matches!(kind, Self::OnnxVad),
            ModelRole::Punc => matches!(kind, Self::OnnxPunc | Self::TorchPunc),
        };
        allowed.then_some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnnxContextual => "funasr_onnx_contextual",
            Self::OnnxParaformer => "funasr_onnx_paraformer",
            Self::OnnxVad => "funasr_onnx_vad",
            Self::OnnxPunc => "funasr_onnx_punc",
            Self::TorchPunc => "funasr_torch_punc",
        }
    }

    /// Whether this backend consumes a normalized hotword string.
    pub fn wants_hotwords(&self) -> bool {
        matches!(self, Self::OnnxContextual)
    }
}

/// Everything a factory needs to materialize one model handle.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub model_name: String,
    pub model_dir: PathBuf,
    pub backend: BackendKind,
    pub quantize: bool,
}

/// Speech-to-text capability. `&mut self` because decoders are stateful
/// (caches, hidden states); the single-threaded command loop is the only
/// caller.
pub trait Recognizer: Send {
    fn recognize(&mut self, waveform: &[f32], hotwords: &str) -> anyhow::Result<RawResult>;
}

/// Voice-activity capability: speech-present time ranges for a waveform.
pub trait VoiceActivity: Send {
    fn detect(&mut self, waveform: &[f32]) -> anyhow::Result<RawResult>;
}

/// Punctuation-restoration capability.
pub trait Punctuator: Send {
    fn restore(&mut self, text: &str) -> anyhow::Result<RawResult>;
}

/// Materializes model handles from locally-cached artifacts. Supplied by
/// the embedding application; the engine only orchestrates.
pub trait BackendFactory: Send {
    fn create_recognizer(&self, spec: &ModelSpec) -> anyhow::Result<Box<dyn Recognizer>>;
    fn create_voice_activity(&self, spec: &ModelSpec) -> anyhow::Result<Box<dyn VoiceActivity>>;
    fn create_punctuator(&self, spec: &ModelSpec) -> anyhow::Result<Box<dyn Punctuator>>;
}
