//! Request and response envelopes.
//!
//! ## Inbound
//!
//! `{"id": 3, "cmd": "init", "modelName": "...", ...}` — the dispatcher
//! extracts `id`/`cmd` itself (so a malformed body still yields a correlated
//! error) and then deserializes the command-specific payload from the same
//! value.
//!
//! ## Outbound
//!
//! | message | shape |
//! |---------|-------|
//! | ready banner | `{"ready": true}` (exactly once, at startup) |
//! | progress | `{"id", "progress": 0–100, "status"?}` |
//! | success | `{"id", "ok": true, ...}` |
//! | failure | `{"id", "ok": false, "error": {...}}` |

use serde::{Deserialize, Serialize};

use crate::error::VerbaError;
use crate::hotwords::HotwordStats;
use crate::registry::DependencyStatus;

/// Caller-chosen correlation id, echoed back verbatim in every response.
/// Integers by convention, but any JSON value a parseable line carries is
/// preserved as-is; `0` stands in when no id could be recovered.
pub type RequestId = serde_json::Value;

/// Default ASR backend when the host omits `backend`.
pub const DEFAULT_ASR_BACKEND: &str = "funasr_onnx_contextual";
/// Default VAD backend when the host omits `vadBackend`.
pub const DEFAULT_VAD_BACKEND: &str = "funasr_onnx_vad";
/// Default PUNC backend when the host omits `puncBackend`.
pub const DEFAULT_PUNC_BACKEND: &str = "funasr_onnx_punc";

fn default_asr_backend() -> String {
    DEFAULT_ASR_BACKEND.to_string()
}

fn default_vad_backend() -> String {
    DEFAULT_VAD_BACKEND.to_string()
}

fn default_punc_backend() -> String {
    DEFAULT_PUNC_BACKEND.to_string()
}

fn default_true() -> bool {
    true
}

/// Model triple requested by `init` and `check`.
///
/// One ASR model is always named; VAD and PUNC participate only when their
/// model name is non-empty.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSelection {
    pub model_name: String,
    #[serde(default = "default_asr_backend")]
    pub backend: String,
    #[serde(default)]
    pub quantize: bool,
    #[serde(default)]
    pub vad_model_name: String,
    #[serde(default = "default_vad_backend")]
    pub vad_backend: String,
    #[serde(default = "default_true")]
    pub vad_quantize: bool,
    #[serde(default = "default_true")]
    pub use_punc: bool,
    #[serde(default)]
    pub punc_model_name: String,
    #[serde(default = "default_punc_backend")]
    pub punc_backend: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    #[serde(flatten)]
    pub models: ModelSelection,
    #[serde(default)]
    pub hotwords: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognizeRequest {
    /// Base64-encoded raw audio container (44-byte header + 16 kHz mono
    /// s16le PCM).
    pub wav_base64: String,
}

// ---------------------------------------------------------------------------
// Outbound messages
// ---------------------------------------------------------------------------

/// Emitted exactly once before the first request is read.
#[derive(Debug, Clone, Serialize)]
pub struct ReadyBanner {
    pub ready: bool,
}

/// Zero or more per request, always before the terminal response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub id: RequestId,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Wire form of a failure; see [`VerbaError`] for the taxonomy.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub phase: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ErrorEnvelope {
    pub fn from_error(err: &VerbaError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            phase: err.phase().to_string(),
            details: err.details(),
            data: err.data(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureResponse {
    pub id: RequestId,
    pub ok: bool,
    pub error: ErrorEnvelope,
}

impl FailureResponse {
    pub fn new(id: RequestId, err: &VerbaError) -> Self {
        Self {
            id,
            ok: false,
            error: ErrorEnvelope::from_error(err),
        }
    }
}

/// Terminal success payloads, one variant per command family.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SuccessResponse {
    Ack(AckResponse),
    Init(InitResponse),
    Recognize(RecognizeResponse),
    Check(CheckResponse),
}

/// `ping` / `dispose` terminal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    pub id: RequestId,
    pub ok: bool,
}

impl AckResponse {
    pub fn new(id: RequestId) -> Self {
        Self { id, ok: true }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub id: RequestId,
    pub ok: bool,
    pub hotword_stats: HotwordStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognizeResponse {
    pub id: RequestId,
    pub ok: bool,
    /// Punctuated text (equal to `raw_text` when PUNC is disabled).
    pub text: String,
    pub raw_text: String,
    pub segment_count: usize,
    pub asr_passes: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub id: RequestId,
    pub ok: bool,
    /// Every dependency is cached and artifact-complete.
    pub downloaded: bool,
    /// The primary ASR cache directory exists but the set is not ready —
    /// distinguishes a broken/partial install from "nothing downloaded yet".
    pub incomplete: bool,
    pub dependencies: Vec<DependencyStatus>,
}
