use serde_json::{json, Value};
use thiserror::Error;

use crate::registry::ModelRole;

/// All errors produced by verba-core.
///
/// Every variant maps onto exactly one wire error code (`code()`) and one
/// pipeline phase (`phase()`), so the dispatcher can turn any failure into
/// a protocol error envelope without inspecting the variant itself.
#[derive(Debug, Error)]
pub enum VerbaError {
    #[error("request line is not valid JSON")]
    Parse(#[source] serde_json::Error),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("recognizer is not initialized")]
    NotInitialized,

    #[error("model download failed: {model}")]
    Download {
        model: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{role} model failed to initialize: {model}")]
    ModelInit {
        role: ModelRole,
        model: String,
        backend: String,
        quantize: bool,
        #[source]
        source: anyhow::Error,
    },

    #[error("audio payload could not be decoded: {0}")]
    AudioDecode(String),

    #[error("voice-activity inference failed")]
    VadInference(#[source] anyhow::Error),

    #[error("speech recognition inference failed")]
    AsrInference(#[source] anyhow::Error),

    #[error("punctuation restoration failed")]
    PuncInference(#[source] anyhow::Error),

    #[error("malformed {cmd} request")]
    BadRequest {
        cmd: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VerbaError>;

impl VerbaError {
    /// Machine-readable error code for the wire envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "PARSE_ERROR",
            Self::UnknownCommand(_) => "UNKNOWN_COMMAND",
            Self::NotInitialized => "RECOGNIZER_NOT_INITIALIZED",
            Self::Download { .. } => "MODEL_DOWNLOAD_FAILED",
            Self::ModelInit { role, .. } => match role {
                ModelRole::Asr => "ASR_MODEL_INIT_FAILED",
                ModelRole::Vad => "VAD_MODEL_INIT_FAILED",
                ModelRole::Punc => "PUNC_MODEL_INIT_FAILED",
            },
            Self::AudioDecode(_) => "AUDIO_DECODE_FAILED",
            Self::VadInference(_) => "VAD_INFER_FAILED",
            Self::AsrInference(_) => "ASR_INFER_FAILED",
            Self::PuncInference(_) => "PUNC_INFER_FAILED",
            Self::BadRequest { .. } | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Pipeline stage the failure belongs to.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::UnknownCommand(_) => "router",
            Self::NotInitialized => "recognize/precheck",
            Self::Download { .. } => "init/download",
            Self::ModelInit { role, .. } => match role {
                ModelRole::Asr => "init/asr",
                ModelRole::Vad => "init/vad",
                ModelRole::Punc => "init/punc",
            },
            Self::AudioDecode(_) => "recognize/decode",
            Self::VadInference(_) => "recognize/vad",
            Self::AsrInference(_) => "recognize/asr",
            Self::PuncInference(_) => "recognize/punc",
            Self::BadRequest { .. } | Self::Internal(_) => "dispatch",
        }
    }

    /// Structured context attached to the envelope, if the variant carries any.
    pub fn data(&self) -> Option<Value> {
        match self {
            Self::ModelInit {
                model,
                backend,
                quantize,
                ..
            } => Some(json!({
                "modelName": model,
                "backend": backend,
                "quantize": quantize,
            })),
            _ => None,
        }
    }

    /// Renders the full cause chain for the `details` field.
    pub fn details(&self) -> String {
        let mut out = String::new();
        let mut current: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(self);
        while let Some(err) = current {
            if !out.is_empty() {
                out.push_str("\ncaused by: ");
            }
            out.push_str(&err.to_string());
            current = err.source();
        }
        out
    }
}
