//! Command loop and request dispatch.
//!
//! One request line in, one terminal response line out (plus any progress
//! lines in between), in request order. The loop never dies on a bad
//! request: malformed JSON, unknown commands, backend failures, and even
//! panics inside a handler all turn into failure responses, and the next
//! line is read as usual.

use std::io::BufRead;
use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::anyhow;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::audio::decode_waveform;
use crate::audio::segment::{merge_for_recognition, segment_spans, SegmentSpan};
use crate::error::{Result, VerbaError};
use crate::inference::normalize_text;
use crate::lifecycle::ModelLifecycle;
use crate::protocol::channel::{ProgressSink, ResponseChannel};
use crate::protocol::messages::{
    AckResponse, CheckResponse, FailureResponse, InitRequest, InitResponse, ModelSelection,
    ReadyBanner, RecognizeRequest, RecognizeResponse, RequestId, SuccessResponse,
};
use crate::registry::build_dependencies;

/// Longest slice of an unparseable line echoed back for diagnosis.
const LINE_PREVIEW_CHARS: usize = 200;

/// The long-lived engine: a lifecycle manager plus the outbound channel.
pub struct Sidecar {
    lifecycle: ModelLifecycle,
    channel: ResponseChannel,
}

impl Sidecar {
    pub fn new(lifecycle: ModelLifecycle, channel: ResponseChannel) -> Self {
        Self { lifecycle, channel }
    }

    /// Announces readiness, then serves requests until the reader is
    /// exhausted (host closed stdin).
    pub fn run<R: BufRead>(&mut self, reader: R) {
        self.channel.send(&ReadyBanner { ready: true });

        for line in reader.lines() {
            match line {
                Ok(line) => self.handle_line(&line),
                Err(err) => {
                    warn!(error = %err, "request stream read failed");
                    break;
                }
            }
        }

        info!("request stream closed, shutting down");
    }

    /// Processes one request line. Blank lines are ignored; everything
    /// else produces exactly one terminal response.
    pub fn handle_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let payload: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                // No id is recoverable from an unparseable line; 0 is the
                // documented sentinel.
                let mut failure = FailureResponse::new(0.into(), &VerbaError::Parse(err));
                failure.error.data = Some(json!({ "linePreview": preview(line) }));
                self.channel.send(&failure);
                return;
            }
        };

        // Echoed back verbatim, whatever JSON shape the caller chose.
        let id: RequestId = payload.get("id").cloned().unwrap_or_else(|| 0.into());
        let cmd = payload
            .get("cmd")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let outcome =
            catch_unwind(AssertUnwindSafe(|| self.dispatch(id.clone(), &cmd, payload)));
        match outcome {
            Ok(Ok(response)) => self.channel.send(&response),
            Ok(Err(err)) => self.channel.send(&FailureResponse::new(id, &err)),
            Err(panic) => {
                let err = VerbaError::Internal(anyhow!(
                    "handler for '{cmd}' panicked: {}",
                    panic_message(panic)
                ));
                self.channel.send(&FailureResponse::new(id, &err));
            }
        }
    }

    fn dispatch(&mut self, id: RequestId, cmd: &str, payload: Value) -> Result<SuccessResponse> {
        match cmd {
            "ping" => Ok(SuccessResponse::Ack(AckResponse::new(id))),
            "dispose" => {
                self.lifecycle.dispose();
                Ok(SuccessResponse::Ack(AckResponse::new(id)))
            }
            "init" => self.handle_init(id, payload),
            "check" => self.handle_check(id, payload),
            "recognize" => self.handle_recognize(id, payload),
            other => Err(VerbaError::UnknownCommand(other.to_string())),
        }
    }

    fn handle_init(&mut self, id: RequestId, payload: Value) -> Result<SuccessResponse> {
        let req: InitRequest = serde_json::from_value(payload)
            .map_err(|source| VerbaError::BadRequest { cmd: "init", source })?;

        let progress = ProgressSink::new(&self.channel, id.clone());
        let hotword_stats = self.lifecycle.init(&req, &progress)?;

        Ok(SuccessResponse::Init(InitResponse {
            id,
            ok: true,
            hotword_stats,
        }))
    }

    /// Pure cache inspection — never initializes, downloads, or mutates.
    fn handle_check(&mut self, id: RequestId, payload: Value) -> Result<SuccessResponse> {
        let selection: ModelSelection = serde_json::from_value(payload)
            .map_err(|source| VerbaError::BadRequest { cmd: "check", source })?;

        let deps = build_dependencies(&selection);
        let dependencies: Vec<_> = deps
            .iter()
            .map(|dep| self.lifecycle.registry().inspect(dep))
            .collect();

        let downloaded = dependencies.iter().all(|status| status.complete);
        // The primary ASR entry is always first.
        let incomplete = !downloaded && dependencies.first().is_some_and(|s| s.cached);

        Ok(SuccessResponse::Check(CheckResponse {
            id,
            ok: true,
            downloaded,
            incomplete,
            dependencies,
        }))
    }

    fn handle_recognize(&mut self, id: RequestId, payload: Value) -> Result<SuccessResponse> {
        if self.lifecycle.session_mut().is_none() {
            return Err(VerbaError::NotInitialized);
        }

        let req: RecognizeRequest = serde_json::from_value(payload)
            .map_err(|source| VerbaError::BadRequest { cmd: "recognize", source })?;
        let bytes = BASE64
            .decode(req.wav_base64.as_bytes())
            .map_err(|err| VerbaError::AudioDecode(err.to_string()))?;

        let waveform = decode_waveform(&bytes);
        if waveform.is_empty() {
            // Silence-only payload: succeed without touching any backend.
            return Ok(SuccessResponse::Recognize(RecognizeResponse {
                id,
                ok: true,
                text: String::new(),
                raw_text: String::new(),
                segment_count: 0,
                asr_passes: 0,
            }));
        }

        let session = match self.lifecycle.session_mut() {
            Some(session) => session,
            None => return Err(VerbaError::NotInitialized),
        };

        let spans = match session.voice_activity.as_mut() {
            None => vec![SegmentSpan {
                start: 0,
                end: waveform.len(),
            }],
            Some(vad) => match vad.detect(&waveform) {
                Ok(result) => segment_spans(&result, waveform.len()),
                Err(source) => {
                    // Segmentation is an optimization; a broken VAD must not
                    // fail the request. Recognize the whole waveform instead.
                    let err = VerbaError::VadInference(source);
                    warn!(
                        code = err.code(),
                        error = %err,
                        "voice activity failed, recognizing unsegmented"
                    );
                    vec![SegmentSpan {
                        start: 0,
                        end: waveform.len(),
                    }]
                }
            },
        };
        let segment_count = spans.len();
        let merged = merge_for_recognition(&spans, &waveform);

        let raw = session
            .recognizer
            .recognize(&merged, &session.hotwords)
            .map_err(VerbaError::AsrInference)?;
        let raw_text = normalize_text(&raw).trim().to_string();

        let text = if raw_text.is_empty() {
            raw_text.clone()
        } else {
            match session.punctuator.as_mut() {
                None => raw_text.clone(),
                Some(punc) => {
                    let restored = punc.restore(&raw_text).map_err(VerbaError::PuncInference)?;
                    let punctuated = normalize_text(&restored).trim().to_string();
                    if punctuated.is_empty() {
                        raw_text.clone()
                    } else {
                        punctuated
                    }
                }
            }
        };

        Ok(SuccessResponse::Recognize(RecognizeResponse {
            id,
            ok: true,
            text,
            raw_text,
            segment_count,
            asr_passes: 1,
        }))
    }
}

fn preview(line: &str) -> String {
    line.chars().take(LINE_PREVIEW_CHARS).collect()
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
