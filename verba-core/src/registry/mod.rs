//! Model dependency resolution and cache inspection.
//!
//! Maps a requested `(modelName, backend, quantize)` triple to a canonical
//! on-disk identity and decides readiness without touching the network.
//! Fetching is the [`fetch::ModelFetcher`] collaborator's job; everything
//! here is a deterministic, side-effect-free read of the local cache.

pub mod fetch;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::protocol::messages::ModelSelection;

/// Backend family whose artifacts are validated file-by-file. Other
/// backends are considered complete once any cached directory exists — the
/// backend itself is trusted to validate further at load time.
pub const ARTIFACT_CHECKED_FAMILY: &str = "funasr_onnx";

/// The contextual ASR backend additionally requires a bias-encoder model.
pub const CONTEXTUAL_BACKEND: &str = "funasr_onnx_contextual";

/// Short human aliases → canonical registry identifiers. Unknown names pass
/// through unchanged.
const MODEL_ALIASES: &[(&str, &str)] = &[
    (
        "paraformer-zh",
        "iic/speech_paraformer-large-vad-punc_asr_nat-zh-cn-16k-common-vocab8404-pytorch",
    ),
    (
        "ct-punc",
        "iic/punc_ct-transformer_zh-cn-common-vocab272727-pytorch",
    ),
];

/// Pipeline role a model dependency fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelRole {
    Asr,
    Vad,
    Punc,
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asr => f.write_str("ASR"),
            Self::Vad => f.write_str("VAD"),
            Self::Punc => f.write_str("PUNC"),
        }
    }
}

/// One model the requested configuration depends on. Built fresh per
/// `init`/`check` request, never retained.
#[derive(Debug, Clone)]
pub struct DependencyDescriptor {
    pub role: ModelRole,
    pub model_name: String,
    pub backend: String,
    pub quantize: bool,
}

/// Readiness report for one dependency.
///
/// `cached` means some local directory exists for the resolved identity;
/// `complete` means all backend-required artifacts are present
/// (`complete` implies `cached`). `issue` is non-empty iff `complete` is
/// false.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyStatus {
    pub role: ModelRole,
    pub model_name: String,
    pub backend: String,
    pub quantize: bool,
    pub cached: bool,
    pub complete: bool,
    pub missing_files: Vec<String>,
    pub issue: String,
}

/// Expands a [`ModelSelection`] into its dependency list: ASR always, VAD
/// and PUNC only when a model name was supplied (PUNC is suppressed
/// entirely when `usePunc` is false).
pub fn build_dependencies(selection: &ModelSelection) -> Vec<DependencyDescriptor> {
    let mut deps = vec![DependencyDescriptor {
        role: ModelRole::Asr,
        model_name: selection.model_name.clone(),
        backend: selection.backend.clone(),
        quantize: selection.quantize,
    }];

    if !selection.vad_model_name.is_empty() {
        deps.push(DependencyDescriptor {
            role: ModelRole::Vad,
            model_name: selection.vad_model_name.clone(),
            backend: selection.vad_backend.clone(),
            quantize: selection.vad_quantize,
        });
    }

    if selection.use_punc && !selection.punc_model_name.is_empty() {
        deps.push(DependencyDescriptor {
            role: ModelRole::Punc,
            model_name: selection.punc_model_name.clone(),
            backend: selection.punc_backend.clone(),
            quantize: false,
        });
    }

    deps
}

/// Artifact filenames that must exist for an artifact-checked backend.
///
/// Quantized variants need a quantized primary model. The contextual
/// backend's quantized bias encoder is an either/or: `model_eb_quant.onnx`
/// or the plain `model_eb.onnx` both satisfy it, reported as one
/// `a|b` entry when neither exists.
pub fn missing_artifacts(model_dir: &Path, backend: &str, quantize: bool) -> Vec<String> {
    let mut missing = Vec::new();

    let primary = if quantize { "model_quant.onnx" } else { "model.onnx" };
    if !model_dir.join(primary).exists() {
        missing.push(primary.to_string());
    }

    if backend == CONTEXTUAL_BACKEND {
        if quantize {
            let has_quant_eb = model_dir.join("model_eb_quant.onnx").exists();
            let has_plain_eb = model_dir.join("model_eb.onnx").exists();
            if !(has_quant_eb || has_plain_eb) {
                missing.push("model_eb_quant.onnx|model_eb.onnx".to_string());
            }
        } else if !model_dir.join("model_eb.onnx").exists() {
            missing.push("model_eb.onnx".to_string());
        }
    }

    missing
}

/// Read-only view over the local model cache.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    cache_root: PathBuf,
}

impl ModelRegistry {
    /// Registry over the platform cache (`~/.cache/modelscope/hub/models`).
    pub fn new() -> Self {
        let base = dirs_next::cache_dir()
            .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        Self::with_root(base.join("modelscope").join("hub").join("models"))
    }

    /// Registry over an explicit cache root (tests, relocated installs).
    pub fn with_root(cache_root: PathBuf) -> Self {
        Self { cache_root }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Resolves a short alias to its canonical registry identifier.
    pub fn resolve_identity(&self, model_name: &str) -> String {
        MODEL_ALIASES
            .iter()
            .find(|(alias, _)| *alias == model_name)
            .map(|(_, canonical)| canonical.to_string())
            .unwrap_or_else(|| model_name.to_string())
    }

    /// Deterministic cache path for an identity, mirroring its `/` segments.
    pub fn cache_path(&self, identity: &str) -> PathBuf {
        identity
            .split('/')
            .fold(self.cache_root.clone(), |path, seg| path.join(seg))
    }

    /// A dependency counts as cached when its directory exists and holds at
    /// least one file anywhere in its subtree.
    pub fn is_cached(&self, identity: &str) -> bool {
        let path = self.cache_path(identity);
        path.is_dir() && dir_has_any_file(&path)
    }

    /// Finds the cache directory for a model name, preferring the resolved
    /// identity but accepting a directory keyed by the raw name (older
    /// installs predating the alias table).
    pub fn locate(&self, model_name: &str) -> Option<PathBuf> {
        let resolved = self.resolve_identity(model_name);
        let mut candidates = vec![resolved.clone()];
        if resolved != model_name {
            candidates.push(model_name.to_string());
        }
        candidates
            .iter()
            .map(|candidate| self.cache_path(candidate))
            .find(|path| path.is_dir())
    }

    /// Cache directory for the backend factory; falls back to the raw name
    /// as a relative path so the backend's own error surfaces the problem.
    pub fn resolve_model_dir(&self, model_name: &str) -> PathBuf {
        self.locate(model_name)
            .unwrap_or_else(|| PathBuf::from(model_name))
    }

    /// Combines cache presence and artifact validation into one status.
    pub fn inspect(&self, dep: &DependencyDescriptor) -> DependencyStatus {
        let existing_dir = self.locate(&dep.model_name);
        let cached = existing_dir.is_some();

        let mut missing_files = Vec::new();
        let mut complete = false;
        let mut issue = String::new();

        match existing_dir {
            None => issue = "not downloaded".to_string(),
            Some(dir) => {
                if dep.backend.starts_with(ARTIFACT_CHECKED_FAMILY) {
                    missing_files = missing_artifacts(&dir, &dep.backend, dep.quantize);
                    if missing_files.is_empty() {
                        complete = true;
                    } else {
                        issue = format!("missing files: {}", missing_files.join(", "));
                    }
                } else {
                    complete = true;
                }
            }
        }

        debug!(
            role = %dep.role,
            model = %dep.model_name,
            cached,
            complete,
            "inspected dependency"
        );

        DependencyStatus {
            role: dep.role,
            model_name: dep.model_name.clone(),
            backend: dep.backend.clone(),
            quantize: dep.quantize,
            cached,
            complete,
            missing_files,
            issue,
        }
    }

    pub fn is_ready(&self, dep: &DependencyDescriptor) -> bool {
        self.inspect(dep).complete
    }

    pub fn all_complete(&self, deps: &[DependencyDescriptor]) -> bool {
        deps.iter().all(|dep| self.is_ready(dep))
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn dir_has_any_file(dir: &Path) -> bool {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    for entry in entries.flatten() {
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => {
                if dir_has_any_file(&entry.path()) {
                    return true;
                }
            }
            Ok(_) => return true,
            Err(_) => continue,
        }
    }
    false
}
