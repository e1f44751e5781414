//! Model lifecycle: dependency download, backend loading, session state.
//!
//! `init` is atomic — the three model handles are built into locals and
//! committed to the session together, so a failure partway through can
//! never leave a half-initialized pipeline behind. After a failed `init`
//! the engine behaves exactly as if `init` had never been called.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use tempfile::TempDir;
use tracing::{info, warn};

use crate::error::{Result, VerbaError};
use crate::hotwords::{inspect_hotwords, normalize_hotwords, HotwordStats};
use crate::inference::{
    BackendFactory, BackendKind, ModelSpec, Punctuator, Recognizer, VoiceActivity,
};
use crate::protocol::channel::ProgressSink;
use crate::protocol::messages::InitRequest;
use crate::registry::fetch::ModelFetcher;
use crate::registry::{build_dependencies, DependencyDescriptor, ModelRegistry, ModelRole};

/// Support files mirrored into a staged model directory.
const STAGED_SUPPORT_FILES: &[&str] = &["config.yaml", "am.mvn", "tokens.json", "configuration.json"];

/// Where the engine currently stands in its model lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Uninitialized,
    Downloading,
    LoadingAsr,
    LoadingVad,
    LoadingPunc,
    Ready,
    Failed,
}

/// The loaded model handles for one initialized session.
pub struct SessionModels {
    pub recognizer: Box<dyn Recognizer>,
    pub voice_activity: Option<Box<dyn VoiceActivity>>,
    pub punctuator: Option<Box<dyn Punctuator>>,
    pub backend: BackendKind,
    /// Normalized hotword string for hotword-aware backends, empty otherwise.
    pub hotwords: String,
}

/// Filesystem scratch owned by the current session. Dropping it removes
/// any staged model directories.
#[derive(Default)]
struct SessionScratch {
    staged_dirs: Vec<TempDir>,
}

/// Owns the registry, the fetcher, the backend factory, and the current
/// session. Single-threaded by design: the command loop is the only caller.
pub struct ModelLifecycle {
    registry: ModelRegistry,
    fetcher: Box<dyn ModelFetcher>,
    factory: Box<dyn BackendFactory>,
    phase: LifecyclePhase,
    session: Option<SessionModels>,
    scratch: SessionScratch,
}

impl ModelLifecycle {
    pub fn new(
        registry: ModelRegistry,
        fetcher: Box<dyn ModelFetcher>,
        factory: Box<dyn BackendFactory>,
    ) -> Self {
        Self {
            registry,
            fetcher,
            factory,
            phase: LifecyclePhase::Uninitialized,
            session: None,
            scratch: SessionScratch::default(),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn session_mut(&mut self) -> Option<&mut SessionModels> {
        self.session.as_mut()
    }

    /// Releases the session. Safe to call in any phase, any number of times.
    pub fn dispose(&mut self) {
        if self.session.take().is_some() {
            info!("session disposed");
        }
        self.scratch = SessionScratch::default();
        self.phase = LifecyclePhase::Uninitialized;
    }

    /// Downloads missing dependencies, loads the requested backends, and
    /// commits the new session. Replaces any existing session; on error the
    /// engine is left uninitialized with `phase() == Failed`.
    pub fn init(&mut self, req: &InitRequest, progress: &ProgressSink<'_>) -> Result<HotwordStats> {
        self.session = None;
        self.scratch = SessionScratch::default();

        match self.init_inner(req, progress) {
            Ok((session, scratch, stats)) => {
                self.session = Some(session);
                self.scratch = scratch;
                self.phase = LifecyclePhase::Ready;
                info!(backend = stats.backend.as_str(), "session ready");
                Ok(stats)
            }
            Err(err) => {
                self.phase = LifecyclePhase::Failed;
                Err(err)
            }
        }
    }

    fn init_inner(
        &mut self,
        req: &InitRequest,
        progress: &ProgressSink<'_>,
    ) -> Result<(SessionModels, SessionScratch, HotwordStats)> {
        let models = &req.models;

        // Resolve every backend name up front so a typo fails before any
        // download starts.
        let asr_kind = parse_backend(
            ModelRole::Asr,
            &models.model_name,
            &models.backend,
            models.quantize,
        )?;
        let vad_kind = if models.vad_model_name.is_empty() {
            None
        } else {
            Some(parse_backend(
                ModelRole::Vad,
                &models.vad_model_name,
                &models.vad_backend,
                models.vad_quantize,
            )?)
        };
        let punc_kind = if models.use_punc && !models.punc_model_name.is_empty() {
            Some(parse_backend(
                ModelRole::Punc,
                &models.punc_model_name,
                &models.punc_backend,
                false,
            )?)
        } else {
            None
        };

        self.phase = LifecyclePhase::Downloading;
        let deps = build_dependencies(models);
        self.ensure_downloaded(&deps, progress)?;

        let mut scratch = SessionScratch::default();

        self.phase = LifecyclePhase::LoadingAsr;
        progress.report(92, Some("loading speech model"));
        let (asr_dir, asr_quantize) = self
            .stage_asr_dir(&models.model_name, asr_kind, models.quantize, &mut scratch)
            .map_err(|source| model_init_error(&deps[0], source))?;
        let asr_spec = ModelSpec {
            model_name: models.model_name.clone(),
            model_dir: asr_dir,
            backend: asr_kind,
            quantize: asr_quantize,
        };
        let recognizer = self
            .factory
            .create_recognizer(&asr_spec)
            .map_err(|source| model_init_error(&deps[0], source))?;

        self.phase = LifecyclePhase::LoadingVad;
        progress.report(96, Some("loading voice-activity model"));
        let voice_activity = match vad_kind {
            None => None,
            Some(kind) => {
                let spec = ModelSpec {
                    model_name: models.vad_model_name.clone(),
                    model_dir: self.registry.resolve_model_dir(&models.vad_model_name),
                    backend: kind,
                    quantize: models.vad_quantize,
                };
                let handle = self.factory.create_voice_activity(&spec).map_err(|source| {
                    VerbaError::ModelInit {
                        role: ModelRole::Vad,
                        model: models.vad_model_name.clone(),
                        backend: models.vad_backend.clone(),
                        quantize: models.vad_quantize,
                        source,
                    }
                })?;
                Some(handle)
            }
        };

        self.phase = LifecyclePhase::LoadingPunc;
        let punctuator = match punc_kind {
            None => {
                progress.report(98, Some("punctuation disabled"));
                None
            }
            Some(kind) => {
                progress.report(98, Some("loading punctuation model"));
                let spec = ModelSpec {
                    model_name: models.punc_model_name.clone(),
                    model_dir: self.registry.resolve_model_dir(&models.punc_model_name),
                    backend: kind,
                    quantize: false,
                };
                let handle = self.factory.create_punctuator(&spec).map_err(|source| {
                    VerbaError::ModelInit {
                        role: ModelRole::Punc,
                        model: models.punc_model_name.clone(),
                        backend: models.punc_backend.clone(),
                        quantize: false,
                        source,
                    }
                })?;
                Some(handle)
            }
        };

        let stats = inspect_hotwords(asr_kind, &req.hotwords);
        let hotwords = if asr_kind.wants_hotwords() {
            normalize_hotwords(&req.hotwords)
        } else {
            String::new()
        };

        let session = SessionModels {
            recognizer,
            voice_activity,
            punctuator,
            backend: asr_kind,
            hotwords,
        };
        Ok((session, scratch, stats))
    }

    /// Fetches every dependency that is not already complete. Progress
    /// advances through the 5–90 band as dependencies finish, whether they
    /// were downloaded or found cached.
    fn ensure_downloaded(
        &self,
        deps: &[DependencyDescriptor],
        progress: &ProgressSink<'_>,
    ) -> Result<()> {
        if self.registry.all_complete(deps) {
            return Ok(());
        }

        progress.report(5, Some("checking model cache"));
        let total = deps.len().max(1) as u64;

        for (i, dep) in deps.iter().enumerate() {
            let before = (((i as u64) * 90 / total) as u8).max(5);
            let after = ((((i as u64) + 1) * 90 / total) as u8).max(5);

            if self.registry.is_ready(dep) {
                progress.report(after, None);
                continue;
            }

            let status = format!("downloading {}", dep.model_name);
            progress.report(before, Some(&status));

            let identity = self.registry.resolve_identity(&dep.model_name);
            let dest = self.registry.cache_path(&identity);
            self.fetcher
                .fetch(&identity, dep, &dest)
                .map_err(|source| VerbaError::Download {
                    model: dep.model_name.clone(),
                    source,
                })?;

            if !self.registry.is_ready(dep) {
                let inspected = self.registry.inspect(dep);
                return Err(VerbaError::Download {
                    model: dep.model_name.clone(),
                    source: anyhow!("artifacts incomplete after download: {}", inspected.issue),
                });
            }
            progress.report(after, None);
        }

        Ok(())
    }

    /// Resolves the ASR model directory, staging a compatibility view when
    /// a quantized contextual install carries only the plain bias encoder:
    /// the quantized primary and the plain encoder are exposed under the
    /// unquantized artifact names and the model loads unquantized.
    fn stage_asr_dir(
        &self,
        model_name: &str,
        kind: BackendKind,
        quantize: bool,
        scratch: &mut SessionScratch,
    ) -> anyhow::Result<(PathBuf, bool)> {
        let model_dir = self.registry.resolve_model_dir(model_name);

        if kind != BackendKind::OnnxContextual || !quantize {
            return Ok((model_dir, quantize));
        }
        if model_dir.join("model_eb_quant.onnx").exists() {
            return Ok((model_dir, true));
        }

        warn!(
            model = %model_name,
            "quantized bias encoder absent; staging unquantized-compatible view"
        );
        let staged = tempfile::tempdir().context("creating staging directory")?;
        link_or_copy(
            &model_dir.join("model_quant.onnx"),
            &staged.path().join("model.onnx"),
        )?;
        link_or_copy(
            &model_dir.join("model_eb.onnx"),
            &staged.path().join("model_eb.onnx"),
        )?;
        for name in STAGED_SUPPORT_FILES {
            let src = model_dir.join(name);
            if src.exists() {
                link_or_copy(&src, &staged.path().join(name))?;
            }
        }

        let dir = staged.path().to_path_buf();
        scratch.staged_dirs.push(staged);
        Ok((dir, false))
    }
}

fn parse_backend(
    role: ModelRole,
    model_name: &str,
    backend: &str,
    quantize: bool,
) -> Result<BackendKind> {
    BackendKind::parse(role, backend).ok_or_else(|| VerbaError::ModelInit {
        role,
        model: model_name.to_string(),
        backend: backend.to_string(),
        quantize,
        source: anyhow!("unsupported {role} backend: {backend}"),
    })
}

fn model_init_error(dep: &DependencyDescriptor, source: anyhow::Error) -> VerbaError {
    VerbaError::ModelInit {
        role: dep.role,
        model: dep.model_name.clone(),
        backend: dep.backend.clone(),
        quantize: dep.quantize,
        source,
    }
}

fn link_or_copy(src: &Path, dst: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        if std::os::unix::fs::symlink(src, dst).is_ok() {
            return Ok(());
        }
    }
    fs::copy(src, dst)
        .with_context(|| format!("copying {} into staged directory", src.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::StubFactory;
    use crate::inference::RawResult;
    use crate::protocol::channel::ResponseChannel;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::io::Write;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn progress_values(&self) -> Vec<u8> {
            String::from_utf8(self.0.lock().clone())
                .expect("utf8")
                .lines()
                .map(|line| serde_json::from_str::<serde_json::Value>(line).expect("json"))
                .filter_map(|v| v["progress"].as_u64())
                .map(|p| p as u8)
                .collect()
        }
    }

    /// Fetcher that fails the test if any download is attempted.
    struct NoFetch;

    impl ModelFetcher for NoFetch {
        fn fetch(
            &self,
            identity: &str,
            _dep: &DependencyDescriptor,
            _dest: &Path,
        ) -> anyhow::Result<()> {
            panic!("unexpected fetch of {identity}");
        }
    }

    /// Fetcher that materializes the artifacts a checked backend expects.
    struct FakeFetch;

    impl ModelFetcher for FakeFetch {
        fn fetch(
            &self,
            _identity: &str,
            dep: &DependencyDescriptor,
            dest: &Path,
        ) -> anyhow::Result<()> {
            fs::create_dir_all(dest)?;
            let primary = if dep.quantize { "model_quant.onnx" } else { "model.onnx" };
            fs::write(dest.join(primary), b"w")?;
            if dep.backend == crate::registry::CONTEXTUAL_BACKEND {
                fs::write(dest.join("model_eb.onnx"), b"w")?;
            }
            Ok(())
        }
    }

    struct FailFetch;

    impl ModelFetcher for FailFetch {
        fn fetch(
            &self,
            _identity: &str,
            _dep: &DependencyDescriptor,
            _dest: &Path,
        ) -> anyhow::Result<()> {
            Err(anyhow!("registry unreachable"))
        }
    }

    /// Factory that records every spec it is asked to materialize.
    #[derive(Clone, Default)]
    struct RecordingFactory(Arc<Mutex<Vec<ModelSpec>>>);

    impl BackendFactory for RecordingFactory {
        fn create_recognizer(&self, spec: &ModelSpec) -> anyhow::Result<Box<dyn Recognizer>> {
            self.0.lock().push(spec.clone());
            Ok(Box::new(crate::inference::stub::StubRecognizer))
        }

        fn create_voice_activity(
            &self,
            spec: &ModelSpec,
        ) -> anyhow::Result<Box<dyn VoiceActivity>> {
            self.0.lock().push(spec.clone());
            Ok(Box::new(crate::inference::stub::StubVoiceActivity))
        }

        fn create_punctuator(&self, spec: &ModelSpec) -> anyhow::Result<Box<dyn Punctuator>> {
            self.0.lock().push(spec.clone());
            Ok(Box::new(crate::inference::stub::StubPunctuator))
        }
    }

    struct RefusingFactory;

    impl BackendFactory for RefusingFactory {
        fn create_recognizer(&self, _spec: &ModelSpec) -> anyhow::Result<Box<dyn Recognizer>> {
            Err(anyhow!("runtime missing"))
        }

        fn create_voice_activity(
            &self,
            _spec: &ModelSpec,
        ) -> anyhow::Result<Box<dyn VoiceActivity>> {
            Err(anyhow!("runtime missing"))
        }

        fn create_punctuator(&self, _spec: &ModelSpec) -> anyhow::Result<Box<dyn Punctuator>> {
            Err(anyhow!("runtime missing"))
        }
    }

    fn init_request(value: serde_json::Value) -> InitRequest {
        serde_json::from_value(value).expect("valid init request")
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, b"x").expect("write");
    }

    fn lifecycle_with(
        root: &Path,
        fetcher: Box<dyn ModelFetcher>,
        factory: Box<dyn BackendFactory>,
    ) -> ModelLifecycle {
        ModelLifecycle::new(
            ModelRegistry::with_root(root.to_path_buf()),
            fetcher,
            factory,
        )
    }

    #[test]
    fn cached_init_skips_the_download_band() {
        let root = tempfile::tempdir().expect("tempdir");
        touch(&root.path().join("acme/asr/model.onnx"));
        let mut lifecycle = lifecycle_with(root.path(), Box::new(NoFetch), Box::new(StubFactory));

        let buf = SharedBuf::default();
        let channel = ResponseChannel::from_writer(buf.clone());
        let progress = ProgressSink::new(&channel, 1.into());

        let stats = lifecycle
            .init(
                &init_request(json!({
                    "modelName": "acme/asr",
                    "backend": "funasr_onnx_paraformer",
                })),
                &progress,
            )
            .expect("init succeeds");

        assert_eq!(lifecycle.phase(), LifecyclePhase::Ready);
        assert!(lifecycle.session_mut().is_some());
        assert_eq!(stats.backend, "funasr_onnx_paraformer");

        let values = buf.progress_values();
        assert_eq!(values, vec![92, 96, 98], "no download-band progress at all");
    }

    #[test]
    fn missing_models_are_fetched_and_progress_climbs() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut lifecycle = lifecycle_with(root.path(), Box::new(FakeFetch), Box::new(StubFactory));

        let buf = SharedBuf::default();
        let channel = ResponseChannel::from_writer(buf.clone());
        let progress = ProgressSink::new(&channel, 7.into());

        lifecycle
            .init(
                &init_request(json!({
                    "modelName": "acme/asr",
                    "vadModelName": "acme/vad",
                })),
                &progress,
            )
            .expect("init succeeds");

        let values = buf.progress_values();
        assert_eq!(values.first(), Some(&5));
        assert!(values.contains(&45), "mid-band milestone for dep 1 of 2");
        assert!(values.contains(&90));
        assert_eq!(values.last(), Some(&98));
    }

    #[test]
    fn fetcher_failure_surfaces_as_download_error() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut lifecycle = lifecycle_with(root.path(), Box::new(FailFetch), Box::new(StubFactory));

        let buf = SharedBuf::default();
        let channel = ResponseChannel::from_writer(buf);
        let progress = ProgressSink::new(&channel, 1.into());

        let err = lifecycle
            .init(&init_request(json!({ "modelName": "acme/asr" })), &progress)
            .expect_err("init fails");
        assert_eq!(err.code(), "MODEL_DOWNLOAD_FAILED");
        assert_eq!(lifecycle.phase(), LifecyclePhase::Failed);
        assert!(lifecycle.session_mut().is_none());
    }

    #[test]
    fn unknown_backend_is_rejected_before_any_download() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut lifecycle = lifecycle_with(root.path(), Box::new(NoFetch), Box::new(StubFactory));

        let buf = SharedBuf::default();
        let channel = ResponseChannel::from_writer(buf);
        let progress = ProgressSink::new(&channel, 1.into());

        let err = lifecycle
            .init(
                &init_request(json!({ "modelName": "m", "backend": "bogus" })),
                &progress,
            )
            .expect_err("init fails");
        assert_eq!(err.code(), "ASR_MODEL_INIT_FAILED");
        assert_eq!(lifecycle.phase(), LifecyclePhase::Failed);
    }

    #[test]
    fn factory_failure_maps_to_role_specific_init_error() {
        let root = tempfile::tempdir().expect("tempdir");
        touch(&root.path().join("acme/asr/model.onnx"));
        let mut lifecycle =
            lifecycle_with(root.path(), Box::new(NoFetch), Box::new(RefusingFactory));

        let buf = SharedBuf::default();
        let channel = ResponseChannel::from_writer(buf);
        let progress = ProgressSink::new(&channel, 1.into());

        let err = lifecycle
            .init(
                &init_request(json!({
                    "modelName": "acme/asr",
                    "backend": "funasr_onnx_paraformer",
                })),
                &progress,
            )
            .expect_err("init fails");
        assert_eq!(err.code(), "ASR_MODEL_INIT_FAILED");
        let data = err.data().expect("context");
        assert_eq!(data["modelName"], "acme/asr");
    }

    #[test]
    fn quantized_contextual_without_quant_encoder_loads_staged_view() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("acme/ctx");
        touch(&dir.join("model_quant.onnx"));
        touch(&dir.join("model_eb.onnx"));
        touch(&dir.join("config.yaml"));

        let factory = RecordingFactory::default();
        let specs = factory.0.clone();
        let mut lifecycle = lifecycle_with(root.path(), Box::new(NoFetch), Box::new(factory));

        let buf = SharedBuf::default();
        let channel = ResponseChannel::from_writer(buf);
        let progress = ProgressSink::new(&channel, 1.into());

        lifecycle
            .init(
                &init_request(json!({ "modelName": "acme/ctx", "quantize": true })),
                &progress,
            )
            .expect("init succeeds");

        let specs = specs.lock();
        let asr = &specs[0];
        assert!(!asr.quantize, "staged view loads unquantized");
        assert_ne!(asr.model_dir, dir, "model dir points at the staged copy");
        assert!(asr.model_dir.join("model.onnx").exists());
        assert!(asr.model_dir.join("model_eb.onnx").exists());
        assert!(asr.model_dir.join("config.yaml").exists());
    }

    #[test]
    fn contextual_hotwords_are_normalized_into_the_session() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("acme/ctx");
        touch(&dir.join("model.onnx"));
        touch(&dir.join("model_eb.onnx"));
        let mut lifecycle = lifecycle_with(root.path(), Box::new(NoFetch), Box::new(StubFactory));

        let buf = SharedBuf::default();
        let channel = ResponseChannel::from_writer(buf);
        let progress = ProgressSink::new(&channel, 1.into());

        let stats = lifecycle
            .init(
                &init_request(json!({
                    "modelName": "acme/ctx",
                    "hotwords": "肉眼所见 20\n鳞状上皮 20",
                })),
                &progress,
            )
            .expect("init succeeds");

        assert_eq!(stats.configured_count, 2);
        let session = lifecycle.session_mut().expect("session");
        assert_eq!(session.hotwords, "肉眼所见 鳞状上皮");
        assert_eq!(session.backend, BackendKind::OnnxContextual);
        assert!(session.voice_activity.is_none());
        assert!(session.punctuator.is_none(), "no punc model named");
    }

    #[test]
    fn dispose_is_idempotent() {
        let root = tempfile::tempdir().expect("tempdir");
        touch(&root.path().join("acme/asr/model.onnx"));
        let mut lifecycle = lifecycle_with(root.path(), Box::new(NoFetch), Box::new(StubFactory));

        let buf = SharedBuf::default();
        let channel = ResponseChannel::from_writer(buf);
        let progress = ProgressSink::new(&channel, 1.into());
        lifecycle
            .init(
                &init_request(json!({
                    "modelName": "acme/asr",
                    "backend": "funasr_onnx_paraformer",
                })),
                &progress,
            )
            .expect("init succeeds");

        lifecycle.dispose();
        assert_eq!(lifecycle.phase(), LifecyclePhase::Uninitialized);
        assert!(lifecycle.session_mut().is_none());
        lifecycle.dispose();
        assert_eq!(lifecycle.phase(), LifecyclePhase::Uninitialized);
    }

    #[test]
    fn reinit_replaces_the_previous_session() {
        let root = tempfile::tempdir().expect("tempdir");
        touch(&root.path().join("acme/a/model.onnx"));
        touch(&root.path().join("acme/b/model.onnx"));
        let mut lifecycle = lifecycle_with(root.path(), Box::new(NoFetch), Box::new(StubFactory));

        let buf = SharedBuf::default();
        let channel = ResponseChannel::from_writer(buf);
        let progress = ProgressSink::new(&channel, 1.into());

        for model in ["acme/a", "acme/b"] {
            lifecycle
                .init(
                    &init_request(json!({
                        "modelName": model,
                        "backend": "funasr_onnx_paraformer",
                    })),
                    &progress,
                )
                .expect("init succeeds");
        }
        assert_eq!(lifecycle.phase(), LifecyclePhase::Ready);

        let session = lifecycle.session_mut().expect("session");
        let result = session
            .recognizer
            .recognize(&[0.0; 320], "")
            .expect("stub recognize");
        assert!(matches!(result, RawResult::Text(_)));
    }
}
