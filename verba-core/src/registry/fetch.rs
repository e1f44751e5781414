//! Artifact download collaborator.
//!
//! The lifecycle manager only sees the [`ModelFetcher`] trait; the bundled
//! [`HttpFetcher`] pulls artifacts from the ModelScope file endpoint with
//! retry/backoff and a temp-file-then-rename discipline so an interrupted
//! transfer never leaves a half-written artifact behind.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tracing::{info, warn};

use crate::registry::{DependencyDescriptor, ARTIFACT_CHECKED_FAMILY, CONTEXTUAL_BACKEND};

/// Fetches one dependency's artifacts into `dest`.
pub trait ModelFetcher: Send {
    /// `identity` is the resolved registry identifier; `dest` the cache
    /// directory the artifacts must land in. Completeness is re-validated
    /// by the caller afterwards.
    fn fetch(&self, identity: &str, dep: &DependencyDescriptor, dest: &Path)
        -> anyhow::Result<()>;
}

const REGISTRY_BASE_URL: &str = "https://modelscope.cn/models";

/// Non-model files shipped alongside the weights. Missing ones are
/// tolerated — not every repository carries all of them.
const SUPPORT_FILES: &[&str] = &["config.yaml", "am.mvn", "tokens.json", "configuration.json"];

const MAX_RETRIES: usize = 3;
const RETRY_BACKOFF_SECS: u64 = 2;

/// Blocking HTTP fetcher against the public model registry.
pub struct HttpFetcher {
    base_url: String,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            base_url: REGISTRY_BASE_URL.to_string(),
        }
    }

    /// Fetcher against a non-default endpoint (mirrors, tests).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn artifact_plan(dep: &DependencyDescriptor) -> Vec<(String, bool)> {
        let mut plan = Vec::new();

        if dep.backend.starts_with(ARTIFACT_CHECKED_FAMILY) {
            let primary = if dep.quantize {
                "model_quant.onnx"
            } else {
                "model.onnx"
            };
            plan.push((primary.to_string(), true));

            if dep.backend == CONTEXTUAL_BACKEND {
                if dep.quantize {
                    // Either bias encoder satisfies the requirement; try
                    // both and let post-download validation arbitrate.
                    plan.push(("model_eb_quant.onnx".to_string(), false));
                    plan.push(("model_eb.onnx".to_string(), false));
                } else {
                    plan.push(("model_eb.onnx".to_string(), true));
                }
            }
        } else {
            // Unchecked backends validate themselves at load time; fetch
            // the conventional primary weight name.
            plan.push(("model.onnx".to_string(), false));
        }

        for file in SUPPORT_FILES {
            plan.push((file.to_string(), false));
        }

        plan
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelFetcher for HttpFetcher {
    fn fetch(
        &self,
        identity: &str,
        dep: &DependencyDescriptor,
        dest: &Path,
    ) -> anyhow::Result<()> {
        fs::create_dir_all(dest)
            .with_context(|| format!("creating cache directory {}", dest.display()))?;

        for (file, required) in Self::artifact_plan(dep) {
            let target = dest.join(&file);
            if target.exists() {
                continue;
            }

            let url = format!("{}/{identity}/resolve/master/{file}", self.base_url);
            match download_asset(&url, &target) {
                Ok(()) => {}
                Err(err) if required => {
                    return Err(err.context(format!("fetching required artifact {file}")));
                }
                Err(err) => {
                    warn!(
                        model = %dep.model_name,
                        file = %file,
                        error = %err,
                        "optional artifact unavailable — continuing"
                    );
                }
            }
        }

        Ok(())
    }
}

fn download_asset(url: &str, dest: &Path) -> anyhow::Result<()> {
    let tmp = dest.with_extension("download");
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 1..=MAX_RETRIES {
        if tmp.exists() {
            let _ = fs::remove_file(&tmp);
        }

        info!(url, attempt, max = MAX_RETRIES, "downloading model asset");

        match try_download_once(url, &tmp, dest) {
            Ok(()) => return Ok(()),
            Err(err) => {
                last_err = Some(err);
                if attempt < MAX_RETRIES {
                    std::thread::sleep(Duration::from_secs(RETRY_BACKOFF_SECS * attempt as u64));
                } else if tmp.exists() {
                    let _ = fs::remove_file(&tmp);
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{url}: failed to download")))
}

fn try_download_once(url: &str, tmp: &Path, dest: &Path) -> anyhow::Result<()> {
    let response = reqwest::blocking::get(url).with_context(|| format!("requesting {url}"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("{url}: unexpected status {status}"));
    }

    let mut file =
        fs::File::create(tmp).with_context(|| format!("creating {}", tmp.display()))?;
    let mut reader = response;
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .with_context(|| format!("{url}: read failed"))?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])
            .with_context(|| format!("{url}: write failed"))?;
    }

    fs::rename(tmp, dest).with_context(|| format!("moving into place: {}", dest.display()))?;
    Ok(())
}
