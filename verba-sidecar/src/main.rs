//! Sidecar process entry point.
//!
//! stdout carries protocol lines exclusively; all diagnostics go to stderr
//! through tracing so the host's reader never sees log noise.

use tracing::info;
use verba_core::inference::stub::StubFactory;
use verba_core::registry::fetch::HttpFetcher;
use verba_core::{ModelLifecycle, ModelRegistry, ResponseChannel, Sidecar};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "verba=info".parse().expect("static filter parses")),
        )
        .with_writer(std::io::stderr)
        .init();

    let registry = ModelRegistry::new();
    info!(cache_root = %registry.cache_root().display(), "starting sidecar");

    let lifecycle = ModelLifecycle::new(
        registry,
        Box::new(HttpFetcher::new()),
        Box::new(StubFactory),
    );
    let mut sidecar = Sidecar::new(lifecycle, ResponseChannel::stdout());

    let stdin = std::io::stdin();
    sidecar.run(stdin.lock());
}
