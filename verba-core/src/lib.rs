//! # verba-core
//!
//! Speech-recognition sidecar engine: a long-lived child process serving a
//! line-delimited JSON protocol over stdin/stdout.
//!
//! ## Architecture
//!
//! ```text
//! stdin line → Sidecar::handle_line → dispatch
//!                                        │
//!                    init: download → load ASR/VAD/PUNC → session
//!                                        │
//!          recognize: decode → VAD segment → merge → ASR → PUNC
//!                                        │
//!                        ResponseChannel (stdout, one JSON line each)
//! ```
//!
//! The request loop is single-threaded; only progress reporting writes from
//! inside a running handler, through the same locked channel.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod dispatch;
pub mod error;
pub mod hotwords;
pub mod inference;
pub mod lifecycle;
pub mod protocol;
pub mod registry;

// Convenience re-exports for downstream crates
pub use dispatch::Sidecar;
pub use error::VerbaError;
pub use inference::{BackendFactory, BackendKind, ModelSpec, RawResult};
pub use lifecycle::{LifecyclePhase, ModelLifecycle};
pub use protocol::channel::ResponseChannel;
pub use registry::{ModelRegistry, ModelRole};
