//! `ResponseChannel` — the single shared writer for outbound messages.
//!
//! Progress callbacks fire from inside nested calls (the download loop
//! reports while still executing), so the sink is guarded by a
//! `parking_lot::Mutex`: each message is serialized, written, and flushed as
//! one unit while the lock is held, and partial lines can never interleave.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::error;

use crate::protocol::messages::{ProgressUpdate, RequestId};

/// Clonable handle to the outbound message sink.
#[derive(Clone)]
pub struct ResponseChannel {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ResponseChannel {
    /// Channel writing to the process's stdout (the production sink).
    pub fn stdout() -> Self {
        Self::from_writer(std::io::stdout())
    }

    /// Channel writing to an arbitrary sink (used by tests to capture output).
    pub fn from_writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Serialize `msg` and emit it as one complete, flushed line.
    ///
    /// A write failure is logged and swallowed: if stdout is gone the host
    /// is gone too, and the read loop will see EOF shortly.
    pub fn send<T: Serialize>(&self, msg: &T) {
        let line = match serde_json::to_string(msg) {
            Ok(line) => line,
            Err(err) => {
                error!(error = %err, "failed to serialize outbound message");
                return;
            }
        };

        let mut sink = self.sink.lock();
        if let Err(err) = writeln!(sink, "{line}").and_then(|_| sink.flush()) {
            error!(error = %err, "failed to write outbound message");
        }
    }

    pub fn progress(&self, id: RequestId, progress: u8, status: Option<&str>) {
        self.send(&ProgressUpdate {
            id,
            progress,
            status: status.map(ToOwned::to_owned),
        });
    }
}

impl std::fmt::Debug for ResponseChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseChannel").finish_non_exhaustive()
    }
}

/// Progress reporter scoped to one request id.
pub struct ProgressSink<'a> {
    channel: &'a ResponseChannel,
    id: RequestId,
}

impl<'a> ProgressSink<'a> {
    pub fn new(channel: &'a ResponseChannel, id: RequestId) -> Self {
        Self { channel, id }
    }

    pub fn report(&self, progress: u8, status: Option<&str>) {
        self.channel.progress(self.id.clone(), progress, status);
    }
}
