use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use colloquy_core::errors::GatewayError;
use colloquy_core::provider::ChunkStream;
use colloquy_core::stream::StreamEvent;

use crate::sse::ChatStreamParser;

/// Maximum silence between body chunks before the stream is declared dead.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Shared pause flag. The read loop stops pulling bytes while it is set and
/// wakes as soon as it is cleared.
#[derive(Debug)]
pub struct PauseGate {
    tx: watch::Sender<bool>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Flip the flag and return the new state (`true` = paused).
    pub fn toggle(&self) -> bool {
        let mut paused = false;
        self.tx.send_modify(|p| {
            *p = !*p;
            paused = *p;
        });
        paused
    }

    pub fn resume(&self) {
        self.tx.send_if_modified(|p| std::mem::replace(p, false));
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// How a read loop ended without a transport error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Completed,
    Aborted,
}

/// Cancellation and pause inputs for one read loop.
pub struct StreamControls {
    pub cancel: CancellationToken,
    pub pause: watch::Receiver<bool>,
    pub idle_timeout: Duration,
}

impl StreamControls {
    pub fn new(cancel: CancellationToken, pause: watch::Receiver<bool>) -> Self {
        Self {
            cancel,
            pause,
            idle_timeout: STREAM_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Suspend until the pause flag clears. Returns `false` if cancelled
    /// while waiting.
    async fn wait_for_resume(&mut self) -> bool {
        loop {
            if !*self.pause.borrow_and_update() {
                return true;
            }
            debug!("stream paused");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                changed = self.pause.changed() => {
                    // Gate dropped: nobody can pause any more.
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }
}

/// Drive `body` through `parser`, invoking `on_event` for every event in
/// wire order with the parser's buffers already updated.
///
/// Cancellation is honoured between chunks and while waiting for one; a
/// chunk that has been received is always processed in full. Pausing while
/// a read is pending abandons that read, so no further bytes are pulled
/// until resume. The idle timeout does not run while paused.
pub async fn read_stream<F>(
    mut body: ChunkStream,
    parser: &mut ChatStreamParser,
    controls: &mut StreamControls,
    mut on_event: F,
) -> Result<ReadOutcome, GatewayError>
where
    F: FnMut(&StreamEvent, &ChatStreamParser),
{
    parser.begin();

    loop {
        if !controls.wait_for_resume().await {
            parser.abort();
            return Ok(ReadOutcome::Aborted);
        }

        let next = tokio::select! {
            biased;
            _ = controls.cancel.cancelled() => {
                parser.abort();
                return Ok(ReadOutcome::Aborted);
            }
            // `next()` is cancel-safe: dropping the pending read loses nothing.
            Ok(()) = controls.pause.changed() => continue,
            next = tokio::time::timeout(controls.idle_timeout, body.next()) => next,
        };

        match next {
            Err(_) => {
                parser.fail();
                warn!(timeout_secs = controls.idle_timeout.as_secs(), "stream idle timeout");
                return Err(GatewayError::StreamInterrupted(format!(
                    "idle timeout after {}s",
                    controls.idle_timeout.as_secs()
                )));
            }
            Ok(None) => {
                for event in parser.finish() {
                    on_event(&event, parser);
                }
                return Ok(ReadOutcome::Completed);
            }
            Ok(Some(Err(e))) if e.is_cancelled() => {
                parser.abort();
                return Ok(ReadOutcome::Aborted);
            }
            Ok(Some(Err(e))) => {
                parser.fail();
                return Err(e);
            }
            Ok(Some(Ok(chunk))) => {
                for event in parser.feed(&chunk) {
                    on_event(&event, parser);
                }
                if parser.phase().is_terminal() {
                    return Ok(ReadOutcome::Completed);
                }
            }
        }
    }
}
