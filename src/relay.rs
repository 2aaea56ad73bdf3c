//! Drives a token stream into a display surface.
//!
//! The sink sees one `clear()` and then `update()` calls carrying the whole
//! transcript so far, each strictly longer than the last. When the sink
//! reports itself withdrawn the relay stops polling the stream and drops it,
//! including while it is waiting on a slow model for the next fragment.

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

/// A surface that renders the growing transcript.
pub trait ReviewSink: Send {
    /// Wipe whatever is currently rendered.
    fn clear(&mut self) -> impl Future<Output = ()> + Send;

    /// Replace the rendered content with `transcript`.
    fn update(&mut self, transcript: &str) -> impl Future<Output = ()> + Send;

    /// True once the surface is gone. Further calls would be no-ops.
    fn is_withdrawn(&self) -> bool;

    /// Resolves when the surface goes away. Sinks that can only be polled
    /// keep the default, which never resolves.
    fn withdrawn(&self) -> impl Future<Output = ()> + Send {
        std::future::pending()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Everything received before the stream ended or the sink went away.
    pub transcript: String,
    /// Number of `update()` calls made.
    pub updates: usize,
    pub withdrawn: bool,
}

/// Consume `tokens`, forwarding the accumulated transcript to `sink`.
pub async fn relay<S, K>(tokens: S, sink: &mut K) -> RelayOutcome
where
    S: Stream<Item = String>,
    K: ReviewSink,
{
    let mut outcome = RelayOutcome::default();
    if sink.is_withdrawn() {
        outcome.withdrawn = true;
        return outcome;
    }

    sink.clear().await;
    let mut tokens = std::pin::pin!(tokens);

    loop {
        if sink.is_withdrawn() {
            outcome.withdrawn = true;
            break;
        }
        let next = tokio::select! {
            biased;
            _ = sink.withdrawn() => {
                outcome.withdrawn = true;
                break;
            }
            next = tokens.next() => next,
        };
        let Some(token) = next else {
            break;
        };
        if token.is_empty() {
            continue;
        }
        outcome.transcript.push_str(&token);
        if sink.is_withdrawn() {
            outcome.withdrawn = true;
            break;
        }
        sink.update(&outcome.transcript).await;
        outcome.updates += 1;
    }

    if outcome.withdrawn {
        tracing::debug!(updates = outcome.updates, "sink withdrawn, abandoning stream");
    } else {
        tracing::debug!(
            updates = outcome.updates,
            chars = outcome.transcript.len(),
            "relay finished"
        );
    }
    outcome
}

/// Messages a [`ChannelSink`] emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Clear,
    Update(String),
}

/// Sink backed by an unbounded channel. Withdrawn once the receiver is dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ReviewSink for ChannelSink {
    async fn clear(&mut self) {
        let _ = self.tx.send(SinkEvent::Clear);
    }

    async fn update(&mut self, transcript: &str) {
        let _ = self.tx.send(SinkEvent::Update(transcript.to_string()));
    }

    fn is_withdrawn(&self) -> bool {
        self.tx.is_closed()
    }

    fn withdrawn(&self) -> impl Future<Output = ()> + Send {
        self.tx.closed()
    }
}
