//! Stream consumer: one long-lived subscribe stream per channel, parsed line by line and
//! fanned out to the channel's local handlers. Reconnects until cancelled.

use crate::error::AppError;
use crate::models::event::EventEnvelope;
use crate::repositories::store::{ByteStream, Store, FRAME_PREFIX};
use crate::services::handler::{EventHandler, HandlerId};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::{Id, JoinHandle, JoinSet};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, trace, warn};

/// Handlers of one channel, shared between the subscription manager and the consumer.
pub type HandlerSet = Arc<RwLock<HashMap<HandlerId, Arc<dyn EventHandler>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Connecting,
    Streaming,
    ReconnectWait,
    Closed,
}

/// Longest partial line kept while waiting for its line break.
pub(crate) const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// Accumulates raw chunks and yields complete lines; a partial trailing line stays buffered
/// up to [`MAX_PENDING_BYTES`], past which it is discarded.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let lines = match self.pending.iter().rposition(|b| *b == b'\n') {
            Some(last_newline) => {
                let rest = self.pending.split_off(last_newline + 1);
                let complete = std::mem::replace(&mut self.pending, rest);
                complete
                    .split(|b| *b == b'\n')
                    .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
                    .filter(|line| !line.is_empty())
                    .map(|line| String::from_utf8_lossy(line).into_owned())
                    .collect()
            }
            None => Vec::new(),
        };
        if self.pending.len() > MAX_PENDING_BYTES {
            let err = AppError::MalformedMessage(format!(
                "no line break within {} bytes",
                self.pending.len()
            ));
            warn!(error = %err, "discarding partial line");
            self.pending.clear();
        }
        lines
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// One `data: <kind>,<channel>,<payload>` record.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct StreamRecord<'a> {
    pub kind: &'a str,
    pub channel: &'a str,
    pub payload: Option<&'a str>,
}

/// Split on the first two commas only; the payload keeps any commas of its own.
pub(crate) fn parse_record(line: &str) -> Option<StreamRecord<'_>> {
    let body = line.strip_prefix(FRAME_PREFIX)?;
    let mut parts = body.splitn(3, ',');
    let kind = parts.next().filter(|s| !s.is_empty())?;
    let channel = parts.next().filter(|s| !s.is_empty())?;
    Some(StreamRecord {
        kind,
        channel,
        payload: parts.next(),
    })
}

tokio::task_local! {
    /// Task id of the consumer whose dispatch is running the current handler.
    static DISPATCHING_CONSUMER: Option<Id>;
}

/// The consumer task currently waiting on this handler, when called from inside a dispatch.
pub(crate) fn dispatching_consumer() -> Option<Id> {
    DISPATCHING_CONSUMER.try_with(|owner| *owner).ok().flatten()
}

/// Hand `event` to every handler in `handlers` concurrently and wait for all of them.
pub(crate) async fn dispatch(channel: &str, handlers: &HandlerSet, event: EventEnvelope) {
    let snapshot: Vec<(HandlerId, Arc<dyn EventHandler>)> = handlers
        .read()
        .await
        .iter()
        .map(|(id, handler)| (*id, handler.clone()))
        .collect();
    if snapshot.is_empty() {
        return;
    }

    let event = Arc::new(event);
    let owner = tokio::task::try_id();
    let mut tasks = JoinSet::new();
    for (id, handler) in snapshot {
        let event = event.clone();
        tasks.spawn(DISPATCHING_CONSUMER.scope(owner, async move {
            (id, handler.handle(event).await)
        }));
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((id, Err(e))) => {
                warn!(channel = %channel, handler = id, error = %e, "handler failed")
            }
            Err(e) => error!(channel = %channel, error = %e, "handler panicked"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Disconnected,
    Cancelled,
}

struct ConsumerLoop {
    store: Arc<dyn Store>,
    channel: String,
    handlers: HandlerSet,
    token: CancellationToken,
    state: watch::Sender<ConsumerState>,
    reconnect_delay: Duration,
}

impl ConsumerLoop {
    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    async fn run(self) {
        loop {
            if self.token.is_cancelled() {
                break;
            }
            self.set_state(ConsumerState::Connecting);
            let opened = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                opened = self.store.subscribe(&self.channel) => opened,
            };

            match opened {
                Ok(stream) => {
                    self.set_state(ConsumerState::Streaming);
                    debug!(channel = %self.channel, "streaming");
                    if self.consume(stream).await == Flow::Cancelled {
                        break;
                    }
                }
                Err(e) => warn!(channel = %self.channel, error = %e, "subscribe failed"),
            }

            if self.token.is_cancelled() {
                break;
            }
            self.set_state(ConsumerState::ReconnectWait);
            debug!(
                channel = %self.channel,
                delay_ms = self.reconnect_delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        self.set_state(ConsumerState::Closed);
        info!(channel = %self.channel, "stream consumer closed");
    }

    async fn consume(&self, mut stream: ByteStream) -> Flow {
        let mut lines = LineBuffer::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Flow::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    for line in lines.push(&chunk) {
                        self.handle_line(&line).await;
                    }
                }
                Some(Err(e)) => {
                    warn!(channel = %self.channel, error = %e, "stream read failed");
                    return Flow::Disconnected;
                }
                None => {
                    info!(channel = %self.channel, "stream ended");
                    return Flow::Disconnected;
                }
            }
            if self.token.is_cancelled() {
                return Flow::Cancelled;
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        let Some(record) = parse_record(line) else {
            trace!(channel = %self.channel, line = %line, "ignoring line");
            return;
        };
        if record.kind != "message" || record.channel != self.channel {
            trace!(channel = %self.channel, kind = %record.kind, "ignoring record");
            return;
        }
        let Some(payload) = record.payload else {
            debug!(channel = %self.channel, "message record without payload");
            return;
        };
        match serde_json::from_str::<EventEnvelope>(payload) {
            Ok(event) => dispatch(&self.channel, &self.handlers, event).await,
            Err(e) => {
                let err = AppError::MalformedMessage(e.to_string());
                warn!(channel = %self.channel, error = %err, "dropping message");
            }
        }
    }
}

/// Handle to a running consumer task. Dropping it cancels the task.
pub struct StreamConsumer {
    channel: String,
    state: watch::Receiver<ConsumerState>,
    task: JoinHandle<()>,
    guard: DropGuard,
}

impl StreamConsumer {
    pub fn spawn(
        store: Arc<dyn Store>,
        channel: String,
        handlers: HandlerSet,
        reconnect_delay: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ConsumerState::Connecting);
        let task = tokio::spawn(
            ConsumerLoop {
                store,
                channel: channel.clone(),
                handlers,
                token: token.clone(),
                state: state_tx,
                reconnect_delay,
            }
            .run(),
        );
        Self {
            channel,
            state: state_rx,
            task,
            guard: token.drop_guard(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    /// Request cancellation; the returned task ends after any in-flight dispatch.
    pub fn cancel(self) -> JoinHandle<()> {
        let StreamConsumer { guard, task, .. } = self;
        drop(guard);
        task
    }

    /// Cancel and wait until the task has stopped touching the network.
    pub async fn close(self) {
        let channel = self.channel.clone();
        if let Err(e) = self.cancel().await {
            error!(channel = %channel, error = %e, "stream consumer task failed");
        }
    }
}
