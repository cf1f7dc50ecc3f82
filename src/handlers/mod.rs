//! Per-channel handlers bound to routes.
//!
//! A handler is created fresh for every dispatched channel. It receives the
//! route parameters, the channel (byte stream plus control side) and the
//! request stream: every control request buffered before `exec`, followed by
//! whatever the client sends afterwards.

pub mod api;
pub mod command;

use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::msg::{ExitSignal, ExitStatus};

pub use api::ApiHandler;
pub use command::CommandHandler;

/// Route and query parameters injected into a handler.
pub type Params = BTreeMap<String, String>;

/// Creates a new handler instance for each dispatch.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

/// A unit of per-channel work.
#[async_trait]
pub trait Handler: Send {
    fn inject_parameters(&mut self, params: Params);

    /// Serve the channel until the work is done. The handler owns closing it.
    async fn handle(&mut self, channel: SessionChannel, requests: RequestStream);
}

/// Object-safe byte stream.
pub trait ByteStream: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> ByteStream for T {}

/// Out-of-band side of a session channel.
#[async_trait]
pub trait ChannelControl: Send + Sync {
    /// Answer the most recent request that asked for a reply.
    async fn reply(&self, ok: bool);

    async fn exit_status(&self, msg: ExitStatus);

    async fn exit_signal(&self, msg: ExitSignal);

    /// Send EOF and close the channel.
    async fn close(&self);

    /// Tear down the whole connection the channel belongs to.
    async fn disconnect(&self, reason: &str);
}

/// An accepted `session` channel.
pub struct SessionChannel {
    pub stream: Pin<Box<dyn ByteStream>>,
    pub control: Arc<dyn ChannelControl>,
}

impl SessionChannel {
    pub fn new(stream: impl ByteStream + 'static, control: Arc<dyn ChannelControl>) -> Self {
        Self {
            stream: Box::pin(stream),
            control,
        }
    }
}

/// A raw channel request as received from the client.
#[derive(Debug, Clone)]
pub struct ChannelRequest {
    pub kind: String,
    pub want_reply: bool,
    pub payload: Bytes,
}

impl ChannelRequest {
    pub fn new(kind: impl Into<String>, want_reply: bool, payload: Bytes) -> Self {
        Self {
            kind: kind.into(),
            want_reply,
            payload,
        }
    }

    /// Reply through `control` if the client asked for an answer.
    pub async fn reply(&self, control: &dyn ChannelControl, ok: bool) {
        if self.want_reply {
            control.reply(ok).await;
        }
    }
}

/// Control requests received before `exec`, bounded by the configured capacity.
#[derive(Debug)]
pub struct PendingRequests {
    queue: VecDeque<ChannelRequest>,
    capacity: usize,
}

impl PendingRequests {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
        }
    }

    /// Queue a request, handing it back if the queue is full.
    pub fn push(&mut self, request: ChannelRequest) -> Result<(), ChannelRequest> {
        if self.queue.len() >= self.capacity {
            return Err(request);
        }
        self.queue.push_back(request);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Requests seen by a dispatched handler: the buffered ones first, in arrival
/// order, then the live stream.
///
/// Building one consumes both the buffer and the live receiver, so the
/// orchestrator can no longer read from either once a handler owns it.
pub struct RequestStream {
    pending: VecDeque<ChannelRequest>,
    live: mpsc::Receiver<ChannelRequest>,
}

impl RequestStream {
    pub fn new(pending: PendingRequests, live: mpsc::Receiver<ChannelRequest>) -> Self {
        Self {
            pending: pending.queue,
            live,
        }
    }

    /// Next request, or `None` once the channel is gone.
    pub async fn next(&mut self) -> Option<ChannelRequest> {
        if let Some(request) = self.pending.pop_front() {
            return Some(request);
        }
        self.live.recv().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Side effects recorded by [`RecordingControl`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Reply(bool),
        ExitStatus(u32),
        ExitSignal(String),
        Close,
        Disconnect,
    }

    #[derive(Default)]
    pub struct RecordingControl {
        events: Mutex<Vec<Event>>,
        closed: tokio::sync::Notify,
    }

    impl RecordingControl {
        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        /// Wait until the channel has been closed.
        pub async fn wait_closed(&self) {
            loop {
                let notified = self.closed.notified();
                if self.events().contains(&Event::Close) {
                    return;
                }
                notified.await;
            }
        }

        fn push(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl ChannelControl for RecordingControl {
        async fn reply(&self, ok: bool) {
            self.push(Event::Reply(ok));
        }

        async fn exit_status(&self, msg: ExitStatus) {
            self.push(Event::ExitStatus(msg.status));
        }

        async fn exit_signal(&self, msg: ExitSignal) {
            self.push(Event::ExitSignal(msg.signal));
        }

        async fn close(&self) {
            self.push(Event::Close);
            self.closed.notify_waiters();
        }

        async fn disconnect(&self, _reason: &str) {
            self.push(Event::Disconnect);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: &str) -> ChannelRequest {
        ChannelRequest::new(kind, false, Bytes::new())
    }

    #[test]
    fn test_pending_requests_bounded() {
        let mut pending = PendingRequests::new(2);
        assert!(pending.push(request("env")).is_ok());
        assert!(pending.push(request("pty-req")).is_ok());
        let rejected = pending.push(request("window-change")).unwrap_err();
        assert_eq!(rejected.kind, "window-change");
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_request_stream_replays_pending_first() {
        let mut pending = PendingRequests::new(8);
        pending.push(request("env")).unwrap();
        pending.push(request("pty-req")).unwrap();

        let (tx, rx) = mpsc::channel(8);
        tx.send(request("window-change")).await.unwrap();
        drop(tx);

        let mut stream = RequestStream::new(pending, rx);
        let mut kinds = Vec::new();
        while let Some(req) = stream.next().await {
            kinds.push(req.kind);
        }
        assert_eq!(kinds, ["env", "pty-req", "window-change"]);
    }
}
