//! Server-push stream endpoints.
//!
//! [`StreamSink`] is the handler's write side; [`Subscription`] is the
//! caller's read side. Both close exactly once, whichever side initiates.

use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::framing::Frame;
use super::{codec, lock, Delivery, RemoteError, RpcError, Shared};

type CloseCallback = Box<dyn FnOnce() + Send>;

/// Untyped state of one stream served by this side.
pub(crate) struct ServedStream {
    id: u32,
    shared: Weak<Shared>,
    destroyed: CancellationToken,
    /// `None` once the close callbacks have fired.
    on_close: Mutex<Option<Vec<CloseCallback>>>,
}

impl ServedStream {
    pub(crate) fn new(id: u32, shared: Weak<Shared>, destroyed: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            id,
            shared,
            destroyed,
            on_close: Mutex::new(Some(Vec::new())),
        })
    }

    fn write_raw(&self, body: Vec<u8>) -> bool {
        if self.is_destroying() {
            return false;
        }
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        match shared.send(&Frame::StreamData { id: self.id, body }) {
            Ok(()) => true,
            // An event the peer cannot decode ends this stream only.
            Err(RpcError::Codec(reason)) => {
                self.fail(RemoteError::message(reason));
                false
            }
            Err(_) => false,
        }
    }

    fn is_destroying(&self) -> bool {
        self.destroyed.is_cancelled()
    }

    fn on_close(&self, callback: CloseCallback) {
        let mut callbacks = lock(&self.on_close);
        match callbacks.as_mut() {
            Some(pending) => pending.push(callback),
            None => {
                drop(callbacks);
                callback();
            }
        }
    }

    /// Mark the stream closed and run close callbacks. Idempotent.
    pub(crate) fn destroy(&self) {
        self.destroyed.cancel();
        let callbacks = lock(&self.on_close).take();
        for callback in callbacks.into_iter().flatten() {
            callback();
        }
    }

    /// Send a terminal frame, forget the stream, and destroy it.
    fn finish(&self, frame: &Frame) {
        if self.is_destroying() {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            let _ = shared.send(frame);
            shared.forget_served(self.id);
        }
        self.destroy();
    }

    pub(crate) fn fail(&self, error: RemoteError) {
        self.finish(&Frame::StreamError { id: self.id, error });
    }

    fn end(&self) {
        self.finish(&Frame::StreamEnd { id: self.id });
    }
}

/// Write side of a server-push stream, handed to stream handlers.
pub struct StreamSink<Ev> {
    inner: Arc<ServedStream>,
    _marker: PhantomData<fn(Ev)>,
}

impl<Ev> StreamSink<Ev> {
    pub(crate) fn new(inner: Arc<ServedStream>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// Stream id as chosen by the subscriber.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// True once the stream is closed or closing. Writes are dropped.
    pub fn is_destroying(&self) -> bool {
        self.inner.is_destroying()
    }

    /// Run `callback` when the stream closes, from either side.
    ///
    /// Runs immediately if the stream is already closed. Each callback runs
    /// exactly once.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner.on_close(Box::new(callback));
    }

    /// Wait until the stream closes.
    pub async fn closed(&self) {
        self.inner.destroyed.cancelled().await;
    }

    /// End the stream normally. No-op if already closed.
    pub fn end(&self) {
        self.inner.end();
    }
}

impl<Ev: Serialize> StreamSink<Ev> {
    /// Push one event. Returns false if the stream is closed.
    ///
    /// An event too large for a single frame fails the stream.
    pub fn write(&self, event: &Ev) -> bool {
        match codec::encode(event) {
            Ok(body) => self.inner.write_raw(body),
            Err(e) => {
                log::warn!("[Rpc] Dropping unencodable event on stream {}: {e}", self.inner.id);
                false
            }
        }
    }
}

impl<Ev> Clone for StreamSink<Ev> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.inner))
    }
}

impl<Ev> fmt::Debug for StreamSink<Ev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSink")
            .field("id", &self.inner.id)
            .field("destroying", &self.is_destroying())
            .finish()
    }
}

/// Read side of a server-push stream.
///
/// Yields events in send order. A terminal `Err` (remote failure or
/// transport loss) is followed by `None`. Dropping the subscription closes it.
pub struct Subscription<Ev> {
    id: u32,
    events: mpsc::UnboundedReceiver<Delivery>,
    shared: Arc<Shared>,
    closed: bool,
    _marker: PhantomData<fn() -> Ev>,
}

impl<Ev> Subscription<Ev> {
    pub(crate) fn new(id: u32, events: mpsc::UnboundedReceiver<Delivery>, shared: Arc<Shared>) -> Self {
        Self {
            id,
            events,
            shared,
            closed: false,
            _marker: PhantomData,
        }
    }

    /// Local stream id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// True once [`Subscription::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the stream and tell the handler side. Idempotent.
    ///
    /// Events already buffered are discarded.
    pub fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        if self.shared.forget_subscription(self.id) {
            let _ = self.shared.send(&Frame::StreamCancel { id: self.id });
        }
        self.events.close();
        while self.events.try_recv().is_ok() {}
    }
}

impl<Ev: DeserializeOwned> Subscription<Ev> {
    /// Next event, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Result<Ev, RpcError>> {
        let delivery = self.events.recv().await?;
        Some(delivery.and_then(|body| codec::decode(&body)))
    }
}

impl<Ev: DeserializeOwned> Stream for Subscription<Ev> {
    type Item = Result<Ev, RpcError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events
            .poll_recv(cx)
            .map(|delivery| delivery.map(|d| d.and_then(|body| codec::decode(&body))))
    }
}

impl<Ev> Drop for Subscription<Ev> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<Ev> fmt::Debug for Subscription<Ev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
