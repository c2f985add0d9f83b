//! RPC multiplexer over a raw byte transport.
//!
//! One [`Rpc`] instance sits on each side of an [`Endpoint`]. Both sides are
//! symmetric: either may register handlers and either may call.
//!
//! # Call shapes
//!
//! - **Request/response**: [`Rpc::request`] sends a `Request` frame tagged
//!   with a fresh correlation id and resolves when the matching `Response` or
//!   `Error` frame arrives. Any number of calls may be in flight.
//! - **Server push**: [`Rpc::subscribe`] sends a `Subscribe` frame and
//!   returns a [`Subscription`]. The handler side receives a [`StreamSink`]
//!   and writes events until either side closes the stream.
//!
//! # Teardown
//!
//! ```text
//! transport EOF / decode error / Rpc::close()
//!     ├── pending calls      → Err(TransportClosed)
//!     ├── subscriptions      → Err(TransportClosed), then end
//!     └── served streams     → destroyed, on_close callbacks run once
//! ```
//!
//! Nothing is retried. Recreating the worklet and its RPC pairing is the
//! host's job (see [`crate::host::Supervisor`]).

pub mod codec;
mod error;
pub mod framing;
mod stream;

pub use codec::{Any, Method, StreamMethod};
pub use error::{RemoteError, RpcError};
pub(crate) use error::panic_message;
pub use stream::{StreamSink, Subscription};

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::transport::Endpoint;
use framing::{Frame, FrameDecoder};
use stream::ServedStream;

type RequestHandler =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, RemoteError>> + Send + Sync>;
type StreamHandler = Arc<
    dyn Fn(Vec<u8>, Arc<ServedStream>) -> BoxFuture<'static, Result<(), RemoteError>>
        + Send
        + Sync,
>;

/// Registered handler for one method slot.
#[derive(Clone)]
enum Handler {
    Request(RequestHandler),
    Stream(StreamHandler),
}

/// Encoded body or terminal error delivered to a waiting caller.
type Delivery = Result<Vec<u8>, RpcError>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the [`Rpc`] handles, the receive pump, and streams.
pub(crate) struct Shared {
    /// Encoded frames to the transport. `None` once torn down.
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    handlers: Mutex<HashMap<u32, Handler>>,
    /// Local calls awaiting a response, by local id.
    pending: Mutex<HashMap<u32, oneshot::Sender<Delivery>>>,
    /// Local subscriptions, by local id.
    subscriptions: Mutex<HashMap<u32, mpsc::UnboundedSender<Delivery>>>,
    /// Streams this side serves, by the remote subscriber's id.
    served: Mutex<HashMap<u32, Arc<ServedStream>>>,
    next_id: AtomicU32,
    closed: CancellationToken,
}

impl Shared {
    /// Queue a frame on the transport, preserving send order.
    ///
    /// A frame over [`framing::MAX_FRAME_SIZE`] fails with [`RpcError::Codec`]
    /// and leaves the transport open.
    pub(crate) fn send(&self, frame: &Frame) -> Result<(), RpcError> {
        let bytes = frame.encode_bounded().map_err(|e| {
            log::warn!("[Rpc] Refusing to send: {e}");
            RpcError::Codec(e.to_string())
        })?;
        let outbound = lock(&self.outbound);
        match outbound.as_ref() {
            Some(tx) if tx.send(bytes).is_ok() => Ok(()),
            _ => {
                drop(outbound);
                self.closed.cancel();
                Err(RpcError::TransportClosed)
            }
        }
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn begin_call(&self) -> Result<(u32, oneshot::Receiver<Delivery>), RpcError> {
        let (tx, rx) = oneshot::channel();
        let mut pending = lock(&self.pending);
        // Checked under the lock: teardown cancels before it drains.
        if self.closed.is_cancelled() {
            return Err(RpcError::TransportClosed);
        }
        let id = self.next_id();
        pending.insert(id, tx);
        Ok((id, rx))
    }

    fn begin_subscription(&self) -> Result<(u32, mpsc::UnboundedReceiver<Delivery>), RpcError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscriptions = lock(&self.subscriptions);
        if self.closed.is_cancelled() {
            return Err(RpcError::TransportClosed);
        }
        let id = self.next_id();
        subscriptions.insert(id, tx);
        Ok((id, rx))
    }

    pub(crate) fn forget_served(&self, id: u32) {
        lock(&self.served).remove(&id);
    }

    pub(crate) fn forget_subscription(&self, id: u32) -> bool {
        lock(&self.subscriptions).remove(&id).is_some()
    }

    /// Receive loop: reassembles frames from raw chunks and dispatches them.
    async fn pump(shared: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Vec<u8>>) {
        let mut decoder = FrameDecoder::new();

        loop {
            tokio::select! {
                () = shared.closed.cancelled() => break,
                chunk = inbound.recv() => {
                    let Some(chunk) = chunk else {
                        log::info!("[Rpc] Transport closed by peer");
                        break;
                    };
                    match decoder.feed(&chunk) {
                        Ok(frames) => {
                            for frame in frames {
                                shared.dispatch(frame);
                            }
                        }
                        Err(e) => {
                            log::error!("[Rpc] Frame decode error, closing transport: {e}");
                            break;
                        }
                    }
                }
            }
        }

        shared.teardown();
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Request { id, method, body } => self.serve_request(id, method, body),
            Frame::Subscribe { id, method, body } => self.serve_stream(id, method, body),
            Frame::Response { id, body } => self.resolve(id, Ok(body)),
            Frame::Error { id, error } => self.resolve(id, Err(RpcError::RemoteHandler(error))),
            Frame::StreamData { id, body } => match lock(&self.subscriptions).get(&id) {
                Some(tx) => {
                    let _ = tx.send(Ok(body));
                }
                None => log::debug!("[Rpc] Data for unknown stream {id}, ignoring"),
            },
            Frame::StreamEnd { id } => {
                if !self.forget_subscription(id) {
                    log::debug!("[Rpc] End for unknown stream {id}, ignoring");
                }
            }
            Frame::StreamError { id, error } => {
                let tx = lock(&self.subscriptions).remove(&id);
                if let Some(tx) = tx {
                    let _ = tx.send(Err(RpcError::RemoteHandler(error)));
                }
            }
            Frame::StreamCancel { id } => {
                let served = lock(&self.served).remove(&id);
                if let Some(served) = served {
                    log::debug!("[Rpc] Subscriber closed stream {id}");
                    served.destroy();
                }
            }
        }
    }

    fn resolve(&self, id: u32, delivery: Delivery) {
        let waiter = lock(&self.pending).remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(delivery);
            }
            // Caller gave up (deadline or dropped future); the reply is dropped.
            None => log::debug!("[Rpc] Dropping reply for discarded call {id}"),
        }
    }

    fn serve_request(self: &Arc<Self>, id: u32, method: u32, body: Vec<u8>) {
        let handler = lock(&self.handlers).get(&method).cloned();
        let shared = Arc::clone(self);

        tokio::spawn(async move {
            let frame = match handler {
                Some(Handler::Request(handler)) => {
                    match AssertUnwindSafe(async { handler(body).await }).catch_unwind().await {
                        Ok(Ok(body)) => Frame::Response { id, body },
                        Ok(Err(error)) => Frame::Error { id, error },
                        Err(panic) => {
                            let error = RemoteError::from_panic(&*panic);
                            log::error!("[Rpc] Request {id} handler panicked: {}", error.message);
                            Frame::Error { id, error }
                        }
                    }
                }
                _ => Frame::Error {
                    id,
                    error: RemoteError::message(format!(
                        "No request handler registered for method {method:#x}"
                    )),
                },
            };
            match shared.send(&frame) {
                Ok(()) => {}
                // Only this call fails; the reply never reaches the wire.
                Err(RpcError::Codec(reason)) => {
                    let _ = shared.send(&Frame::Error {
                        id,
                        error: RemoteError::message(reason),
                    });
                }
                Err(_) => log::debug!("[Rpc] Dropping reply to request {id}: transport closed"),
            }
        });
    }

    fn serve_stream(self: &Arc<Self>, id: u32, method: u32, body: Vec<u8>) {
        let handler = lock(&self.handlers).get(&method).cloned();
        let Some(Handler::Stream(handler)) = handler else {
            let error = RemoteError::message(format!(
                "No stream handler registered for method {method:#x}"
            ));
            let _ = self.send(&Frame::StreamError { id, error });
            return;
        };

        let served = ServedStream::new(id, Arc::downgrade(self), self.closed.child_token());
        {
            let mut streams = lock(&self.served);
            if self.closed.is_cancelled() {
                return;
            }
            streams.insert(id, Arc::clone(&served));
        }

        tokio::spawn(async move {
            let run = AssertUnwindSafe(async { handler(body, Arc::clone(&served)).await });
            let error = match run.catch_unwind().await {
                Ok(Ok(())) => return,
                Ok(Err(error)) => error,
                Err(panic) => RemoteError::from_panic(&*panic),
            };
            log::warn!("[Rpc] Stream {id} handler failed: {}", error.message);
            served.fail(error);
        });
    }

    fn teardown(&self) {
        self.closed.cancel();
        // Dropping the sender lets the transport writer finish.
        lock(&self.outbound).take();

        let pending: Vec<_> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(RpcError::TransportClosed));
        }

        let subscriptions: Vec<_> = lock(&self.subscriptions)
            .drain()
            .map(|(_, tx)| tx)
            .collect();
        for tx in subscriptions {
            let _ = tx.send(Err(RpcError::TransportClosed));
        }

        let served: Vec<_> = lock(&self.served).drain().map(|(_, s)| s).collect();
        for stream in served {
            stream.destroy();
        }
    }
}

/// Removes a pending call if its future is dropped before the reply lands.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.shared.pending).remove(&self.id);
    }
}

/// Symmetric RPC multiplexer bound to one transport endpoint.
///
/// Cheap to clone; all clones share the same method table and in-flight state.
#[derive(Clone)]
pub struct Rpc {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Rpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rpc")
            .field("pending", &lock(&self.shared.pending).len())
            .field("subscriptions", &lock(&self.shared.subscriptions).len())
            .field("served", &lock(&self.shared.served).len())
            .field("closed", &self.shared.closed.is_cancelled())
            .finish()
    }
}

impl Rpc {
    /// Bind a multiplexer to `endpoint` and start its receive pump.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(endpoint: Endpoint) -> Self {
        let Endpoint { outbound, inbound } = endpoint;
        let shared = Arc::new(Shared {
            outbound: Mutex::new(Some(outbound)),
            handlers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            served: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            closed: CancellationToken::new(),
        });
        tokio::spawn(Shared::pump(Arc::clone(&shared), inbound));
        Self { shared }
    }

    /// Register a request/response handler for `method`.
    ///
    /// Registering the same slot twice replaces the earlier handler.
    pub fn register_request<Req, Resp, F, Fut>(&self, method: Method<Req, Resp>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |body: Vec<u8>| {
            let call = codec::decode::<Req>(&body).map(&handler);
            async move {
                let response = call
                    .map_err(|e| RemoteError::message(e.to_string()))?
                    .await
                    .map_err(|e| RemoteError::from_anyhow(&e))?;
                codec::encode(&response).map_err(|e| RemoteError::message(e.to_string()))
            }
            .boxed()
        });
        self.insert_handler(method.name(), method.id(), Handler::Request(handler));
    }

    /// Register a server-push handler for `method`.
    ///
    /// The handler receives a [`StreamSink`] for the new subscription. The
    /// stream stays open after the handler returns `Ok`; returning `Err` fails
    /// the stream and relays the error to the subscriber.
    pub fn register_stream<Req, Ev, F, Fut>(&self, method: StreamMethod<Req, Ev>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Ev: Serialize + 'static,
        F: Fn(Req, StreamSink<Ev>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: StreamHandler = Arc::new(move |body: Vec<u8>, served| {
            let call = codec::decode::<Req>(&body).map(|req| handler(req, StreamSink::new(served)));
            async move {
                call.map_err(|e| RemoteError::message(e.to_string()))?
                    .await
                    .map_err(|e| RemoteError::from_anyhow(&e))
            }
            .boxed()
        });
        self.insert_handler(method.name(), method.id(), Handler::Stream(handler));
    }

    fn insert_handler(&self, name: &str, id: u32, handler: Handler) {
        if lock(&self.shared.handlers).insert(id, handler).is_some() {
            log::warn!("[Rpc] Method {name} ({id:#x}) registered twice; last registration wins");
        } else {
            log::debug!("[Rpc] Registered {name} ({id:#x})");
        }
    }

    /// Call `method` on the remote side and wait for its response.
    ///
    /// There is no implicit deadline; see [`Rpc::request_with_timeout`].
    pub async fn request<Req, Resp>(
        &self,
        method: Method<Req, Resp>,
        payload: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = codec::encode(payload)?;
        let (id, reply) = self.shared.begin_call()?;
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        self.shared.send(&Frame::Request {
            id,
            method: method.id(),
            body,
        })?;

        let body = reply.await.unwrap_or(Err(RpcError::TransportClosed))?;
        codec::decode(&body)
    }

    /// [`Rpc::request`] bounded by `timeout`.
    ///
    /// On expiry the pending call is discarded; a late response is dropped
    /// silently. The remote handler is not aborted.
    pub async fn request_with_timeout<Req, Resp>(
        &self,
        method: Method<Req, Resp>,
        payload: &Req,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        tokio::time::timeout(timeout, self.request(method, payload))
            .await
            .unwrap_or(Err(RpcError::Timeout))
    }

    /// Open a server-push stream on `method`.
    pub fn subscribe<Req, Ev>(
        &self,
        method: StreamMethod<Req, Ev>,
        payload: &Req,
    ) -> Result<Subscription<Ev>, RpcError>
    where
        Req: Serialize,
        Ev: DeserializeOwned,
    {
        let body = codec::encode(payload)?;
        let (id, events) = self.shared.begin_subscription()?;

        if let Err(e) = self.shared.send(&Frame::Subscribe {
            id,
            method: method.id(),
            body,
        }) {
            self.shared.forget_subscription(id);
            return Err(e);
        }

        Ok(Subscription::new(id, events, Arc::clone(&self.shared)))
    }

    /// Tear the multiplexer down: fail pending calls, end all streams, and
    /// release the transport. Idempotent.
    pub fn close(&self) {
        self.shared.teardown();
    }

    /// Returns true once the transport is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Wait until the transport closes.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    /// Number of streams this side is currently serving.
    pub fn served_streams(&self) -> usize {
        lock(&self.shared.served).len()
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        lock(&self.shared.pending).len()
    }
}
