//! Client side of the protocol.
//!
//! A [`Client`] keeps one session open against a server. When the transport
//! drops it reconnects in the background, resuming the same session, while
//! callers simply wait for the connection to come back.

use crate::{
    Config, Error, Result,
    context::ModelContext,
    error::{ErrorBody, ErrorKind},
    handlers::{GET_MODEL_CONTEXT, SET_MODEL_CONTEXT},
    protocol::{self, ClientCodec, ClientFrame, Request, RequestId, ServerFrame, SessionId},
    session::ConnectionState,
    transport::{Connection, Endpoint},
};
use futures::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{ReadHalf, WriteHalf},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Name sent in the handshake
    pub name: String,

    pub handshake_timeout: Duration,

    pub max_frame_length: usize,

    /// Delay before the second reconnect attempt; doubles on every failure
    pub reconnect_backoff: Duration,

    pub max_reconnect_backoff: Duration,

    /// Attempts made after a connection loss before the client gives up
    pub reconnect_attempts: usize,

    /// How long `send_request` waits for a response, if bounded
    pub request_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ClientOptions {
    fn from(config: &Config) -> Self {
        Self {
            name: config.client.clone(),
            handshake_timeout: config.handshake_timeout,
            max_frame_length: config.max_frame_length,
            reconnect_backoff: Duration::from_millis(25),
            max_reconnect_backoff: Duration::from_secs(1),
            reconnect_attempts: 20,
            request_timeout: None,
        }
    }
}

impl ClientOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_reconnect(
        mut self,
        backoff: Duration,
        max_backoff: Duration,
        attempts: usize,
    ) -> Self {
        self.reconnect_backoff = backoff;
        self.max_reconnect_backoff = max_backoff;
        self.reconnect_attempts = attempts;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

/// Result of `set_model_context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetContextResponse {
    pub success: bool,
}

type Frames = FramedRead<ReadHalf<Connection>, ClientCodec>;
type Sink = FramedWrite<WriteHalf<Connection>, ClientCodec>;

enum Pending {
    Call(oneshot::Sender<Result<Value>>),
    Stream(mpsc::UnboundedSender<StreamEvent>),
}

impl Pending {
    fn settle(self, result: Result<Value>) {
        match self {
            Pending::Call(tx) => {
                let _ = tx.send(result);
            }
            Pending::Stream(tx) => {
                let _ = tx.send(StreamEvent::Done(result));
            }
        }
    }
}

enum StreamEvent {
    Message(Value),
    Done(Result<Value>),
}

/// A handshaken connection that is not in use yet.
struct Established {
    frames: Frames,
    sink: Sink,
    session: SessionId,
    resumed: bool,
}

/// The connection currently in use.
struct Attached {
    frames: Frames,
    writer: JoinHandle<()>,
    dropped: CancellationToken,
}

enum Ended {
    /// The transport went away; worth reconnecting.
    Lost,
    /// The session is over.
    Closed,
}

enum Enqueued {
    Sent(RequestId),
    /// No connection right now.
    Offline(Request, Pending),
    /// The connection is going away.
    Lost,
}

struct Inner {
    endpoint: Endpoint,
    options: ClientOptions,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<SessionId>>,
    next_id: AtomicU64,
    // Lock order: `pending` before `outbox`.
    pending: Mutex<HashMap<RequestId, Pending>>,
    outbox: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    link: Mutex<Option<CancellationToken>>,
    closed: Mutex<Option<ErrorBody>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one session on a server.
///
/// Dropping the handle ends the session as `disconnect` would, without
/// waiting for the goodbye to be written.
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Connects to `endpoint` and performs the handshake.
    pub async fn connect(endpoint: Endpoint, options: ClientOptions) -> Result<Self> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let inner = Arc::new(Inner {
            endpoint,
            options,
            state,
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
            pending: Default::default(),
            outbox: Mutex::new(None),
            link: Mutex::new(None),
            closed: Mutex::new(None),
            supervisor: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        let established = inner.open(None).await?;
        let attached = inner.attach(established);
        let supervisor = tokio::spawn(supervise(inner.clone(), attached));
        *lock(&inner.supervisor) = Some(supervisor);

        Ok(Self { inner })
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Follows state changes, e.g. to observe a reconnect.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Id of the server-side session, which survives reconnects unless the
    /// server expired it.
    pub fn session_id(&self) -> Option<SessionId> {
        *lock(&self.inner.session)
    }

    /// Waits until the client is connected.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.inner.ready())
            .await
            .map_err(|_| Error::Timeout("the client to connect".into()))?
    }

    /// Ends the session. Requests still waiting for a response fail with
    /// `Cancelled`. Calling it again does nothing.
    pub async fn disconnect(&self) {
        if self.state() != ConnectionState::Closed {
            if let Some(outbox) = lock(&self.inner.outbox).as_ref() {
                let _ = outbox.send(ClientFrame::Goodbye);
            }
            self.inner.hang_up();
        }
        self.inner.shutdown.cancel();

        let supervisor = lock(&self.inner.supervisor).take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
    }

    /// Sends a request and waits for its response.
    ///
    /// While the client is reconnecting the request waits for the connection
    /// to come back. Dropping the returned future cancels the request.
    pub async fn send_request(&self, command: impl Into<String>, payload: Value) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let ticket = self
            .inner
            .submit(command.into(), payload, Pending::Call(tx))
            .await?;

        let response = async move { rx.await.unwrap_or(Err(Error::ConnectionLost)) };
        match self.inner.options.request_timeout {
            Some(limit) => tokio::time::timeout(limit, response)
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Timeout(format!("a response to request {}", ticket.id)))
                }),
            None => response.await,
        }
    }

    pub async fn set_model_context(&self, context: &ModelContext) -> Result<SetContextResponse> {
        let value = self
            .send_request(SET_MODEL_CONTEXT, serde_json::to_value(context)?)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// The session's model context, `None` if it was never set.
    pub async fn get_model_context(&self) -> Result<Option<ModelContext>> {
        let value = self.send_request(GET_MODEL_CONTEXT, Value::Null).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Sends a request whose intermediate messages are read one at a time.
    pub async fn stream_response(
        &self,
        command: impl Into<String>,
        payload: Value,
    ) -> Result<ResponseStream> {
        let (tx, events) = mpsc::unbounded_channel();
        let ticket = self
            .inner
            .submit(command.into(), payload, Pending::Stream(tx))
            .await?;
        Ok(ResponseStream {
            events,
            ticket,
            outcome: None,
        })
    }

    /// Runs a streaming request, handing each message to `on_message`, and
    /// returns the final result.
    pub async fn stream_with<F>(
        &self,
        command: impl Into<String>,
        payload: Value,
        mut on_message: F,
    ) -> Result<Value>
    where
        F: FnMut(Value),
    {
        let mut stream = self.stream_response(command, payload).await?;
        while let Some(message) = stream.next_message().await {
            on_message(message);
        }
        stream.finish().await
    }

    /// Cuts the transport without telling the server, as a network failure
    /// would. The client reconnects on its own.
    pub fn simulate_connection_drop(&self) {
        let link = lock(&self.inner.link).take();
        if let Some(link) = link {
            link.cancel();
            // Requests issued from here on wait for the reconnect.
            self.inner.detach();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.state() != ConnectionState::Closed {
            if let Some(outbox) = lock(&self.inner.outbox).as_ref() {
                let _ = outbox.send(ClientFrame::Goodbye);
            }
            self.inner.hang_up();
        }
        self.inner.shutdown.cancel();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("session", &self.session_id())
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Dials the endpoint and exchanges `hello` and `welcome`.
    async fn open(&self, resume: Option<SessionId>) -> Result<Established> {
        let conn = self.endpoint.dial().await?;
        let (read, write) = tokio::io::split(conn);
        let mut frames = FramedRead::new(read, ClientCodec::new(self.options.max_frame_length));
        let mut sink = FramedWrite::new(write, ClientCodec::new(self.options.max_frame_length));

        sink.send(ClientFrame::Hello {
            client: self.options.name.clone(),
            resume,
        })
        .await?;

        let reply = tokio::time::timeout(self.options.handshake_timeout, frames.next())
            .await
            .map_err(|_| Error::Timeout("welcome".into()))?;

        match reply {
            Some(Ok(ServerFrame::Welcome { session, resumed })) => Ok(Established {
                frames,
                sink,
                session,
                resumed,
            }),
            Some(Ok(ServerFrame::Disconnect { reason })) => Err(Error::Remote(reason)),
            Some(Ok(_)) => Err(Error::Handshake("expected welcome".into())),
            Some(Err(err)) => Err(err),
            None => Err(Error::ConnectionLost),
        }
    }

    /// Makes `established` the connection requests go out on.
    fn attach(&self, established: Established) -> Attached {
        let Established {
            frames,
            sink,
            session,
            resumed,
        } = established;

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = protocol::spawn_writer(sink, rx);
        let dropped = CancellationToken::new();

        *lock(&self.session) = Some(session);
        *lock(&self.link) = Some(dropped.clone());
        *lock(&self.outbox) = Some(tx);
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Connected;
            true
        });
        info!(%session, resumed, "connected");

        Attached {
            frames,
            writer,
            dropped,
        }
    }

    /// Reads server frames until the connection ends.
    async fn drive(&self, attached: &mut Attached) -> Ended {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => return Ended::Closed,
                _ = attached.dropped.cancelled() => return Ended::Lost,
                frame = attached.frames.next() => frame,
            };

            match frame {
                Some(Ok(ServerFrame::Message { id, data })) => self.on_message(id, data),
                Some(Ok(ServerFrame::Response(response))) => {
                    let pending = lock(&self.pending).remove(&response.id);
                    if let Some(pending) = pending {
                        pending.settle(response.outcome.into_result());
                    }
                }
                Some(Ok(ServerFrame::Disconnect { reason })) => {
                    info!(kind = %reason.kind, reason = %reason.message, "server closed the session");
                    self.close(reason);
                    return Ended::Closed;
                }
                Some(Ok(ServerFrame::Welcome { .. })) => {
                    warn!("ignoring unexpected welcome");
                }
                Some(Err(err)) => {
                    warn!(%err, "dropping unreadable connection");
                    return Ended::Lost;
                }
                None => return Ended::Lost,
            }
        }
    }

    fn on_message(&self, id: RequestId, data: Value) {
        match lock(&self.pending).get(&id) {
            Some(Pending::Stream(tx)) => {
                let _ = tx.send(StreamEvent::Message(data));
            }
            Some(Pending::Call(_)) => debug!(id, "discarding message for a plain call"),
            None => debug!(id, "discarding message for unknown request"),
        }
    }

    /// Tries to resume the session, backing off between attempts.
    async fn reconnect(&self) -> Option<Established> {
        self.state.send_replace(ConnectionState::Reconnecting);
        let mut delay = self.options.reconnect_backoff;

        for attempt in 1..=self.options.reconnect_attempts {
            let resume = *lock(&self.session);
            let opened = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                opened = self.open(resume) => opened,
            };
            match opened {
                Ok(established) => {
                    if !established.resumed {
                        warn!(previous = ?resume, "session was not resumed, continuing in a new one");
                    }
                    return Some(established);
                }
                Err(err) => debug!(attempt, %err, "reconnect attempt failed"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.options.max_reconnect_backoff);
        }
        None
    }

    /// Forgets the current connection. Requests in flight on it are cancelled.
    fn detach(&self) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Disconnected;
            true
        });
        lock(&self.outbox).take();
        lock(&self.link).take();
        self.fail_pending(|| Error::Cancelled);
    }

    /// Ends the session for good. The first reason given sticks, and
    /// waiting calls fail with it.
    fn close(&self, reason: ErrorBody) {
        self.close_with(reason, || self.closed_error());
    }

    /// Ends the session on the caller's behalf. Waiting calls are cancelled;
    /// later ones fail with `SessionClosed`.
    fn hang_up(&self) {
        self.close_with(ErrorKind::SessionClosed.into(), || Error::Cancelled);
    }

    fn close_with(&self, reason: ErrorBody, err: impl Fn() -> Error) {
        lock(&self.closed).get_or_insert(reason);
        self.state.send_replace(ConnectionState::Closed);
        lock(&self.outbox).take();
        lock(&self.link).take();
        self.fail_pending(err);
    }

    fn closed_error(&self) -> Error {
        match lock(&self.closed).clone() {
            Some(body) if body.kind == ErrorKind::ConnectionLost => Error::ConnectionLost,
            Some(body) if body.kind == ErrorKind::SessionClosed => Error::SessionClosed,
            Some(body) => Error::Remote(body),
            None => Error::SessionClosed,
        }
    }

    fn fail_pending(&self, err: impl Fn() -> Error) {
        let drained: Vec<_> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        for pending in drained {
            pending.settle(Err(err()));
        }
    }

    /// Waits until requests can be sent.
    async fn ready(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Connected | ConnectionState::Closed
                )
            })
            .await
            .map(|state| *state)
            .map_err(|_| Error::SessionClosed)?;

        match state {
            ConnectionState::Closed => Err(self.closed_error()),
            _ => Ok(()),
        }
    }

    async fn submit(
        self: &Arc<Self>,
        command: String,
        payload: Value,
        pending: Pending,
    ) -> Result<Ticket> {
        let mut request = Request {
            id: 0,
            command,
            payload,
        };
        let mut pending = pending;
        loop {
            self.ready().await?;
            match self.enqueue(request, pending) {
                Enqueued::Sent(id) => {
                    return Ok(Ticket {
                        inner: self.clone(),
                        id,
                    });
                }
                // Lost the connection after `ready`; wait for the next one.
                Enqueued::Offline(r, p) => {
                    request = r;
                    pending = p;
                }
                Enqueued::Lost => return Err(Error::ConnectionLost),
            }
        }
    }

    fn enqueue(&self, mut request: Request, pending: Pending) -> Enqueued {
        let mut table = lock(&self.pending);
        let outbox = lock(&self.outbox);
        let Some(tx) = outbox.as_ref() else {
            return Enqueued::Offline(request, pending);
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        request.id = id;
        if tx.send(ClientFrame::Request(request)).is_err() {
            return Enqueued::Lost;
        }
        // Still holding `pending`, so the response cannot be handled first.
        table.insert(id, pending);
        Enqueued::Sent(id)
    }

    /// Gives up on a request, telling the server if it is still running.
    fn abandon(&self, id: RequestId) {
        let removed = lock(&self.pending).remove(&id);
        if removed.is_some() {
            if let Some(outbox) = lock(&self.outbox).as_ref() {
                let _ = outbox.send(ClientFrame::Cancel { id });
            }
            debug!(id, "request abandoned");
        }
    }
}

async fn supervise(inner: Arc<Inner>, mut attached: Attached) {
    loop {
        match inner.drive(&mut attached).await {
            Ended::Closed => {
                // Let the writer flush a pending goodbye.
                lock(&inner.outbox).take();
                let _ = attached.writer.await;
                break;
            }
            Ended::Lost => {
                info!("connection lost, reconnecting");
                inner.detach();
                attached.writer.abort();
                drop(attached);

                match inner.reconnect().await {
                    Some(established) => attached = inner.attach(established),
                    None => {
                        if !inner.shutdown.is_cancelled() {
                            warn!("giving up on reconnecting");
                        }
                        inner.close(ErrorKind::ConnectionLost.into());
                        break;
                    }
                }
            }
        }
    }
    debug!("client supervisor stopped");
}

/// Cancels its request when dropped, unless it has been answered.
struct Ticket {
    inner: Arc<Inner>,
    id: RequestId,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.inner.abandon(self.id);
    }
}

/// Messages of a streaming request, followed by its final result.
///
/// Messages are read in the order the server produced them. Dropping the
/// stream before it finished cancels the request on the server.
pub struct ResponseStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    ticket: Ticket,
    outcome: Option<Result<Value>>,
}

impl ResponseStream {
    pub fn id(&self) -> RequestId {
        self.ticket.id
    }

    /// The next intermediate message, or `None` once the request finished.
    pub async fn next_message(&mut self) -> Option<Value> {
        while self.outcome.is_none() {
            match self.events.recv().await {
                Some(StreamEvent::Message(data)) => return Some(data),
                Some(StreamEvent::Done(result)) => self.outcome = Some(result),
                None => self.outcome = Some(Err(Error::ConnectionLost)),
            }
        }
        None
    }

    /// Skips any remaining messages and returns the final result.
    pub async fn finish(mut self) -> Result<Value> {
        while self.next_message().await.is_some() {}
        self.outcome.take().unwrap_or(Err(Error::Cancelled))
    }

    /// Whether the final result has arrived.
    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Yields each message, then the final error if the request failed.
impl Stream for ResponseStream {
    type Item = Result<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.outcome.is_some() {
            return Poll::Ready(None);
        }

        let event = match this.events.poll_recv(cx) {
            Poll::Ready(event) => event,
            Poll::Pending => return Poll::Pending,
        };
        match event {
            Some(StreamEvent::Message(data)) => Poll::Ready(Some(Ok(data))),
            Some(StreamEvent::Done(Ok(value))) => {
                this.outcome = Some(Ok(value));
                Poll::Ready(None)
            }
            Some(StreamEvent::Done(Err(err))) => {
                this.outcome = Some(Err(Error::Remote(err.to_body())));
                Poll::Ready(Some(Err(err)))
            }
            None => {
                this.outcome = Some(Err(Error::ConnectionLost));
                Poll::Ready(Some(Err(Error::ConnectionLost)))
            }
        }
    }
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("id", &self.ticket.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
