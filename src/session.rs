//! Server-side state of one logical client.
//!
//! A session outlives the connections it is attached to: a dropped
//! connection leaves it waiting for a resume, and a server restart suspends
//! it while keeping its connection open.

use crate::{
    Error, Result,
    context::ModelContextStore,
    error::{ErrorBody, ErrorKind},
    link::Link,
    protocol::{Outcome, RequestId, Response, ServerFrame, SessionId},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::{
    sync::{Mutex, watch},
    task::AbortHandle,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub client: String,
    pub state: ConnectionState,
    pub outstanding: usize,
    pub has_context: bool,
}

/// Requests that have been accepted but not answered yet. The abort handle is
/// filled in once the request's task has been spawned.
type Outstanding = HashMap<RequestId, Option<AbortHandle>>;

pub struct Session {
    id: SessionId,
    client: String,
    state: watch::Sender<ConnectionState>,
    // Lock order: `outstanding` before `link`.
    outstanding: Mutex<Outstanding>,
    link: Mutex<Option<Link>>,
    context: ModelContextStore,
    generations: AtomicU64,
    /// Lowest request id still accepted. Only written under `outstanding`.
    next_id: AtomicU64,
}

impl Session {
    pub(crate) fn new(client: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            id: SessionId::new(),
            client: client.into(),
            state,
            outstanding: Default::default(),
            link: Default::default(),
            context: Default::default(),
            generations: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn context(&self) -> &ModelContextStore {
        &self.context
    }

    pub async fn outstanding(&self) -> usize {
        self.outstanding.lock().await.len()
    }

    pub async fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            client: self.client.clone(),
            state: self.state(),
            outstanding: self.outstanding().await,
            has_context: self.context.is_set().await,
        }
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Attaches a freshly handshaken connection.
    ///
    /// Requests still running for an earlier connection are aborted without a
    /// response; that connection's client has already given up on them.
    pub(crate) async fn attach(&self, link: Link) -> Result<()> {
        let mut outstanding = self.outstanding.lock().await;
        if self.state() == ConnectionState::Closed {
            return Err(Error::SessionClosed);
        }
        let aborted = abort_all(&mut outstanding);
        if aborted > 0 {
            debug!(session = %self.id, aborted, "dropped requests from previous connection");
        }
        *self.link.lock().await = Some(link);
        self.state.send_replace(ConnectionState::Connected);
        Ok(())
    }

    /// Records the loss of the connection identified by `generation`.
    ///
    /// Returns false if a newer connection has already taken over or the
    /// session is closed.
    pub(crate) async fn connection_lost(&self, generation: u64) -> bool {
        let mut outstanding = self.outstanding.lock().await;
        let mut link = self.link.lock().await;
        match link.as_ref() {
            Some(current) if current.generation == generation => {}
            _ => return false,
        }
        if self.state() == ConnectionState::Closed {
            return false;
        }

        *link = None;
        self.state.send_replace(ConnectionState::Disconnected);
        let cancelled = abort_all(&mut outstanding);
        debug!(session = %self.id, cancelled, "connection lost, waiting for resume");
        self.state.send_replace(ConnectionState::Reconnecting);
        true
    }

    /// Closes a session nobody resumed since the connection `generation` was
    /// lost.
    pub(crate) async fn expire(&self, generation: u64) -> bool {
        let mut outstanding = self.outstanding.lock().await;
        let link = self.link.lock().await;
        if link.is_some()
            || self.state() != ConnectionState::Reconnecting
            || self.generations.load(Ordering::Relaxed) != generation
        {
            return false;
        }
        abort_all(&mut outstanding);
        self.state.send_replace(ConnectionState::Closed);
        debug!(session = %self.id, "reconnect grace expired");
        true
    }

    /// Parks a connected session while the server restarts. In-flight
    /// requests are answered with `Cancelled`.
    pub(crate) async fn suspend(&self) -> usize {
        let mut outstanding = self.outstanding.lock().await;
        if self.state() != ConnectionState::Connected {
            return 0;
        }
        self.state.send_replace(ConnectionState::Reconnecting);
        let link = self.link.lock().await;
        fail_all(&mut outstanding, link.as_ref(), &ErrorKind::Cancelled.into())
    }

    /// Returns a suspended session to `Connected` if its connection survived.
    pub(crate) async fn resume(&self) -> bool {
        let _outstanding = self.outstanding.lock().await;
        let link = self.link.lock().await;
        if self.state() == ConnectionState::Reconnecting && link.is_some() {
            self.state.send_replace(ConnectionState::Connected);
            true
        } else {
            false
        }
    }

    /// Closes the session for good.
    ///
    /// With a `reason`, every in-flight request is answered with that error
    /// and the client is sent a `disconnect` frame before the link is dropped.
    pub(crate) async fn close(&self, reason: Option<ErrorKind>) -> bool {
        let mut outstanding = self.outstanding.lock().await;
        if self.state() == ConnectionState::Closed {
            return false;
        }
        self.state.send_replace(ConnectionState::Closed);

        let mut link = self.link.lock().await;
        match reason {
            Some(kind) => {
                let body = ErrorBody::from(kind);
                fail_all(&mut outstanding, link.as_ref(), &body);
                if let Some(link) = link.as_ref() {
                    link.send(ServerFrame::Disconnect { reason: body });
                }
            }
            None => {
                abort_all(&mut outstanding);
            }
        }
        *link = None;
        debug!(session = %self.id, "session closed");
        true
    }

    /// Waits until the session can run requests.
    pub(crate) async fn ready(&self, limit: Duration) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = tokio::time::timeout(
            limit,
            rx.wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Connected | ConnectionState::Closed
                )
            }),
        )
        .await
        .map_err(|_| Error::Timeout("the session to reconnect".into()))?
        .map(|state| *state)
        .map_err(|_| Error::SessionClosed)?;

        match state {
            ConnectionState::Closed => Err(Error::SessionClosed),
            _ => Ok(()),
        }
    }

    /// Registers a request id as outstanding.
    ///
    /// Ids must increase over the lifetime of the session, across
    /// reconnects. An id at or below one already seen is refused, so no id
    /// is ever answered twice.
    pub(crate) async fn begin(&self, id: RequestId) -> Result<()> {
        let mut outstanding = self.outstanding.lock().await;
        if self.state() == ConnectionState::Closed {
            return Err(Error::SessionClosed);
        }
        if id < self.next_id.load(Ordering::Relaxed) || outstanding.contains_key(&id) {
            return Err(Error::DuplicateRequest(id));
        }
        self.next_id.store(id.saturating_add(1), Ordering::Relaxed);
        outstanding.insert(id, None);
        Ok(())
    }

    pub(crate) async fn track(&self, id: RequestId, handle: AbortHandle) {
        if let Some(slot) = self.outstanding.lock().await.get_mut(&id) {
            *slot = Some(handle);
        }
    }

    /// Sends an intermediate message for a request that is still outstanding.
    pub(crate) async fn emit(&self, id: RequestId, data: Value) -> Result<()> {
        let outstanding = self.outstanding.lock().await;
        if !outstanding.contains_key(&id) {
            return Err(Error::Cancelled);
        }
        if self.send(ServerFrame::Message { id, data }).await {
            Ok(())
        } else {
            Err(Error::ConnectionLost)
        }
    }

    /// Delivers the response for `id` unless the request was already answered
    /// or cancelled.
    pub(crate) async fn complete(&self, id: RequestId, result: Result<Value>) -> bool {
        let mut outstanding = self.outstanding.lock().await;
        if outstanding.remove(&id).is_none() {
            return false;
        }
        self.send(ServerFrame::Response(Response {
            id,
            outcome: Outcome::from(result),
        }))
        .await
    }

    /// Answers a request that was never registered as outstanding.
    pub(crate) async fn reject(&self, id: RequestId, err: Error) -> bool {
        self.send(ServerFrame::Response(Response {
            id,
            outcome: Outcome::Error(err.to_body()),
        }))
        .await
    }

    /// Cancels one request. With `notify`, the client gets a `Cancelled`
    /// response for it.
    pub(crate) async fn cancel(&self, id: RequestId, notify: bool) -> bool {
        let mut outstanding = self.outstanding.lock().await;
        let Some(handle) = outstanding.remove(&id) else {
            return false;
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        if notify {
            self.send(ServerFrame::Response(Response {
                id,
                outcome: Outcome::Error(ErrorKind::Cancelled.into()),
            }))
            .await;
        }
        true
    }

    async fn send(&self, frame: ServerFrame) -> bool {
        match self.link.lock().await.as_ref() {
            Some(link) => link.send(frame),
            None => false,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn abort_all(outstanding: &mut Outstanding) -> usize {
    let count = outstanding.len();
    for (_, handle) in outstanding.drain() {
        if let Some(handle) = handle {
            handle.abort();
        }
    }
    count
}

fn fail_all(outstanding: &mut Outstanding, link: Option<&Link>, body: &ErrorBody) -> usize {
    let count = outstanding.len();
    for (id, handle) in outstanding.drain() {
        if let Some(handle) = handle {
            handle.abort();
        }
        if let Some(link) = link {
            link.send(ServerFrame::Response(Response {
                id,
                outcome: Outcome::Error(body.clone()),
            }));
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    async fn attached() -> (Session, mpsc::UnboundedReceiver<ServerFrame>, u64) {
        let session = Session::new("test");
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = session.next_generation();
        session
            .attach(Link::new(generation, tx, CancellationToken::new()))
            .await
            .unwrap();
        (session, rx, generation)
    }

    #[tokio::test]
    async fn responds_at_most_once() {
        let (session, mut rx, _) = attached().await;

        session.begin(1).await.unwrap();
        assert!(session.complete(1, Ok("pong".into())).await);
        assert!(!session.complete(1, Ok("again".into())).await);
        assert_eq!(session.outstanding().await, 0);

        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerFrame::Response(Response { id: 1, .. })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn request_ids_are_never_reused() {
        let (session, _rx, generation) = attached().await;

        session.begin(4).await.unwrap();
        let err = session.begin(4).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateRequest);

        session.complete(4, Ok(Value::Null)).await;
        let err = session.begin(4).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateRequest);
        let err = session.begin(2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateRequest);

        // Still refused after the session moved to a new connection.
        session.connection_lost(generation).await;
        let (tx, _rx2) = mpsc::unbounded_channel();
        session
            .attach(Link::new(session.next_generation(), tx, CancellationToken::new()))
            .await
            .unwrap();
        let err = session.begin(4).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateRequest);
        session.begin(5).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_requests_emit_nothing() {
        let (session, mut rx, _) = attached().await;

        session.begin(2).await.unwrap();
        assert!(session.cancel(2, true).await);

        let err = session.emit(2, "late".into()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(!session.complete(2, Ok(Value::Null)).await);

        let ServerFrame::Response(response) = rx.try_recv().unwrap() else {
            panic!("expected the cancellation response");
        };
        assert_eq!(response.outcome, Outcome::Error(ErrorKind::Cancelled.into()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_connection_loss_is_ignored() {
        let (session, _rx, generation) = attached().await;

        let (tx, _rx2) = mpsc::unbounded_channel();
        let newer = session.next_generation();
        session
            .attach(Link::new(newer, tx, CancellationToken::new()))
            .await
            .unwrap();

        assert!(!session.connection_lost(generation).await);
        assert_eq!(session.state(), ConnectionState::Connected);

        assert!(session.connection_lost(newer).await);
        assert_eq!(session.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test]
    async fn expiry_only_hits_abandoned_sessions() {
        let (session, _rx, generation) = attached().await;
        assert!(!session.expire(generation).await);

        session.connection_lost(generation).await;
        let (tx, _rx2) = mpsc::unbounded_channel();
        let newer = session.next_generation();
        session
            .attach(Link::new(newer, tx, CancellationToken::new()))
            .await
            .unwrap();
        // Resumed in the meantime.
        assert!(!session.expire(generation).await);

        session.connection_lost(newer).await;
        assert!(session.expire(newer).await);
        assert_eq!(session.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn suspend_and_resume_keep_the_link() {
        let (session, mut rx, _) = attached().await;
        session.begin(8).await.unwrap();

        assert_eq!(session.suspend().await, 1);
        assert_eq!(session.state(), ConnectionState::Reconnecting);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerFrame::Response(Response { id: 8, .. })
        ));

        assert!(session.resume().await);
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn close_with_reason_notifies_the_client() {
        let (session, mut rx, _) = attached().await;
        session.begin(5).await.unwrap();

        assert!(session.close(Some(ErrorKind::ServerShuttingDown)).await);
        assert!(!session.close(None).await);

        let ServerFrame::Response(response) = rx.recv().await.unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(response.id, 5);
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerFrame::Disconnect { reason } if reason.kind == ErrorKind::ServerShuttingDown
        ));
        // The link is gone, so the channel closes.
        assert!(rx.recv().await.is_none());

        let err = session.begin(6).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
    }

    #[tokio::test]
    async fn ready_resolves_on_resume() {
        let (session, _rx, _) = attached().await;
        session.suspend().await;

        let session = std::sync::Arc::new(session);
        let waiter = tokio::spawn({
            let session = session.clone();
            async move { session.ready(Duration::from_secs(5)).await }
        });

        session.resume().await;
        waiter.await.unwrap().unwrap();
    }
}
