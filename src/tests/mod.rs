//! End-to-end tests running a server and its clients in process.
//! Each module covers one area of behavior.

mod error_handling;
mod recovery;
mod streaming;

use crate::{
    Client, ClientOptions, Config, Server, Transport,
    protocol::{ClientCodec, ClientFrame, Request, RequestId, ServerFrame, SessionId},
    session::{ConnectionState, SessionInfo},
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::{future::Future, time::Duration};
use tokio_util::codec::Framed;

/// How long any single step of a test may take.
const STEP: Duration = Duration::from_secs(5);

/// A running server plus helpers for talking to it.
pub struct Test {
    server: Server,
}

impl Test {
    /// Starts a server on the in-process transport.
    pub async fn start() -> Self {
        Self::with_config(Self::config()).await
    }

    /// Starts a server on an ephemeral TCP port.
    pub async fn tcp() -> Self {
        let transport = Transport::Tcp("127.0.0.1:0".parse().unwrap());
        Self::with_config(Self::config().with_transport(transport)).await
    }

    pub async fn with_config(config: Config) -> Self {
        Self::with_server(Server::new(config)).await
    }

    pub async fn with_server(server: Server) -> Self {
        server.start().await.unwrap();
        Self { server }
    }

    /// Defaults with quick streams.
    pub fn config() -> Config {
        Config::default().with_stream(5, Duration::from_millis(1))
    }

    /// Client options with tight reconnect timings.
    pub fn options(&self) -> ClientOptions {
        ClientOptions::from(self.server.config()).with_reconnect(
            Duration::from_millis(5),
            Duration::from_millis(50),
            50,
        )
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub async fn client(&self) -> Client {
        self.client_with(self.options()).await
    }

    pub async fn client_with(&self, options: ClientOptions) -> Client {
        Client::connect(self.server.endpoint(), options)
            .await
            .unwrap()
    }

    /// A connection that speaks frames directly, without a handshake yet.
    pub async fn raw(&self) -> Raw {
        let conn = self.server.endpoint().dial().await.unwrap();
        Raw {
            framed: Framed::new(conn, ClientCodec::default()),
        }
    }

    /// Waits until exactly one session is known, and returns it.
    pub async fn only_session(&self) -> SessionInfo {
        let server = &self.server;
        eventually(|| async move { server.sessions().await.len() == 1 }).await;
        self.server.sessions().await.remove(0)
    }
}

/// A hand-driven connection to a server.
pub struct Raw {
    framed: Framed<crate::transport::Connection, ClientCodec>,
}

impl Raw {
    pub async fn send(&mut self, frame: ClientFrame) {
        self.framed.send(frame).await.unwrap();
    }

    pub async fn request(&mut self, id: RequestId, command: &str, payload: Value) {
        self.send(ClientFrame::Request(Request {
            id,
            command: command.into(),
            payload,
        }))
        .await;
    }

    /// The next frame, or `None` once the server closed the connection.
    pub async fn recv(&mut self) -> Option<ServerFrame> {
        tokio::time::timeout(STEP, self.framed.next())
            .await
            .expect("no frame from the server")
            .map(|frame| frame.unwrap())
    }

    pub async fn hello(&mut self, resume: Option<SessionId>) -> (SessionId, bool) {
        self.send(ClientFrame::Hello {
            client: "raw".into(),
            resume,
        })
        .await;
        match self.recv().await {
            Some(ServerFrame::Welcome { session, resumed }) => (session, resumed),
            other => panic!("expected welcome, got {other:?}"),
        }
    }
}

/// Polls `condition` until it holds.
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(STEP, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Waits until the client reaches `state`.
pub async fn client_state(client: &Client, state: ConnectionState) {
    let mut rx = client.watch_state();
    tokio::time::timeout(STEP, rx.wait_for(|current| *current == state))
        .await
        .expect("client never reached the state")
        .unwrap();
}
