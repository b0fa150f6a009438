use super::*;
use crate::{
    ErrorKind, Status,
    protocol::ServerCodec,
};
use serde_json::json;
use tokio::net::TcpListener;

#[tokio::test]
async fn test_reconnect_after_connection_drop() {
    let test = Test::start().await;
    let client = test.client().await;
    let session = client.session_id();

    client.simulate_connection_drop();
    assert!(!client.is_connected());

    // Waits for the reconnect instead of failing.
    assert_eq!(client.send_request("ping", Value::Null).await.unwrap(), "pong");
    assert!(client.is_connected());
    assert_eq!(client.session_id(), session);

    let info = test.only_session().await;
    assert_eq!(Some(info.id), session);
    assert_eq!(info.state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_repeated_drops() {
    let test = Test::start().await;
    let client = test.client().await;

    for _ in 0..5 {
        client.simulate_connection_drop();
        client.wait_connected(STEP).await.unwrap();
        assert_eq!(client.send_request("ping", Value::Null).await.unwrap(), "pong");
    }
    assert_eq!(test.server().sessions().await.len(), 1);
}

#[tokio::test]
async fn test_drop_cancels_in_flight_requests() {
    let test = Test::start().await;
    let client = test.client().await;

    let mut stream = client
        .stream_response("test_stream", json!({ "count": 10_000, "interval_ms": 5 }))
        .await
        .unwrap();
    stream.next_message().await.unwrap();

    client.simulate_connection_drop();
    let err = stream.finish().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    client.wait_connected(STEP).await.unwrap();
    let server = test.server();
    eventually(|| async move {
        let sessions = server.sessions().await;
        sessions[0].state == ConnectionState::Connected && sessions[0].outstanding == 0
    })
    .await;
}

#[tokio::test]
async fn test_restart_keeps_clients_connected() {
    let test = Test::start().await;
    let clients = futures::future::join_all((0..3).map(|_| test.client())).await;
    let sessions: Vec<_> = clients.iter().map(Client::session_id).collect();

    test.server().restart().await.unwrap();
    assert_eq!(test.server().status(), Status::Running);

    for (client, session) in clients.iter().zip(sessions) {
        assert!(client.is_connected());
        assert_eq!(client.session_id(), session);
        assert_eq!(client.send_request("ping", Value::Null).await.unwrap(), "pong");
    }
    let infos = test.server().sessions().await;
    assert_eq!(infos.len(), 3);
    assert!(
        infos
            .iter()
            .all(|info| info.state == ConnectionState::Connected)
    );

    // New clients are accepted after the restart.
    let late = test.client().await;
    assert_eq!(late.send_request("ping", Value::Null).await.unwrap(), "pong");
}

#[tokio::test]
async fn test_restart_cancels_in_flight_requests() {
    let test = Test::start().await;
    let client = test.client().await;

    let mut stream = client
        .stream_response("test_stream", json!({ "count": 10_000, "interval_ms": 5 }))
        .await
        .unwrap();
    stream.next_message().await.unwrap();

    test.server().restart().await.unwrap();

    let err = stream.finish().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(client.is_connected());
    assert_eq!(client.send_request("ping", Value::Null).await.unwrap(), "pong");
}

#[tokio::test]
async fn test_restart_keeps_the_tcp_address() {
    let test = Test::tcp().await;
    let before = test.server().local_addr().await.unwrap();
    let client = test.client().await;

    test.server().restart().await.unwrap();

    assert_eq!(test.server().local_addr().await, Some(before));
    assert_eq!(client.send_request("ping", Value::Null).await.unwrap(), "pong");

    let other = Client::connect(crate::Endpoint::tcp(before), test.options())
        .await
        .unwrap();
    assert_eq!(other.send_request("ping", Value::Null).await.unwrap(), "pong");
}

#[tokio::test]
async fn test_restart_failure_stops_the_server() {
    let test = Test::start().await;
    let client = test.client().await;

    test.server().fail_next_bind();
    let err = test.server().restart().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RestartFailed);
    assert_eq!(test.server().status(), Status::Stopped);
    assert!(test.server().sessions().await.is_empty());

    client_state(&client, ConnectionState::Closed).await;
    let err = client.send_request("ping", Value::Null).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RestartFailed);

    // The server can be brought back.
    test.server().start().await.unwrap();
    let client = test.client().await;
    assert_eq!(client.send_request("ping", Value::Null).await.unwrap(), "pong");
}

#[tokio::test]
async fn test_stop_fails_in_flight_requests() {
    let test = Test::start().await;
    let client = test.client().await;

    let mut stream = client
        .stream_response("test_stream", json!({ "count": 10_000, "interval_ms": 5 }))
        .await
        .unwrap();
    stream.next_message().await.unwrap();

    test.server().stop().await;

    let err = stream.finish().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServerShuttingDown);
    client_state(&client, ConnectionState::Closed).await;

    let err = client.send_request("ping", Value::Null).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServerShuttingDown);
}

#[tokio::test]
async fn test_abandoned_sessions_expire() {
    let config = Test::config().with_reconnect_grace(Duration::from_millis(50));
    let test = Test::with_config(config).await;

    let mut raw = test.raw().await;
    let (session, _) = raw.hello(None).await;
    drop(raw);

    let server = test.server();
    eventually(|| async move { server.sessions().await.is_empty() }).await;

    let mut raw = test.raw().await;
    let (fresh, resumed) = raw.hello(Some(session)).await;
    assert!(!resumed);
    assert_ne!(fresh, session);
}

#[tokio::test]
async fn test_client_gives_up_when_the_server_is_gone() {
    // A peer that welcomes one client, then disappears for good.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, ServerCodec::default());
        let Some(Ok(ClientFrame::Hello { .. })) = framed.next().await else {
            panic!("expected hello");
        };
        framed
            .send(ServerFrame::Welcome {
                session: SessionId::new(),
                resumed: false,
            })
            .await
            .unwrap();
        drop(listener);
        drop(framed);
    });

    let options = ClientOptions::default().with_reconnect(
        Duration::from_millis(1),
        Duration::from_millis(5),
        3,
    );
    let client = Client::connect(crate::Endpoint::tcp(addr), options)
        .await
        .unwrap();
    peer.await.unwrap();

    client_state(&client, ConnectionState::Closed).await;
    let err = client.send_request("ping", Value::Null).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionLost);
}

#[tokio::test]
async fn test_dropping_the_server_closes_sessions() {
    let test = Test::start().await;
    let client = test.client().await;

    let mut stream = client
        .stream_response("test_stream", json!({ "count": 10_000, "interval_ms": 5 }))
        .await
        .unwrap();
    stream.next_message().await.unwrap();

    // A second session waiting for a resume.
    let mut raw = test.raw().await;
    raw.hello(None).await;
    drop(raw);
    let server = test.server();
    eventually(|| async move {
        server
            .sessions()
            .await
            .iter()
            .any(|info| info.state == ConnectionState::Reconnecting)
    })
    .await;

    let Test { server } = test;
    let shared = server.downgrade();
    drop(server);

    let err = stream.finish().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServerShuttingDown);
    client_state(&client, ConnectionState::Closed).await;
    let err = client.send_request("ping", Value::Null).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServerShuttingDown);

    // Nothing is left running on behalf of the dropped server.
    eventually(|| {
        let shared = shared.clone();
        async move { shared.strong_count() == 0 }
    })
    .await;
}

#[tokio::test]
async fn test_stop_ends_grace_timers() {
    let test = Test::start().await;

    let mut raw = test.raw().await;
    raw.hello(None).await;
    drop(raw);
    let server = test.server();
    eventually(|| async move {
        server.sessions().await[0].state == ConnectionState::Reconnecting
    })
    .await;

    test.server().stop().await;
    assert!(test.server().sessions().await.is_empty());

    // Only the controller itself still holds the server state.
    let shared = test.server().downgrade();
    eventually(|| {
        let shared = shared.clone();
        async move { shared.strong_count() == 1 }
    })
    .await;
}
