use super::*;
use crate::{Dispatcher, Error, ErrorKind, RequestContext};
use bytes::Bytes;
use serde_json::json;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[tokio::test]
async fn test_errors_keep_kind_and_message() {
    let test = Test::start().await;
    let client = test.client().await;

    let err = client
        .send_request("set_model_context", json!({ "model": "gpt-4" }))
        .await
        .unwrap_err();

    let Error::Remote(body) = &err else {
        panic!("expected a server error, got {err:?}");
    };
    assert_eq!(body.kind, ErrorKind::InvalidContext);
    assert_eq!(err.to_string(), body.message);
    insta::assert_snapshot!(err, @"Invalid context: missing `parameters`");
}

#[tokio::test]
async fn test_request_timeout_cancels_on_the_server() {
    let test = Test::start().await;
    let client = test
        .client_with(test.options().with_request_timeout(Duration::from_millis(50)))
        .await;

    let err = client
        .send_request("test_stream", json!({ "count": 10_000, "interval_ms": 5 }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let server = test.server();
    eventually(|| async move { server.sessions().await[0].outstanding == 0 }).await;
    assert_eq!(client.send_request("ping", Value::Null).await.unwrap(), "pong");
}

#[tokio::test]
async fn test_dropped_request_future_cancels() {
    let test = Test::start().await;
    let client = test.client().await;

    let slow = client.send_request("test_stream", json!({ "count": 10_000, "interval_ms": 5 }));
    let timed_out = tokio::time::timeout(Duration::from_millis(50), slow).await;
    assert!(timed_out.is_err());

    let server = test.server();
    eventually(|| async move { server.sessions().await[0].outstanding == 0 }).await;
}

#[tokio::test]
async fn test_malformed_frame_is_refused() {
    let test = Test::start().await;
    let conn = test.server().endpoint().dial().await.unwrap();
    let mut framed = Framed::new(conn, LengthDelimitedCodec::new());

    framed.send(Bytes::from_static(b"{not json")).await.unwrap();
    let reply = framed.next().await.unwrap().unwrap();
    let frame: ServerFrame = serde_json::from_slice(&reply).unwrap();

    let ServerFrame::Disconnect { reason } = frame else {
        panic!("expected the connection to be refused, got {frame:?}");
    };
    assert_eq!(reason.kind, ErrorKind::Handshake);
    assert!(framed.next().await.is_none());
}

#[tokio::test]
async fn test_unreadable_frame_drops_the_connection() {
    let test = Test::start().await;
    let mut raw = test.raw().await;
    raw.hello(None).await;

    let Raw { framed } = raw;
    let mut framed = framed.map_codec(|_| LengthDelimitedCodec::new());
    framed
        .send(Bytes::from_static(br#"{"type":"teleport"}"#))
        .await
        .unwrap();
    assert!(framed.next().await.is_none());

    // The session waits for a resume rather than disappearing.
    let info = test.only_session().await;
    assert_eq!(info.state, ConnectionState::Reconnecting);
}

async fn fail(_cx: RequestContext, _payload: Value) -> crate::Result<Value> {
    Err(Error::Internal("backend unavailable".into()))
}

async fn explode(_cx: RequestContext, _payload: Value) -> crate::Result<Value> {
    panic!("handler bug");
}

#[tokio::test]
async fn test_handler_failures_stay_contained() {
    let mut dispatcher = Dispatcher::with_builtins();
    dispatcher.register("fail", fail);
    dispatcher.register("explode", explode);
    let test = Test::with_server(Server::with_dispatcher(Test::config(), dispatcher)).await;

    let first = test.client().await;
    let second = test.client().await;

    let err = first.send_request("fail", Value::Null).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().contains("backend unavailable"));

    let err = first.send_request("explode", Value::Null).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().contains("panicked"));

    assert_eq!(first.send_request("ping", Value::Null).await.unwrap(), "pong");
    assert_eq!(second.send_request("ping", Value::Null).await.unwrap(), "pong");
    assert_eq!(test.server().sessions().await.len(), 2);
}
