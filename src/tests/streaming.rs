use super::*;
use crate::ErrorKind;
use serde_json::json;

#[tokio::test]
async fn test_stream_yields_ordered_messages() {
    let test = Test::start().await;
    let client = test.client().await;

    let mut stream = client
        .stream_response("test_stream", Value::Null)
        .await
        .unwrap();

    let mut messages = Vec::new();
    while let Some(message) = stream.next_message().await {
        messages.push(message);
    }
    assert!(stream.is_finished());

    assert!(!messages.is_empty());
    assert!(messages.iter().all(Value::is_string));
    insta::assert_snapshot!(
        Value::from(messages),
        @r#"["message 1 of 5","message 2 of 5","message 3 of 5","message 4 of 5","message 5 of 5"]"#
    );
    assert_eq!(
        stream.finish().await.unwrap(),
        json!({ "done": true, "count": 5 })
    );
}

#[tokio::test]
async fn test_stream_count_and_interval() {
    let test = Test::start().await;
    let client = test.client().await;

    let stream = client
        .stream_response("test_stream", json!({ "count": 2, "interval_ms": 0 }))
        .await
        .unwrap();
    let messages: Vec<_> = stream.collect().await;

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].as_ref().unwrap(), "message 2 of 2");
}

#[tokio::test]
async fn test_stream_with_callback() {
    let test = Test::start().await;
    let client = test.client().await;

    let mut seen = Vec::new();
    let result = client
        .stream_with("test_stream", json!({ "count": 3 }), |message| {
            seen.push(message.as_str().unwrap().to_string())
        })
        .await
        .unwrap();

    assert_eq!(seen, ["message 1 of 3", "message 2 of 3", "message 3 of 3"]);
    assert_eq!(result["count"], 3);
}

#[tokio::test]
async fn test_stream_rejects_empty_count() {
    let test = Test::start().await;
    let client = test.client().await;

    let mut stream = client
        .stream_response("test_stream", json!({ "count": 0 }))
        .await
        .unwrap();
    let first = stream.next().await.unwrap();
    assert_eq!(first.unwrap_err().kind(), ErrorKind::InvalidParams);
    assert!(stream.next().await.is_none());

    let err = stream.finish().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParams);
}

#[tokio::test]
async fn test_stream_of_plain_command() {
    let test = Test::start().await;
    let client = test.client().await;

    let mut stream = client.stream_response("ping", Value::Null).await.unwrap();
    assert_eq!(stream.next_message().await, None);
    assert_eq!(stream.finish().await.unwrap(), "pong");
}

#[tokio::test]
async fn test_dropping_a_stream_cancels_it() {
    let test = Test::start().await;
    let client = test.client().await;

    let mut stream = client
        .stream_response("test_stream", json!({ "count": 10_000, "interval_ms": 5 }))
        .await
        .unwrap();
    assert!(stream.next_message().await.is_some());
    assert_eq!(test.only_session().await.outstanding, 1);

    drop(stream);
    let server = test.server();
    eventually(|| async move { server.sessions().await[0].outstanding == 0 }).await;

    // The session keeps working.
    assert_eq!(client.send_request("ping", Value::Null).await.unwrap(), "pong");
}

#[tokio::test]
async fn test_concurrent_streams_stay_separate() {
    let test = Test::start().await;
    let client = test.client().await;

    let (a, b) = futures::join!(
        client.stream_response("test_stream", json!({ "count": 4, "interval_ms": 1 })),
        client.stream_response("test_stream", json!({ "count": 6, "interval_ms": 1 })),
    );
    let (a, b) = futures::join!(
        a.unwrap().collect::<Vec<_>>(),
        b.unwrap().collect::<Vec<_>>()
    );

    assert_eq!(a.len(), 4);
    assert_eq!(b.len(), 6);
    assert_eq!(a[3].as_ref().unwrap(), "message 4 of 4");
    assert_eq!(b[5].as_ref().unwrap(), "message 6 of 6");
}
