//! Built-in commands.

use crate::{
    Error, Result,
    context::ModelContext,
    dispatcher::{Dispatcher, RequestContext},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

pub const PING: &str = "ping";
pub const ECHO: &str = "echo";
pub const SET_MODEL_CONTEXT: &str = "set_model_context";
pub const GET_MODEL_CONTEXT: &str = "get_model_context";
pub const TEST_STREAM: &str = "test_stream";
pub const COMMANDS: &str = "commands";
pub const SESSION_INFO: &str = "session_info";

pub(crate) fn register(dispatcher: &mut Dispatcher) {
    dispatcher.register(PING, ping);
    dispatcher.register(ECHO, echo);
    dispatcher.register(SET_MODEL_CONTEXT, set_model_context);
    dispatcher.register(GET_MODEL_CONTEXT, get_model_context);
    dispatcher.register(TEST_STREAM, test_stream);
    dispatcher.register(COMMANDS, commands);
    dispatcher.register(SESSION_INFO, session_info);
}

async fn ping(_cx: RequestContext, _payload: Value) -> Result<Value> {
    Ok(Value::from("pong"))
}

/// Returns `{ data }` exactly as received. The value is moved, never copied
/// or re-encoded, so large payloads come back byte for byte.
async fn echo(_cx: RequestContext, payload: Value) -> Result<Value> {
    let Value::Object(mut fields) = payload else {
        return Err(Error::InvalidParams(
            "echo expects an object with a `data` field".into(),
        ));
    };
    let data = fields
        .remove("data")
        .ok_or_else(|| Error::InvalidParams("missing `data`".into()))?;
    Ok(json!({ "data": data }))
}

async fn set_model_context(cx: RequestContext, payload: Value) -> Result<Value> {
    let context = ModelContext::from_value(payload)?;
    debug!(session = %cx.session_id(), model = %context.model, "model context updated");
    cx.model_context().set(context).await;
    Ok(json!({ "success": true }))
}

/// `null` until a context has been set.
async fn get_model_context(cx: RequestContext, _payload: Value) -> Result<Value> {
    match cx.model_context().get().await {
        Some(context) => Ok(serde_json::to_value(context)?),
        None => Ok(Value::Null),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StreamParams {
    count: Option<usize>,
    interval_ms: Option<u64>,
}

impl StreamParams {
    fn parse(payload: Value) -> Result<Self> {
        if payload.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(payload).map_err(|err| Error::InvalidParams(err.to_string()))
    }
}

/// Produces `count` string messages, each sent as soon as it exists, then
/// acknowledges with `{ done, count }`.
async fn test_stream(cx: RequestContext, payload: Value) -> Result<Value> {
    let params = StreamParams::parse(payload)?;
    let count = params.count.unwrap_or(cx.config().stream_length);
    if count == 0 {
        return Err(Error::InvalidParams("`count` must be at least 1".into()));
    }
    let interval = params
        .interval_ms
        .map(Duration::from_millis)
        .unwrap_or(cx.config().stream_interval);

    for index in 1..=count {
        if index > 1 {
            tokio::time::sleep(interval).await;
        }
        cx.emit(format!("message {index} of {count}")).await?;
    }

    Ok(json!({ "done": true, "count": count }))
}

async fn commands(cx: RequestContext, _payload: Value) -> Result<Value> {
    Ok(json!(cx.commands()))
}

async fn session_info(cx: RequestContext, _payload: Value) -> Result<Value> {
    Ok(json!({
        "session": cx.session_id(),
        "client": cx.client(),
        "state": cx.session().state(),
    }))
}
