//! Wire frames exchanged between clients and the server.
//!
//! Every frame is a JSON document tagged by `type`, carried inside a
//! length-delimited frame. The framing makes payload size independent of the
//! content, so multi-megabyte strings travel unchanged.

use crate::{Error, Result, error::ErrorBody};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{fmt, marker::PhantomData};
use tokio::{io::AsyncWrite, sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::{Decoder, Encoder, FramedWrite, LengthDelimitedCodec};
use tracing::{Instrument, debug};
use uuid::Uuid;

pub type RequestId = u64;

/// Default upper bound for a single encoded frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub command: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Result(Value),
    Error(ErrorBody),
}

impl Outcome {
    pub fn into_result(self) -> Result<Value> {
        match self {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(body) => Err(Error::Remote(body)),
        }
    }
}

impl From<Result<Value>> for Outcome {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Outcome::Result(value),
            Err(err) => Outcome::Error(err.to_body()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Outcome,
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame on every connection. `resume` re-attaches an existing
    /// session instead of opening a new one.
    Hello {
        client: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume: Option<SessionId>,
    },
    Request(Request),
    Cancel {
        id: RequestId,
    },
    Goodbye,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        session: SessionId,
        resumed: bool,
    },
    /// Intermediate message of a streaming request.
    Message {
        id: RequestId,
        data: Value,
    },
    Response(Response),
    /// The server is closing the session; no further frames follow.
    Disconnect {
        reason: ErrorBody,
    },
}

/// Length-delimited JSON codec decoding `In` frames and encoding `Out` frames.
pub struct FrameCodec<In, Out> {
    inner: LengthDelimitedCodec,
    _frames: PhantomData<fn(Out) -> In>,
}

/// Codec used by the server side of a connection.
pub type ServerCodec = FrameCodec<ClientFrame, ServerFrame>;

/// Codec used by the client side of a connection.
pub type ClientCodec = FrameCodec<ServerFrame, ClientFrame>;

impl<In, Out> FrameCodec<In, Out> {
    pub fn new(max_frame_length: usize) -> Self {
        let inner = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_length)
            .new_codec();
        Self {
            inner,
            _frames: PhantomData,
        }
    }
}

impl<In, Out> Default for FrameCodec<In, Out> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl<In: DeserializeOwned, Out> Decoder for FrameCodec<In, Out> {
    type Item = In;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl<In, Out: Serialize> Encoder<Out> for FrameCodec<In, Out> {
    type Error = Error;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<()> {
        let bytes = serde_json::to_vec(&item)?;
        self.inner.encode(Bytes::from(bytes), dst)?;
        Ok(())
    }
}

/// Spawns a task writing every frame queued on `frames` to `sink`, in order.
///
/// The task closes the sink once all senders are gone and the queue is
/// drained, or as soon as a write fails.
pub(crate) fn spawn_writer<W, In, Out>(
    mut sink: FramedWrite<W, FrameCodec<In, Out>>,
    frames: mpsc::UnboundedReceiver<Out>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Send + Unpin + 'static,
    In: 'static,
    Out: Serialize + Send + 'static,
{
    tokio::spawn(
        async move {
            let mut queued = UnboundedReceiverStream::new(frames).map(Ok::<_, Error>);
            if let Err(err) = sink.send_all(&mut queued).await {
                debug!(%err, "frame writer failed");
            }
            let _ = sink.close().await;
        }
        .in_current_span(),
    )
}
