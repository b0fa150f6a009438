//! Drives one accepted connection: handshake, read pump and writer.

use crate::{
    Error,
    error::{ErrorBody, ErrorKind},
    link::Link,
    protocol::{self, ClientFrame, ServerCodec, ServerFrame, SessionId},
    server::{Shared, Status},
    session::{ConnectionState, Session},
    transport::Connection,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::{io::ReadHalf, sync::mpsc};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{Instrument, debug, debug_span, info, warn};

type Frames = FramedRead<ReadHalf<Connection>, ServerCodec>;

pub(crate) async fn serve(shared: Arc<Shared>, conn: Connection) {
    let (read, write) = tokio::io::split(conn);
    let mut frames = FramedRead::new(read, ServerCodec::new(shared.config.max_frame_length));
    let mut sink = FramedWrite::new(write, ServerCodec::new(shared.config.max_frame_length));

    let (client, resume) = match handshake(&shared, &mut frames).await {
        Ok(hello) => hello,
        Err(err) => {
            debug!(%err, "handshake failed");
            let kind = match err {
                Error::ServerShuttingDown => ErrorKind::ServerShuttingDown,
                _ => ErrorKind::Handshake,
            };
            let reason = ErrorBody {
                kind,
                message: err.to_string(),
            };
            let _ = sink.send(ServerFrame::Disconnect { reason }).await;
            return;
        }
    };

    let (session, generation, rx, reader) = attach(&shared, &client, resume).await;
    let span = debug_span!("connection", session = %session.id(), generation);

    let writer = {
        let _entered = span.enter();
        protocol::spawn_writer(sink, rx)
    };

    // A server that stopped while this connection was handshaking does not
    // take on new sessions.
    if *shared.status.borrow() == Status::Stopped || shared.shutdown.is_cancelled() {
        session.close(Some(ErrorKind::ServerShuttingDown)).await;
        shared.sessions.remove(session.id()).await;
    }

    let lost = pump(&shared, &session, &mut frames, &reader)
        .instrument(span.clone())
        .await;

    if lost && session.connection_lost(generation).await {
        info!(parent: &span, "connection lost");
        expire_after_grace(shared.clone(), session.clone(), generation);
    }

    let _ = writer.await;
}

async fn handshake(
    shared: &Shared,
    frames: &mut Frames,
) -> Result<(String, Option<SessionId>), Error> {
    let first = tokio::select! {
        _ = shared.shutdown.cancelled() => return Err(Error::ServerShuttingDown),
        first = tokio::time::timeout(shared.config.handshake_timeout, frames.next()) => {
            first.map_err(|_| Error::Timeout("hello".into()))?
        }
    };

    match first {
        Some(Ok(ClientFrame::Hello { client, resume })) => Ok((client, resume)),
        Some(Ok(_)) => Err(Error::Handshake("expected hello".into())),
        Some(Err(err)) => Err(err),
        None => Err(Error::ConnectionLost),
    }
}

/// Opens or resumes the session for this connection and attaches a link to
/// it. The `welcome` frame is queued before anything else can use the link.
async fn attach(
    shared: &Shared,
    client: &str,
    mut resume: Option<SessionId>,
) -> (
    Arc<Session>,
    u64,
    mpsc::UnboundedReceiver<ServerFrame>,
    CancellationToken,
) {
    loop {
        let (session, resumed) = shared.sessions.open(client, resume.take()).await;
        let generation = session.next_generation();
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = CancellationToken::new();

        let _ = tx.send(ServerFrame::Welcome {
            session: session.id(),
            resumed,
        });

        match session.attach(Link::new(generation, tx, reader.clone())).await {
            Ok(()) => {
                info!(session = %session.id(), client, resumed, "session attached");
                return (session, generation, rx, reader);
            }
            // Closed between lookup and attach; start over with a fresh one.
            Err(_) => continue,
        }
    }
}

/// Reads frames until the connection ends. Returns true if the transport
/// went away, false if the session let go of the connection.
async fn pump(
    shared: &Arc<Shared>,
    session: &Arc<Session>,
    frames: &mut Frames,
    reader: &CancellationToken,
) -> bool {
    loop {
        let frame = tokio::select! {
            _ = reader.cancelled() => return false,
            _ = shared.shutdown.cancelled() => {
                session.close(Some(ErrorKind::ServerShuttingDown)).await;
                shared.sessions.remove(session.id()).await;
                info!("server dropped, session closed");
                return false;
            }
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(ClientFrame::Request(request))) => {
                shared
                    .dispatcher
                    .spawn(session.clone(), shared.config.clone(), request)
                    .await;
            }
            Some(Ok(ClientFrame::Cancel { id })) => {
                if session.cancel(id, true).await {
                    debug!(id, "request cancelled by client");
                }
            }
            Some(Ok(ClientFrame::Goodbye)) => {
                session.close(None).await;
                shared.sessions.remove(session.id()).await;
                info!("client said goodbye");
                return false;
            }
            Some(Ok(ClientFrame::Hello { .. })) => {
                warn!("ignoring repeated hello");
            }
            Some(Err(err)) => {
                warn!(%err, "dropping unreadable connection");
                return true;
            }
            None => return true,
        }
    }
}

/// Closes the session unless it is resumed within the grace period.
///
/// The timer ends early once the session leaves `Reconnecting`, whether it
/// was resumed or closed by `stop`, so it does not keep the server alive.
fn expire_after_grace(shared: Arc<Shared>, session: Arc<Session>, generation: u64) {
    let grace = shared.config.reconnect_grace;
    tokio::spawn(async move {
        let mut state = session.subscribe();
        let settled = async {
            let _ = state
                .wait_for(|state| *state != ConnectionState::Reconnecting)
                .await;
        };

        tokio::select! {
            _ = settled => return,
            _ = shared.shutdown.cancelled() => {
                if session.close(Some(ErrorKind::ServerShuttingDown)).await {
                    shared.sessions.remove(session.id()).await;
                }
                return;
            }
            _ = tokio::time::sleep(grace) => {}
        }

        if session.expire(generation).await {
            shared.sessions.remove(session.id()).await;
            info!(session = %session.id(), "session expired");
        }
    });
}
