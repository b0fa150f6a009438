use crate::protocol::ServerFrame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The attachment of a session to one live connection.
///
/// Frames queued on the link are written in order by the connection's writer
/// task. Dropping the link stops the connection's reader; the writer drains
/// what was already queued and then closes.
pub(crate) struct Link {
    pub(crate) generation: u64,
    frames: mpsc::UnboundedSender<ServerFrame>,
    reader: CancellationToken,
}

impl Link {
    pub(crate) fn new(
        generation: u64,
        frames: mpsc::UnboundedSender<ServerFrame>,
        reader: CancellationToken,
    ) -> Self {
        Self {
            generation,
            frames,
            reader,
        }
    }

    /// Queues a frame. Returns false once the writer has gone away.
    pub(crate) fn send(&self, frame: ServerFrame) -> bool {
        self.frames.send(frame).is_ok()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.cancel();
    }
}
