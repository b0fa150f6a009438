//! Listeners and dialable endpoints.
//!
//! Two transports are supported: an in-process duplex channel, used by tests
//! and embedders, and TCP. Both hand out boxed byte streams so everything
//! above this module is transport agnostic.

use std::{fmt, io, net::SocketAddr, str::FromStr, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream},
    net::{TcpListener, TcpStream},
    sync::{Mutex, mpsc},
};

pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

/// A connected byte stream.
pub type Connection = Box<dyn Io>;

/// Which transport a server listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Memory,
    Tcp(SocketAddr),
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Memory => f.write_str("memory"),
            Transport::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "memory" {
            return Ok(Transport::Memory);
        }
        let addr = s.strip_prefix("tcp://").unwrap_or(s);
        addr.parse()
            .map(Transport::Tcp)
            .map_err(|err| format!("invalid transport {s:?}: {err}"))
    }
}

#[derive(Clone, Default)]
enum Slot {
    #[default]
    Unbound,
    Tcp(SocketAddr),
    Memory(mpsc::Sender<DuplexStream>),
}

/// Where clients dial to reach a server.
///
/// The endpoint outlives individual listeners: a restart rebinds and
/// republishes it, so clients holding a clone keep reaching the server.
#[derive(Clone, Default)]
pub struct Endpoint {
    slot: Arc<Mutex<Slot>>,
    memory_buffer: usize,
}

impl Endpoint {
    pub(crate) fn new(memory_buffer: usize) -> Self {
        Self {
            slot: Default::default(),
            memory_buffer,
        }
    }

    /// An endpoint for a TCP server that is not owned by this process.
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Tcp(addr))),
            memory_buffer: 0,
        }
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.slot.lock().await {
            Slot::Tcp(addr) => Some(*addr),
            _ => None,
        }
    }

    pub async fn is_bound(&self) -> bool {
        !matches!(&*self.slot.lock().await, Slot::Unbound)
    }

    pub async fn dial(&self) -> io::Result<Connection> {
        let slot = self.slot.lock().await.clone();
        match slot {
            Slot::Unbound => Err(not_listening()),
            Slot::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Slot::Memory(acceptor) => {
                let (client, server) = tokio::io::duplex(self.memory_buffer);
                acceptor.send(server).await.map_err(|_| not_listening())?;
                Ok(Box::new(client))
            }
        }
    }

    pub(crate) async fn clear(&self) {
        *self.slot.lock().await = Slot::Unbound;
    }

    async fn publish(&self, slot: Slot) {
        *self.slot.lock().await = slot;
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("memory_buffer", &self.memory_buffer)
            .finish_non_exhaustive()
    }
}

fn not_listening() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, "server is not listening")
}

pub(crate) enum Listener {
    Tcp(TcpListener),
    Memory(mpsc::Receiver<DuplexStream>),
}

impl Listener {
    /// Binds `transport` and publishes the result on `endpoint`.
    ///
    /// `previous` is the address of an earlier TCP listener; it is reused when
    /// the configured port is ephemeral so clients can find the server again.
    pub(crate) async fn bind(
        transport: Transport,
        endpoint: &Endpoint,
        backlog: usize,
        previous: Option<SocketAddr>,
    ) -> io::Result<Self> {
        match transport {
            Transport::Memory => {
                let (tx, rx) = mpsc::channel(backlog.max(1));
                endpoint.publish(Slot::Memory(tx)).await;
                Ok(Listener::Memory(rx))
            }
            Transport::Tcp(addr) => {
                let addr = match previous {
                    Some(previous) if addr.port() == 0 => previous,
                    _ => addr,
                };
                let listener = TcpListener::bind(addr).await?;
                endpoint.publish(Slot::Tcp(listener.local_addr()?)).await;
                Ok(Listener::Tcp(listener))
            }
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Memory(_) => None,
        }
    }

    /// Waits for the next connection. `Ok(None)` means the listener is closed.
    pub(crate) async fn accept(&mut self) -> io::Result<Option<Connection>> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                tracing::debug!(%peer, "accepted tcp connection");
                Ok(Some(Box::new(stream)))
            }
            Listener::Memory(rx) => Ok(rx.recv().await.map(|stream| Box::new(stream) as Connection)),
        }
    }
}
