use crate::{
    Client, ClientOptions, Config, Error, Result,
    connection,
    dispatcher::Dispatcher,
    error::ErrorKind,
    registry::SessionSet,
    session::SessionInfo,
    transport::{Endpoint, Listener},
};
use serde::Serialize;
use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, Semaphore, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Stopped,
    Running,
    Restarting,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Stopped => write!(f, "stopped"),
            Status::Running => write!(f, "running"),
            Status::Restarting => write!(f, "restarting"),
        }
    }
}

/// The server controller.
///
/// Owns the listener and every session. Several servers can live in one
/// process; they share nothing.
pub struct Server {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) config: Arc<Config>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) sessions: SessionSet,
    pub(crate) status: watch::Sender<Status>,
    /// Cancelled when the controller is dropped; every connection closes its
    /// session in response.
    pub(crate) shutdown: CancellationToken,
    endpoint: Endpoint,
    connections: Arc<Semaphore>,
    control: Mutex<Control>,
    #[cfg(test)]
    bind_fault: std::sync::atomic::AtomicBool,
}

#[derive(Default)]
struct Control {
    acceptor: Option<Acceptor>,
    /// Address of the last TCP listener, reused by rebinds.
    addr: Option<SocketAddr>,
}

struct Acceptor {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Acceptor {
    /// Stops accepting and waits until the listener is released.
    async fn stop(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            warn!(%err, "accept loop ended abnormally");
        }
    }
}

impl Server {
    /// A stopped server serving the built-in commands.
    pub fn new(config: Config) -> Self {
        Self::with_dispatcher(config, Dispatcher::with_builtins())
    }

    pub fn with_dispatcher(config: Config, dispatcher: Dispatcher) -> Self {
        let (status, _) = watch::channel(Status::Stopped);
        let shared = Shared {
            endpoint: Endpoint::new(config.memory_buffer),
            connections: Arc::new(Semaphore::new(config.max_connections.max(1))),
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
            sessions: SessionSet::default(),
            status,
            shutdown: CancellationToken::new(),
            control: Mutex::new(Control::default()),
            #[cfg(test)]
            bind_fault: Default::default(),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn status(&self) -> Status {
        *self.shared.status.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.status() == Status::Running
    }

    /// Where clients reach this server. Stays valid across restarts.
    pub fn endpoint(&self) -> Endpoint {
        self.shared.endpoint.clone()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.endpoint.local_addr().await
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.shared.sessions.infos().await
    }

    /// Connects a new client using this server's settings.
    pub async fn connect(&self) -> Result<Client> {
        Client::connect(self.endpoint(), ClientOptions::from(self.config())).await
    }

    pub async fn start(&self) -> Result<()> {
        let mut control = self.shared.control.lock().await;
        if control.acceptor.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.shared.listen(&mut control).await?;
        self.shared.status.send_replace(Status::Running);
        info!(transport = %self.shared.config.transport, addr = ?control.addr, "server started");
        Ok(())
    }

    /// Stops accepting connections and closes every session. In-flight
    /// requests are answered with `ServerShuttingDown`.
    pub async fn stop(&self) {
        let mut control = self.shared.control.lock().await;
        let Some(acceptor) = control.acceptor.take() else {
            return;
        };
        // Connections still handshaking check this before taking a session.
        self.shared.status.send_replace(Status::Stopped);
        acceptor.stop().await;
        self.shared.endpoint.clear().await;
        let closed = self.shared.close_all(ErrorKind::ServerShuttingDown).await;
        info!(closed, "server stopped");
    }

    /// Replaces the listener while keeping established connections.
    ///
    /// Sessions are parked in `Reconnecting` for the duration; their in-flight
    /// requests are cancelled. If the listener cannot be rebound within
    /// `restart_timeout`, all sessions are closed and the server is stopped.
    pub async fn restart(&self) -> Result<()> {
        let mut control = self.shared.control.lock().await;
        let Some(acceptor) = control.acceptor.take() else {
            self.shared.listen(&mut control).await?;
            self.shared.status.send_replace(Status::Running);
            info!("server started by restart");
            return Ok(());
        };

        self.shared.status.send_replace(Status::Restarting);
        acceptor.stop().await;

        let sessions = self.shared.sessions.snapshot().await;
        let mut cancelled = 0;
        for session in &sessions {
            cancelled += session.suspend().await;
        }
        info!(sessions = sessions.len(), cancelled, "restarting server");

        let rebound = tokio::time::timeout(
            self.shared.config.restart_timeout,
            self.shared.listen(&mut control),
        )
        .await
        .unwrap_or_else(|_| Err(Error::Timeout("the listener to rebind".into())));

        if let Err(err) = rebound {
            error!(%err, "restart failed, stopping");
            self.shared.status.send_replace(Status::Stopped);
            self.shared.endpoint.clear().await;
            self.shared.close_all(ErrorKind::RestartFailed).await;
            return Err(Error::RestartFailed(err.to_string()));
        }

        let mut resumed = 0;
        for session in self.shared.sessions.snapshot().await {
            if session.resume().await {
                resumed += 1;
            }
        }
        self.shared.status.send_replace(Status::Running);
        info!(resumed, "server restarted");
        Ok(())
    }

    /// Observes the shared state without keeping it alive.
    #[cfg(test)]
    pub(crate) fn downgrade(&self) -> std::sync::Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    /// Makes the next bind fail, to exercise restart failure.
    #[cfg(test)]
    pub(crate) fn fail_next_bind(&self) {
        self.shared
            .bind_fault
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Tasks hold the shared state, so they have to be told to stop. This
        // also ends the accept loop, whose token is a child of this one.
        self.shared.status.send_replace(Status::Stopped);
        self.shared.shutdown.cancel();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("status", &self.status())
            .field("transport", &self.shared.config.transport)
            .finish_non_exhaustive()
    }
}

impl Shared {
    /// Binds the configured transport and spawns the accept loop.
    async fn listen(self: &Arc<Self>, control: &mut Control) -> Result<()> {
        self.injected_bind_fault()?;

        let listener = Listener::bind(
            self.config.transport,
            &self.endpoint,
            self.config.max_connections,
            control.addr,
        )
        .await?;
        if let Some(addr) = listener.local_addr() {
            control.addr = Some(addr);
        }

        let shutdown = self.shutdown.child_token();
        let task = tokio::spawn(accept_loop(self.clone(), listener, shutdown.clone()));
        control.acceptor = Some(Acceptor { shutdown, task });
        Ok(())
    }

    #[cfg(test)]
    fn injected_bind_fault(&self) -> Result<()> {
        if self
            .bind_fault
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "injected bind failure",
            )
            .into());
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn injected_bind_fault(&self) -> Result<()> {
        Ok(())
    }

    async fn close_all(&self, reason: ErrorKind) -> usize {
        let mut closed = 0;
        for session in self.sessions.drain().await {
            if session.close(Some(reason)).await {
                closed += 1;
            }
        }
        closed
    }
}

async fn accept_loop(shared: Arc<Shared>, mut listener: Listener, shutdown: CancellationToken) {
    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = shared.connections.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(Some(conn)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    connection::serve(shared, conn).await;
                    drop(permit);
                });
            }
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "failed to accept connection");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    debug!("accept loop stopped");
}
