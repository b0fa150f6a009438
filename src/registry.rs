use crate::{
    protocol::SessionId,
    session::{ConnectionState, Session, SessionInfo},
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

/// The controller's set of sessions.
///
/// Bulk operations work on snapshots, so connections arriving or leaving
/// while the server broadcasts a shutdown never disturb the iteration.
#[derive(Default)]
pub(crate) struct SessionSet {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionSet {
    /// Resumes `resume` if it names a live session, otherwise opens a new one.
    /// The flag reports whether an existing session was resumed.
    pub(crate) async fn open(&self, client: &str, resume: Option<SessionId>) -> (Arc<Session>, bool) {
        if let Some(id) = resume {
            if let Some(session) = self.get(id).await {
                if session.state() != ConnectionState::Closed {
                    return (session, true);
                }
            }
        }

        let session = Arc::new(Session::new(client));
        self.sessions
            .write()
            .await
            .insert(session.id(), session.clone());
        (session, false)
    }

    pub(crate) async fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub(crate) async fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(&id)
    }

    pub(crate) async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub(crate) async fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions
            .write()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect()
    }

    pub(crate) async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub(crate) async fn infos(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::new();
        for session in self.snapshot().await {
            infos.push(session.info().await);
        }
        infos
    }
}
