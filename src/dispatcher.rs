//! Command routing.
//!
//! Every request runs in its own task so a slow handler never holds up other
//! requests of the same session, let alone other sessions.

use crate::{
    Config, Error, Result,
    context::ModelContextStore,
    protocol::{Request, RequestId, SessionId},
    session::Session,
};
use futures::{FutureExt, future::BoxFuture};
use serde_json::Value;
use std::{collections::HashMap, future::Future, panic::AssertUnwindSafe, sync::Arc};
use tracing::{Instrument, debug, debug_span, warn};

pub type HandlerFuture = BoxFuture<'static, Result<Value>>;

/// Server-side implementation of one command.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, cx: RequestContext, payload: Value) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn call(&self, cx: RequestContext, payload: Value) -> HandlerFuture {
        Box::pin(self(cx, payload))
    }
}

/// What a handler knows about the request it serves.
#[derive(Clone)]
pub struct RequestContext {
    id: RequestId,
    session: Arc<Session>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<Config>,
}

impl RequestContext {
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Name the client gave in its handshake.
    pub fn client(&self) -> &str {
        self.session.client()
    }

    pub fn model_context(&self) -> &ModelContextStore {
        self.session.context()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn commands(&self) -> Vec<String> {
        self.dispatcher.commands()
    }

    /// Sends an intermediate message to the caller right away.
    ///
    /// Fails with `Cancelled` once the request has been cancelled; handlers
    /// should stop producing at that point.
    pub async fn emit(&self, data: impl Into<Value>) -> Result<()> {
        self.session.emit(self.id, data.into()).await
    }
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Dispatcher {
    /// A dispatcher without any commands.
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher serving the built-in command set.
    pub fn with_builtins() -> Self {
        let mut dispatcher = Self::new();
        crate::handlers::register(&mut dispatcher);
        dispatcher
    }

    /// Registers `handler` under `command`, returning any handler it replaces.
    pub fn register(
        &mut self,
        command: impl Into<String>,
        handler: impl Handler,
    ) -> Option<Arc<dyn Handler>> {
        self.handlers.insert(command.into(), Arc::new(handler))
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    pub fn commands(&self) -> Vec<String> {
        let mut commands: Vec<_> = self.handlers.keys().cloned().collect();
        commands.sort();
        commands
    }

    fn dispatch(&self, cx: RequestContext, command: &str, payload: Value) -> HandlerFuture {
        match self.handlers.get(command) {
            Some(handler) => handler.call(cx, payload),
            None => {
                let err = Error::InvalidCommand(command.to_string());
                Box::pin(async move { Err::<Value, _>(err) })
            }
        }
    }

    /// Accepts `request` for `session` and runs it on its own task.
    ///
    /// The response is delivered through the session, which drops it if the
    /// request was cancelled in the meantime.
    pub(crate) async fn spawn(
        self: &Arc<Self>,
        session: Arc<Session>,
        config: Arc<Config>,
        request: Request,
    ) {
        let Request {
            id,
            command,
            payload,
        } = request;

        if let Err(err) = session.begin(id).await {
            match err {
                Error::DuplicateRequest(_) => {
                    warn!(session = %session.id(), id, "ignoring duplicate request id");
                }
                err => {
                    // Never registered, so this is the only response for `id`.
                    session.reject(id, err).await;
                }
            }
            return;
        }

        let cx = RequestContext {
            id,
            session: session.clone(),
            dispatcher: self.clone(),
            config: config.clone(),
        };
        let dispatcher = self.clone();
        let span = debug_span!("request", session = %session.id(), id, command = %command);

        let task = tokio::spawn(
            {
                let session = session.clone();
                async move {
                    let result = match session.ready(config.restart_timeout).await {
                        Ok(()) => {
                            let call = dispatcher.dispatch(cx, &command, payload);
                            AssertUnwindSafe(call).catch_unwind().await.unwrap_or_else(|_| {
                                Err(Error::Internal(format!("handler for `{command}` panicked")))
                            })
                        }
                        Err(err) => Err(err),
                    };
                    if let Err(err) = &result {
                        debug!(%err, "request failed");
                    }
                    session.complete(id, result).await;
                }
            }
            .instrument(span),
        );

        session.track(id, task.abort_handle()).await;
    }
}
