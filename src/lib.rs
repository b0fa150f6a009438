mod client;
mod config;
mod connection;
mod context;
mod dispatcher;
mod error;
pub mod handlers;
mod link;
pub mod protocol;
mod registry;
mod server;
mod session;
#[cfg(test)]
mod tests;
pub mod transport;

pub use client::{Client, ClientOptions, ResponseStream, SetContextResponse};
pub use config::Config;
pub use context::{ModelContext, ModelContextStore};
pub use dispatcher::{Dispatcher, Handler, HandlerFuture, RequestContext};
pub use error::{Error, ErrorBody, ErrorKind, Result};
pub use protocol::{RequestId, SessionId};
pub use server::{Server, Status};
pub use session::{ConnectionState, Session, SessionInfo};
pub use transport::{Endpoint, Transport};
