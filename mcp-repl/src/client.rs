use anyhow::Result;
use mcp_server::{Client, ClientOptions, ConnectionState, Endpoint, ModelContext, SessionId};
use serde_json::Value;
use std::{net::SocketAddr, ops};
use tokio::sync::watch;

/// Session client plus the command list the server advertised.
pub struct ReplClient {
    client: Client,
    addr: SocketAddr,
    commands: Vec<String>,
}

impl ReplClient {
    pub async fn connect(addr: SocketAddr, name: &str) -> Result<Self> {
        let options = ClientOptions::default().with_name(name);
        let client = Client::connect(Endpoint::tcp(addr), options).await?;

        let mut repl_client = Self {
            client,
            addr,
            commands: vec![],
        };
        repl_client.refresh_commands().await?;

        Ok(repl_client)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.client.session_id()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.client.watch_state()
    }

    pub async fn refresh_commands(&mut self) -> Result<()> {
        let listed = self.client.send_request("commands", Value::Null).await?;
        self.commands = serde_json::from_value(listed)?;
        Ok(())
    }

    pub fn command_names(&self) -> &[String] {
        &self.commands
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.iter().any(|command| command == name)
    }

    pub async fn call(&self, command: &str, args: Option<Value>) -> Result<Value> {
        let payload = args.unwrap_or(Value::Null);
        Ok(self.client.send_request(command, payload).await?)
    }

    /// Runs a streaming command, handing each intermediate message to `on_message`.
    pub async fn stream<F>(&self, command: &str, args: Option<Value>, on_message: F) -> Result<Value>
    where
        F: FnMut(Value),
    {
        let payload = args.unwrap_or(Value::Null);
        Ok(self.client.stream_with(command, payload, on_message).await?)
    }

    pub async fn model_context(&self) -> Result<Option<ModelContext>> {
        Ok(self.client.get_model_context().await?)
    }

    pub async fn set_model_context(&self, value: Value) -> Result<()> {
        let context = ModelContext::from_value(value)?;
        self.client.set_model_context(&context).await?;
        Ok(())
    }
}

impl ops::Deref for ReplClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}
