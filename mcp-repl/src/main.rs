mod client;
mod completer;
mod prompt;
mod repl;
mod term;

use clap::Parser;
use client::ReplClient;
use crossterm::tty::IsTty;
use repl::Repl;
use std::{net::SocketAddr, path::PathBuf};

/// Interactive client for an mcp-server session.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Address of the server to connect to.
    #[arg(default_value = "127.0.0.1:7878")]
    addr: SocketAddr,

    /// Client name reported during the handshake.
    #[arg(long, default_value = "mcp-repl")]
    name: String,

    /// File to keep line history in.
    #[arg(long)]
    history: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    println!("MCP REPL - Model Context Protocol session client");
    println!("================================================");

    let client = ReplClient::connect(args.addr, &args.name).await?;

    println!();
    println!("Connected to: {}", client.addr());
    if let Some(session) = client.session_id() {
        println!("Session: {session}");
    }
    println!("Available commands: {}", client.command_names().len());
    println!();
    println!("Type 'help' ('h') for available commands, 'quit' ('q') to exit.");
    println!();

    let mut repl = Repl::new(client);
    if let Some(history) = args.history {
        repl = repl.with_history(history, 1000);
    }

    if std::io::stdin().is_tty() {
        repl.run().await?;
    } else {
        repl.run_non_interactive().await?;
    }

    println!("Goodbye!");
    Ok(())
}
