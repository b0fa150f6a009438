use crate::{client::ReplClient, completer::Completer, prompt::ReplPrompt, term::*};
use mcp_server::ConnectionState;
use nu_ansi_term::{Color, Style};
use reedline::{
    self, ColumnarMenu, DefaultHinter, DefaultValidator, Emacs, ExampleHighlighter,
    ExternalPrinter, FileBackedHistory, KeyCode, KeyModifiers, Keybindings, MenuBuilder, Reedline,
    ReedlineEvent, ReedlineMenu, Signal, default_emacs_keybindings,
};
use serde_json::Value;
use std::{boxed::Box, ops::ControlFlow, path::PathBuf};

/// Interactive shell over one server session.
pub struct Repl {
    prompt: ReplPrompt,
    history: Option<(PathBuf, usize)>,
    client: ReplClient,
    keybindings: Keybindings,
    external_printer: ExternalPrinter<String>,
    hinter_style: Style,
}

impl Repl {
    pub fn new(client: ReplClient) -> Self {
        let style = Style::new().italic().fg(Color::LightGray);
        let mut keybindings = default_emacs_keybindings();
        keybindings.add_binding(
            KeyModifiers::NONE,
            KeyCode::Tab,
            ReedlineEvent::Menu("completion_menu".to_string()),
        );
        let left = paint_green_bold(&format!("{}> ", client.addr()));
        let prompt = ReplPrompt::new(&left, client.watch_state());

        Self {
            history: None,
            hinter_style: style,
            prompt,
            client,
            keybindings,
            external_printer: ExternalPrinter::new(2048),
        }
    }

    /// Keeps line history in a file at `history_path`.
    pub fn with_history(mut self, history_path: PathBuf, capacity: usize) -> Self {
        self.history = Some((history_path, capacity));
        self
    }

    async fn handle_command(
        &mut self,
        command: &str,
        args: Option<&str>,
    ) -> anyhow::Result<ControlFlow<()>> {
        match command {
            "h" | "help" => self.show_help(),
            "commands" | "list" => {
                self.client.refresh_commands().await?;
                self.list_commands();
            }
            "session" => self.show_session(),
            "context" => match args {
                Some(args) => {
                    self.client.set_model_context(parse_args(args)?).await?;
                    println!("Model context updated.");
                }
                None => match self.client.model_context().await? {
                    Some(context) => println!("{}", serde_json::to_string_pretty(&context)?),
                    None => println!("No model context set."),
                },
            },
            "stream" => {
                let Some((target, args)) = args.map(split_args) else {
                    anyhow::bail!("usage: stream <command> [args]");
                };
                let args = args.map(parse_args).transpose()?;
                let result = self
                    .client
                    .stream(target, args, |message| println!("  {}", render(&message)))
                    .await?;
                println!("Result:\n\n{}\n", serde_json::to_string_pretty(&result)?);
            }
            "drop" => {
                self.client.simulate_connection_drop();
                println!("Connection dropped; the client will resume the session.");
            }
            "q" | "quit" | "exit" => {
                self.client.disconnect().await;
                return Ok(ControlFlow::Break(()));
            }
            _ => {
                if !self.client.has_command(command) {
                    println!("Unknown command: {command}. Type 'help' for available commands.");
                    return Ok(ControlFlow::Continue(()));
                }
                let args = args.map(parse_args).transpose()?;
                let result = self.client.call(command, args).await?;
                println!("Result:\n\n{}\n", serde_json::to_string_pretty(&result)?);
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn show_help(&self) {
        println!("Available commands:");
        println!("  help                     - Show this help message");
        println!("  commands, list           - List the server's commands");
        println!("  session                  - Show the current session");
        println!("  context [json]           - Show or replace the model context");
        println!("  stream <command> [json]  - Run a command and print its messages as they arrive");
        println!("  drop                     - Drop the connection and resume the session");
        println!("  q, quit, exit            - Close the session and exit");
        println!();
        println!("Server commands:");
        for name in self.client.command_names() {
            println!("  {name}");
        }
        println!();
        println!("To send a command with a payload:");
        println!("  <command> {{data: 'value'}}");
    }

    fn list_commands(&self) {
        for name in self.client.command_names() {
            println!("  {name}");
        }
    }

    fn show_session(&self) {
        println!("Session:");
        println!("  Server: {}", self.client.addr());
        match self.client.session_id() {
            Some(id) => println!("  Id: {id}"),
            None => println!("  Id: -"),
        }
        println!("  State: {}", self.client.state());
    }

    async fn process_line(&mut self, line: String) -> anyhow::Result<ControlFlow<()>> {
        match parse_line(&line) {
            Some((command, args)) => self.handle_command(command, args).await,
            None => Ok(ControlFlow::Continue(())),
        }
    }

    fn build_line_editor(&mut self) -> anyhow::Result<Reedline> {
        let completer = Completer::new(&self.client);
        let valid_commands = completer.commands().to_vec();

        let completion_menu = Box::new(ColumnarMenu::default().with_name("completion_menu"));
        let mut line_editor = Reedline::create()
            .with_edit_mode(Box::new(Emacs::new(self.keybindings.clone())))
            .with_completer(Box::new(completer))
            .with_menu(ReedlineMenu::EngineCompleter(completion_menu))
            .with_highlighter(Box::new(ExampleHighlighter::new(valid_commands)))
            .with_validator(Box::new(DefaultValidator))
            .with_partial_completions(true)
            .with_quick_completions(true)
            .with_external_printer(self.external_printer.clone())
            .with_hinter(Box::new(
                DefaultHinter::default().with_style(self.hinter_style),
            ));

        if let Some((history_path, capacity)) = &self.history {
            let history = FileBackedHistory::with_file(*capacity, history_path.clone())?;
            line_editor = line_editor.with_history(Box::new(history));
        }

        Ok(line_editor)
    }

    /// Reports connection changes above the prompt while the editor is waiting for input.
    fn watch_connection(&self) -> tokio::task::JoinHandle<()> {
        let mut state = self.client.watch_state();
        let printer = self.external_printer.clone();
        tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let current = *state.borrow_and_update();
                let line = match current {
                    ConnectionState::Connected => paint_green_bold("connection restored"),
                    other => paint_yellow_bold(&format!("connection {other}")),
                };
                if printer.print(line).is_err() || current == ConnectionState::Closed {
                    break;
                }
            }
        })
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut line_editor = self.build_line_editor()?;
        let watcher = self.watch_connection();

        loop {
            match line_editor.read_line(&self.prompt)? {
                Signal::Success(line) => match self.process_line(line).await {
                    Ok(ControlFlow::Continue(())) => {}
                    Ok(ControlFlow::Break(())) => break,
                    Err(err) => println!("Error: {}", paint_yellow_bold(&err.to_string())),
                },
                Signal::CtrlC | Signal::CtrlD => {
                    self.client.disconnect().await;
                    break;
                }
            }
        }

        watcher.abort();
        Ok(())
    }

    pub async fn run_non_interactive(&mut self) -> anyhow::Result<()> {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        while let Some(line) = lines.next_line().await? {
            match self.process_line(line).await {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => return Ok(()),
                Err(err) => println!("Error: {err}"),
            }
        }

        self.client.disconnect().await;
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<(&str, Option<&str>)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(split_args(line))
}

fn split_args(line: &str) -> (&str, Option<&str>) {
    match line.trim().split_once(' ') {
        Some((command, args)) if !args.trim().is_empty() => (command, Some(args.trim())),
        Some((command, _)) => (command, None),
        None => (line.trim(), None),
    }
}

/// Accepts JSON5 so payloads can be typed without quoting every key.
fn parse_args(args: &str) -> anyhow::Result<Value> {
    json5::from_str(args).map_err(|e| anyhow::anyhow!("Failed to parse JSON: {e}"))
}

fn render(message: &Value) -> String {
    match message {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
