use crate::client::ReplClient;
use reedline::{Span, Suggestion};

pub const BUILT_IN: &[&str] = &[
    "h", "help", "commands", "list", "session", "context", "stream", "drop", "q", "quit", "exit",
];

/// Completes built-in REPL commands and the server's command names.
pub struct Completer {
    commands: Vec<String>,
    server: Vec<String>,
}

impl Completer {
    pub fn new(client: &ReplClient) -> Self {
        let server = client.command_names().to_vec();
        let mut commands: Vec<String> = BUILT_IN.iter().map(|name| name.to_string()).collect();
        commands.extend(server.iter().cloned());

        Self { commands, server }
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    fn suggest(value: &str, description: Option<&str>, span: Span) -> Suggestion {
        Suggestion {
            value: value.to_string(),
            description: description.map(str::to_string),
            extra: None,
            span,
            style: None,
            append_whitespace: true,
        }
    }
}

impl reedline::Completer for Completer {
    fn complete(&mut self, line: &str, pos: usize) -> Vec<Suggestion> {
        let mut completions = vec![];

        // `stream <command>` completes the server command in second position.
        if let Some(rest) = line.strip_prefix("stream ") {
            if rest.contains(' ') {
                return completions;
            }
            let span = Span::new(pos - rest.len(), pos);
            for name in &self.server {
                if name.starts_with(rest) {
                    completions.push(Self::suggest(name, Some("server command"), span));
                }
            }
            return completions;
        }

        if line.contains(' ') {
            return completions;
        }

        let span = Span::new(0, pos);
        for name in BUILT_IN {
            if name.starts_with(line) {
                completions.push(Self::suggest(name, None, span));
            }
        }
        for name in &self.server {
            if name.starts_with(line) {
                completions.push(Self::suggest(name, Some("server command"), span));
            }
        }

        completions
    }
}
