use mcp_server::ConnectionState;
use reedline::{Prompt, PromptEditMode, PromptHistorySearch, PromptHistorySearchStatus};
use std::borrow::Cow;
use tokio::sync::watch;

use crate::term::paint_yellow_bold;

pub struct ReplPrompt {
    left: String,
    state: watch::Receiver<ConnectionState>,
}

impl ReplPrompt {
    pub fn new(left: &str, state: watch::Receiver<ConnectionState>) -> Self {
        Self {
            left: left.to_string(),
            state,
        }
    }
}

impl Prompt for ReplPrompt {
    fn render_prompt_left(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.left)
    }

    /// Shows the connection state while it is anything but connected.
    fn render_prompt_right(&self) -> Cow<'_, str> {
        match *self.state.borrow() {
            ConnectionState::Connected => Cow::Borrowed(""),
            state => Cow::Owned(paint_yellow_bold(&format!("[{state}]"))),
        }
    }

    fn render_prompt_indicator(&self, _edit_mode: PromptEditMode) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<'_, str> {
        Cow::Borrowed("::: ")
    }

    fn render_prompt_history_search_indicator(
        &self,
        history_search: PromptHistorySearch,
    ) -> Cow<'_, str> {
        let prefix = match history_search.status {
            PromptHistorySearchStatus::Passing => "",
            PromptHistorySearchStatus::Failing => "failing ",
        };
        Cow::Owned(format!(
            "({prefix}reverse-search: {}) ",
            history_search.term
        ))
    }
}
