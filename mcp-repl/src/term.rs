use yansi::Paint;

/// Prompt and success highlighting.
pub fn paint_green_bold(input: &str) -> String {
    input.green().bold().to_string()
}

/// Errors and connection warnings.
pub fn paint_yellow_bold(input: &str) -> String {
    input.yellow().bold().to_string()
}
