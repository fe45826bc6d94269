//! Interpretation of terminal input lines.

/// A parsed input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Disconnect and exit
    Quit,
    /// Clear resilience state and connect again
    Reconnect,
    /// Print diagnostics
    Status,
    /// Forward to the server
    Command(String),
    /// Nothing to do
    Empty,
}

/// Parse one line of user input.
///
/// Lines starting with `::` are sent as commands with one colon removed.
pub fn parse_input(line: &str) -> Input {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Empty;
    }
    if let Some(escaped) = trimmed.strip_prefix("::") {
        return Input::Command(format!(":{}", escaped));
    }
    match trimmed {
        ":quit" | ":q" | ":exit" => Input::Quit,
        ":reconnect" => Input::Reconnect,
        ":status" => Input::Status,
        _ => Input::Command(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}
