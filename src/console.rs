//! Terminal front end: command parsing and colored rendering.
//!
//! Lines starting with `:` are commands, anything else is chat.

use std::path::PathBuf;

use colored::*;

use crate::execution::OutputPanel;
use crate::language::Language;
use crate::view::{ChatLine, RoomView};

pub const HELP: &str = "\
Commands:
  :run            run the shared buffer
  :lang <name>    switch language (replaces the buffer with its template)
  :load <path>    replace the shared buffer with a file's contents
  :code           print the shared buffer
  :who            list participants
  :leave          leave the room (also :quit)
  :help           show this help
Anything else is sent as a chat message.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Chat(String),
    Run,
    Language(Language),
    Load(PathBuf),
    ShowCode,
    Who,
    Leave,
    Help,
}

/// Parse one input line. `Ok(None)` for blank input.
pub fn parse_input(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let Some(rest) = trimmed.strip_prefix(':') else {
        return Ok(Some(ConsoleCommand::Chat(trimmed.to_string())));
    };

    let mut parts = rest.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or("").to_lowercase();
    let arg = parts.next().map(str::trim).unwrap_or("");

    let parsed = match cmd.as_str() {
        "run" | "r" => ConsoleCommand::Run,
        "lang" | "language" => {
            if arg.is_empty() {
                return Err(format!("usage: :lang <{}>", language_names()));
            }
            ConsoleCommand::Language(arg.parse::<Language>()?)
        }
        "load" => {
            if arg.is_empty() {
                return Err("usage: :load <path>".to_string());
            }
            ConsoleCommand::Load(PathBuf::from(arg))
        }
        "code" => ConsoleCommand::ShowCode,
        "who" => ConsoleCommand::Who,
        "leave" | "quit" | "q" => ConsoleCommand::Leave,
        "help" | "h" | "?" => ConsoleCommand::Help,
        other => return Err(format!("unknown command :{} (try :help)", other)),
    };
    Ok(Some(parsed))
}

fn language_names() -> String {
    Language::ALL
        .iter()
        .map(Language::as_str)
        .collect::<Vec<_>>()
        .join("|")
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

pub fn render_chat_line(line: &ChatLine) -> String {
    if line.is_system {
        format!("{}", format!("* {}", line.body).bright_black().italic())
    } else {
        format!("{} {}", format!("{}:", line.sender).bright_cyan().bold(), line.body)
    }
}

pub fn render_header(view: &RoomView) -> String {
    let status = if view.connected {
        view.connection.bright_green()
    } else {
        view.connection.bright_red()
    };
    format!(
        "{} {}  {} {}  [{}]",
        "Room:".bold(),
        view.room_id.bright_green().bold(),
        "Language:".bold(),
        view.language.label().bright_yellow(),
        status,
    )
}

pub fn render_participants(view: &RoomView) -> String {
    let mut out = format!("{}", view.participants_heading.bold());
    for row in &view.participants {
        let label = row.label();
        out.push_str("\n  ");
        if row.is_local {
            out.push_str(&label.bright_green().to_string());
        } else {
            out.push_str(&label);
        }
    }
    out
}

pub fn render_code(view: &RoomView) -> String {
    let rule = "─".repeat(40);
    format!(
        "{}\n{}\n{}",
        format!("{} {}", rule, view.language.label()).bright_black(),
        view.code,
        rule.bright_black()
    )
}

pub fn render_output(panel: &OutputPanel) -> String {
    let mut out = String::new();
    if !panel.output.is_empty() {
        out.push_str(&format!("{}\n{}", "Output:".bold(), panel.output.trim_end()));
    }
    if panel.has_error() {
        if !out.is_empty() {
            out.push('\n');
        }
        let label = if panel.failed { "Execution error:" } else { "Error:" };
        out.push_str(&format!("{}\n{}", label.bright_red().bold(), panel.error.trim_end().red()));
    }
    if out.is_empty() {
        out.push_str(&"(no output)".bright_black().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(":run", ConsoleCommand::Run)]
    #[case(":r", ConsoleCommand::Run)]
    #[case(":code", ConsoleCommand::ShowCode)]
    #[case(":who", ConsoleCommand::Who)]
    #[case(":leave", ConsoleCommand::Leave)]
    #[case(":quit", ConsoleCommand::Leave)]
    #[case(":help", ConsoleCommand::Help)]
    #[case(":lang rust", ConsoleCommand::Language(Language::Rust))]
    #[case(":LANG  Go ", ConsoleCommand::Language(Language::Go))]
    #[case(":load src/main.py", ConsoleCommand::Load(PathBuf::from("src/main.py")))]
    #[case("  hello there ", ConsoleCommand::Chat("hello there".into()))]
    fn test_parse_input(#[case] line: &str, #[case] expected: ConsoleCommand) {
        assert_eq!(parse_input(line).unwrap(), Some(expected));
    }

    #[test]
    fn test_blank_input_is_none() {
        assert_eq!(parse_input("   ").unwrap(), None);
    }

    #[test]
    fn test_bad_commands_are_errors() {
        assert!(parse_input(":lang").unwrap_err().contains("usage"));
        assert!(parse_input(":lang cobol").unwrap_err().contains("cobol"));
        assert!(parse_input(":load").is_err());
        assert!(parse_input(":dance").unwrap_err().contains(":dance"));
    }

    #[test]
    fn test_render_output_distinguishes_failure() {
        colored::control::set_override(false);
        let failed = OutputPanel { output: String::new(), error: "Failed to execute code".into(), failed: true };
        assert!(render_output(&failed).contains("Execution error:"));
        let stderr = OutputPanel { output: "1\n".into(), error: "warn".into(), failed: false };
        let text = render_output(&stderr);
        assert!(text.contains("Output:\n1"));
        assert!(text.contains("Error:\nwarn"));
        assert_eq!(render_output(&OutputPanel::default()), "(no output)");
    }

    #[test]
    fn test_render_chat_line_plain() {
        colored::control::set_override(false);
        let line = ChatLine { sender: "bob".into(), body: "hi".into(), is_system: false };
        assert_eq!(render_chat_line(&line), "bob: hi");
        let sys = ChatLine { sender: "System".into(), body: "bob joined the room".into(), is_system: true };
        assert_eq!(render_chat_line(&sys), "* bob joined the room");
    }
}
