use std::path::PathBuf;

use super::command_registry::{lookup, CommandKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Attach an image to the next prompt; `None` when no path was given.
    Attach(Option<PathBuf>),
    Detach,
    Gallery,
    Status,
    Help,
    Quit,
    Unknown { name: String, arg: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInput {
    /// Free text to generate from. A blank line is `Prompt(None)` and still
    /// counts as a submission.
    Prompt(Option<String>),
    Command(ChatCommand),
}

pub fn parse_chat_input(line: &str) -> ChatInput {
    let trimmed = line.trim();
    match split_command(trimmed) {
        Some((name, arg)) => ChatInput::Command(command_for(name, arg)),
        None if trimmed.is_empty() => ChatInput::Prompt(None),
        None => ChatInput::Prompt(Some(trimmed.to_string())),
    }
}

/// `/name rest` into `(name, rest)`. Names are ASCII word characters.
fn split_command(text: &str) -> Option<(&str, &str)> {
    let tail = text.strip_prefix('/')?;
    let end = tail
        .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
        .unwrap_or(tail.len());
    if end == 0 {
        return None;
    }
    Some((&tail[..end], tail[end..].trim()))
}

fn command_for(name: &str, arg: &str) -> ChatCommand {
    match lookup(name) {
        Some(CommandKind::Attach) => ChatCommand::Attach(path_argument(arg)),
        Some(CommandKind::Detach) => ChatCommand::Detach,
        Some(CommandKind::Gallery) => ChatCommand::Gallery,
        Some(CommandKind::Status) => ChatCommand::Status,
        Some(CommandKind::Help) => ChatCommand::Help,
        Some(CommandKind::Quit) => ChatCommand::Quit,
        None => ChatCommand::Unknown {
            name: name.to_ascii_lowercase(),
            arg: arg.to_string(),
        },
    }
}

/// A single path, shell-quoted or not. Unquoted words are rejoined with
/// spaces; unbalanced quotes fall back to the raw text.
fn path_argument(arg: &str) -> Option<PathBuf> {
    let path = match shell_words::split(arg) {
        Ok(words) => words.join(" "),
        Err(_) => arg.to_string(),
    };
    let path = path.trim();
    if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    }
}
