//! Parsing of lines typed into the chat prompt.

mod command_registry;
mod input;

pub use command_registry::CHAT_HELP_COMMANDS;
pub use input::{parse_chat_input, ChatCommand, ChatInput};
