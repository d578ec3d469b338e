#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CommandKind {
    Attach,
    Detach,
    Gallery,
    Status,
    Help,
    Quit,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub name: &'static str,
    pub kind: CommandKind,
}

const fn entry(name: &'static str, kind: CommandKind) -> CommandSpec {
    CommandSpec { name, kind }
}

pub(crate) const COMMANDS: &[CommandSpec] = &[
    entry("attach", CommandKind::Attach),
    entry("use", CommandKind::Attach),
    entry("detach", CommandKind::Detach),
    entry("gallery", CommandKind::Gallery),
    entry("status", CommandKind::Status),
    entry("help", CommandKind::Help),
    entry("quit", CommandKind::Quit),
    entry("exit", CommandKind::Quit),
];

/// Case-insensitive lookup by name without the leading slash.
pub(crate) fn lookup(name: &str) -> Option<CommandKind> {
    COMMANDS
        .iter()
        .find(|entry| entry.name.eq_ignore_ascii_case(name))
        .map(|entry| entry.kind)
}

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/attach <path>",
    "/detach",
    "/gallery",
    "/status",
    "/help",
    "/quit",
];
