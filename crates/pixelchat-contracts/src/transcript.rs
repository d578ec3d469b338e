//! Chronological chat transcript and its text layout.
//!
//! The transcript is append-only: entries are never edited or removed. A
//! working indicator stays in the list after its request finishes; `render`
//! simply stops drawing it once a result for the same request exists.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

pub const WORKING_TEXT: &str = "Generating, please wait...";

const MIN_RENDER_WIDTH: usize = 24;
const CONTENT_INDENT: &str = "  ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    User,
    Bot,
    System,
}

impl Sender {
    pub fn label(&self) -> &'static str {
        match self {
            Sender::User => "You",
            Sender::Bot => "Bot",
            Sender::System => "System",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Plain,
    /// Transient indicator for a request still in flight.
    Working(RequestId),
    /// The single terminal entry of a request.
    Result(RequestId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub sender: Sender,
    pub timestamp: DateTime<Local>,
    pub text: Option<String>,
    pub image: Option<PathBuf>,
    pub status: MessageStatus,
}

impl Message {
    fn new(sender: Sender, text: Option<String>, image: Option<PathBuf>) -> Self {
        Self {
            sender,
            timestamp: Local::now(),
            text,
            image,
            status: MessageStatus::Plain,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Sender::User, Some(text.into()), None)
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self::new(Sender::Bot, Some(text.into()), None)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Sender::System, Some(text.into()), None)
    }

    pub fn working(id: RequestId) -> Self {
        let mut message = Self::bot(WORKING_TEXT);
        message.status = MessageStatus::Working(id);
        message
    }

    pub fn result_text(id: RequestId, text: impl Into<String>) -> Self {
        let mut message = Self::bot(text);
        message.status = MessageStatus::Result(id);
        message
    }

    pub fn result_image(id: RequestId, path: impl Into<PathBuf>) -> Self {
        let mut message = Self::new(Sender::Bot, None, Some(path.into()));
        message.status = MessageStatus::Result(id);
        message
    }

    pub fn with_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.image = Some(path.into());
        self
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match self.status {
            MessageStatus::Plain => None,
            MessageStatus::Working(id) | MessageStatus::Result(id) => Some(id),
        }
    }

    pub fn is_working(&self) -> bool {
        matches!(self.status, MessageStatus::Working(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, MessageStatus::Result(_))
    }
}

#[derive(Debug, Default)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends at the end and returns the entry's index.
    pub fn append(&mut self, message: Message) -> usize {
        self.messages.push(message);
        self.messages.len() - 1
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn terminal_for(&self, id: RequestId) -> Option<&Message> {
        self.messages
            .iter()
            .find(|message| message.status == MessageStatus::Result(id))
    }

    /// Requests that show a working indicator but have no result yet.
    pub fn unresolved(&self) -> Vec<RequestId> {
        let resolved = self.resolved_ids();
        self.messages
            .iter()
            .filter_map(|message| match message.status {
                MessageStatus::Working(id) if !resolved.contains(&id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn resolved_ids(&self) -> HashSet<RequestId> {
        self.messages
            .iter()
            .filter_map(|message| match message.status {
                MessageStatus::Result(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Lays out the whole transcript for a terminal `width` columns wide.
    pub fn render(&self, width: usize) -> Vec<String> {
        let width = width.max(MIN_RENDER_WIDTH);
        let resolved = self.resolved_ids();
        let mut lines = Vec::new();

        for message in &self.messages {
            if let MessageStatus::Working(id) = message.status {
                if resolved.contains(&id) {
                    continue;
                }
            }
            if !lines.is_empty() {
                lines.push(String::new());
            }
            lines.extend(render_message(message, width));
        }
        lines
    }
}

fn render_message(message: &Message, width: usize) -> Vec<String> {
    let mut block = vec![format!(
        "{} [{}]",
        message.sender.label(),
        message.timestamp.format("%H:%M:%S")
    )];
    let content_width = width - CONTENT_INDENT.len();

    let mut content = Vec::new();
    if let Some(text) = message.text.as_deref() {
        for line in text.lines() {
            content.extend(wrap_line(line, content_width));
        }
    }
    if let Some(path) = message.image.as_deref() {
        content.extend(wrap_line(&describe_image(path), content_width));
    }

    if message.sender == Sender::User {
        block.extend(content);
        return block
            .into_iter()
            .map(|line| align_right(&line, width))
            .collect();
    }
    block.extend(
        content
            .into_iter()
            .map(|line| format!("{CONTENT_INDENT}{line}")),
    );
    block
}

fn describe_image(path: &Path) -> String {
    match image::image_dimensions(path) {
        Ok((w, h)) => format!("[image] {} ({w}x{h})", path.display()),
        Err(err) => format!("[image] {} (unavailable: {err})", path.display()),
    }
}

fn align_right(line: &str, width: usize) -> String {
    let len = line.chars().count();
    if len >= width {
        return line.to_string();
    }
    format!("{}{line}", " ".repeat(width - len))
}

/// Greedy word wrap by character count; words wider than `width` are split.
fn wrap_line(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > width {
            if current_len > 0 {
                lines.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let rest = word.split_off(width);
            lines.push(word.into_iter().collect());
            word = rest;
        }
        if word.is_empty() {
            continue;
        }
        let needed = if current_len == 0 {
            word.len()
        } else {
            current_len + 1 + word.len()
        };
        if needed > width {
            lines.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if current_len > 0 {
            current.push(' ');
            current_len += 1;
        }
        current.extend(word.iter());
        current_len += word.len();
    }

    if current_len > 0 || lines.is_empty() {
        lines.push(current);
    }
    lines
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    #[test]
    fn append_keeps_insertion_order() {
        let mut transcript = Transcript::new();
        assert_eq!(transcript.append(Message::system("one")), 0);
        assert_eq!(transcript.append(Message::user("two")), 1);
        assert_eq!(transcript.append(Message::bot("three")), 2);

        let texts: Vec<&str> = transcript
            .messages()
            .iter()
            .filter_map(|message| message.text.as_deref())
            .collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[test]
    fn render_hides_working_indicator_once_resolved() {
        let id = RequestId(7);
        let mut transcript = Transcript::new();
        transcript.append(Message::user("a red circle"));
        transcript.append(Message::working(id));

        let pending = transcript.render(60).join("\n");
        assert!(pending.contains(WORKING_TEXT));
        assert_eq!(transcript.unresolved(), vec![id]);

        transcript.append(Message::result_text(id, "Text-to-image generation failed: boom"));
        let done = transcript.render(60).join("\n");
        assert!(!done.contains(WORKING_TEXT));
        assert!(done.contains("generation failed"));
        assert!(transcript.unresolved().is_empty());
        assert_eq!(transcript.len(), 3);
        assert!(transcript.terminal_for(id).is_some());
    }

    #[test]
    fn render_right_aligns_user_entries() {
        let mut transcript = Transcript::new();
        transcript.append(Message::user("hello"));
        transcript.append(Message::system("welcome"));

        let lines = transcript.render(40);
        assert_eq!(lines[0].chars().count(), 40);
        assert!(lines[0].trim_start().starts_with("You ["));
        assert_eq!(lines[1], format!("{}hello", " ".repeat(35)));
        assert_eq!(lines[2], "");
        assert!(lines[3].starts_with("System ["));
        assert_eq!(lines[4], "  welcome");
    }

    #[test]
    fn render_wraps_long_text() {
        let mut transcript = Transcript::new();
        let long = "word ".repeat(30);
        transcript.append(Message::bot(long.trim()));

        let lines = transcript.render(30);
        assert!(lines.len() > 2);
        for line in &lines {
            assert!(line.chars().count() <= 30, "line too wide: {line:?}");
        }
    }

    #[test]
    fn wrap_splits_oversized_words() {
        let wrapped = wrap_line("abcdefghij xy", 4);
        assert_eq!(wrapped, vec!["abcd", "efgh", "ij", "xy"]);
        assert_eq!(wrap_line("", 10), vec![""]);
    }

    #[test]
    fn render_describes_images() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("out.png");
        RgbImage::from_pixel(3, 2, Rgb([1, 2, 3])).save(&path)?;

        let mut transcript = Transcript::new();
        transcript.append(Message::result_image(RequestId(1), &path));
        transcript.append(Message::result_image(
            RequestId(2),
            temp.path().join("gone.png"),
        ));

        let text = transcript.render(200).join("\n");
        assert!(text.contains("(3x2)"));
        assert!(text.contains("gone.png (unavailable:"));
        Ok(())
    }
}
