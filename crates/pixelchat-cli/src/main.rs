use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pixelchat_contracts::chat::{parse_chat_input, ChatCommand, ChatInput, CHAT_HELP_COMMANDS};
use pixelchat_contracts::{EventPayload, EventWriter, GenerationRequest, Transcript};
use pixelchat_engine::{
    DispatchConfig, DryrunModel, Generator, ImageModel, ImageStore, LocalDiffusionModel,
    Session, UiEvent, UiHandle, DEFAULT_LOCAL_MODEL_URL, DEFAULT_MAX_IN_FLIGHT,
};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "pixelchat", version, about = "Chat with a local image model")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive session on the terminal.
    Chat(ChatArgs),
    /// Run one request and print the transcript.
    Generate(GenerateArgs),
    /// List stored images.
    Gallery(GalleryArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Local,
    Dryrun,
}

impl Backend {
    fn as_str(&self) -> &'static str {
        match self {
            Backend::Local => "local",
            Backend::Dryrun => "dryrun",
        }
    }
}

#[derive(Debug, Args)]
struct StorageArgs {
    #[arg(long, default_value = "storage")]
    storage: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct BackendArgs {
    #[arg(long, value_enum, default_value_t = Backend::Local)]
    backend: Backend,
    #[arg(long, default_value = DEFAULT_LOCAL_MODEL_URL)]
    model_url: String,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[command(flatten)]
    storage: StorageArgs,
    #[command(flatten)]
    backend: BackendArgs,
    #[arg(long, default_value_t = DEFAULT_MAX_IN_FLIGHT as u32, value_parser = clap::value_parser!(u32).range(1..))]
    max_in_flight: u32,
    #[arg(long, default_value_t = 80)]
    width: u16,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    image: Option<PathBuf>,
    #[command(flatten)]
    storage: StorageArgs,
    #[command(flatten)]
    backend: BackendArgs,
    #[arg(long, default_value_t = 80)]
    width: u16,
}

#[derive(Debug, Parser)]
struct GalleryArgs {
    #[arg(long, default_value = "storage")]
    storage: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("pixelchat error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => run_chat(args),
        Command::Generate(args) => run_generate(args),
        Command::Gallery(args) => run_gallery(args),
    }
}

fn run_chat(args: ChatArgs) -> Result<i32> {
    let mut session = open_session(&args.storage, &args.backend, args.max_in_flight as usize)?;
    session.notify(format!(
        "Type a prompt to generate an image. Commands: {}",
        CHAT_HELP_COMMANDS.join(" ")
    ));

    let stdout = io::stdout();
    let mut console = ConsoleSurface::new(stdout.lock(), args.width as usize);
    console.repaint(session.transcript())?;
    spawn_input_reader(session.ui_handle())?;

    let mut chat = ChatState::default();
    while let Some(event) = session.next_event() {
        let flow = match event {
            UiEvent::Input(line) => handle_input(&mut session, &mut chat, &line),
            UiEvent::InputClosed => Flow::Quit,
            UiEvent::Completed(completion) => {
                session.apply(completion);
                Flow::Continue
            }
        };
        console.repaint(session.transcript())?;
        if flow == Flow::Quit {
            break;
        }
    }

    if session.pending() > 0 {
        session.notify(format!(
            "Waiting for {} generation(s) to finish...",
            session.pending()
        ));
        console.repaint(session.transcript())?;
        while session.pending() > 0 {
            match session.next_event() {
                Some(UiEvent::Completed(completion)) => {
                    session.apply(completion);
                    console.repaint(session.transcript())?;
                }
                Some(_) => {}
                None => break,
            }
        }
    }
    Ok(0)
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let mut session = open_session(&args.storage, &args.backend, 1)?;
    let mut request = GenerationRequest::text(args.prompt);
    if let Some(image) = args.image {
        request = request.with_source_image(image);
    }
    let accepted = session.submit(request);
    session.wait_idle(None)?;

    let mut stdout = io::stdout().lock();
    for line in session.transcript().render(args.width as usize) {
        writeln!(stdout, "{line}")?;
    }
    let produced_image = accepted
        .ok()
        .and_then(|id| session.transcript().terminal_for(id))
        .map(|message| message.image.is_some())
        .unwrap_or(false);
    Ok(if produced_image { 0 } else { 1 })
}

fn run_gallery(args: GalleryArgs) -> Result<i32> {
    let store = ImageStore::open(&args.storage)?;
    let mut stdout = io::stdout().lock();
    for line in gallery_lines(&store)? {
        writeln!(stdout, "{line}")?;
    }
    Ok(0)
}

fn open_session(storage: &StorageArgs, backend: &BackendArgs, max_in_flight: usize) -> Result<Session> {
    let store = ImageStore::open(&storage.storage)?;
    let events = EventWriter::for_session(storage.events.clone());

    let mut payload = EventPayload::new();
    payload.insert(
        "storage".to_string(),
        json!(store.root().to_string_lossy().to_string()),
    );
    payload.insert("backend".to_string(), json!(backend.backend.as_str()));
    payload.insert("model_url".to_string(), json!(backend.model_url));
    payload.insert("max_in_flight".to_string(), json!(max_in_flight));
    events
        .emit("session_started", payload)
        .context("failed to write event log")?;

    let generator = Generator::initialize(|| connect_backend(backend));
    let notice = match (generator.model_name(), generator.unavailable_reason()) {
        (Some(name), _) => {
            let mut payload = EventPayload::new();
            payload.insert("model".to_string(), json!(name));
            let _ = events.emit("model_ready", payload);
            format!("Model ready: {name}")
        }
        (None, reason) => {
            let reason = reason.unwrap_or("unknown error");
            let mut payload = EventPayload::new();
            payload.insert("error".to_string(), json!(reason));
            let _ = events.emit("model_unavailable", payload);
            format!("Model unavailable: {reason}. Every request will fail until restart.")
        }
    };

    let mut session = Session::new(
        generator,
        store,
        events,
        DispatchConfig { max_in_flight },
    );
    session.notify(notice);
    Ok(session)
}

fn connect_backend(args: &BackendArgs) -> Result<Box<dyn ImageModel>> {
    match args.backend {
        Backend::Dryrun => Ok(Box::new(DryrunModel)),
        Backend::Local => Ok(Box::new(LocalDiffusionModel::connect(&args.model_url)?)),
    }
}

fn spawn_input_reader(ui: UiHandle) -> Result<()> {
    thread::Builder::new()
        .name("pixelchat-stdin".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if !ui.post(UiEvent::Input(line)) {
                    return;
                }
            }
            ui.post(UiEvent::InputClosed);
        })
        .context("failed to start input reader")?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

#[derive(Debug, Default)]
struct ChatState {
    attachment: Option<PathBuf>,
}

/// Reacts to one line typed by the user. Runs on the UI thread.
fn handle_input(session: &mut Session, chat: &mut ChatState, line: &str) -> Flow {
    let command = match parse_chat_input(line) {
        ChatInput::Prompt(text_prompt) => {
            let request = GenerationRequest {
                text_prompt,
                source_image: chat.attachment.clone(),
            };
            if session.submit(request).is_ok() {
                chat.attachment = None;
            }
            return Flow::Continue;
        }
        ChatInput::Command(command) => command,
    };

    match command {
        ChatCommand::Attach(Some(path)) => {
            if path.is_file() {
                session.notify(format!(
                    "Attached {}. It will be sent with your next prompt.",
                    path.display()
                ));
            } else {
                session.notify(format!("Attached {} (file not found yet).", path.display()));
            }
            chat.attachment = Some(path);
        }
        ChatCommand::Attach(None) => session.notify("/attach requires a path"),
        ChatCommand::Detach => match chat.attachment.take() {
            Some(path) => session.notify(format!("Detached {}", path.display())),
            None => session.notify("No image attached."),
        },
        ChatCommand::Gallery => {
            let text = match gallery_lines(session.store()) {
                Ok(lines) => lines.join("\n"),
                Err(err) => format!("Could not list stored images: {err:#}"),
            };
            session.notify(text);
        }
        ChatCommand::Status => {
            let text = status_text(session, chat);
            session.notify(text);
        }
        ChatCommand::Help => session.notify(format!("Commands: {}", CHAT_HELP_COMMANDS.join(" "))),
        ChatCommand::Quit => return Flow::Quit,
        ChatCommand::Unknown { name, .. } => session.notify(format!(
            "Unknown command: /{name}. Type /help for commands."
        )),
    }
    Flow::Continue
}

fn status_text(session: &Session, chat: &ChatState) -> String {
    let model = match (session.generator().model_name(), session.generator().unavailable_reason()) {
        (Some(name), _) => format!("{name} (ready)"),
        (None, reason) => format!("unavailable ({})", reason.unwrap_or("unknown error")),
    };
    let attachment = chat
        .attachment
        .as_deref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "none".to_string());
    format!(
        "Model: {model}\nPending: {} of {}\nAttachment: {attachment}\nStorage: {}",
        session.pending(),
        session.config().max_in_flight,
        session.store().root().display()
    )
}

fn gallery_lines(store: &ImageStore) -> Result<Vec<String>> {
    let paths = store.list()?;
    if paths.is_empty() {
        return Ok(vec![format!(
            "No images stored in {}",
            store.root().display()
        )]);
    }
    let mut lines = vec![format!("{} stored image(s):", paths.len())];
    lines.extend(paths.iter().map(|path| describe_stored(path)));
    Ok(lines)
}

fn describe_stored(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    match image::image_dimensions(path) {
        Ok((w, h)) => format!("  {name} ({w}x{h})"),
        Err(_) => format!("  {name} (unreadable)"),
    }
}

/// Prints transcript renders, appending when the new layout extends the old
/// one and redrawing the screen otherwise.
struct ConsoleSurface<W: Write> {
    out: W,
    width: usize,
    shown: Vec<String>,
}

impl<W: Write> ConsoleSurface<W> {
    fn new(out: W, width: usize) -> Self {
        Self {
            out,
            width,
            shown: Vec::new(),
        }
    }

    fn repaint(&mut self, transcript: &Transcript) -> io::Result<()> {
        let lines = transcript.render(self.width);
        if lines == self.shown {
            return Ok(());
        }
        let start = if lines.starts_with(&self.shown) {
            self.shown.len()
        } else {
            write!(self.out, "\x1b[2J\x1b[H")?;
            0
        };
        for line in &lines[start..] {
            writeln!(self.out, "{line}")?;
        }
        self.out.flush()?;
        self.shown = lines;
        Ok(())
    }
}
