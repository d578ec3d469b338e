//! Request admission and the per-request background worker.
//!
//! The dispatcher runs on the UI thread. Each accepted request gets exactly
//! one named worker thread, and each worker posts exactly one `Completion`
//! back through the `UiHandle`. Only the UI thread touches the transcript.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use pixelchat_contracts::{
    EventPayload, EventWriter, GenerationRequest, Message, RequestId, Transcript, ValidatedRequest,
    ValidationError,
};
use serde_json::{json, Value};

use crate::generator::{GenerationError, Generator, SynthesisMode};
use crate::store::ImageStore;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// Everything the UI thread reacts to, in arrival order.
#[derive(Debug)]
pub enum UiEvent {
    Input(String),
    InputClosed,
    Completed(Completion),
}

/// Posts events onto the UI thread's queue. Cheap to clone into workers.
#[derive(Debug, Clone)]
pub struct UiHandle {
    tx: mpsc::Sender<UiEvent>,
}

impl UiHandle {
    /// Returns false once the UI thread has gone away.
    pub fn post(&self, event: UiEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

pub fn ui_channel() -> (UiHandle, mpsc::Receiver<UiEvent>) {
    let (tx, rx) = mpsc::channel();
    (UiHandle { tx }, rx)
}

/// The single outcome of one request.
#[derive(Debug, Clone)]
pub struct Completion {
    pub id: RequestId,
    pub outcome: Result<PathBuf, GenerationError>,
    pub elapsed: Duration,
}

impl Completion {
    pub fn into_message(self) -> Message {
        match self.outcome {
            Ok(path) => Message::result_image(self.id, path),
            Err(err) => Message::result_text(self.id, err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub max_in_flight: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

/// Why a request never got a working indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Invalid(ValidationError),
    Busy { in_flight: usize },
}

pub struct Dispatcher {
    generator: Arc<Generator>,
    store: Arc<ImageStore>,
    events: EventWriter,
    ui: UiHandle,
    config: DispatchConfig,
    in_flight: Arc<AtomicUsize>,
    outstanding: BTreeSet<RequestId>,
    next_id: u64,
}

impl Dispatcher {
    pub fn new(
        generator: Arc<Generator>,
        store: Arc<ImageStore>,
        events: EventWriter,
        ui: UiHandle,
        config: DispatchConfig,
    ) -> Self {
        Self {
            generator,
            store,
            events,
            ui,
            config: DispatchConfig {
                max_in_flight: config.max_in_flight.max(1),
            },
            in_flight: Arc::new(AtomicUsize::new(0)),
            outstanding: BTreeSet::new(),
            next_id: 0,
        }
    }

    /// Worker threads that have not exited yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Accepted requests whose terminal message has not been appended yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn config(&self) -> DispatchConfig {
        self.config
    }

    /// Validates `request` and starts its worker. Must run on the UI thread.
    ///
    /// A rejected request appends one system message and starts nothing. An
    /// accepted one appends the user's message and a working indicator.
    pub fn submit(
        &mut self,
        transcript: &mut Transcript,
        request: GenerationRequest,
    ) -> Result<RequestId, Rejection> {
        let validated = match request.validate() {
            Ok(validated) => validated,
            Err(err) => {
                transcript.append(Message::system(err.to_string()));
                self.emit_rejected(err.code(), &request);
                return Err(Rejection::Invalid(err));
            }
        };

        let in_flight = self.in_flight();
        if in_flight >= self.config.max_in_flight {
            transcript.append(Message::system(format!(
                "Still working on {in_flight} request(s); try again when one finishes."
            )));
            self.emit_rejected("busy", &request);
            return Err(Rejection::Busy { in_flight });
        }

        self.next_id += 1;
        let id = RequestId(self.next_id);
        let mut user_message = Message::user(validated.prompt.clone());
        if let Some(path) = validated.source_image.as_deref() {
            user_message = user_message.with_image(path);
        }
        transcript.append(user_message);
        transcript.append(Message::working(id));
        self.emit_submitted(id, &validated);

        let job = GenerationJob {
            id,
            request: validated,
            generator: Arc::clone(&self.generator),
            store: Arc::clone(&self.store),
            events: self.events.clone(),
            ui: self.ui.clone(),
            slot: InFlightSlot::acquire(&self.in_flight),
        };
        match thread::Builder::new()
            .name(format!("pixelchat-gen-{}", id.0))
            .spawn(move || job.run())
        {
            Ok(_) => {
                self.outstanding.insert(id);
            }
            Err(err) => {
                transcript.append(Message::result_text(
                    id,
                    format!("Could not start generation: {err}"),
                ));
            }
        }
        Ok(id)
    }

    /// Appends the terminal message for `completion`. Unknown or repeated ids
    /// are ignored and return false.
    pub fn complete(&mut self, transcript: &mut Transcript, completion: Completion) -> bool {
        if !self.outstanding.remove(&completion.id) {
            return false;
        }
        transcript.append(completion.into_message());
        true
    }

    fn emit_rejected(&self, reason: &str, request: &GenerationRequest) {
        let mut payload = EventPayload::new();
        payload.insert("reason".to_string(), Value::String(reason.to_string()));
        payload.insert(
            "has_source_image".to_string(),
            Value::Bool(request.source_image().is_some()),
        );
        let _ = self.events.emit("request_rejected", payload);
    }

    fn emit_submitted(&self, id: RequestId, request: &ValidatedRequest) {
        let mut payload = EventPayload::new();
        payload.insert("request_id".to_string(), json!(id.0));
        payload.insert("mode".to_string(), json!(request.mode()));
        payload.insert("prompt".to_string(), json!(request.prompt));
        if let Some(path) = request.source_image.as_deref() {
            payload.insert(
                "source_image".to_string(),
                json!(path.to_string_lossy().to_string()),
            );
        }
        let _ = self.events.emit("request_submitted", payload);
    }
}

struct InFlightSlot(Arc<AtomicUsize>);

impl InFlightSlot {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct GenerationJob {
    id: RequestId,
    request: ValidatedRequest,
    generator: Arc<Generator>,
    store: Arc<ImageStore>,
    events: EventWriter,
    ui: UiHandle,
    slot: InFlightSlot,
}

impl GenerationJob {
    fn run(self) {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            run_generation(&self.request, &self.generator, &self.store)
        }))
        .unwrap_or_else(|panic| {
            Err(GenerationError::synthesis(
                synthesis_mode(&self.request),
                format!("generation worker panicked: {}", panic_message(panic.as_ref())),
            ))
        });
        let elapsed = started.elapsed();
        self.report(&outcome, elapsed);

        // The slot is free before the UI sees the completion.
        drop(self.slot);
        self.ui.post(UiEvent::Completed(Completion {
            id: self.id,
            outcome,
            elapsed,
        }));
    }

    fn report(&self, outcome: &Result<PathBuf, GenerationError>, elapsed: Duration) {
        let mut payload = EventPayload::new();
        payload.insert("request_id".to_string(), json!(self.id.0));
        payload.insert("mode".to_string(), json!(self.request.mode()));
        payload.insert("elapsed_ms".to_string(), json!(elapsed.as_millis() as u64));
        let event_type = match outcome {
            Ok(path) => {
                payload.insert(
                    "path".to_string(),
                    json!(path.to_string_lossy().to_string()),
                );
                "generation_finished"
            }
            Err(err) => {
                payload.insert("kind".to_string(), json!(err.kind().as_str()));
                payload.insert("error".to_string(), json!(err.message()));
                "generation_failed"
            }
        };
        let _ = self.events.emit(event_type, payload);
    }
}

fn synthesis_mode(request: &ValidatedRequest) -> SynthesisMode {
    if request.source_image.is_some() {
        SynthesisMode::ImageToImage
    } else {
        SynthesisMode::TextToImage
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = panic.downcast_ref::<String>() {
        return text.clone();
    }
    "unknown panic".to_string()
}

/// Load, synthesize, save. Blocking; runs on a worker thread.
pub fn run_generation(
    request: &ValidatedRequest,
    generator: &Generator,
    store: &ImageStore,
) -> Result<PathBuf, GenerationError> {
    let image = match request.source_image.as_deref() {
        Some(path) => {
            let source = store
                .load(path)
                .map_err(|err| GenerationError::load(path, &err))?;
            generator.image_to_image(&request.prompt, &source)?
        }
        None => generator.text_to_image(&request.prompt)?,
    };
    let source_name = request.source_file_name();
    store
        .save(&image, Some(&request.prompt), source_name.as_deref())
        .map_err(|err| GenerationError::save(&err))
}
