pub mod dispatch;
pub mod generator;
pub mod models;
pub mod store;

#[cfg(test)]
mod test_support;

use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use pixelchat_contracts::{EventWriter, GenerationRequest, Message, RequestId, Transcript};

pub use dispatch::{
    run_generation, ui_channel, Completion, DispatchConfig, Dispatcher, Rejection, UiEvent,
    UiHandle, DEFAULT_MAX_IN_FLIGHT,
};
pub use generator::{GenerationError, GenerationErrorKind, Generator, SynthesisMode};
pub use models::{DryrunModel, ImageModel, LocalDiffusionModel, DEFAULT_LOCAL_MODEL_URL};
pub use store::{sanitize_fragment, ImageStore};

/// One chat session: the transcript plus the dispatcher that feeds it.
///
/// Owned by the UI thread. Worker threads and the input reader only ever
/// reach it through a `UiHandle`.
pub struct Session {
    transcript: Transcript,
    dispatcher: Dispatcher,
    generator: Arc<Generator>,
    store: Arc<ImageStore>,
    events: EventWriter,
    ui: UiHandle,
    inbox: mpsc::Receiver<UiEvent>,
}

impl Session {
    pub fn new(
        generator: Generator,
        store: ImageStore,
        events: EventWriter,
        config: DispatchConfig,
    ) -> Self {
        let generator = Arc::new(generator);
        let store = Arc::new(store);
        let (ui, inbox) = ui_channel();
        let dispatcher = Dispatcher::new(
            Arc::clone(&generator),
            Arc::clone(&store),
            events.clone(),
            ui.clone(),
            config,
        );
        Self {
            transcript: Transcript::new(),
            dispatcher,
            generator,
            store,
            events,
            ui,
            inbox,
        }
    }

    pub fn ui_handle(&self) -> UiHandle {
        self.ui.clone()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    pub fn config(&self) -> DispatchConfig {
        self.dispatcher.config()
    }

    /// Requests still waiting for their terminal message.
    pub fn pending(&self) -> usize {
        self.dispatcher.outstanding()
    }

    pub fn notify(&mut self, text: impl Into<String>) {
        self.transcript.append(Message::system(text));
    }

    pub fn submit(&mut self, request: GenerationRequest) -> Result<RequestId, Rejection> {
        self.dispatcher.submit(&mut self.transcript, request)
    }

    /// Blocks for the next event. `None` only if every handle is gone.
    pub fn next_event(&mut self) -> Option<UiEvent> {
        self.inbox.recv().ok()
    }

    pub fn apply(&mut self, completion: Completion) -> bool {
        self.dispatcher.complete(&mut self.transcript, completion)
    }

    /// Applies completions until nothing is pending. Input events that
    /// arrive meanwhile are dropped.
    pub fn wait_idle(&mut self, limit: Option<Duration>) -> Result<()> {
        let deadline = limit.map(|limit| Instant::now() + limit);
        while self.pending() > 0 {
            let event = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match self.inbox.recv_timeout(remaining) {
                        Ok(event) => event,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            bail!("timed out waiting for {} generation(s)", self.pending())
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => {
                            bail!("UI event channel closed")
                        }
                    }
                }
                None => match self.inbox.recv() {
                    Ok(event) => event,
                    Err(_) => bail!("UI event channel closed"),
                },
            };
            if let UiEvent::Completed(completion) = event {
                self.apply(completion);
            }
        }
        Ok(())
    }
}
