pub mod chat;
pub mod events;
pub mod request;
pub mod transcript;

pub use events::{EventPayload, EventWriter};
pub use request::{GenerationRequest, ValidatedRequest, ValidationError};
pub use transcript::{Message, MessageStatus, RequestId, Sender, Transcript, WORKING_TEXT};
