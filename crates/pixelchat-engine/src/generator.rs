use std::fmt;
use std::path::Path;

use anyhow::Result;
use image::{DynamicImage, GenericImageView};

use crate::models::{truncate_text, ImageModel};

const MAX_CAUSE_CHARS: usize = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationErrorKind {
    Load,
    Synthesis,
    Save,
}

impl GenerationErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Load => "load_error",
            Self::Synthesis => "synthesis_error",
            Self::Save => "save_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisMode {
    TextToImage,
    ImageToImage,
}

impl SynthesisMode {
    fn label(&self) -> &'static str {
        match self {
            Self::TextToImage => "Text-to-image",
            Self::ImageToImage => "Image-to-image",
        }
    }
}

/// Failure of one generation; `message` is what the user sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationError {
    kind: GenerationErrorKind,
    message: String,
}

impl GenerationError {
    pub fn load(path: &Path, err: &anyhow::Error) -> Self {
        Self {
            kind: GenerationErrorKind::Load,
            message: format!(
                "Failed to load initial image: {}. Error: {}",
                path.display(),
                error_chain_text(err)
            ),
        }
    }

    pub fn synthesis(mode: SynthesisMode, cause: impl fmt::Display) -> Self {
        Self {
            kind: GenerationErrorKind::Synthesis,
            message: format!("{} generation failed: {cause}", mode.label()),
        }
    }

    pub fn save(err: &anyhow::Error) -> Self {
        Self {
            kind: GenerationErrorKind::Save,
            message: format!("Failed to save generated image: {}", error_chain_text(err)),
        }
    }

    pub fn kind(&self) -> GenerationErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for GenerationError {}

pub(crate) fn error_chain_text(err: &anyhow::Error) -> String {
    let text = err
        .chain()
        .map(|cause| cause.to_string())
        .collect::<Vec<_>>()
        .join(": ");
    truncate_text(&text, MAX_CAUSE_CHARS)
}

/// Process-wide handle on the image model, initialized exactly once.
///
/// A failed initialization is remembered: every later request fails with the
/// same reason instead of retrying.
pub struct Generator {
    backend: Result<Box<dyn ImageModel>, String>,
}

impl Generator {
    pub fn initialize<F>(init: F) -> Self
    where
        F: FnOnce() -> Result<Box<dyn ImageModel>>,
    {
        match init() {
            Ok(model) => Self { backend: Ok(model) },
            Err(err) => Self::unavailable(error_chain_text(&err)),
        }
    }

    pub fn ready(model: impl ImageModel + 'static) -> Self {
        Self {
            backend: Ok(Box::new(model)),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            backend: Err(reason.into()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.backend.is_ok()
    }

    pub fn model_name(&self) -> Option<&str> {
        self.backend.as_ref().ok().map(|model| model.name())
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        self.backend.as_ref().err().map(String::as_str)
    }

    pub fn text_to_image(&self, prompt: &str) -> Result<DynamicImage, GenerationError> {
        self.synthesize(SynthesisMode::TextToImage, |model| {
            model.text_to_image(prompt)
        })
    }

    pub fn image_to_image(
        &self,
        prompt: &str,
        source: &DynamicImage,
    ) -> Result<DynamicImage, GenerationError> {
        self.synthesize(SynthesisMode::ImageToImage, |model| {
            model.image_to_image(prompt, source)
        })
    }

    fn synthesize<F>(&self, mode: SynthesisMode, call: F) -> Result<DynamicImage, GenerationError>
    where
        F: FnOnce(&dyn ImageModel) -> Result<DynamicImage>,
    {
        let model = self.backend.as_ref().map_err(|reason| {
            GenerationError::synthesis(mode, format!("model unavailable: {reason}"))
        })?;
        let image = call(model.as_ref())
            .map_err(|err| GenerationError::synthesis(mode, error_chain_text(&err)))?;
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(GenerationError::synthesis(
                mode,
                format!("{} returned an empty image", model.name()),
            ));
        }
        Ok(image)
    }
}

impl fmt::Debug for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.backend {
            Ok(model) => f.debug_tuple("Generator").field(&model.name()).finish(),
            Err(reason) => f
                .debug_struct("Generator")
                .field("unavailable", reason)
                .finish(),
        }
    }
}
