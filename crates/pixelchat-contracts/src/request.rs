use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// What the user asked for: a prompt, an image to start from, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub text_prompt: Option<String>,
    pub source_image: Option<PathBuf>,
}

/// A request that passed validation; the prompt is trimmed and non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedRequest {
    pub prompt: String,
    pub source_image: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    EmptyPrompt,
    PromptRequired,
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyPrompt => "empty_prompt",
            Self::PromptRequired => "prompt_required",
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyPrompt => write!(f, "Please enter a prompt."),
            Self::PromptRequired => write!(
                f,
                "Please provide a text prompt to accompany the uploaded image."
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

impl GenerationRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            text_prompt: Some(prompt.into()),
            source_image: None,
        }
    }

    pub fn with_source_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_image = Some(path.into());
        self
    }

    /// Trimmed prompt, or `None` when missing or whitespace only.
    pub fn prompt(&self) -> Option<&str> {
        self.text_prompt
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn source_image(&self) -> Option<&Path> {
        self.source_image.as_deref()
    }

    pub fn validate(&self) -> Result<ValidatedRequest, ValidationError> {
        match (self.prompt(), &self.source_image) {
            (Some(prompt), source_image) => Ok(ValidatedRequest {
                prompt: prompt.to_string(),
                source_image: source_image.clone(),
            }),
            (None, Some(_)) => Err(ValidationError::PromptRequired),
            (None, None) => Err(ValidationError::EmptyPrompt),
        }
    }
}

impl ValidatedRequest {
    pub fn mode(&self) -> &'static str {
        if self.source_image.is_some() {
            "image_to_image"
        } else {
            "text_to_image"
        }
    }

    /// File name of the source image, used to name the stored result.
    pub fn source_file_name(&self) -> Option<String> {
        self.source_image
            .as_deref()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().to_string())
    }
}
