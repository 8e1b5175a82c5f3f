use thiserror::Error;

/// Classified failure surfaced to the session for one generation request.
///
/// Every variant maps to the HTTP status the original route boundary used,
/// so callers embedding the engine behind a web surface can translate
/// without re-classifying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("{0}")]
    Validation(String),

    #[error("API key is required. Please add your Google Gemini API key in settings.")]
    CredentialMissing,

    #[error("request failed: {0}")]
    Network(String),

    #[error("Request timeout - please try again")]
    Timeout,

    #[error("provider request failed ({status}): {message}")]
    Provider { status: u16, message: String },

    #[error("Video generation timed out")]
    PollTimeout { attempts: u32 },

    #[error("{0}")]
    NotFound(String),
}

impl GenerationError {
    pub fn empty_prompt() -> Self {
        Self::Validation("Prompt is required".to_string())
    }

    pub fn prompt_too_long(limit: usize) -> Self {
        Self::Validation(format!("Prompt exceeds {limit}-character limit"))
    }

    pub fn missing_source_image() -> Self {
        Self::Validation("Prompt and image are required".to_string())
    }

    /// Status the session boundary reports for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::NotFound(_) => 400,
            Self::CredentialMissing => 401,
            Self::PollTimeout { .. } => 408,
            Self::Network(_) | Self::Timeout | Self::Provider { .. } => 500,
        }
    }

    /// Whether the caller should re-open credential entry instead of showing
    /// a generic failure notice. Provider messages are matched on the same
    /// marker the original UI looked for.
    pub fn is_credential_failure(&self) -> bool {
        match self {
            Self::CredentialMissing => true,
            Self::Provider { message, .. } => message.to_ascii_lowercase().contains("api key"),
            _ => false,
        }
    }

    /// A poll timeout is retryable by resubmitting the request; nothing else
    /// inside one generation lifecycle is.
    pub fn retryable_by_resubmission(&self) -> bool {
        matches!(self, Self::PollTimeout { .. })
    }
}
