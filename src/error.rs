use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Input text must be non-empty")]
    EmptyInput,

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Model call failed after {attempts} attempts: {message}")]
    ModelCall { message: String, attempts: u32 },

    #[error("Step '{step}' exceeded its model-call deadline")]
    StepTimeout { step: String },

    #[error("Routing exceeded {cap} transitions (loop in the routing table?)")]
    PipelineLoop { cap: usize },

    #[error("Step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
