use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssetError {
    #[error("asset {url} timed out after {after_ms}ms")]
    Timeout { url: String, after_ms: u64 },
    #[error("asset {url} failed to load: {reason}")]
    Failed { url: String, reason: String },
}

impl AssetError {
    pub fn url(&self) -> &str {
        match self {
            Self::Timeout { url, .. } | Self::Failed { url, .. } => url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("template execution failed: {message}")]
pub struct TemplateError {
    pub message: String,
    pub stack: Option<String>,
}

impl TemplateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("sub-channel {0} is closed")]
    Closed(u64),
    #[error("transport unavailable")]
    Unavailable,
    #[error("failed to write message: {0}")]
    Write(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentError {
    #[error("pagelet {fragment} does not expose remote method {method}")]
    UnknownMethod { fragment: String, method: String },
    #[error("pagelet {0} has no open sub-channel")]
    ChannelUnavailable(String),
    #[error("pagelet {0} is destroyed")]
    Destroyed(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipeError {
    #[error("no pagelet named {0} is registered")]
    UnknownFragment(String),
    #[error("page has been destroyed")]
    Destroyed,
    #[error(transparent)]
    Fragment(#[from] FragmentError),
}
