//! Error taxonomy shared by the registry, dispatcher and orchestrator.

use crate::provider::ProviderError;
use crate::types::ErrorKind;

/// Errors surfaced by weft's public operations.
///
/// Inside a run these never escape the runner: they are rendered into
/// `Event::error` with the matching [`ErrorKind`].
#[derive(Debug, thiserror::Error)]
pub enum WeftError {
    #[error("{what} '{name}' already exists")]
    DuplicateName { what: &'static str, name: String },
    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },
    #[error("invalid arguments for '{target}': {reason}")]
    ArgumentValidation { target: String, reason: String },
    #[error("tool '{tool}' failed: {source}")]
    ToolExecution {
        tool: String,
        #[source]
        source: ToolError,
    },
    #[error("cannot delegate to unknown agent '{0}'")]
    Delegation(String),
    #[error("dependency failure: {0}")]
    Dependency(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
}

impl WeftError {
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            name: name.into(),
        }
    }

    pub fn duplicate(what: &'static str, name: impl Into<String>) -> Self {
        Self::DuplicateName {
            what,
            name: name.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateName { .. } | Self::ArgumentValidation { .. } => {
                ErrorKind::ArgumentValidation
            }
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ToolExecution { .. } => ErrorKind::ToolExecution,
            Self::Delegation(_) => ErrorKind::Delegation,
            Self::Dependency(_) => ErrorKind::Dependency,
            Self::LimitExceeded(_) => ErrorKind::LimitExceeded,
        }
    }

    /// Notice suitable for end users: no internal detail, just the kind.
    pub fn user_message(&self) -> String {
        format!("Sorry, the request could not be completed ({}).", self.kind())
    }
}

impl From<CallbackError> for WeftError {
    fn from(e: CallbackError) -> Self {
        Self::Dependency(e.to_string())
    }
}

impl From<ProviderError> for WeftError {
    fn from(e: ProviderError) -> Self {
        Self::Dependency(e.to_string())
    }
}

/// Failure reported by a tool body or remote adapter.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),
    #[error("Authentication required: credential expected in state key '{0}'")]
    AuthRequired(String),
    #[error("Cancelled")]
    Cancelled,
}

/// A hook failed. Hooks are trusted configuration, so this aborts the
/// wrapped operation instead of being swallowed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("callback failed: {0}")]
pub struct CallbackError(pub String);

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
