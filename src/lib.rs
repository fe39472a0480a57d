pub mod agent;
pub mod artifacts;
pub mod callbacks;
pub mod error;
pub mod mcp;
#[cfg(feature = "openapi")]
pub mod openapi;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod session;
pub mod tools;
pub mod types;

pub use agent::{AgentKind, AgentSpec, CompletionSignal};
pub use artifacts::{Artifact, ArtifactService, InMemoryArtifactService};
pub use callbacks::{CallbackContext, Callbacks, HookOutcome, HookResult};
pub use error::{CallbackError, ToolError, WeftError};
pub use orchestrator::{ErrorPolicy, EventStream, RunConfig, Runner};
pub use provider::{MockProvider, MockResponse, ModelProvider, ModelRequest, ModelResponse};
pub use registry::AgentRegistry;
pub use retry::RetryConfig;
pub use session::{InMemorySessionService, Session, SessionKey, SessionService, State};
pub use tools::{ToolContext, ToolDispatcher, ToolSpec, ToolTarget};
pub use types::*;
