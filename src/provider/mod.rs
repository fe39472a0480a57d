pub mod mock;
pub mod openai_compat;
pub mod registry;
pub mod traits;

pub use mock::{MockProvider, MockResponse, MockToolCall};
pub use openai_compat::{OpenAiCompatProvider, OpenAiConfig};
pub use registry::ProviderRegistry;
pub use traits::*;
