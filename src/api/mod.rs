pub mod anthropic;
pub mod error;
pub mod models;
pub mod provider;

pub use error::ProviderError;
pub use provider::{
    ChatMessage, EventStream, ProviderTransport, StreamEvent, StreamOutcome, StreamRequest,
    ToolChoice, ToolSpec,
};
