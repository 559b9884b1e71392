//! The LLM Adapter (C7): a provider-agnostic contract over chat-completion
//! style APIs with tool-calling, used exclusively by the Agent Controller
//! (C8) and the Insights Engine (C9).

pub mod provider;

pub use provider::{
    ChatReply, LlmAdapter, LlmProvider, Message, ProviderXClient, ProviderYClient,
    ProviderZClient, Role, StopReason, ToolCall, ToolDeclaration, Usage,
};
