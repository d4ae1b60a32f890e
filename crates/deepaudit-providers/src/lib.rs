//! deepaudit-providers: concrete `Provider` implementations for the LLM
//! services the auditor engine's agents call through `deepaudit_core::LlmClient`.

pub mod anthropic;
pub mod context_windows;
pub mod gemini;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAIProvider;
