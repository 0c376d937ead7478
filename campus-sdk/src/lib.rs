//! campus-sdk: shared wire models, a typed client for the campus HTTP API,
//! and an OpenAI-compatible chat completions client (DeepSeek, OpenAI).

pub mod client;
pub mod llm;
pub mod models;
