//! API translation between the Ollama and `OpenAI` wire formats.
//!
//! The core of the gateway: converts requests, responses, and streaming
//! chunks through a backend-agnostic canonical form. All translation
//! functions are pure (no I/O).

pub mod canonical;
pub mod ollama_types;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
