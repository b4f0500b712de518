//! llm-gateway: authenticated gateway in front of a hosted LLM.
//!
//! Turns a natural-language query into a fixed instruction prompt, sends it
//! to a watsonx.ai model and returns the answer either as one JSON object or
//! as a live server-sent event stream.

pub mod config;
pub mod error;
pub mod inference;
pub mod metrics;
pub mod prompt;
pub mod server;
