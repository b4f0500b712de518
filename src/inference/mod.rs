//! Upstream model inference.
//!
//! - [`types`]: Model configuration, payloads, stream chunks and errors
//! - [`auth`]: Bearer-token exchange for the upstream endpoint
//! - [`client`]: The model client trait and its watsonx.ai implementation
//! - [`streaming`]: Decoding and relaying the upstream token stream

pub mod auth;
pub mod client;
pub mod streaming;
pub mod types;
