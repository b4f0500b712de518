//! HTTP surface of the gateway.
//!
//! - [`api`]: Routes, request/response types and handlers
//! - [`auth`]: API-key access guard
//! - [`streaming`]: SSE relay for token-by-token responses

pub mod api;
pub mod auth;
pub mod streaming;
