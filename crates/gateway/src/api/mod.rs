//! HTTP surface: chat endpoints, the SSE stream, and the admin metrics
//! endpoint.

pub mod admin;
pub mod chat;
pub mod router;
