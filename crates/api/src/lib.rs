//! HTTP API: server, routing, request/response mapping, and typed clients.

pub mod app;
pub mod client;
