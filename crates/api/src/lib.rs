//! HTTP and WebSocket surface for the darkroom generation service.
//!
//! Everything network-facing lives here: the session router and hub for
//! the WebSocket control channel, the HTTP bridge for binary uploads and
//! content-addressed outputs, the status/queue broadcasters, and the
//! admin endpoints for mode management.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
pub mod state;
pub mod ws;
