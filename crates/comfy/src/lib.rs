//! ComfyUI bridge for the darkroom engine.
//!
//! The accelerator-bound backend this service ships with delegates
//! execution to a ComfyUI server: workflows are submitted over its HTTP
//! API and progress streams back over its WebSocket. [`ComfyWorker`]
//! wraps that protocol behind the engine's blocking `Worker` trait;
//! [`ComfyWorkerFactory`] is the default worker factory wired up in
//! `main`.

pub mod api;
pub mod backoff;
pub mod client;
pub mod messages;
pub mod template;
pub mod worker;

pub use api::ComfyApi;
pub use client::{ComfyClient, ComfyConnection};
pub use worker::{ComfyEndpoints, ComfyWorker, ComfyWorkerFactory};
