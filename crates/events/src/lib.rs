//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the rendezvous between the engine (worker pool, dream
//! controller) and every surface that wants to observe it (WebSocket
//! session fan-out, status broadcasters, tests). Events are published
//! from any thread -- including the pool's blocking execution thread --
//! and received by async subscribers.

pub mod bus;

pub use bus::{DreamStats, EngineEvent, EventBus, JobMeta, OutputRef};
