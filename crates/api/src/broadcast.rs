//! Push broadcasters: periodic `system:status`, per-mutation
//! `queue:state`, and dream events fanned out to every session.
//!
//! Both loops suspend their work while no sessions are connected; the
//! status loop also fires immediately after a mode change so clients see
//! switches without waiting out the interval.

use std::time::Duration;

use axum::extract::ws::Message;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use darkroom_events::EngineEvent;

use crate::state::AppState;
use crate::ws::protocol::ServerMessage;

/// Cadence of the periodic `system:status` push.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// VRAM usage thresholds for the alert level carried on status frames.
const VRAM_WARNING_PCT: f64 = 85.0;
const VRAM_CRITICAL_PCT: f64 = 95.0;

/// Classify VRAM usage against the warning/critical thresholds.
pub fn vram_alert_level(usage_percent: f64) -> &'static str {
    if usage_percent >= VRAM_CRITICAL_PCT {
        "critical"
    } else if usage_percent >= VRAM_WARNING_PCT {
        "warning"
    } else {
        "ok"
    }
}

/// Build the `system:status` payload: current mode, VRAM, storage
/// health, queue shape, and connected client count.
pub async fn build_status(state: &AppState) -> Value {
    let (pending, running) = state.pool.queue_state();
    let vram = state.registry.stats();
    json!({
        "type": "system:status",
        "ts": chrono::Utc::now().timestamp_millis(),
        "mode": state.pool.current_mode(),
        "vram_alert": vram_alert_level(vram.usage_percent),
        "vram": vram,
        "storage": state.blobs.health(),
        "queue": {
            "pending": pending.len(),
            "running": usize::from(running.is_some()),
        },
        "ws_clients": state.ws.connection_count().await,
    })
}

/// Periodic status broadcaster. Idle (no sessions) intervals skip the
/// build entirely; VRAM threshold crossings are logged and always push,
/// so operators see pressure changes at the poll cadence.
pub fn spawn_status_broadcaster(
    state: AppState,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_alert = "ok";
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let usage = state.registry.stats().usage_percent;
                    let alert = vram_alert_level(usage);
                    let crossed = alert != last_alert;
                    if crossed {
                        tracing::warn!(usage, from = last_alert, to = alert, "VRAM alert level changed");
                        last_alert = alert;
                    }
                    if !crossed && state.ws.connection_count().await == 0 {
                        continue;
                    }
                    let status = build_status(&state).await;
                    state.ws.broadcast(Message::Text(status.to_string().into())).await;
                }
            }
        }
    })
}

/// Bus-driven broadcaster: `queue:state` on every queue mutation,
/// `system:status` on mode changes, and dream pushes.
pub fn spawn_event_broadcaster(
    state: AppState,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = state.bus.subscribe();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Broadcast consumer lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            };

            if state.ws.connection_count().await == 0 {
                continue;
            }

            match event {
                EngineEvent::QueueChanged {
                    pending,
                    running,
                    jobs,
                } => {
                    let frame = ServerMessage::QueueState {
                        pending,
                        running,
                        jobs,
                    }
                    .frame();
                    state.ws.broadcast(frame).await;
                }
                EngineEvent::ModeChanged { .. } => {
                    let status = build_status(&state).await;
                    state
                        .ws
                        .broadcast(Message::Text(status.to_string().into()))
                        .await;
                }
                EngineEvent::DreamCandidate {
                    job_id,
                    prompt,
                    seed,
                    outputs,
                } => {
                    let frame = ServerMessage::DreamCandidatePush {
                        job_id,
                        prompt,
                        seed,
                        outputs,
                    }
                    .frame();
                    state.ws.broadcast(frame).await;
                }
                EngineEvent::DreamStopped { stats } => {
                    let frame = ServerMessage::DreamStopped { id: None, stats }.frame();
                    state.ws.broadcast(frame).await;
                }
                _ => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_levels() {
        assert_eq!(vram_alert_level(0.0), "ok");
        assert_eq!(vram_alert_level(84.9), "ok");
        assert_eq!(vram_alert_level(85.0), "warning");
        assert_eq!(vram_alert_level(94.9), "warning");
        assert_eq!(vram_alert_level(95.0), "critical");
        assert_eq!(vram_alert_level(100.0), "critical");
    }
}
