//! Unit tests for `WsManager` and the per-session shared state.
//!
//! These exercise the session registry directly, without HTTP upgrades:
//! add/remove semantics, targeted and broadcast delivery, graceful
//! shutdown, and job-ownership bookkeeping.

use axum::extract::ws::Message;
use darkroom_api::ws::WsManager;

#[tokio::test]
async fn new_manager_has_zero_connections() {
    let manager = WsManager::new();
    assert_eq!(manager.connection_count().await, 0);
}

#[tokio::test]
async fn add_and_remove_track_count() {
    let manager = WsManager::new();

    let (_rx, _shared) = manager.add("sess-1".to_string()).await;
    assert_eq!(manager.connection_count().await, 1);

    manager.remove("sess-1").await;
    assert_eq!(manager.connection_count().await, 0);
}

#[tokio::test]
async fn remove_unknown_id_is_noop() {
    let manager = WsManager::new();
    let (_rx, _shared) = manager.add("sess-1".to_string()).await;

    manager.remove("nonexistent").await;
    assert_eq!(manager.connection_count().await, 1);
}

#[tokio::test]
async fn send_to_targets_one_session() {
    let manager = WsManager::new();
    let (mut rx1, _s1) = manager.add("sess-1".to_string()).await;
    let (mut rx2, _s2) = manager.add("sess-2".to_string()).await;

    manager
        .send_to("sess-1", Message::Text("only for one".into()))
        .await;

    let msg = rx1.recv().await.expect("sess-1 should receive");
    assert!(matches!(&msg, Message::Text(t) if *t == "only for one"));
    assert!(rx2.try_recv().is_err(), "sess-2 must not receive");
}

#[tokio::test]
async fn broadcast_reaches_all_sessions() {
    let manager = WsManager::new();
    let (mut rx1, _s1) = manager.add("sess-1".to_string()).await;
    let (mut rx2, _s2) = manager.add("sess-2".to_string()).await;
    let (mut rx3, _s3) = manager.add("sess-3".to_string()).await;

    manager.broadcast(Message::Text("hello everyone".into())).await;

    for rx in [&mut rx1, &mut rx2, &mut rx3] {
        let msg = rx.recv().await.expect("should receive broadcast");
        assert!(matches!(&msg, Message::Text(t) if *t == "hello everyone"));
    }
}

#[tokio::test]
async fn broadcast_skips_closed_channels() {
    let manager = WsManager::new();
    let (rx1, _s1) = manager.add("sess-1".to_string()).await;
    let (mut rx2, _s2) = manager.add("sess-2".to_string()).await;

    drop(rx1);

    manager.broadcast(Message::Text("still alive".into())).await;
    let msg = rx2.recv().await.expect("sess-2 should receive");
    assert!(matches!(&msg, Message::Text(t) if *t == "still alive"));
}

#[tokio::test]
async fn shutdown_all_sends_close_and_clears() {
    let manager = WsManager::new();
    let (mut rx1, _s1) = manager.add("sess-1".to_string()).await;
    let (mut rx2, _s2) = manager.add("sess-2".to_string()).await;

    manager.shutdown_all().await;
    assert_eq!(manager.connection_count().await, 0);

    for rx in [&mut rx1, &mut rx2] {
        let msg = rx.recv().await.expect("should receive Close");
        assert!(matches!(msg, Message::Close(None)));
        assert!(rx.recv().await.is_none(), "channel closed after shutdown");
    }
}

#[tokio::test]
async fn duplicate_id_replaces_previous_session() {
    let manager = WsManager::new();
    let (_rx_old, _s_old) = manager.add("sess-1".to_string()).await;

    let (mut rx_new, _s_new) = manager.add("sess-1".to_string()).await;
    assert_eq!(manager.connection_count().await, 1);

    manager.broadcast(Message::Text("replaced".into())).await;
    let msg = rx_new.recv().await.expect("new receiver gets the message");
    assert!(matches!(&msg, Message::Text(t) if *t == "replaced"));
}

// ---------------------------------------------------------------------------
// Session job ownership
// ---------------------------------------------------------------------------

#[tokio::test]
async fn session_tracks_job_ownership() {
    let manager = WsManager::new();
    let (_rx, shared) = manager.add("sess-1".to_string()).await;

    assert!(!shared.owns("job-1"));
    shared.register_job(Some("corr-1".to_string()), &"job-1".to_string());
    assert!(shared.owns("job-1"));

    shared.release_job("job-1");
    assert!(!shared.owns("job-1"));
}

#[tokio::test]
async fn release_is_idempotent_and_scoped() {
    let manager = WsManager::new();
    let (_rx, shared) = manager.add("sess-1".to_string()).await;

    shared.register_job(None, &"job-1".to_string());
    shared.register_job(None, &"job-2".to_string());

    shared.release_job("job-1");
    shared.release_job("job-1");
    assert!(!shared.owns("job-1"));
    assert!(shared.owns("job-2"));
}

#[tokio::test]
async fn session_lookup_by_id() {
    let manager = WsManager::new();
    let (_rx, shared) = manager.add("sess-1".to_string()).await;
    shared.register_job(None, &"job-9".to_string());

    let found = manager.session("sess-1").await.expect("session exists");
    assert!(found.owns("job-9"));
    assert!(manager.session("ghost").await.is_none());
}
