//! Periodic batching, timer releases and the two-phase session end.

mod common;

use common::{periodic_config, wait_until, Harness, Reply};
use curio_dispatch::{EndSession, QueueKind, Route};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn periodic_mode_defers_everything_but_session_lifecycle() {
    let harness = Harness::with_session(periodic_config()).await;
    let (client, transport) = (&harness.client, &harness.transport);

    client.start_screen("home", "Home", "/home");
    client.send_event("tap", "buy");
    client.persisted().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(transport.calls().len(), 1);
    assert_eq!(client.pending_records(QueueKind::Periodic).await.unwrap(), 2);

    let released = client.tick_periodic_dispatch().expect("tick releases the batch");
    assert_eq!(released.released().await, 2);
    assert_eq!(transport.count(Route::ScreenStart), 1);
    assert_eq!(transport.count(Route::SendEvent), 1);
    assert_eq!(client.pending_records(QueueKind::Periodic).await.unwrap(), 0);

    let event = &transport.calls_to(Route::SendEvent)[0];
    assert_eq!(event.params["type"], 4);
    assert!(event.params.contains_key("timestamp"));
}

#[tokio::test]
async fn session_end_releases_the_batch_first() {
    let harness = Harness::with_session(periodic_config()).await;
    let (client, transport) = (&harness.client, &harness.transport);

    for key in ["a", "b", "c"] {
        client.send_event(key, "v");
    }
    client.persisted().await.unwrap();

    let handle = match client.end_session() {
        EndSession::Releasing(handle) => handle,
        other => panic!("expected a periodic release, got {other:?}"),
    };
    assert!(client.ending_session());
    assert!(client.tick_periodic_dispatch().is_none(), "tick skipped while ending");

    assert_eq!(handle.released().await, 3);
    assert_eq!(transport.count(Route::SendEvent), 3);
    assert_eq!(transport.count(Route::SessionEnd), 0);

    assert!(matches!(client.end_session(), EndSession::Sent));
    assert!(!client.ending_session());
    assert!(transport.wait_for(Route::SessionEnd, 1).await);
    assert!(wait_until(|| client.session_code().is_none()).await);

    let routes: Vec<Option<Route>> = transport.calls().iter().map(|c| c.route).collect();
    assert_eq!(routes.last(), Some(&Some(Route::SessionEnd)));
}

#[tokio::test]
async fn flushed_end_session_runs_both_phases() {
    let harness = Harness::with_session(periodic_config()).await;
    let (client, transport) = (&harness.client, &harness.transport);

    client.send_event("a", "v");
    client.persisted().await.unwrap();

    assert!(matches!(client.end_session_flushed().await, EndSession::Sent));
    assert!(transport.wait_for(Route::SessionEnd, 1).await);
    let events = transport.calls_to(Route::SendEvent);
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn screen_end_uses_the_hit_code_confirmed_by_the_server() {
    let harness = Harness::with_session(periodic_config()).await;
    let (client, transport) = (&harness.client, &harness.transport);
    transport.set_default(Route::ScreenStart, Reply::Status(200, Some(json!({ "hitCode": "srv-A" }))));

    client.start_screen("home", "Home", "/home");
    client.persisted().await.unwrap();
    let local = client.screen_hit_code("home").unwrap();
    assert_ne!(local, "srv-A");

    client.tick_periodic_dispatch().unwrap().released().await;
    assert_eq!(transport.calls_to(Route::ScreenStart)[0].str("hitCode"), Some(local.as_str()));
    assert!(wait_until(|| client.screen_hit_code("home").as_deref() == Some("srv-A")).await);

    client.end_screen("home");
    client.persisted().await.unwrap();
    client.tick_periodic_dispatch().unwrap().released().await;

    let end = &transport.calls_to(Route::ScreenEnd)[0];
    assert_eq!(end.str("hitCode"), Some("srv-A"));
    assert_eq!(end.str("pageTitle"), Some("Home"));
}

#[tokio::test]
async fn disabling_periodic_dispatch_sends_live_again() {
    let harness = Harness::with_session(periodic_config()).await;
    let (client, transport) = (&harness.client, &harness.transport);

    client.send_event("held", "v");
    client.persisted().await.unwrap();
    assert_eq!(transport.count(Route::SendEvent), 0);

    client.set_periodic_dispatch(false);
    client.send_event("live", "v");
    assert!(transport.wait_for(Route::SendEvent, 1).await);
    assert_eq!(transport.calls_to(Route::SendEvent)[0].str("eventKey"), Some("live"));
    assert!(client.tick_periodic_dispatch().is_none());
    assert_eq!(client.pending_records(QueueKind::Periodic).await.unwrap(), 1);
}
