use std::time::Duration;

use task_progress_server::events::{ProgressEvent, TaskStatus};
use task_progress_server::runner::{CANCELLED_MESSAGE, STAGES};
use task_progress_server::stream::{CONNECTION_ALIVE, CONNECTION_ESTABLISHED};
use task_progress_server::{EngineConfig, ProgressEngine, StreamSession};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn create_test_engine() -> ProgressEngine {
    ProgressEngine::new(EngineConfig::default())
}

/// Next non-heartbeat event; panics if the stream ends first.
async fn next_task_event(session: &mut StreamSession) -> ProgressEvent {
    loop {
        let event = session.next_event().await.expect("stream ended");
        if !event.is_heartbeat() {
            return event;
        }
    }
}

async fn collect_task(session: &mut StreamSession) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_task_event(session).await;
        let done = event.status.is_terminal();
        events.push(event);
        if done {
            return events;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_task_reports_five_stages() {
    let engine = create_test_engine();
    let mut session = engine.open_stream("alice", None, CancellationToken::new());

    let hello = session.next_event().await.unwrap();
    assert!(hello.is_heartbeat());
    assert_eq!(hello.message.as_deref(), Some(CONNECTION_ESTABLISHED));

    let started = Instant::now();
    let task_id = engine.start_task("alice", "ReportGen", 5).unwrap();
    let events = collect_task(&mut session).await;

    let pcts: Vec<u8> = events.iter().map(|e| e.progress_percentage).collect();
    assert_eq!(pcts, vec![20, 40, 60, 80, 100]);

    let messages: Vec<&str> = events.iter().filter_map(|e| e.message.as_deref()).collect();
    assert_eq!(messages, STAGES.to_vec());

    assert!(events.iter().all(|e| e.task_id == task_id && e.task_name == "ReportGen"));
    assert!(events[..4].iter().all(|e| e.status == TaskStatus::Running));
    assert_eq!(events[4].status, TaskStatus::Completed);

    // Four pauses of one second each; none after the last stage.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_task_emits_single_cancelled_event() {
    let engine = create_test_engine();
    let mut session = engine.open_stream("alice", None, CancellationToken::new());
    session.next_event().await.unwrap();

    let task_id = engine.start_task("alice", "ReportGen", 10).unwrap();
    assert_eq!(next_task_event(&mut session).await.progress_percentage, 20);
    assert_eq!(next_task_event(&mut session).await.progress_percentage, 40);

    engine.cancel_task("alice", &task_id).unwrap();
    let cancelled = next_task_event(&mut session).await;
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(cancelled.progress_percentage, 0);
    assert_eq!(cancelled.message.as_deref(), Some(CANCELLED_MESSAGE));

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(engine.running_tasks("alice").is_empty());
    assert_eq!(engine.hub().history_len("alice"), 3);
    assert!(engine.cancel_task("alice", &task_id).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_replays_missed_events() {
    let engine = create_test_engine();
    engine.start_task("alice", "ReportGen", 5).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let mut session = engine.open_stream("alice", Some("2"), CancellationToken::new());
    let mut replayed = Vec::new();
    for _ in 0..3 {
        replayed.push(session.next_event().await.unwrap());
    }
    let ids: Vec<&str> = replayed.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(ids, vec!["3", "4", "5"]);

    let hello = session.next_event().await.unwrap();
    assert_eq!(hello.message.as_deref(), Some(CONNECTION_ESTABLISHED));
    assert_eq!(hello.event_id, "5");
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_from_heartbeat_id_replays_missed_events() {
    let engine = create_test_engine();

    // Disconnect before any event was stored.
    let mut session = engine.open_stream("alice", None, CancellationToken::new());
    let hello = session.next_event().await.unwrap();
    assert_eq!(hello.event_id, "0");
    drop(session);

    engine.start_task("alice", "ReportGen", 0).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut session = engine.open_stream("alice", Some(hello.event_id.as_str()), CancellationToken::new());
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(session.next_event().await.unwrap().event_id);
    }
    assert_eq!(ids, vec!["1", "2", "3", "4", "5"]);
    let hello = session.next_event().await.unwrap();
    assert_eq!(hello.message.as_deref(), Some(CONNECTION_ESTABLISHED));

    // Disconnect right after an idle heartbeat.
    let beat = session.next_event().await.unwrap();
    assert_eq!(beat.message.as_deref(), Some(CONNECTION_ALIVE));
    assert_eq!(beat.event_id, "5");
    drop(session);

    engine.start_task("alice", "Export", 0).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut session = engine.open_stream("alice", Some(beat.event_id.as_str()), CancellationToken::new());
    let mut replayed = Vec::new();
    for _ in 0..5 {
        replayed.push(session.next_event().await.unwrap());
    }
    let ids: Vec<&str> = replayed.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(ids, vec!["6", "7", "8", "9", "10"]);
    assert!(replayed.iter().all(|e| e.task_name == "Export"));
    assert!(session.next_event().await.unwrap().is_heartbeat());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_resume_point_replays_nothing() {
    let engine = create_test_engine();
    engine.start_task("alice", "ReportGen", 0).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    for resume in ["5", "99", "2024-01-01T00:00:00Z"] {
        let mut session = engine.open_stream("alice", Some(resume), CancellationToken::new());
        let first = session.next_event().await.unwrap();
        assert!(first.is_heartbeat(), "resume point {resume} replayed events");
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_sessions_see_same_order() {
    let engine = create_test_engine();
    let mut first = engine.open_stream("alice", None, CancellationToken::new());
    let mut second = engine.open_stream("alice", None, CancellationToken::new());
    first.next_event().await.unwrap();
    second.next_event().await.unwrap();

    engine.start_task("alice", "ReportGen", 5).unwrap();
    engine.start_task("alice", "Export", 3).unwrap();

    let mut a = Vec::new();
    let mut b = Vec::new();
    for _ in 0..10 {
        a.push(next_task_event(&mut first).await.event_id);
    }
    for _ in 0..10 {
        b.push(next_task_event(&mut second).await.event_id);
    }
    assert_eq!(a, b);
    let expected: Vec<String> = (1..=10).map(|n| n.to_string()).collect();
    assert_eq!(a, expected);
}

#[tokio::test(start_paused = true)]
async fn test_users_are_isolated() {
    let engine = create_test_engine();
    let mut bob = engine.open_stream("bob", None, CancellationToken::new());
    bob.next_event().await.unwrap();

    engine.start_task("alice", "ReportGen", 5).unwrap();

    let next = bob.next_event().await.unwrap();
    assert!(next.is_heartbeat());
    assert_eq!(next.message.as_deref(), Some(CONNECTION_ALIVE));
    assert_eq!(engine.hub().history_len("bob"), 0);
    assert_eq!(engine.hub().history_len("alice"), 5);
}

#[tokio::test(start_paused = true)]
async fn test_idle_heartbeat_carries_last_event_id() {
    let engine = create_test_engine();
    let mut session = engine.open_stream("alice", None, CancellationToken::new());
    session.next_event().await.unwrap();

    engine.start_task("alice", "ReportGen", 5).unwrap();
    collect_task(&mut session).await;

    let idle_since = Instant::now();
    let beat = session.next_event().await.unwrap();
    assert_eq!(beat.message.as_deref(), Some(CONNECTION_ALIVE));
    assert_eq!(beat.event_id, "5");
    let idle = idle_since.elapsed();
    assert!(idle >= Duration::from_secs(30) && idle < Duration::from_secs(31));
}

#[tokio::test(start_paused = true)]
async fn test_history_keeps_last_fifty_events() {
    let engine = create_test_engine();
    for n in 0..12 {
        engine.start_task("alice", &format!("Batch {n}"), 0).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    let hub = engine.hub();
    assert_eq!(hub.history_len("alice"), 50);
    assert!(hub.replay_after("alice", "1").is_empty());

    let replayed = hub.replay_after("alice", "11");
    assert_eq!(replayed.len(), 49);
    assert_eq!(replayed[0].event_id, "12");
    assert_eq!(replayed[48].event_id, "60");
}

#[tokio::test(start_paused = true)]
async fn test_closed_streams_deregister() {
    let engine = create_test_engine();
    let token = CancellationToken::new();
    let mut cancelled = engine.open_stream("alice", None, token.clone());
    let dropped = engine.open_stream("alice", None, CancellationToken::new());
    assert_eq!(engine.hub().subscriber_count("alice"), 2);

    drop(dropped);
    assert_eq!(engine.hub().subscriber_count("alice"), 1);

    cancelled.next_event().await.unwrap();
    token.cancel();
    assert!(cancelled.next_event().await.is_none());
    assert!(cancelled.next_event().await.is_none());
    assert_eq!(engine.hub().subscriber_count("alice"), 0);

    // Publishing with nobody listening still records history.
    engine.start_task("alice", "ReportGen", 0).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(engine.hub().history_len("alice"), 5);
}

#[tokio::test(start_paused = true)]
async fn test_active_users_expire_after_five_minutes() {
    let engine = create_test_engine();
    let sweeper = engine.start_background();

    engine.register_activity("alice");
    let _stream = engine.open_stream("bob", None, CancellationToken::new());
    assert_eq!(engine.active_user_count(), 2);

    tokio::time::sleep(Duration::from_secs(4 * 60)).await;
    engine.register_activity("alice");
    tokio::time::sleep(Duration::from_secs(2 * 60)).await;
    assert_eq!(engine.active_user_count(), 1);

    tokio::time::sleep(Duration::from_secs(5 * 60)).await;
    assert_eq!(engine.active_user_count(), 0);

    assert!(engine.shutdown(Duration::from_secs(1)).await);
    sweeper.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_running_tasks() {
    let engine = create_test_engine();
    let mut session = engine.open_stream("alice", None, CancellationToken::new());
    session.next_event().await.unwrap();
    engine.start_task("alice", "ReportGen", 60).unwrap();
    assert_eq!(next_task_event(&mut session).await.progress_percentage, 20);

    assert!(engine.shutdown(Duration::from_secs(1)).await);
    assert!(session.next_event().await.is_none());

    let stored = engine.hub().events_since("alice", 0);
    assert_eq!(stored.last().map(|e| e.status), Some(TaskStatus::Cancelled));
    assert!(engine.running_tasks("alice").is_empty());
}
