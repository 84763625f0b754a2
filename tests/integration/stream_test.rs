//! Stream hub delivery guarantees.

use std::time::Duration;

use neobase::db::StreamNotifier;
use neobase::stream::{StreamEvent, StreamHub};

fn step(n: u32) -> StreamEvent {
    StreamEvent::AiResponseStep {
        message: format!("step {n}"),
        user_message_id: "m1".into(),
    }
}

#[tokio::test]
async fn events_are_delivered_in_producer_order() {
    let hub = StreamHub::new(Duration::from_secs(300));
    let mut rx = hub.register("s1", "c1", "u1");

    for n in 0..50 {
        hub.emit("s1", step(n));
    }

    for n in 0..50 {
        match rx.recv().await.unwrap() {
            StreamEvent::AiResponseStep { message, .. } => {
                assert_eq!(message, format!("step {n}"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn exactly_one_terminal_event_per_turn() {
    let hub = StreamHub::new(Duration::from_secs(300));
    let mut rx = hub.register("s1", "c1", "u1");
    hub.begin_turn("s1");

    hub.emit(
        "s1",
        StreamEvent::AiResponseError {
            code: "LLM_ERROR".into(),
            message: "boom".into(),
            user_message_id: "m1".into(),
        },
    );
    hub.emit(
        "s1",
        StreamEvent::ResponseCancelled {
            user_message_id: "m1".into(),
        },
    );

    let first = rx.recv().await.unwrap();
    assert!(matches!(first, StreamEvent::AiResponseError { .. }));
    assert!(rx.try_recv().is_err(), "second terminal must be suppressed");
}

#[tokio::test]
async fn reconnect_resumes_pending_events() {
    let hub = StreamHub::new(Duration::from_secs(300));
    let rx = hub.register("s1", "c1", "u1");
    drop(rx);

    hub.emit("s1", step(1));
    hub.emit("s1", step(2));

    let mut rx = hub.register("s1", "c1", "u1");
    for n in 1..=2 {
        match rx.recv().await.unwrap() {
            StreamEvent::AiResponseStep { message, .. } => {
                assert_eq!(message, format!("step {n}"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn collected_streams_drop_later_events() {
    let hub = StreamHub::new(Duration::from_millis(5));
    let rx = hub.register("s1", "c1", "u1");
    drop(rx);
    hub.detach_consumer("s1");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(hub.collect_idle(), 1);

    // Events for the collected id disappear; re-registering starts
    // from a clean session.
    hub.emit("s1", step(1));
    let mut rx = hub.register("s1", "c1", "u1");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn db_lifecycle_events_reach_all_chat_streams() {
    let hub = StreamHub::new(Duration::from_secs(300));
    let mut rx_a = hub.register("s1", "c1", "u1");
    let mut rx_b = hub.register("s2", "c1", "u1");
    let mut rx_other = hub.register("s3", "c2", "u2");

    hub.on_connected("c1");

    assert!(matches!(
        rx_a.recv().await.unwrap(),
        StreamEvent::DbConnected { .. }
    ));
    assert!(matches!(
        rx_b.recv().await.unwrap(),
        StreamEvent::DbConnected { .. }
    ));
    assert!(rx_other.try_recv().is_err());
}

#[test]
fn sse_frames_follow_the_wire_format() {
    let frame = StreamEvent::SystemMessage {
        message: "The database schema changed. Consider refreshing.".into(),
    }
    .to_sse_frame();

    let mut lines = frame.lines();
    assert_eq!(lines.next(), Some("event: system-message"));
    let data = lines.next().unwrap();
    assert!(data.starts_with("data: "));
    let parsed: serde_json::Value =
        serde_json::from_str(data.strip_prefix("data: ").unwrap()).unwrap();
    assert!(parsed["message"].as_str().unwrap().contains("schema"));
    assert!(frame.ends_with("\n\n"));
}
