//! End-to-end chat scenarios over mocks.

use std::sync::Arc;

use neobase::llm::{AiResponse, MockLlmClient, QuerySpec};
use neobase::models::{ChatSettings, QueryStatus};
use neobase::storage::{ChatStore, MessageStore};
use neobase::stream::StreamEvent;

use super::test_core;

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn read_query_happy_path() {
    let core = test_core(Arc::new(MockLlmClient::new()), ChatSettings::default()).await;
    let mut rx = core.hub.register("s1", "c1", "u1");

    core.service
        .send_message("u1", "c1", "s1", "Show me all users")
        .await
        .unwrap();

    let events = drain(&mut rx);

    // Progress steps come first, then exactly one terminal event.
    assert!(matches!(
        events.first(),
        Some(StreamEvent::AiResponseStep { message, .. }) if message.contains("analyzing")
    ));
    let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminals.len(), 1);

    let StreamEvent::AiResponse(payload) = terminals[0] else {
        panic!("expected ai-response, got {:?}", terminals[0]);
    };
    let queries = payload.queries.as_ref().unwrap();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].query.contains("SELECT"));

    // The read executed immediately and returned the mock's rows.
    let result = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::QueryResult(p) if p.tag == "execute" => Some(p),
            _ => None,
        })
        .expect("read query should auto-execute");
    assert_eq!(result.result.rows.len(), 2);
    assert!(result.result.rows[0].contains_key("name"));
}

#[tokio::test]
async fn write_query_with_rollback_restores() {
    let response = AiResponse {
        assistant_message: "This will uppercase every name.".into(),
        queries: vec![QuerySpec {
            query: "UPDATE users SET name = upper(name)".into(),
            query_type: Some("UPDATE".into()),
            tables: Some("users".into()),
            explanation: None,
            rollback_query: Some("UPDATE users SET name = lower(name)".into()),
        }],
        action_buttons: vec![],
    };
    let core = test_core(
        Arc::new(MockLlmClient::new().with_response(response)),
        ChatSettings::default(),
    )
    .await;
    let mut rx = core.hub.register("s1", "c1", "u1");

    core.service
        .send_message("u1", "c1", "s1", "Set every user's name to uppercase")
        .await
        .unwrap();
    drain(&mut rx);

    let assistant = core.stores.messages.list_recent("c1", 10).await.unwrap()[1].clone();
    let query = assistant.queries.as_ref().unwrap()[0].clone();
    assert!(query.rollback_query.is_some());

    let forward = core
        .service
        .execute_query("u1", "c1", "s1", &assistant.id, &query.id)
        .await
        .unwrap();
    assert_eq!(forward.affected_rows, Some(2));

    let rollback = core
        .service
        .rollback_query("u1", "c1", "s1", &assistant.id, &query.id)
        .await
        .unwrap();
    assert_eq!(rollback.affected_rows, Some(2));

    let stored = core
        .stores
        .messages
        .get("c1", &assistant.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.query(&query.id).unwrap().status, QueryStatus::RolledBack);
}

#[tokio::test]
async fn edit_keeps_assistant_message_id() {
    let core = test_core(Arc::new(MockLlmClient::new()), ChatSettings::default()).await;
    let mut rx = core.hub.register("s1", "c1", "u1");

    let user_message = core
        .service
        .send_message("u1", "c1", "s1", "top 10 orders")
        .await
        .unwrap();
    drain(&mut rx);

    let before = core
        .stores
        .messages
        .find_assistant_for("c1", &user_message.id)
        .await
        .unwrap()
        .unwrap();

    core.service
        .edit_message("u1", "c1", "s1", &user_message.id, "top 5 orders")
        .await
        .unwrap();
    let events = drain(&mut rx);

    let after = core
        .stores
        .messages
        .find_assistant_for("c1", &user_message.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before.id, after.id, "assistant id must survive the edit");

    // Terminal event carries the original pairing.
    let terminal = events.iter().find(|e| e.is_terminal()).unwrap();
    let StreamEvent::AiResponse(payload) = terminal else {
        panic!("expected ai-response");
    };
    assert_eq!(payload.message_id, before.id);
    assert_eq!(payload.user_message_id, user_message.id);
}

#[tokio::test]
async fn provider_outage_surfaces_error_and_keeps_user_message() {
    let core = test_core(
        Arc::new(MockLlmClient::failing("upstream returned 502")),
        ChatSettings::default(),
    )
    .await;
    let mut rx = core.hub.register("s1", "c1", "u1");

    core.service
        .send_message("u1", "c1", "s1", "Show me all users")
        .await
        .unwrap();

    let events = drain(&mut rx);
    let terminal = events.iter().find(|e| e.is_terminal()).unwrap();
    match terminal {
        StreamEvent::AiResponseError { code, message, .. } => {
            assert_eq!(code, "LLM_ERROR");
            assert!(message.contains("502"));
        }
        other => panic!("expected ai-response-error, got {other:?}"),
    }

    let history = core.stores.messages.list_recent("c1", 10).await.unwrap();
    assert_eq!(history.len(), 1, "only the user message is persisted");
}

#[tokio::test]
async fn cancellation_mid_llm_releases_the_chat() {
    let core = test_core(
        Arc::new(MockLlmClient::new().with_delay(std::time::Duration::from_secs(30))),
        ChatSettings::default(),
    )
    .await;
    let mut rx = core.hub.register("s1", "c1", "u1");

    let service = core.service.clone();
    let turn = tokio::spawn(async move {
        service
            .send_message("u1", "c1", "s1", "Show me all users")
            .await
    });

    // First progress event means ANALYZING started.
    loop {
        if let Some(StreamEvent::AiResponseStep { .. }) = rx.recv().await {
            break;
        }
    }
    core.service.cancel("s1");
    turn.await.unwrap().unwrap();

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::ResponseCancelled { .. })));

    // No assistant message was persisted; the user message survives.
    let history = core.stores.messages.list_recent("c1", 10).await.unwrap();
    assert_eq!(history.len(), 1);

    // The chat mutex is released: a second turn reaches ANALYZING
    // immediately instead of blocking on the lock.
    let service = core.service.clone();
    let second = tokio::spawn(async move {
        service
            .send_message("u1", "c1", "s1", "Show me all users again")
            .await
    });
    let step = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv()).await;
    assert!(
        matches!(step, Ok(Some(StreamEvent::AiResponseStep { .. }))),
        "chat must not stay locked after cancel"
    );
    core.service.cancel("s1");
    second.await.unwrap().unwrap();
}

#[tokio::test]
async fn clear_messages_empties_history() {
    let core = test_core(Arc::new(MockLlmClient::new()), ChatSettings::default()).await;
    core.hub.register("s1", "c1", "u1");

    core.service
        .send_message("u1", "c1", "s1", "Show me all users")
        .await
        .unwrap();
    assert!(!core
        .stores
        .messages
        .list_recent("c1", 10)
        .await
        .unwrap()
        .is_empty());

    core.service.clear_messages("u1", "c1").await.unwrap();
    assert!(core
        .stores
        .messages
        .list_recent("c1", 10)
        .await
        .unwrap()
        .is_empty());

    // The chat itself survives.
    assert!(core.stores.chats.get("c1").await.unwrap().is_some());
}
