mod helpers;

use helpers::{TestApp, OWNER, WAIT};
use std::collections::HashSet;
use std::time::Duration;
use streamchat_lib::history::ChatTurn;
use streamchat_lib::models::Role;
use streamchat_lib::publisher::StreamEnd;
use streamchat_lib::reconciler::{EntryState, ViewEntry};
use uuid::Uuid;

fn reply(view: &[ViewEntry]) -> &ViewEntry {
    view.iter()
        .rev()
        .find(|e| e.role == Role::Assistant)
        .expect("no assistant entry in view")
}

async fn wait_for_stored(app: &TestApp, conversation_id: Uuid, content: &str) {
    for _ in 0..100 {
        let messages = app.state.storage.get_messages(OWNER, conversation_id).await.unwrap();
        if messages.iter().any(|m| m.content == content) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("'{}' never reached the store", content);
}

fn assert_unique_and_ordered(view: &[ViewEntry]) {
    let ids: HashSet<_> = view.iter().map(|e| e.id).collect();
    assert_eq!(ids.len(), view.len(), "duplicate ids in view");
    assert!(view.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn given_streamed_reply_when_fragments_arrive_then_one_entry_grows_to_final_text() {
    let app = TestApp::new().await;
    let mut session = app.session();
    let conv = app.state.storage.create_conversation(OWNER, None).await.unwrap();
    session.switch_conversation(conv.id).await.unwrap();
    let fragments = app.provider.script();

    let handle = session.submit("Hello").await.unwrap();
    assert_eq!(reply(session.view()).state, EntryState::Placeholder);

    for (fragment, expected) in [("H", "H"), ("e", "He"), ("llo there", "Hello there")] {
        fragments.send(Ok(fragment.to_string())).unwrap();
        assert!(session.wait_for_update(WAIT).await.unwrap());
        let entry = reply(session.view());
        assert_eq!(entry.content, expected);
        assert_eq!(entry.state, EntryState::Streaming);
        assert_eq!(session.view().len(), 2);
    }
    drop(fragments);
    assert!(session.wait_for_update(WAIT).await.unwrap());

    let outcome = handle.completion.await.unwrap().unwrap();
    assert_eq!(outcome.end, StreamEnd::Completed);
    assert_eq!(outcome.fragments, 3);

    let view = session.view();
    assert_unique_and_ordered(view);
    assert_eq!(view.len(), 2);
    assert_eq!(view[0].content, "Hello");
    assert_eq!(view[1].content, "Hello there");
    assert!(view[1].is_complete);
    assert_eq!(view[1].id.server_id(), Some(handle.receipt.assistant_message.id));

    let stored = app.state.storage.get_messages(OWNER, conv.id).await.unwrap();
    assert_eq!(stored[1].content, "Hello there");
    assert!(stored[1].is_complete);
}

#[tokio::test]
async fn given_lost_and_stale_updates_when_snapshot_merges_then_view_matches_store() {
    let app = TestApp::new().await;
    let mut session = app.session();
    let conv = app.state.storage.create_conversation(OWNER, None).await.unwrap();
    session.switch_conversation(conv.id).await.unwrap();
    let fragments = app.provider.script();

    let handle = session.submit("Tell me something").await.unwrap();
    for fragment in ["Once ", "upon ", "a time"] {
        fragments.send(Ok(fragment.to_string())).unwrap();
    }
    drop(fragments);
    handle.completion.await.unwrap().unwrap();

    // None of the pushed updates were seen yet; the poll gets there first
    session.refresh().await.unwrap();
    assert_eq!(reply(session.view()).content, "Once upon a time");
    assert!(reply(session.view()).is_complete);

    // The queued incremental updates now arrive late and must not reopen it
    let handled = session.pump_events().await.unwrap();
    assert_eq!(handled, 4);
    let view = session.view();
    assert_unique_and_ordered(view);
    assert_eq!(view.len(), 2);
    assert_eq!(reply(view).content, "Once upon a time");
    assert!(reply(view).is_complete);
}

#[tokio::test]
async fn given_open_stream_when_switching_conversation_then_its_updates_stay_out() {
    let app = TestApp::new().await;
    let mut session = app.session();
    let first = app.state.storage.create_conversation(OWNER, Some("first")).await.unwrap();
    let second = app.state.storage.create_conversation(OWNER, Some("second")).await.unwrap();

    session.switch_conversation(first.id).await.unwrap();
    let fragments = app.provider.script();
    let handle = session.submit("long question").await.unwrap();

    session.switch_conversation(second.id).await.unwrap();
    assert!(session.view().is_empty(), "pending entries of the old view were kept");

    fragments.send(Ok("partial".to_string())).unwrap();
    assert!(!session.wait_for_update(Duration::from_millis(200)).await.unwrap());
    wait_for_stored(&app, first.id, "partial").await;
    assert_eq!(session.pump_events().await.unwrap(), 0);
    assert!(session.view().is_empty());

    session.switch_conversation(first.id).await.unwrap();
    assert_eq!(reply(session.view()).content, "partial");
    assert_eq!(reply(session.view()).state, EntryState::Streaming);

    fragments.send(Ok(" answer".to_string())).unwrap();
    drop(fragments);
    handle.completion.await.unwrap().unwrap();
    session.pump_events().await.unwrap();
    assert_eq!(reply(session.view()).content, "partial answer");
    assert!(reply(session.view()).is_complete);
}

#[tokio::test]
async fn given_prior_exchange_when_sending_again_then_model_sees_alternating_turns() {
    let app = TestApp::new().await;
    let mut session = app.session();
    let conv = app.state.storage.create_conversation(OWNER, None).await.unwrap();
    session.switch_conversation(conv.id).await.unwrap();

    let first = app.provider.script();
    first.send(Ok("b".to_string())).unwrap();
    drop(first);
    session.submit("a").await.unwrap().completion.await.unwrap().unwrap();

    let second = app.provider.script();
    drop(second);
    session.submit("c").await.unwrap().completion.await.unwrap().unwrap();

    let requests = app.provider.requests();
    assert_eq!(requests[0], vec![ChatTurn::user("a")]);
    assert_eq!(
        requests[1],
        vec![ChatTurn::user("a"), ChatTurn::assistant("b"), ChatTurn::user("c")]
    );
}

#[tokio::test]
async fn given_stop_request_when_next_fragment_arrives_then_partial_reply_is_final() {
    let app = TestApp::new().await;
    let mut session = app.session();
    let conv = app.state.storage.create_conversation(OWNER, None).await.unwrap();
    session.switch_conversation(conv.id).await.unwrap();
    let fragments = app.provider.script();

    let handle = session.submit("count to a million").await.unwrap();
    fragments.send(Ok("1, 2, 3".to_string())).unwrap();
    assert!(session.wait_for_update(WAIT).await.unwrap());

    let streaming = session.streaming_message_id().expect("reply should be streaming");
    assert_eq!(streaming, handle.receipt.assistant_message.id);
    session.stop(streaming).await.unwrap();
    fragments.send(Ok(", 4".to_string())).unwrap();

    let outcome = handle.completion.await.unwrap().unwrap();
    assert_eq!(outcome.end, StreamEnd::Cancelled);
    assert_eq!(outcome.content, "1, 2, 3");

    session.pump_events().await.unwrap();
    assert!(reply(session.view()).is_complete);
    assert_eq!(session.streaming_message_id(), None);
}

#[tokio::test]
async fn given_unreachable_model_when_sending_then_reply_finalizes_with_error_notice() {
    let app = TestApp::new().await;
    let mut session = app.session();
    let conv = app.state.storage.create_conversation(OWNER, None).await.unwrap();
    session.switch_conversation(conv.id).await.unwrap();

    // Nothing scripted: the provider refuses to start
    let handle = session.submit("anyone there?").await.unwrap();
    let outcome = handle.completion.await.unwrap().unwrap();
    assert!(matches!(outcome.end, StreamEnd::Failed(_)));

    session.pump_events().await.unwrap();
    let entry = reply(session.view());
    assert!(entry.is_complete);
    assert!(entry.content.contains("[Error"));
}
