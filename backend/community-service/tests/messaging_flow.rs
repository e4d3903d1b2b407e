mod common;

use std::sync::Arc;
use tokio::time::timeout;

use common::*;
use community_service::domain::Identity;
use community_service::error::InteractionError;
use community_service::repository::{InMemoryStore, StoreOperation};
use community_service::services::{MessagingService, RecordingNotifier, StaticIdentity};

struct Member {
    service: MessagingService,
    notifier: Arc<RecordingNotifier>,
}

fn member(store: &Arc<InMemoryStore>, identity: Option<Identity>) -> Member {
    let notifier = Arc::new(RecordingNotifier::new());
    let identity = Arc::new(match identity {
        Some(identity) => StaticIdentity::signed_in(identity),
        None => StaticIdentity::signed_out(),
    });
    let service = MessagingService::new(store.clone(), store.clone(), identity, notifier.clone());
    Member { service, notifier }
}

#[tokio::test]
async fn starting_a_conversation_requires_sign_in() {
    let store = Arc::new(InMemoryStore::new());
    let guest = member(&store, None);

    let err = guest
        .service
        .start_conversation("user_victor")
        .await
        .unwrap_err();

    assert!(matches!(err, InteractionError::AuthenticationRequired));
    assert_eq!(
        guest.notifier.last().unwrap().description,
        "You must be logged in to start a conversation"
    );
    assert!(guest.service.conversations().await.is_empty());
}

#[tokio::test]
async fn direct_conversation_is_reused() {
    let store = Arc::new(InMemoryStore::new());
    let uma_side = member(&store, Some(uma()));
    let victor_side = member(&store, Some(victor()));

    let first = uma_side.service.start_conversation("user_victor").await.unwrap();
    let again = victor_side.service.start_conversation("user_uma").await.unwrap();

    assert_eq!(first.conversation.id, again.conversation.id);
    assert!(first.conversation.has_participant("user_uma"));
    assert!(first.conversation.has_participant("user_victor"));
    assert_eq!(uma_side.service.conversations().await.len(), 1);
}

#[tokio::test]
async fn cannot_message_yourself() {
    let store = Arc::new(InMemoryStore::new());
    let uma_side = member(&store, Some(uma()));

    let err = uma_side
        .service
        .start_conversation("user_uma")
        .await
        .unwrap_err();

    assert!(matches!(err, InteractionError::Validation(_)));
}

#[tokio::test]
async fn opening_marks_incoming_messages_read() {
    let store = Arc::new(InMemoryStore::new());
    let uma_side = member(&store, Some(uma()));
    let victor_side = member(&store, Some(victor()));

    let thread = uma_side.service.start_conversation("user_victor").await.unwrap();
    let id = thread.conversation.id;
    uma_side.service.send(id, "hi Victor").await.unwrap();
    victor_side.service.send(id, "hey Uma").await.unwrap();

    let opened = uma_side.service.open_conversation(id).await.unwrap();

    let contents: Vec<_> = opened.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["hi Victor", "hey Uma"]);
    assert_eq!(opened.unread_for("user_uma"), 0);
    // Uma's own message stays unread until Victor opens it
    assert_eq!(opened.unread_for("user_victor"), 1);
}

#[tokio::test]
async fn blank_message_is_not_sent() {
    let store = Arc::new(InMemoryStore::new());
    let uma_side = member(&store, Some(uma()));
    let thread = uma_side.service.start_conversation("user_victor").await.unwrap();

    let sent = uma_side
        .service
        .send(thread.conversation.id, "  ")
        .await
        .unwrap();

    assert!(sent.is_none());
    let opened = uma_side
        .service
        .open_conversation(thread.conversation.id)
        .await
        .unwrap();
    assert!(opened.messages.is_empty());
}

#[tokio::test]
async fn conversations_are_ordered_by_latest_activity() {
    let store = Arc::new(InMemoryStore::new());
    let uma_side = member(&store, Some(uma()));

    let with_victor = uma_side.service.start_conversation("user_victor").await.unwrap();
    let with_wren = uma_side.service.start_conversation("user_wren").await.unwrap();
    uma_side
        .service
        .send(with_victor.conversation.id, "bumping this one")
        .await
        .unwrap();

    let conversations = uma_side.service.conversations().await;
    let ids: Vec<_> = conversations.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![with_victor.conversation.id, with_wren.conversation.id]);
    assert_eq!(
        conversations[0].last_message_text.as_deref(),
        Some("bumping this one")
    );
}

#[tokio::test]
async fn failures_are_reported_as_toasts() {
    let store = Arc::new(InMemoryStore::new());
    let uma_side = member(&store, Some(uma()));
    let thread = uma_side.service.start_conversation("user_victor").await.unwrap();

    store.fail_next(StoreOperation::SendMessage);
    let err = uma_side
        .service
        .send(thread.conversation.id, "lost")
        .await
        .unwrap_err();
    assert!(matches!(err, InteractionError::Remote(_)));
    assert_eq!(
        uma_side.notifier.last().unwrap().description,
        "Failed to send message"
    );

    store.fail_next(StoreOperation::FetchConversations);
    assert!(uma_side.service.conversations().await.is_empty());
    assert_eq!(
        uma_side.notifier.last().unwrap().description,
        "Failed to fetch conversations"
    );

    store.fail_next(StoreOperation::CreateConversation);
    let err = uma_side
        .service
        .start_conversation("user_wren")
        .await
        .unwrap_err();
    assert!(matches!(err, InteractionError::Remote(_)));
    assert_eq!(
        uma_side.notifier.last().unwrap().description,
        "Failed to create conversation"
    );
}

#[tokio::test]
async fn watcher_receives_incoming_messages() {
    let store = Arc::new(InMemoryStore::new());
    let uma_side = member(&store, Some(uma()));
    let victor_side = member(&store, Some(victor()));
    let thread = uma_side.service.start_conversation("user_victor").await.unwrap();
    let id = thread.conversation.id;

    let mut watch = uma_side.service.watch_conversation(id).await.unwrap();
    let sent = victor_side.service.send(id, "are you there?").await.unwrap().unwrap();

    let received = timeout(WAIT, watch.next()).await.unwrap().unwrap();
    assert_eq!(received.id, sent.id);
    assert_eq!(watch.conversation_id(), id);

    let opened = victor_side.service.open_conversation(id).await.unwrap();
    assert!(opened.messages.iter().all(|m| m.read));
}

#[tokio::test]
async fn watcher_ignores_other_conversations() {
    let store = Arc::new(InMemoryStore::new());
    let uma_side = member(&store, Some(uma()));
    let victor_side = member(&store, Some(victor()));
    let watched = uma_side.service.start_conversation("user_victor").await.unwrap();
    let elsewhere = victor_side.service.start_conversation("user_wren").await.unwrap();

    let mut watch = uma_side
        .service
        .watch_conversation(watched.conversation.id)
        .await
        .unwrap();
    victor_side
        .service
        .send(elsewhere.conversation.id, "not for Uma")
        .await
        .unwrap();
    let expected = victor_side
        .service
        .send(watched.conversation.id, "for Uma")
        .await
        .unwrap()
        .unwrap();

    let received = timeout(WAIT, watch.next()).await.unwrap().unwrap();
    assert_eq!(received.id, expected.id);
}

#[tokio::test]
async fn conversation_list_refreshes_on_new_messages() {
    let store = Arc::new(InMemoryStore::new());
    let uma_side = member(&store, Some(uma()));
    let victor_side = member(&store, Some(victor()));
    let thread = uma_side.service.start_conversation("user_victor").await.unwrap();

    let mut watch = uma_side.service.watch_conversations().await.unwrap();
    victor_side
        .service
        .send(thread.conversation.id, "ping")
        .await
        .unwrap();

    let found = timeout(WAIT, async {
        while let Some(conversations) = watch.next().await {
            if conversations[0].last_message_text.as_deref() == Some("ping") {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(found);
}
