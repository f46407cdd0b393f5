use super::*;
use chrono::{DateTime, TimeZone, Utc};
use shared::domain::ConversationId;

const SELF: UserId = UserId(1);
const PEER: UserId = UserId(42);
const CONVERSATION: ConversationKey = ConversationKey::Confirmed(ConversationId(7));

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("timestamp")
}

fn confirmed(id: i64, seconds: i64, sender: UserId, receiver: UserId) -> Message {
    Message {
        message_id: Some(MessageId(id)),
        temp_id: None,
        conversation: CONVERSATION,
        sender_id: sender,
        receiver_id: receiver,
        content: format!("message {id}"),
        created_at: at(seconds),
        status: MessageStatus::Sent,
    }
}

fn pending(temp: &str, seconds: i64) -> Message {
    Message::pending(
        CONVERSATION,
        TempId::from(temp),
        SELF,
        PEER,
        "hello",
        at(seconds),
    )
}

fn assert_sorted(messages: &[Message]) {
    for pair in messages.windows(2) {
        assert!(
            pair[0].sort_key() <= pair[1].sort_key(),
            "log out of order: {:?} then {:?}",
            pair[0].key(),
            pair[1].key()
        );
    }
}

#[tokio::test]
async fn confirmed_echo_replaces_pending_entry() {
    let store = MessageLogStore::new();
    store.append(CONVERSATION, pending("tmp-1", 10)).await;

    let mut echo = confirmed(101, 11, SELF, PEER);
    echo.temp_id = Some(TempId::from("tmp-1"));
    let outcome = store.append(CONVERSATION, echo).await;

    assert_eq!(
        outcome,
        AppendOutcome::Reconciled {
            temp_id: TempId::from("tmp-1")
        }
    );
    let messages = store.messages(CONVERSATION).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_id, Some(MessageId(101)));
    assert_eq!(messages[0].status, MessageStatus::Sent);
    assert_eq!(messages[0].created_at, at(11));
}

#[tokio::test]
async fn repeated_echoes_do_not_duplicate() {
    let store = MessageLogStore::new();
    store.append(CONVERSATION, pending("tmp-1", 10)).await;
    store.append(CONVERSATION, pending("tmp-1", 10)).await;

    let mut echo = confirmed(101, 11, SELF, PEER);
    echo.temp_id = Some(TempId::from("tmp-1"));
    store.append(CONVERSATION, echo.clone()).await;
    let again = store.append(CONVERSATION, echo).await;

    assert_eq!(again, AppendOutcome::Unchanged);
    assert_eq!(store.len(CONVERSATION).await, 1);
}

#[tokio::test]
async fn reconciliation_resorts_when_server_timestamp_differs() {
    let store = MessageLogStore::new();
    store.append(CONVERSATION, pending("tmp-1", 50)).await;
    store
        .append(CONVERSATION, confirmed(90, 20, PEER, SELF))
        .await;
    store
        .append(CONVERSATION, confirmed(91, 30, PEER, SELF))
        .await;

    let mut echo = confirmed(101, 25, SELF, PEER);
    echo.temp_id = Some(TempId::from("tmp-1"));
    store.append(CONVERSATION, echo).await;

    let ids: Vec<_> = store
        .messages(CONVERSATION)
        .await
        .iter()
        .map(|m| m.message_id.map(|id| id.0))
        .collect();
    assert_eq!(ids, vec![Some(90), Some(101), Some(91)]);
}

#[tokio::test]
async fn echo_into_confirmed_conversation_moves_placeholder_log() {
    let store = MessageLogStore::new();
    let placeholder = ConversationKey::Provisional(PEER);
    let mut local = pending("tmp-1", 10);
    local.conversation = placeholder;
    store.append(placeholder, local).await;

    let mut echo = confirmed(101, 11, SELF, PEER);
    echo.temp_id = Some(TempId::from("tmp-1"));
    let outcome = store.append(CONVERSATION, echo).await;

    assert!(matches!(outcome, AppendOutcome::Reconciled { .. }));
    assert!(store.is_empty(placeholder).await);
    let messages = store.messages(CONVERSATION).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].conversation, CONVERSATION);
}

#[tokio::test]
async fn out_of_order_arrivals_stay_sorted_with_id_tie_break() {
    let store = MessageLogStore::new();
    for (id, seconds) in [(5, 30), (3, 10), (9, 20), (4, 20), (1, 40)] {
        store
            .append(CONVERSATION, confirmed(id, seconds, PEER, SELF))
            .await;
    }
    store.append(CONVERSATION, pending("tmp-z", 20)).await;

    let messages = store.messages(CONVERSATION).await;
    assert_sorted(&messages);
    let keys: Vec<String> = messages.iter().map(|m| m.key().to_string()).collect();
    assert_eq!(keys, vec!["3", "4", "9", "tmp-z", "5", "1"]);
}

#[tokio::test]
async fn status_never_regresses() {
    let store = MessageLogStore::new();
    store
        .append(CONVERSATION, confirmed(101, 1, PEER, SELF))
        .await;

    assert!(store.update_status(MessageId(101), MessageStatus::Seen).await);
    assert!(
        !store
            .update_status(MessageId(101), MessageStatus::Delivered)
            .await
    );
    assert!(!store.update_status(MessageId(101), MessageStatus::Seen).await);
    assert!(!store.update_status(MessageId(101), MessageStatus::Failed).await);
    assert!(!store.update_status(MessageId(999), MessageStatus::Read).await);

    let message = store.get(MessageId(101)).await.expect("message");
    assert_eq!(message.status, MessageStatus::Seen);
}

#[tokio::test]
async fn history_and_live_messages_merge_losslessly() {
    let store = MessageLogStore::new();
    store
        .append(CONVERSATION, confirmed(3, 30, PEER, SELF))
        .await;
    store.update_status(MessageId(3), MessageStatus::Read).await;
    store.append(CONVERSATION, pending("tmp-1", 50)).await;

    let mut page = vec![
        confirmed(1, 10, PEER, SELF),
        confirmed(2, 20, SELF, PEER),
        confirmed(3, 30, PEER, SELF),
    ];
    page[2].status = MessageStatus::Delivered;
    let merge = store.load_history(CONVERSATION, page).await;

    assert_eq!(merge.inserted, 2);
    assert_eq!(merge.unchanged, 1);
    let messages = store.messages(CONVERSATION).await;
    assert_eq!(messages.len(), 4);
    assert_sorted(&messages);
    let third = store.get(MessageId(3)).await.expect("message 3");
    assert_eq!(third.status, MessageStatus::Read);
}

#[tokio::test]
async fn history_page_carrying_temp_id_reconciles_pending_entry() {
    let store = MessageLogStore::new();
    store.append(CONVERSATION, pending("tmp-1", 10)).await;

    let mut fetched = confirmed(101, 11, SELF, PEER);
    fetched.temp_id = Some(TempId::from("tmp-1"));
    let merge = store.load_history(CONVERSATION, vec![fetched]).await;

    assert_eq!(merge.reconciled, 1);
    assert_eq!(store.len(CONVERSATION).await, 1);
}

#[tokio::test]
async fn failed_send_is_kept_until_discarded() {
    let store = MessageLogStore::new();
    let temp_id = TempId::from("tmp-1");
    store.append(CONVERSATION, pending("tmp-1", 10)).await;

    assert!(store.discard(&temp_id).await.is_none());
    assert!(store.mark_failed(&temp_id).await);
    assert!(!store.mark_failed(&temp_id).await);
    let failed = store.find_by_temp(&temp_id).await.expect("kept");
    assert_eq!(failed.status, MessageStatus::Failed);

    assert!(store.mark_pending(&temp_id).await);
    assert!(store.mark_failed(&temp_id).await);
    let removed = store.discard(&temp_id).await.expect("discarded");
    assert_eq!(removed.content, "hello");
    assert!(store.is_empty(CONVERSATION).await);
}

#[tokio::test]
async fn late_echo_reconciles_a_failed_send() {
    let store = MessageLogStore::new();
    let temp_id = TempId::from("tmp-1");
    store.append(CONVERSATION, pending("tmp-1", 10)).await;
    store.mark_failed(&temp_id).await;

    let mut echo = confirmed(101, 11, SELF, PEER);
    echo.temp_id = Some(temp_id.clone());
    store.append(CONVERSATION, echo).await;

    let messages = store.messages(CONVERSATION).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::Sent);
}

#[tokio::test]
async fn lists_inbound_messages_below_target() {
    let store = MessageLogStore::new();
    store
        .append(CONVERSATION, confirmed(1, 1, PEER, SELF))
        .await;
    store
        .append(CONVERSATION, confirmed(2, 2, PEER, SELF))
        .await;
    store
        .append(CONVERSATION, confirmed(3, 3, SELF, PEER))
        .await;
    store.update_status(MessageId(2), MessageStatus::Delivered).await;

    let below = store
        .inbound_below(SELF, MessageStatus::Delivered, Some(CONVERSATION))
        .await;
    assert_eq!(below, vec![MessageId(1)]);
}

#[tokio::test]
async fn search_matches_case_insensitively() {
    let store = MessageLogStore::new();
    let mut first = confirmed(1, 1, PEER, SELF);
    first.content = "Is the Book still available?".into();
    let mut second = confirmed(2, 2, SELF, PEER);
    second.content = "yes".into();
    store.append(CONVERSATION, first).await;
    store.append(CONVERSATION, second).await;

    let found = store.search(CONVERSATION, "book").await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].message_id, Some(MessageId(1)));
    assert!(store.search(CONVERSATION, "   ").await.is_empty());
}

#[tokio::test]
async fn concurrent_echo_and_history_leave_one_entry() {
    let store = MessageLogStore::new();
    store.append(CONVERSATION, pending("tmp-1", 10)).await;

    let mut echo = confirmed(101, 11, SELF, PEER);
    echo.temp_id = Some(TempId::from("tmp-1"));
    let live = {
        let store = store.clone();
        let echo = echo.clone();
        tokio::spawn(async move { store.append(CONVERSATION, echo).await })
    };
    let history = {
        let store = store.clone();
        tokio::spawn(async move { store.load_history(CONVERSATION, vec![echo]).await })
    };
    live.await.expect("live");
    history.await.expect("history");

    assert_eq!(store.len(CONVERSATION).await, 1);
}

#[tokio::test]
async fn second_confirmation_of_same_send_is_dropped() {
    let store = MessageLogStore::new();
    store.append(CONVERSATION, pending("tmp-1", 10)).await;

    let mut first = confirmed(101, 11, SELF, PEER);
    first.temp_id = Some(TempId::from("tmp-1"));
    let mut resent = confirmed(102, 12, SELF, PEER);
    resent.temp_id = Some(TempId::from("tmp-1"));
    store.append(CONVERSATION, first).await;
    let outcome = store.append(CONVERSATION, resent).await;

    assert_eq!(outcome, AppendOutcome::Unchanged);
    assert_eq!(store.len(CONVERSATION).await, 1);
    assert!(store.get(MessageId(102)).await.is_none());
}

#[tokio::test]
async fn echo_after_history_row_without_temp_id_retires_pending_entry() {
    let store = MessageLogStore::new();
    store.append(CONVERSATION, pending("tmp-1", 10)).await;
    let merge = store
        .load_history(CONVERSATION, vec![confirmed(101, 11, SELF, PEER)])
        .await;
    assert_eq!(merge.inserted, 1);

    let mut echo = confirmed(101, 11, SELF, PEER);
    echo.temp_id = Some(TempId::from("tmp-1"));
    let outcome = store.append(CONVERSATION, echo).await;

    assert_eq!(
        outcome,
        AppendOutcome::Reconciled {
            temp_id: TempId::from("tmp-1")
        }
    );
    let messages = store.messages(CONVERSATION).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_id, Some(MessageId(101)));
    assert_eq!(messages[0].status, MessageStatus::Sent);
    let by_temp = store
        .find_by_temp(&TempId::from("tmp-1"))
        .await
        .expect("indexed by temp id");
    assert_eq!(by_temp.message_id, Some(MessageId(101)));
}
