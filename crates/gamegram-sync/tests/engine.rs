use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use gamegram_loopback::LoopbackStore;
use gamegram_sync::{
    ConnectionState, ScrollDirective, ScrollPosition, SyncConfig, SyncEngine, SyncError, SyncHandle,
    ToggleOutcome, ViewState, WriteAction,
};
use gamegram_types::{Delivery, MessageId, MessageKey, UserIdentity};

const ROOM: i64 = 1;
const ME: &str = "@me";

fn start(remote: &Arc<LoopbackStore>) -> SyncEngine {
    SyncEngine::start(SyncConfig::default(), UserIdentity::new(ME), ROOM, remote.clone())
}

async fn wait_for(handle: &SyncHandle, what: &str, pred: impl Fn(&ViewState) -> bool) -> ViewState {
    let mut rx = handle.subscribe();
    match timeout(Duration::from_secs(60), rx.wait_for(|view| pred(view))).await {
        Ok(Ok(view)) => view.clone(),
        _ => panic!("timed out waiting for {}: {:#?}", what, handle.view()),
    }
}

async fn loaded(handle: &SyncHandle) -> ViewState {
    wait_for(handle, "initial load", |v| !v.loading_initial).await
}

async fn subscribed(handle: &SyncHandle) -> ViewState {
    wait_for(handle, "subscription", |v| v.connection_status == ConnectionState::Subscribed).await
}

fn server_ids(view: &ViewState) -> Vec<MessageId> {
    view.messages.iter().filter_map(|m| m.server_id()).collect()
}

fn scrolled(offset: f64, content_height: f64) -> ScrollPosition {
    ScrollPosition {
        offset,
        viewport_height: 500.0,
        content_height,
    }
}

#[tokio::test(start_paused = true)]
async fn initial_load_is_chronological() {
    let remote = Arc::new(LoopbackStore::new());
    for n in 0..4 {
        remote.seed_message(ROOM + 1, "@bo", &format!("other room {}", n));
    }
    remote.seed_message(ROOM, "@ana", "five");
    remote.seed_message(ROOM, "@bo", "six");

    let engine = start(&remote);
    let handle = engine.handle();
    let mut directives = handle.directives();

    let view = wait_for(&handle, "two messages", |v| v.messages.len() == 2).await;
    assert_eq!(server_ids(&view), [5, 6]);
    assert!(!view.has_more_history);
    assert_eq!(view.last_error, None);
    assert_eq!(directives.recv().await.unwrap(), ScrollDirective::ScrollToBottom);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn send_shows_pending_then_reconciles() {
    let remote = Arc::new(LoopbackStore::new());
    for n in 0..6 {
        remote.seed_message(ROOM, "@ana", &format!("m{}", n));
    }
    let engine = start(&remote);
    let handle = engine.handle();
    loaded(&handle).await;

    remote.set_latency(Duration::from_millis(50));
    let sender = handle.clone();
    let send = tokio::spawn(async move { sender.send_message("  hi ").await });

    let view = wait_for(&handle, "pending message", |v| v.messages.iter().any(|m| m.is_pending())).await;
    let pending = view.messages.last().unwrap();
    assert!(matches!(pending.key, MessageKey::Temp(_)));
    assert_eq!(pending.text, "hi");
    assert_eq!(pending.delivery, Delivery::Pending);

    let id = send.await.unwrap().unwrap();
    assert_eq!(id, 7);

    let view = wait_for(&handle, "reconciled message", |v| !v.messages.iter().any(|m| m.is_pending())).await;
    let last = view.messages.last().unwrap();
    assert_eq!(last.key, MessageKey::Server(7));
    assert_eq!(last.text, "hi");
    assert_eq!(last.username, ME);
    assert_eq!(view.messages.iter().filter(|m| m.server_id() == Some(7)).count(), 1);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_refused_handshakes() {
    let remote = Arc::new(LoopbackStore::new());
    remote.fail_next_subscribes(3);

    let engine = start(&remote);
    let handle = engine.handle();

    subscribed(&handle).await;
    assert_eq!(remote.subscribe_calls(), 4);
    assert_eq!(remote.active_subscriptions(), 1);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn arrivals_while_scrolled_up_count_as_unviewed() {
    let remote = Arc::new(LoopbackStore::new());
    remote.seed_message(ROOM, "@ana", "hello");
    let engine = start(&remote);
    let handle = engine.handle();
    loaded(&handle).await;
    subscribed(&handle).await;

    handle.on_scroll_position_changed(scrolled(100.0, 2000.0));
    wait_for(&handle, "scrolled up", |v| !v.is_at_bottom).await;

    remote.post_as(ROOM, "@bo", "you there?");
    let view = wait_for(&handle, "unviewed message", |v| v.unviewed_count == 1).await;
    assert!(!view.is_at_bottom);

    let mut directives = handle.directives();
    remote.post_as(ROOM, ME, "from my other tab");
    let view = wait_for(&handle, "own message", |v| v.messages.len() == 3).await;
    assert_eq!(view.unviewed_count, 0);
    assert!(view.is_at_bottom);
    assert_eq!(directives.recv().await.unwrap(), ScrollDirective::ScrollToBottom);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failed_send_keeps_text_and_can_be_retried() {
    let remote = Arc::new(LoopbackStore::new());
    let engine = start(&remote);
    let handle = engine.handle();
    loaded(&handle).await;

    remote.fail_next_inserts(2);
    let mut composer = handle.composer();
    composer.set_draft("hello");

    let err = composer.submit().await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Write {
            action: WriteAction::SendMessage,
            ..
        }
    ));
    assert_eq!(composer.draft(), "hello");

    let view = wait_for(&handle, "failed message", |v| v.messages.iter().any(|m| m.is_failed())).await;
    let failed = view.messages.last().unwrap();
    assert_eq!(failed.text, "hello");
    assert!(view.last_error.is_some());
    let MessageKey::Temp(temp_id) = failed.key.clone() else {
        panic!("failed message should keep its temporary id");
    };

    assert!(handle.retry_send(temp_id.clone()).await.is_err());
    let id = handle.retry_send(temp_id).await.unwrap();

    let view = wait_for(&handle, "retried message", |v| !v.messages.iter().any(|m| m.is_pending())).await;
    assert_eq!(server_ids(&view), [id]);
    assert_eq!(view.last_error, None);
    assert_eq!(remote.message_count(ROOM), 1);

    composer.set_draft("second try");
    composer.submit().await.unwrap();
    assert_eq!(composer.draft(), "");

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn discarding_a_failed_send_removes_it() {
    let remote = Arc::new(LoopbackStore::new());
    let engine = start(&remote);
    let handle = engine.handle();
    loaded(&handle).await;

    remote.fail_next_inserts(1);
    handle.send_message("oops").await.unwrap_err();
    let view = wait_for(&handle, "failed message", |v| v.messages.len() == 1).await;
    let MessageKey::Temp(temp_id) = view.messages[0].key.clone() else {
        panic!("expected a temporary id");
    };

    handle.discard_failed(temp_id);
    wait_for(&handle, "discard", |v| v.messages.is_empty()).await;

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn second_send_from_same_composer_is_rejected_while_in_flight() {
    let remote = Arc::new(LoopbackStore::new());
    let engine = start(&remote);
    let handle = engine.handle();
    loaded(&handle).await;
    remote.set_latency(Duration::from_millis(100));

    let (first, second) = tokio::join!(handle.send_message("one"), handle.send_message("two"));
    assert!(first.is_ok());
    assert_eq!(second, Err(SyncError::SendInFlight));
    assert_eq!(handle.send_message("   ").await, Err(SyncError::EmptyMessage));

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn toggling_twice_restores_reactions() {
    let remote = Arc::new(LoopbackStore::new());
    let id = remote.seed_message(ROOM, "@ana", "react to me");
    remote.react_as(id, "@bo", "👍").unwrap();

    let engine = start(&remote);
    let handle = engine.handle();
    let before = wait_for(&handle, "message with reaction", |v| v.messages.len() == 1).await;
    subscribed(&handle).await;
    let key = MessageKey::Server(id);
    assert_eq!(before.reaction_groups(&key)[0].count, 1);

    assert_eq!(handle.toggle_reaction(id, "👍").await.unwrap(), ToggleOutcome::Added);
    let view = wait_for(&handle, "my reaction", |v| {
        v.reaction_groups(&key).first().is_some_and(|g| g.count == 2)
    })
    .await;
    assert!(view.reaction_groups(&key)[0].reacted_by_me);

    assert_eq!(handle.toggle_reaction(id, "👍").await.unwrap(), ToggleOutcome::Removed);
    let view = wait_for(&handle, "reaction removed", |v| {
        v.reaction_groups(&key).first().is_some_and(|g| g.count == 1)
    })
    .await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.view().messages[0].reactions, before.messages[0].reactions);
    assert!(!view.reaction_groups(&key)[0].reacted_by_me);
    assert_eq!(remote.reactions_for(id).len(), 1);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_toggle_of_same_pair_is_refused() {
    let remote = Arc::new(LoopbackStore::new());
    let id = remote.seed_message(ROOM, "@ana", "hi");
    let engine = start(&remote);
    let handle = engine.handle();
    loaded(&handle).await;
    remote.set_latency(Duration::from_millis(100));

    let (first, second) = tokio::join!(handle.toggle_reaction(id, "🔥"), handle.toggle_reaction(id, "🔥"));
    assert_eq!(first, Ok(ToggleOutcome::Added));
    assert_eq!(second, Err(SyncError::ToggleInFlight));
    assert_eq!(remote.reactions_for(id).len(), 1);

    assert_eq!(
        handle.toggle_reaction(999, "🔥").await,
        Err(SyncError::UnknownMessage(MessageKey::Server(999)))
    );

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_reaction_insert_is_a_no_op() {
    let remote = Arc::new(LoopbackStore::new());
    let id = remote.seed_message(ROOM, "@ana", "hi");
    let engine = start(&remote);
    let handle = engine.handle();
    loaded(&handle).await;
    subscribed(&handle).await;

    // The other tab's reaction never reaches this client.
    remote.kill_subscriptions_silently();
    remote.react_as(id, ME, "🎉").unwrap();

    assert_eq!(handle.toggle_reaction(id, "🎉").await, Ok(ToggleOutcome::Added));
    let view = wait_for(&handle, "resynced reaction", |v| !v.messages[0].reactions.is_empty()).await;
    assert_eq!(view.messages[0].reactions.len(), 1);
    assert_eq!(remote.reactions_for(id).len(), 1);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn reactions_from_others_are_pushed() {
    let remote = Arc::new(LoopbackStore::new());
    let id = remote.seed_message(ROOM, "@ana", "hi");
    let engine = start(&remote);
    let handle = engine.handle();
    loaded(&handle).await;
    subscribed(&handle).await;

    let row = remote.react_as(id, "@bo", "🔥").unwrap();
    let key = MessageKey::Server(id);
    let view = wait_for(&handle, "pushed reaction", |v| !v.reaction_groups(&key).is_empty()).await;
    let group = &view.reaction_groups(&key)[0];
    assert_eq!(group.emoji, "🔥");
    assert!(!group.reacted_by_me);

    gamegram_types::RemoteStore::delete_reaction(remote.as_ref(), row.id.unwrap())
        .await
        .unwrap();
    wait_for(&handle, "pushed reaction delete", |v| v.reaction_groups(&key).is_empty()).await;

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn push_and_poll_of_same_row_yield_one_record() {
    let remote = Arc::new(LoopbackStore::new());
    remote.seed_message(ROOM, "@ana", "first");
    let engine = start(&remote);
    let handle = engine.handle();
    loaded(&handle).await;
    subscribed(&handle).await;

    remote.set_latency(Duration::from_millis(50));
    handle.set_visible(false);
    handle.set_visible(true);
    remote.post_as(ROOM, "@bo", "seen twice");

    sleep(Duration::from_millis(500)).await;
    let view = handle.view();
    assert_eq!(server_ids(&view), [1, 2]);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn polls_while_channel_is_down() {
    let remote = Arc::new(LoopbackStore::new());
    remote.hang_subscribes(true);
    let engine = start(&remote);
    let handle = engine.handle();
    loaded(&handle).await;

    remote.post_as(ROOM, "@bo", "anyone?");
    let view = wait_for(&handle, "polled message", |v| v.messages.len() == 1).await;
    assert_ne!(view.connection_status, ConnectionState::Subscribed);
    assert_eq!(view.unviewed_count, 0);

    remote.hang_subscribes(false);
    subscribed(&handle).await;
    assert_eq!(remote.open_subscriptions(), 1);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn health_check_replaces_a_silently_dead_channel() {
    let remote = Arc::new(LoopbackStore::new());
    let engine = start(&remote);
    let handle = engine.handle();
    loaded(&handle).await;
    subscribed(&handle).await;

    remote.kill_subscriptions_silently();
    remote.post_as(ROOM, "@bo", "lost in the void");

    let view = wait_for(&handle, "message after reconnect", |v| v.messages.len() == 1).await;
    assert_eq!(view.messages[0].text, "lost in the void");
    subscribed(&handle).await;
    assert_eq!(remote.subscribe_calls(), 2);
    assert_eq!(remote.open_subscriptions(), 1);
    assert_eq!(remote.active_subscriptions(), 1);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn coming_back_online_leaves_exactly_one_subscription() {
    let remote = Arc::new(LoopbackStore::new());
    let engine = start(&remote);
    let handle = engine.handle();
    loaded(&handle).await;
    subscribed(&handle).await;

    remote.set_offline(true);
    handle.set_online(false);
    wait_for(&handle, "degraded", |v| v.connection_status != ConnectionState::Subscribed).await;
    sleep(Duration::from_secs(5)).await;

    remote.set_offline(false);
    remote.post_as(ROOM, "@bo", "while you were away");
    handle.set_online(true);

    subscribed(&handle).await;
    wait_for(&handle, "caught up", |v| v.messages.len() == 1).await;
    assert_eq!(remote.open_subscriptions(), 1);
    assert_eq!(remote.active_subscriptions(), 1);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn older_pages_prepend_without_disturbing_loaded_records() {
    let remote = Arc::new(LoopbackStore::new());
    for n in 1..=120 {
        remote.seed_message(ROOM, "@ana", &format!("m{}", n));
    }
    let engine = start(&remote);
    let handle = engine.handle();

    let first = wait_for(&handle, "first page", |v| v.messages.len() == 50).await;
    assert_eq!(server_ids(&first), (71..=120).collect::<Vec<_>>());
    assert!(first.has_more_history);

    handle.on_scroll_position_changed(scrolled(0.0, 5000.0));
    let second = wait_for(&handle, "second page", |v| v.messages.len() == 100).await;
    assert_eq!(server_ids(&second), (21..=120).collect::<Vec<_>>());
    assert_eq!(&second.messages[50..], &first.messages[..]);

    let mut directives = handle.directives();
    handle.on_scroll_position_changed(scrolled(0.0, 9000.0));
    assert_eq!(directives.recv().await.unwrap(), ScrollDirective::ScrollTo(4000.0));

    handle.on_scroll_position_changed(scrolled(0.0, 9000.0));
    let all = wait_for(&handle, "start of history", |v| !v.has_more_history && !v.loading_older).await;
    assert_eq!(server_ids(&all), (1..=120).collect::<Vec<_>>());

    handle.load_older();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.view().messages.len(), 120);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn live_message_during_an_older_fetch_does_not_move_the_anchor() {
    let remote = Arc::new(LoopbackStore::new());
    for n in 1..=120 {
        remote.seed_message(ROOM, "@ana", &format!("m{}", n));
    }
    let engine = start(&remote);
    let handle = engine.handle();
    wait_for(&handle, "first page", |v| v.messages.len() == 50).await;
    subscribed(&handle).await;

    remote.set_latency(Duration::from_millis(200));
    let mut directives = handle.directives();
    handle.on_scroll_position_changed(scrolled(0.0, 5000.0));
    wait_for(&handle, "older fetch started", |v| v.loading_older).await;

    // Someone posts while the older page is still on its way; the UI
    // renders it at the bottom and reports the taller content.
    remote.post_as(ROOM, "@bo", "live");
    let view = wait_for(&handle, "live message", |v| v.messages.len() == 51).await;
    assert_eq!(view.unviewed_count, 1);
    handle.on_scroll_position_changed(scrolled(0.0, 5100.0));

    let view = wait_for(&handle, "older page", |v| v.messages.len() == 101).await;
    assert_eq!(server_ids(&view), (21..=121).collect::<Vec<_>>());

    handle.on_scroll_position_changed(scrolled(0.0, 8100.0));
    assert_eq!(directives.recv().await.unwrap(), ScrollDirective::ScrollTo(3000.0));
    assert!(directives.try_recv().is_err());

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn joining_another_room_starts_over_there() {
    let remote = Arc::new(LoopbackStore::new());
    remote.add_room(ROOM, "general");
    remote.add_room(ROOM + 1, "random");
    for n in 1..=3 {
        remote.seed_message(ROOM, "@ana", &format!("general {}", n));
    }
    remote.seed_message(ROOM + 1, "@kit", "random 1");
    remote.seed_message(ROOM + 1, "@kit", "random 2");

    let engine = start(&remote);
    let handle = engine.handle();
    wait_for(&handle, "rooms and history", |v| {
        v.rooms.len() == 2 && v.messages.len() == 3
    })
    .await;
    subscribed(&handle).await;

    let rooms = handle.list_rooms().await.unwrap();
    let names: Vec<_> = rooms.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["general", "random"]);

    handle.on_scroll_position_changed(scrolled(0.0, 2000.0));
    remote.post_as(ROOM, "@bo", "unseen");
    wait_for(&handle, "unviewed", |v| v.unviewed_count == 1).await;

    let mut directives = handle.directives();
    handle.join_room(ROOM + 1);
    let view = wait_for(&handle, "other room", |v| {
        v.room_id == ROOM + 1
            && !v.loading_initial
            && v.connection_status == ConnectionState::Subscribed
    })
    .await;
    assert_eq!(server_ids(&view), [4, 5]);
    assert_eq!(view.unviewed_count, 0);
    assert!(view.is_at_bottom);
    assert_eq!(directives.recv().await.unwrap(), ScrollDirective::ScrollToBottom);

    remote.post_as(ROOM, "@bo", "left behind");
    sleep(Duration::from_secs(3)).await;
    assert_eq!(server_ids(&handle.view()), [4, 5]);

    remote.post_as(ROOM + 1, "@bo", "hello random");
    let view = wait_for(&handle, "push in new room", |v| v.messages.len() == 3).await;
    assert_eq!(view.messages[2].text, "hello random");
    assert_eq!(remote.open_subscriptions(), 1);
    assert_eq!(remote.active_subscriptions(), 1);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn switching_rooms_mid_handshake_keeps_one_subscription() {
    let remote = Arc::new(LoopbackStore::new());
    remote.seed_message(ROOM, "@ana", "general");
    remote.seed_message(ROOM + 1, "@kit", "random");
    remote.set_latency(Duration::from_millis(300));

    let engine = start(&remote);
    let handle = engine.handle();
    let (sent, ()) = tokio::join!(handle.send_message("said in general"), async {
        handle.join_room(ROOM + 1)
    });
    assert!(sent.is_ok());
    assert_eq!(remote.message_count(ROOM), 2);

    let view = wait_for(&handle, "other room", |v| {
        v.room_id == ROOM + 1
            && !v.loading_initial
            && v.connection_status == ConnectionState::Subscribed
    })
    .await;
    assert_eq!(server_ids(&view), [2]);
    assert!(!view.messages.iter().any(|m| m.text == "said in general"));
    assert_eq!(remote.subscribe_calls(), 2);
    assert_eq!(remote.open_subscriptions(), 1);

    engine.stop().await;
    assert_eq!(remote.open_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn refresh_recovers_from_failed_initial_load() {
    let remote = Arc::new(LoopbackStore::new());
    remote.seed_message(ROOM, "@ana", "hello");
    remote.set_offline(true);

    let engine = start(&remote);
    let handle = engine.handle();
    let view = wait_for(&handle, "load failure", |v| v.last_error.is_some()).await;
    assert!(view.messages.is_empty());

    remote.set_offline(false);
    handle.refresh();
    let view = wait_for(&handle, "refreshed", |v| v.messages.len() == 1).await;
    assert_eq!(view.last_error, None);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_tears_down_the_channel() {
    let remote = Arc::new(LoopbackStore::new());
    let engine = start(&remote);
    let handle = engine.handle();
    subscribed(&handle).await;

    engine.stop().await;
    assert_eq!(remote.open_subscriptions(), 0);
    assert_eq!(handle.view().connection_status, ConnectionState::Closed);
    assert_eq!(handle.send_message("too late").await, Err(SyncError::EngineStopped));
}
