//! Awareness propagation, user-list notifications and collaborator views.

use std::sync::Arc;

use collab_sync::{
    CursorPosition, FixedIdentity, MemoryPubSub, ProviderConfig, ProviderEvent, ProviderOptions,
    RemoteUser, SyncProvider,
};
use tokio::sync::mpsc;
use tokio::time::Duration;
use yrs::Doc;

// ─── Helpers ─────────────────────────────────────────────────────

fn provider(hub: &Arc<MemoryPubSub>, participant: &str, client: &str, name: &str) -> SyncProvider {
    let options = ProviderOptions::new("doc:1", Doc::new())
        .with_identity(Arc::new(FixedIdentity::new(participant, client, "#F87171")))
        .with_participant(participant, name);
    SyncProvider::new(options, hub.clone()).unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

fn user_lists(rx: &mut mpsc::UnboundedReceiver<ProviderEvent>) -> Vec<Vec<RemoteUser>> {
    let mut lists = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ProviderEvent::UsersChanged(users) = event {
            lists.push(users);
        }
    }
    lists
}

fn names(users: &[RemoteUser]) -> Vec<String> {
    users.iter().map(|u| u.state.display_name.clone()).collect()
}

// ─── Join / leave ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_join_and_leave_notifications() {
    let hub = Arc::new(MemoryPubSub::new());
    let mut alice = provider(&hub, "user-alice", "tab-a", "Alice");
    let mut events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    settle().await;

    let bob = provider(&hub, "user-bob", "tab-b", "Bob");
    bob.connect().await.unwrap();
    settle().await;
    assert_eq!(names(&alice.users()), vec!["Bob"]);

    bob.disconnect().await;
    settle().await;
    assert!(alice.users().is_empty());

    // An empty list may be reported before anyone joins.
    let lists: Vec<Vec<String>> = user_lists(&mut events)
        .iter()
        .map(|l| names(l))
        .skip_while(|l| l.is_empty())
        .collect();
    assert_eq!(lists, vec![vec!["Bob".to_string()], vec![]]);
}

#[tokio::test(start_paused = true)]
async fn test_destroyed_peer_disappears() {
    let hub = Arc::new(MemoryPubSub::new());
    let alice = provider(&hub, "user-alice", "tab-a", "Alice");
    let bob = provider(&hub, "user-bob", "tab-b", "Bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    settle().await;
    assert_eq!(alice.users().len(), 1);

    drop(bob);
    settle().await;
    assert!(alice.users().is_empty());
}

#[tokio::test]
async fn test_live_peer_outlasts_stale_window() {
    // Membership ages by the wall clock, so this runs in real time.
    let hub = Arc::new(MemoryPubSub::new());
    let short = |p: &str, c: &str, n: &str| {
        let options = ProviderOptions::new("doc:1", Doc::new())
            .with_identity(Arc::new(FixedIdentity::new(p, c, "#F87171")))
            .with_participant(p, n)
            .with_config(
                ProviderConfig::default().with_membership_stale_after(Duration::from_millis(300)),
            );
        SyncProvider::new(options, hub.clone()).unwrap()
    };
    let alice = short("user-alice", "tab-a", "Alice");
    let bob = short("user-bob", "tab-b", "Bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(names(&alice.users()), vec!["Bob"]);

    tokio::time::sleep(Duration::from_millis(550)).await;
    let carol = short("user-carol", "tab-c", "Carol");
    carol.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(bob.is_connected());
    assert_eq!(names(&alice.users()), vec!["Bob", "Carol"]);
}

// ─── Notification dedup ──────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_cursor_moves_do_not_notify() {
    let hub = Arc::new(MemoryPubSub::new());
    let mut alice = provider(&hub, "user-alice", "tab-a", "Alice");
    let bob = provider(&hub, "user-bob", "tab-b", "Bob");
    let mut events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    settle().await;
    user_lists(&mut events);

    for x in 0..5 {
        assert!(bob.update_cursor(Some(CursorPosition::new(x as f64 * 10.0, 5.0))));
        tokio::time::sleep(Duration::from_millis(80)).await;
    }
    settle().await;

    assert!(user_lists(&mut events).is_empty());
    let cursor = alice.users()[0].state.cursor.clone().unwrap();
    assert_eq!(cursor.x, 40.0);
}

#[tokio::test(start_paused = true)]
async fn test_block_change_notifies_once() {
    let hub = Arc::new(MemoryPubSub::new());
    let mut alice = provider(&hub, "user-alice", "tab-a", "Alice");
    let bob = provider(&hub, "user-bob", "tab-b", "Bob");
    let mut events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    settle().await;
    user_lists(&mut events);

    assert!(bob.update_selected_block(Some("block-7".into())));
    assert!(!bob.update_selected_block(Some("block-7".into())));
    settle().await;
    bob.update_cursor(Some(CursorPosition::new(1.0, 1.0)));
    settle().await;

    let lists = user_lists(&mut events);
    assert_eq!(lists.len(), 1);
    assert_eq!(lists[0][0].state.selected_block_id.as_deref(), Some("block-7"));
    assert!(collab_sync::user_on_block(&alice.users(), "block-7").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_section_moves_are_visible() {
    let hub = Arc::new(MemoryPubSub::new());
    let alice = provider(&hub, "user-alice", "tab-a", "Alice");
    let bob = provider(&hub, "user-bob", "tab-b", "Bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();

    bob.update_current_section(Some("intro".into()), Some("Introduction".into()));
    settle().await;

    let users = alice.users();
    let in_intro = collab_sync::users_in_section(&users, "intro");
    assert_eq!(in_intro.len(), 1);
    assert_eq!(
        in_intro[0].state.current_section_title.as_deref(),
        Some("Introduction")
    );
}

// ─── Typing ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_typing_propagates_and_auto_clears() {
    let hub = Arc::new(MemoryPubSub::new());
    let alice = provider(&hub, "user-alice", "tab-a", "Alice");
    let bob = provider(&hub, "user-bob", "tab-b", "Bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    settle().await;

    assert!(bob.set_typing(true));
    settle().await;
    assert!(alice.users()[0].state.is_typing);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!bob.local_state().unwrap().is_typing);
    assert!(!alice.users()[0].state.is_typing);
}

// ─── Collaborators ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_multi_tab_collaborators() {
    let hub = Arc::new(MemoryPubSub::new());
    let alice = provider(&hub, "user-alice", "tab-a", "Alice");
    let bob_1 = provider(&hub, "user-bob", "tab-b1", "Bob");
    let bob_2 = provider(&hub, "user-bob", "tab-b2", "Bob");
    alice.connect().await.unwrap();
    bob_1.connect().await.unwrap();
    bob_2.connect().await.unwrap();
    settle().await;

    // Both of Bob's tabs are sessions, but one collaborator.
    assert_eq!(alice.users().len(), 2);
    let seen_by_alice = alice.collaborators();
    assert_eq!(seen_by_alice.len(), 1);
    assert_eq!(seen_by_alice[0].participant_id, "user-bob");

    // Bob's other tab is not a collaborator of Bob.
    assert_eq!(bob_1.users().len(), 2);
    let seen_by_bob = bob_1.collaborators();
    assert_eq!(seen_by_bob.len(), 1);
    assert_eq!(seen_by_bob[0].participant_id, "user-alice");
}
