//! Presence / awareness state for collaborative sessions.
//!
//! Tracks the local participant's ephemeral state (identity, color, cursor,
//! selection, typing) and the last-known state of every remote session on
//! the topic.
//!
//! ## Architecture
//!
//! ```text
//! UI helper (update_cursor, set_typing, …)
//!       │
//!       ▼
//! AwarenessStore::update_local()  ──► observers(origin = Local)
//!                                          │
//!                                          ▼  provider broadcasts full state
//! remote awareness-update ──► apply_remote()      ┐
//! presence sync           ──► reconcile_members() ┴─► observers(origin = Remote)
//!                                          │
//!                                          ▼  debounced
//!                               UserListKey ──► NotificationGate ──► UsersChanged
//! ```
//!
//! Remote state is last-write-wins per client id: an awareness update fully
//! replaces the previous entry. Membership decides who is present: it fills
//! gaps and evicts every session it no longer lists, but never overwrites
//! richer awareness state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::protocol::MemberDescriptor;

/// Per-session replica identifier.
pub type ClientId = String;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Pointer position in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
    /// Milliseconds since the Unix epoch when the position was sampled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, timestamp: None }
    }

    pub fn stamped(x: f64, y: f64) -> Self {
        let ms = Utc::now().timestamp_millis().max(0) as u64;
        Self { x, y, timestamp: Some(ms) }
    }
}

/// Text selection as anchor/head offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSelection {
    pub anchor: u32,
    pub head: u32,
}

impl TextSelection {
    pub fn collapsed(&self) -> bool {
        self.anchor == self.head
    }
}

/// Ephemeral state one session publishes about its participant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    /// Participant (user) id; shared by all of a user's sessions.
    #[serde(rename = "id", default)]
    pub participant_id: String,
    #[serde(rename = "name", default)]
    pub display_name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<TextSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_block_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_section_title: Option<String>,
    #[serde(default)]
    pub is_typing: bool,
}

impl PresenceState {
    pub fn new(
        participant_id: impl Into<String>,
        display_name: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            display_name: display_name.into(),
            color: color.into(),
            ..Default::default()
        }
    }

    /// Minimal state derived from a membership descriptor.
    pub fn from_member(member: &MemberDescriptor) -> Self {
        Self {
            participant_id: member.id.clone(),
            display_name: member.name.clone(),
            color: member.color.clone(),
            avatar_url: member.avatar_url.clone(),
            ..Default::default()
        }
    }
}

/// Where a change to the store came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Client ids touched by one store mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    pub origin: ChangeOrigin,
}

impl AwarenessChange {
    fn new(origin: ChangeOrigin) -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Remote session as exposed to the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteUser {
    pub client_id: ClientId,
    pub state: PresenceState,
}

/// Handle returned by [`AwarenessStore::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(&AwarenessChange) + Send + Sync>;

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntrySource {
    Awareness,
    Membership,
}

#[derive(Debug, Clone)]
struct RemoteEntry {
    state: PresenceState,
    source: EntrySource,
}

#[derive(Debug, Default)]
struct StoreInner {
    local: Option<PresenceState>,
    remote: HashMap<ClientId, RemoteEntry>,
    destroyed: bool,
}

/// Local + remote presence for one replica.
///
/// Shared behind an `Arc`; several providers may reuse one store.
/// Observers are invoked synchronously, outside the internal lock.
pub struct AwarenessStore {
    client_id: ClientId,
    inner: Mutex<StoreInner>,
    observers: Mutex<Vec<(ObserverId, Observer)>>,
    next_observer: AtomicU64,
}

impl std::fmt::Debug for AwarenessStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwarenessStore")
            .field("client_id", &self.client_id)
            .field("remote", &self.remote_count())
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl AwarenessStore {
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self {
            client_id: client_id.into(),
            inner: Mutex::new(StoreInner::default()),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn local_state(&self) -> Option<PresenceState> {
        self.inner.lock().local.clone()
    }

    /// Replace the local state. Observers fire only if it actually changed.
    pub fn set_local_state(&self, state: PresenceState) -> bool {
        let change = {
            let mut inner = self.inner.lock();
            if inner.destroyed || inner.local.as_ref() == Some(&state) {
                return false;
            }
            let mut change = AwarenessChange::new(ChangeOrigin::Local);
            if inner.local.is_some() {
                change.updated.push(self.client_id.clone());
            } else {
                change.added.push(self.client_id.clone());
            }
            inner.local = Some(state);
            change
        };
        self.emit(&change);
        true
    }

    /// Read-modify-write of the local state (shallow merge by the closure).
    /// No-op when there is no local state yet.
    ///
    /// The closure runs under the store lock and must not call back into
    /// the store.
    pub fn update_local<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut PresenceState),
    {
        let change = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return false;
            }
            let Some(local) = inner.local.as_mut() else {
                return false;
            };
            let before = local.clone();
            f(local);
            if *local == before {
                return false;
            }
            let mut change = AwarenessChange::new(ChangeOrigin::Local);
            change.updated.push(self.client_id.clone());
            change
        };
        self.emit(&change);
        true
    }

    pub fn clear_local_state(&self) -> bool {
        let change = {
            let mut inner = self.inner.lock();
            if inner.local.take().is_none() {
                return false;
            }
            let mut change = AwarenessChange::new(ChangeOrigin::Local);
            change.removed.push(self.client_id.clone());
            change
        };
        self.emit(&change);
        true
    }

    /// Apply a remote awareness update (full replacement).
    ///
    /// Updates carrying our own client id are ignored.
    pub fn apply_remote(&self, client_id: &str, state: PresenceState) -> Option<AwarenessChange> {
        if client_id == self.client_id {
            return None;
        }

        let change = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return None;
            }
            let mut change = AwarenessChange::new(ChangeOrigin::Remote);
            match inner.remote.get_mut(client_id) {
                Some(entry) if entry.state == state && entry.source == EntrySource::Awareness => {
                    return None;
                }
                Some(entry) => {
                    entry.state = state;
                    entry.source = EntrySource::Awareness;
                    change.updated.push(client_id.to_string());
                }
                None => {
                    inner.remote.insert(
                        client_id.to_string(),
                        RemoteEntry {
                            state,
                            source: EntrySource::Awareness,
                        },
                    );
                    change.added.push(client_id.to_string());
                }
            }
            change
        };

        self.emit(&change);
        Some(change)
    }

    pub fn remove_remote(&self, client_id: &str) -> bool {
        let removed = self.inner.lock().remote.remove(client_id).is_some();
        if removed {
            let mut change = AwarenessChange::new(ChangeOrigin::Remote);
            change.removed.push(client_id.to_string());
            self.emit(&change);
        }
        removed
    }

    /// Reconcile remote entries against a membership snapshot.
    ///
    /// - several descriptors for one client id: most recent `online_at` wins
    /// - the local client and descriptors older than `stale_after` are skipped
    /// - unknown sessions are added with state derived from the descriptor
    /// - known sessions keep their state
    /// - every other remote session is removed, including ones only heard
    ///   of through awareness
    pub fn reconcile_members(
        &self,
        members: &[MemberDescriptor],
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Option<AwarenessChange> {
        let mut latest: HashMap<&str, &MemberDescriptor> = HashMap::new();
        for member in members {
            if member.client_id == self.client_id {
                continue;
            }
            let is_stale = (now - member.online_at)
                .to_std()
                .map(|age| age > stale_after)
                .unwrap_or(false);
            if is_stale {
                log::debug!("Skipping stale member {} ({})", member.client_id, member.online_at);
                continue;
            }
            let newer = latest
                .get(member.client_id.as_str())
                .map_or(true, |existing| member.online_at > existing.online_at);
            if newer {
                latest.insert(member.client_id.as_str(), member);
            }
        }

        let change = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return None;
            }
            let mut change = AwarenessChange::new(ChangeOrigin::Remote);

            for (client_id, member) in &latest {
                if !inner.remote.contains_key(*client_id) {
                    inner.remote.insert(
                        client_id.to_string(),
                        RemoteEntry {
                            state: PresenceState::from_member(member),
                            source: EntrySource::Membership,
                        },
                    );
                    change.added.push(client_id.to_string());
                }
            }

            let present: HashSet<&str> = latest.keys().copied().collect();
            let gone: Vec<ClientId> = inner
                .remote
                .keys()
                .filter(|id| !present.contains(id.as_str()))
                .cloned()
                .collect();
            for id in gone {
                inner.remote.remove(&id);
                change.removed.push(id);
            }

            change.added.sort();
            change.removed.sort();
            change
        };

        if change.is_empty() {
            return None;
        }
        self.emit(&change);
        Some(change)
    }

    /// Remote sessions, ordered by client id.
    pub fn remote_users(&self) -> Vec<RemoteUser> {
        let inner = self.inner.lock();
        let mut users: Vec<RemoteUser> = inner
            .remote
            .iter()
            .map(|(id, entry)| RemoteUser {
                client_id: id.clone(),
                state: entry.state.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        users
    }

    pub fn remote_state(&self, client_id: &str) -> Option<PresenceState> {
        self.inner.lock().remote.get(client_id).map(|e| e.state.clone())
    }

    pub fn remote_count(&self) -> usize {
        self.inner.lock().remote.len()
    }

    /// Register a change listener.
    pub fn observe<F>(&self, f: F) -> ObserverId
    where
        F: Fn(&AwarenessChange) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, Arc::new(f)));
        id
    }

    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Drop all state and listeners. Later mutations are ignored.
    pub fn destroy(&self) {
        {
            let mut inner = self.inner.lock();
            inner.destroyed = true;
            inner.local = None;
            inner.remote.clear();
        }
        self.observers.lock().clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    fn emit(&self, change: &AwarenessChange) {
        let observers: Vec<Observer> = self
            .observers
            .lock()
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for observer in observers {
            observer(change);
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// User-list notification
// ───────────────────────────────────────────────────────────────────

/// Comparison key for the remote user list. Two lists with the same key
/// are considered the same for "users changed" notifications.
pub trait UserListKey: Send + Sync {
    fn key(&self, users: &[RemoteUser]) -> String;
}

impl<F> UserListKey for F
where
    F: Fn(&[RemoteUser]) -> String + Send + Sync,
{
    fn key(&self, users: &[RemoteUser]) -> String {
        self(users)
    }
}

/// Default key: identity, name, block, section and typing. Cursor and
/// selection are excluded so pointer movement never re-renders user lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityKey;

#[derive(Serialize)]
struct KeyEntry<'a> {
    client: &'a str,
    id: &'a str,
    name: &'a str,
    block: Option<&'a str>,
    section: Option<&'a str>,
    section_title: Option<&'a str>,
    typing: bool,
}

impl UserListKey for IdentityKey {
    fn key(&self, users: &[RemoteUser]) -> String {
        let entries: Vec<KeyEntry<'_>> = users
            .iter()
            .map(|u| KeyEntry {
                client: &u.client_id,
                id: &u.state.participant_id,
                name: &u.state.display_name,
                block: u.state.selected_block_id.as_deref(),
                section: u.state.current_section.as_deref(),
                section_title: u.state.current_section_title.as_deref(),
                typing: u.state.is_typing,
            })
            .collect();
        serde_json::to_string(&entries).unwrap_or_default()
    }
}

/// Admits a notification only when the key differs from the last one.
#[derive(Debug, Default)]
pub struct NotificationGate {
    last: Option<String>,
}

impl NotificationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, key: String) -> bool {
        if self.last.as_deref() == Some(key.as_str()) {
            return false;
        }
        self.last = Some(key);
        true
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Minimum spacing between accepted cursor updates. A zero interval
/// accepts everything.
#[derive(Debug)]
pub struct CursorThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn allow(&mut self, now: Instant) -> bool {
        if self.interval.is_zero() {
            return true;
        }
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Collaborator views
// ───────────────────────────────────────────────────────────────────

/// One entry per remote participant (a user with several tabs appears
/// once), excluding the local participant.
pub fn collaborators<'a>(users: &'a [RemoteUser], local_participant: &str) -> Vec<&'a PresenceState> {
    let mut seen = HashSet::new();
    users
        .iter()
        .map(|u| &u.state)
        .filter(|s| s.participant_id != local_participant)
        .filter(|s| seen.insert(s.participant_id.as_str()))
        .collect()
}

pub fn users_in_section<'a>(users: &'a [RemoteUser], section: &str) -> Vec<&'a RemoteUser> {
    users
        .iter()
        .filter(|u| u.state.current_section.as_deref() == Some(section))
        .collect()
}

pub fn user_on_block<'a>(users: &'a [RemoteUser], block_id: &str) -> Option<&'a RemoteUser> {
    users
        .iter()
        .find(|u| u.state.selected_block_id.as_deref() == Some(block_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn member(id: &str, client: &str, age_secs: i64, now: DateTime<Utc>) -> MemberDescriptor {
        MemberDescriptor {
            id: id.into(),
            client_id: client.into(),
            name: id.to_uppercase(),
            color: "#000".into(),
            avatar_url: None,
            online_at: now - chrono::Duration::seconds(age_secs),
        }
    }

    fn counting_store(client: &str) -> (AwarenessStore, Arc<AtomicUsize>) {
        let store = AwarenessStore::new(client);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        store.observe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (store, count)
    }

    #[test]
    fn test_presence_state_wire_shape() {
        let mut state = PresenceState::new("u1", "Alice", "#F87171");
        state.cursor = Some(CursorPosition::new(1.0, 2.0));
        state.current_section_title = Some("Intro".into());
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["id"], "u1");
        assert_eq!(value["name"], "Alice");
        assert_eq!(value["currentSectionTitle"], "Intro");
        assert_eq!(value["isTyping"], false);
        assert!(value.get("selection").is_none());
    }

    #[test]
    fn test_set_local_state_emits_only_on_change() {
        let (store, count) = counting_store("tab-a");
        let state = PresenceState::new("alice", "Alice", "#fff");

        assert!(store.set_local_state(state.clone()));
        assert!(!store.set_local_state(state));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_update_local_shallow_merge() {
        let store = AwarenessStore::new("tab-a");
        assert!(!store.update_local(|s| s.is_typing = true));

        store.set_local_state(PresenceState::new("alice", "Alice", "#fff"));
        assert!(store.update_local(|s| s.selected_block_id = Some("b1".into())));
        assert!(store.update_local(|s| s.is_typing = true));

        let local = store.local_state().unwrap();
        assert_eq!(local.selected_block_id.as_deref(), Some("b1"));
        assert!(local.is_typing);
        assert_eq!(local.display_name, "Alice");
    }

    #[test]
    fn test_local_change_origin() {
        let store = AwarenessStore::new("tab-a");
        let origins = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&origins);
        store.observe(move |change| o.lock().push(change.origin));

        store.set_local_state(PresenceState::new("alice", "Alice", "#fff"));
        store.apply_remote("tab-b", PresenceState::new("bob", "Bob", "#000"));

        assert_eq!(*origins.lock(), vec![ChangeOrigin::Local, ChangeOrigin::Remote]);
    }

    #[test]
    fn test_apply_remote_last_write_wins() {
        let store = AwarenessStore::new("tab-a");
        let mut first = PresenceState::new("bob", "Bob", "#000");
        first.selected_block_id = Some("b1".into());
        let change = store.apply_remote("tab-b", first).unwrap();
        assert_eq!(change.added, vec!["tab-b".to_string()]);

        // Full replacement: the block id is gone.
        let change = store
            .apply_remote("tab-b", PresenceState::new("bob", "Bobby", "#000"))
            .unwrap();
        assert_eq!(change.updated, vec!["tab-b".to_string()]);
        let state = store.remote_state("tab-b").unwrap();
        assert_eq!(state.display_name, "Bobby");
        assert!(state.selected_block_id.is_none());
    }

    #[test]
    fn test_apply_remote_ignores_self_and_duplicates() {
        let (store, count) = counting_store("tab-a");
        assert!(store.apply_remote("tab-a", PresenceState::default()).is_none());

        let state = PresenceState::new("bob", "Bob", "#000");
        assert!(store.apply_remote("tab-b", state.clone()).is_some());
        assert!(store.apply_remote("tab-b", state).is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reconcile_adds_and_removes() {
        let store = AwarenessStore::new("tab-a");
        let now = Utc::now();
        let window = Duration::from_secs(60);

        let change = store
            .reconcile_members(
                &[member("alice", "tab-a", 0, now), member("bob", "tab-b", 0, now)],
                window,
                now,
            )
            .unwrap();
        assert_eq!(change.added, vec!["tab-b".to_string()]);
        assert_eq!(store.remote_users()[0].state.display_name, "BOB");

        let change = store.reconcile_members(&[], window, now).unwrap();
        assert_eq!(change.removed, vec!["tab-b".to_string()]);
        assert_eq!(store.remote_count(), 0);
    }

    #[test]
    fn test_reconcile_keeps_awareness_state() {
        let store = AwarenessStore::new("tab-a");
        let now = Utc::now();
        let mut rich = PresenceState::new("bob", "Bob", "#000");
        rich.current_section = Some("s1".into());
        store.apply_remote("tab-b", rich.clone());

        assert!(store
            .reconcile_members(&[member("bob", "tab-b", 0, now)], Duration::from_secs(60), now)
            .is_none());
        assert_eq!(store.remote_state("tab-b").unwrap(), rich);
    }

    #[test]
    fn test_reconcile_removes_awareness_only_entries() {
        let store = AwarenessStore::new("tab-a");
        let now = Utc::now();
        // Never tracked, or its last awareness outlived its membership.
        store.apply_remote("tab-c", PresenceState::new("carol", "Carol", "#111"));
        store.apply_remote("tab-d", PresenceState::new("dan", "Dan", "#222"));

        let change = store
            .reconcile_members(&[member("dan", "tab-d", 0, now)], Duration::from_secs(60), now)
            .unwrap();
        assert_eq!(change.removed, vec!["tab-c".to_string()]);
        assert!(change.added.is_empty());
        assert_eq!(store.remote_count(), 1);
        assert_eq!(store.remote_state("tab-d").unwrap().display_name, "Dan");

        let change = store.reconcile_members(&[], Duration::from_secs(60), now).unwrap();
        assert_eq!(change.removed, vec!["tab-d".to_string()]);
        assert_eq!(store.remote_count(), 0);
    }

    #[test]
    fn test_update_local_is_atomic_across_threads() {
        let store = Arc::new(AwarenessStore::new("tab-a"));
        store.set_local_state(PresenceState::new("alice", "Alice", "#fff"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        store.update_local(|s| {
                            let x = s.cursor.map_or(0.0, |c| c.x);
                            s.cursor = Some(CursorPosition::new(x + 1.0, 0.0));
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.local_state().unwrap().cursor.unwrap().x, 1600.0);
    }

    #[test]
    fn test_update_local_keeps_concurrent_field_changes() {
        let store = AwarenessStore::new("tab-a");
        store.set_local_state(PresenceState::new("alice", "Alice", "#fff"));
        store.update_local(|s| s.is_typing = true);

        // Typing reset touches only its own field.
        store.update_local(|s| s.selected_block_id = Some("b1".into()));
        assert!(store.update_local(|s| s.is_typing = false));
        assert!(!store.update_local(|s| s.is_typing = false));

        let local = store.local_state().unwrap();
        assert_eq!(local.selected_block_id.as_deref(), Some("b1"));
        assert!(!local.is_typing);
    }

    #[test]
    fn test_reconcile_skips_stale_and_picks_latest() {
        let store = AwarenessStore::new("tab-a");
        let now = Utc::now();
        let mut older = member("bob", "tab-b", 10, now);
        older.name = "Old Bob".into();
        let newer = member("bob", "tab-b", 1, now);

        store.reconcile_members(
            &[older, newer, member("zed", "tab-z", 120, now)],
            Duration::from_secs(60),
            now,
        );
        let users = store.remote_users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].state.display_name, "BOB");
    }

    #[test]
    fn test_observer_lifecycle_and_destroy() {
        let (store, count) = counting_store("tab-a");
        assert_eq!(store.observer_count(), 1);

        store.destroy();
        assert!(store.is_destroyed());
        assert_eq!(store.observer_count(), 0);
        assert!(!store.set_local_state(PresenceState::default()));
        assert!(store.apply_remote("tab-b", PresenceState::default()).is_none());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unobserve() {
        let (store, count) = counting_store("tab-a");
        let extra = store.observe(|_| {});
        assert!(store.unobserve(extra));
        assert!(!store.unobserve(extra));
        store.apply_remote("tab-b", PresenceState::default());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_identity_key_ignores_cursor() {
        let mut bob = PresenceState::new("bob", "Bob", "#000");
        let before = IdentityKey.key(&[RemoteUser {
            client_id: "tab-b".into(),
            state: bob.clone(),
        }]);
        bob.cursor = Some(CursorPosition::new(10.0, 20.0));
        bob.selection = Some(TextSelection { anchor: 1, head: 4 });
        let after = IdentityKey.key(&[RemoteUser {
            client_id: "tab-b".into(),
            state: bob.clone(),
        }]);
        assert_eq!(before, after);

        bob.is_typing = true;
        let typing = IdentityKey.key(&[RemoteUser {
            client_id: "tab-b".into(),
            state: bob,
        }]);
        assert_ne!(before, typing);
    }

    #[test]
    fn test_closure_key() {
        let key = |users: &[RemoteUser]| users.len().to_string();
        assert_eq!(key.key(&[]), "0");
    }

    #[test]
    fn test_notification_gate() {
        let mut gate = NotificationGate::new();
        assert!(gate.admit("a".into()));
        assert!(!gate.admit("a".into()));
        assert!(gate.admit("b".into()));
        gate.reset();
        assert!(gate.admit("b".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_throttle() {
        let mut throttle = CursorThrottle::new(Duration::from_millis(50));
        let t0 = Instant::now();
        assert!(throttle.allow(t0));
        assert!(!throttle.allow(t0 + Duration::from_millis(20)));
        assert!(throttle.allow(t0 + Duration::from_millis(50)));

        let mut open = CursorThrottle::new(Duration::ZERO);
        assert!(open.allow(t0));
        assert!(open.allow(t0));
    }

    #[test]
    fn test_collaborator_views() {
        let mk = |client: &str, id: &str, section: Option<&str>, block: Option<&str>| RemoteUser {
            client_id: client.into(),
            state: PresenceState {
                participant_id: id.into(),
                current_section: section.map(Into::into),
                selected_block_id: block.map(Into::into),
                ..Default::default()
            },
        };
        let users = vec![
            mk("t1", "alice", None, None),
            mk("t2", "bob", Some("s1"), Some("b1")),
            mk("t3", "bob", Some("s1"), None),
            mk("t4", "carol", Some("s2"), None),
        ];

        let others = collaborators(&users, "alice");
        let ids: Vec<&str> = others.iter().map(|s| s.participant_id.as_str()).collect();
        assert_eq!(ids, vec!["bob", "carol"]);

        assert_eq!(users_in_section(&users, "s1").len(), 2);
        assert_eq!(user_on_block(&users, "b1").unwrap().client_id, "t2");
        assert!(user_on_block(&users, "b9").is_none());
    }
}
