//! Deadline scheduler owned by a provider's driver task.
//!
//! Every debounce in the provider is a named deadline here rather than a
//! detached sleep, so teardown has exactly one place to cancel outstanding
//! work. Deadlines use [`tokio::time::Instant`], which lets tests drive the
//! provider with paused, manually advanced time.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Timers a provider can have outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// Flush batched document updates.
    DocumentFlush,
    /// Recompute the remote user list and notify if it changed.
    AwarenessNotify,
    /// Clear the local typing indicator.
    TypingReset,
    /// Re-track our membership so its `online_at` never goes stale.
    PresenceRefresh,
}

/// At most one deadline per [`TimerKind`].
#[derive(Debug, Default)]
pub struct Scheduler {
    deadlines: HashMap<TimerKind, Instant>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` at `at`, replacing any existing deadline (debounce).
    pub fn schedule(&mut self, kind: TimerKind, at: Instant) {
        self.deadlines.insert(kind, at);
    }

    /// Arm `kind` to fire `delay` from now.
    pub fn schedule_in(&mut self, kind: TimerKind, delay: Duration) {
        self.schedule(kind, Instant::now() + delay);
    }

    /// Cancel one timer. Returns whether it was armed.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.deadlines.remove(&kind).is_some()
    }

    /// Cancel everything. Returns how many timers were armed.
    pub fn cancel_all(&mut self) -> usize {
        let n = self.deadlines.len();
        self.deadlines.clear();
        n
    }

    pub fn is_scheduled(&self, kind: TimerKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines.get(&kind).copied()
    }

    /// Earliest armed deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<(Instant, TimerKind)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(kind, at)| (*at, *kind))
            .collect();
        due.sort();

        for (_, kind) in &due {
            self.deadlines.remove(kind);
        }
        due.into_iter().map(|(_, kind)| kind).collect()
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.deadlines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_and_take_due() {
        let mut scheduler = Scheduler::new();
        let now = Instant::now();

        scheduler.schedule(TimerKind::DocumentFlush, now + Duration::from_millis(50));
        scheduler.schedule(TimerKind::AwarenessNotify, now + Duration::from_millis(100));
        assert_eq!(scheduler.pending(), 2);
        assert_eq!(scheduler.next_deadline(), Some(now + Duration::from_millis(50)));

        assert!(scheduler.take_due(now).is_empty());

        let due = scheduler.take_due(now + Duration::from_millis(60));
        assert_eq!(due, vec![TimerKind::DocumentFlush]);
        assert!(!scheduler.is_scheduled(TimerKind::DocumentFlush));
        assert!(scheduler.is_scheduled(TimerKind::AwarenessNotify));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_deadline() {
        let mut scheduler = Scheduler::new();
        let now = Instant::now();

        scheduler.schedule(TimerKind::DocumentFlush, now + Duration::from_millis(50));
        scheduler.schedule(TimerKind::DocumentFlush, now + Duration::from_millis(80));
        assert_eq!(scheduler.pending(), 1);

        assert!(scheduler.take_due(now + Duration::from_millis(60)).is_empty());
        assert_eq!(
            scheduler.take_due(now + Duration::from_millis(80)),
            vec![TimerKind::DocumentFlush]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_order_is_by_deadline() {
        let mut scheduler = Scheduler::new();
        let now = Instant::now();

        scheduler.schedule(TimerKind::TypingReset, now + Duration::from_millis(5));
        scheduler.schedule(TimerKind::AwarenessNotify, now + Duration::from_millis(1));
        scheduler.schedule(TimerKind::DocumentFlush, now + Duration::from_millis(3));

        let due = scheduler.take_due(now + Duration::from_secs(1));
        assert_eq!(
            due,
            vec![
                TimerKind::AwarenessNotify,
                TimerKind::DocumentFlush,
                TimerKind::TypingReset
            ]
        );
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_in_uses_virtual_clock() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_in(TimerKind::AwarenessNotify, Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(scheduler.take_due(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(scheduler.take_due(Instant::now()), vec![TimerKind::AwarenessNotify]);
    }

    #[test]
    fn test_cancel() {
        let mut scheduler = Scheduler::new();
        let now = Instant::now();
        scheduler.schedule(TimerKind::DocumentFlush, now);
        scheduler.schedule(TimerKind::TypingReset, now);

        assert!(scheduler.cancel(TimerKind::DocumentFlush));
        assert!(!scheduler.cancel(TimerKind::DocumentFlush));
        assert_eq!(scheduler.cancel_all(), 1);
        assert_eq!(scheduler.next_deadline(), None);
    }
}
