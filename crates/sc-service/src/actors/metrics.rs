//! Actor metrics and mailbox monitoring.
//!
//! | Actor Type  | Normal | Warning | Critical |
//! |-------------|--------|---------|----------|
//! | Session     | < 16   | 16-64   | > 64     |
//! | Egress      | < 50   | 50-200  | > 200    |
//!
//! A session mailbox only backs up when one client floods requests or its
//! owner is stuck on a slow engine call, so its thresholds are low.
//! Thresholds apply per mailbox; the exported gauge is the number of
//! messages queued across all actors of a type.

use crate::observability::metrics as prom;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `SessionActor` (one per connected client).
    Session,
    /// `EgressBridge` (singleton).
    Egress,
}

impl ActorType {
    /// Returns the actor type as a string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Session => "session",
            ActorType::Egress => "egress",
        }
    }

    /// Depth above which the mailbox is elevated.
    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Session => 16,
            ActorType::Egress => 50,
        }
    }

    /// Depth above which the mailbox is critical.
    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Session => 64,
            ActorType::Egress => 200,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks the queue depth of one actor's mailbox.
///
/// Handles call [`record_enqueue`](Self::record_enqueue) when they send and
/// the actor calls [`record_dequeue`](Self::record_dequeue) after handling a
/// message, so the monitor sees messages waiting behind an in-flight one.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    actor_id: String,
    depth: AtomicUsize,
    /// Messages queued across every mailbox sharing this counter.
    queued_total: Arc<AtomicUsize>,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
    messages_dropped: AtomicU64,
}

impl MailboxMonitor {
    /// Monitor for a singleton actor.
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self::pooled(actor_type, actor_id, Arc::new(AtomicUsize::new(0)))
    }

    /// Monitor for one of many actors of a type; `queued_total` is shared
    /// by all of them and backs the exported depth gauge.
    #[must_use]
    pub fn pooled(
        actor_type: ActorType,
        actor_id: impl Into<String>,
        queued_total: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            queued_total,
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Record a message being added to the mailbox.
    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(new_depth, Ordering::Relaxed);
        let total = self.queued_total.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), total);

        match self.level_for_depth(new_depth) {
            MailboxLevel::Critical => warn!(
                target: "sc.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = new_depth,
                threshold = self.actor_type.warning_threshold(),
                "Mailbox depth critical"
            ),
            // Log once when crossing into the warning band
            MailboxLevel::Warning if new_depth == self.actor_type.normal_threshold() + 1 => {
                debug!(
                    target: "sc.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth = new_depth,
                    "Mailbox depth elevated"
                );
            }
            _ => {}
        }
    }

    /// Record a message being removed from the mailbox (processed).
    pub fn record_dequeue(&self) {
        let previous = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(1)))
            .unwrap_or(0);
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        if previous == 0 {
            return;
        }
        let total = self
            .queued_total
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |t| Some(t.saturating_sub(1)))
            .unwrap_or(0)
            .saturating_sub(1);
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), total);
    }

    /// Give back messages still counted when the actor stops, so the
    /// shared total does not keep them.
    pub fn release_remaining(&self) {
        let remaining = self.depth.swap(0, Ordering::Relaxed);
        if remaining == 0 {
            return;
        }
        let total = self
            .queued_total
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |t| {
                Some(t.saturating_sub(remaining))
            })
            .unwrap_or(0)
            .saturating_sub(remaining);
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), total);
    }

    /// Record a message that could not be delivered because the queue was full.
    pub fn record_drop(&self) {
        let dropped = self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_message_dropped(self.actor_type.as_str());
        warn!(
            target: "sc.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            actor_id = %self.actor_id,
            dropped,
            "Message dropped due to backpressure"
        );
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Aggregated counters for the actor system.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    /// Session actors currently running.
    pub active_sessions: AtomicUsize,
    /// Messages queued across all session mailboxes.
    pub queued_session_messages: Arc<AtomicUsize>,
    /// Total actor panics (indicates bugs).
    pub actor_panics: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn session_started(&self) {
        let count = self.active_sessions.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_sessions_active(count);
    }

    pub fn session_stopped(&self) {
        let previous = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some(c.saturating_sub(1)))
            .unwrap_or(0);
        prom::set_sessions_active(previous.saturating_sub(1));
    }

    /// Record an actor panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "sc.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Mailbox monitor for a new session, counted in the session total.
    #[must_use]
    pub fn session_mailbox(&self, actor_id: impl Into<String>) -> MailboxMonitor {
        MailboxMonitor::pooled(
            ActorType::Session,
            actor_id,
            Arc::clone(&self.queued_session_messages),
        )
    }

    #[must_use]
    pub fn queued_session_messages(&self) -> usize {
        self.queued_session_messages.load(Ordering::Relaxed)
    }
}
