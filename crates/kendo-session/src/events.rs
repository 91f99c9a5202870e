//! Session lifecycle events.
//!
//! Collaborators (request authorisation, UI prompts) subscribe to these
//! instead of polling the store.

use tokio::sync::broadcast;

use crate::error::RenewalFailureKind;

/// Events broadcast as the session changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A login succeeded and a credential was issued.
    LoggedIn { username: String, expires_at: i64 },
    /// A persisted credential was picked up again at start-up.
    Resumed { expires_at: i64 },
    /// A renewal timer was armed.
    RenewalScheduled { expires_at: i64, fires_at: i64 },
    /// The credential was already inside its renewal window; nothing was armed.
    RenewalSkipped { expires_at: i64 },
    /// A renewal succeeded and the new credential was stored.
    Renewed { expires_at: i64 },
    /// A renewal failed; automatic renewal has stopped until the next login.
    RenewalStopped {
        kind: RenewalFailureKind,
        reason: String,
    },
    /// The session was closed and its stored values removed.
    LoggedOut,
}

impl SessionEvent {
    /// Event name for logging and subscriptions.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::LoggedIn { .. } => "session_logged_in",
            Self::Resumed { .. } => "session_resumed",
            Self::RenewalScheduled { .. } => "renewal_scheduled",
            Self::RenewalSkipped { .. } => "renewal_skipped",
            Self::Renewed { .. } => "renewal_succeeded",
            Self::RenewalStopped { .. } => "renewal_stopped",
            Self::LoggedOut => "session_logged_out",
        }
    }

    /// Whether the event requires the user to authenticate again.
    pub fn requires_relogin(&self) -> bool {
        matches!(self, Self::RenewalStopped { .. })
    }
}

/// Default channel capacity for session events.
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Broadcaster for session events.
#[derive(Debug, Clone)]
pub struct SessionEventBroadcaster {
    sender: broadcast::Sender<SessionEvent>,
}

impl SessionEventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SessionEvent) {
        tracing::trace!(event = event.event_name(), "Publishing session event");
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SessionEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let broadcaster = SessionEventBroadcaster::new();
        let mut rx1 = broadcaster.subscribe();
        let mut rx2 = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        broadcaster.publish(SessionEvent::Renewed { expires_at: 10 });

        assert_eq!(rx1.recv().await.unwrap(), SessionEvent::Renewed { expires_at: 10 });
        assert_eq!(rx2.recv().await.unwrap(), SessionEvent::Renewed { expires_at: 10 });
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broadcaster = SessionEventBroadcaster::new();
        broadcaster.publish(SessionEvent::LoggedOut);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_relogin_flag() {
        let stopped = SessionEvent::RenewalStopped {
            kind: RenewalFailureKind::NoResponse,
            reason: "down".into(),
        };
        assert!(stopped.requires_relogin());
        assert_eq!(stopped.event_name(), "renewal_stopped");
        assert!(!SessionEvent::LoggedOut.requires_relogin());
    }
}
