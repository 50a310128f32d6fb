//! Fire-and-forget notification dispatch
//!
//! The state machine hands a [`Notification`] to a [`Notifier`] after its
//! transaction commits. A failed or dropped notification never affects the
//! committed state.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │       LotStateMachine (after commit)         │
//! └─────────────────────┬────────────────────────┘
//!                       │ try_send (never blocks)
//!                       ▼
//! ┌──────────────────────────────────────────────┐
//! │     ChannelNotifier (Clone, bounded mpsc)    │
//! └─────────────────────┬────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────┐
//! │  NotifierActor (single task) → sink.deliver  │
//! └──────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::types::{EntityId, LotId};
use crate::{Error, Result};

/// What happened to the lot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// A lot awaits the recipient's decision
    Submitted,
    /// A lot was accepted
    Accepted,
    /// A lot was accepted into a closed period
    Frozen,
}

/// Message for the dispatch layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Kind
    pub kind: NotificationKind,
    /// Lot concerned
    pub lot_id: LotId,
    /// Its traceability code
    pub traceability_code: String,
    /// Entity to notify, if registered
    pub recipient: Option<EntityId>,
    /// Entity whose action triggered it
    pub actor: EntityId,
    /// Commit time
    pub at: DateTime<Utc>,
}

/// Receives notifications from the commit path. Must not block.
pub trait Notifier: Send + Sync {
    /// Hand over a notification
    fn notify(&self, notification: Notification);
}

/// Discards every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _notification: Notification) {}
}

/// Final destination of notifications (mailer, webhook, log)
pub trait NotificationSink: Send + 'static {
    /// Deliver one notification
    fn deliver(&mut self, notification: &Notification) -> Result<()>;
}

/// Sink that writes notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

impl NotificationSink for LoggingSink {
    fn deliver(&mut self, notification: &Notification) -> Result<()> {
        tracing::info!(
            kind = ?notification.kind,
            lot_id = %notification.lot_id,
            code = %notification.traceability_code,
            recipient = ?notification.recipient,
            "Notification dispatched"
        );
        Ok(())
    }
}

/// Message sent to the notifier actor
enum NotifierMessage {
    /// Deliver a notification
    Deliver(Notification),

    /// Answer once everything queued before has been delivered
    Flush(oneshot::Sender<()>),

    /// Stop the actor
    Shutdown,
}

/// Actor draining the mailbox into a sink
struct NotifierActor<S> {
    sink: S,
    mailbox: mpsc::Receiver<NotifierMessage>,
}

impl<S: NotificationSink> NotifierActor<S> {
    async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                NotifierMessage::Deliver(notification) => {
                    if let Err(e) = self.sink.deliver(&notification) {
                        tracing::error!(
                            lot_id = %notification.lot_id,
                            "Notification delivery failed: {}",
                            e
                        );
                    }
                }
                NotifierMessage::Flush(response) => {
                    let _ = response.send(());
                }
                NotifierMessage::Shutdown => break,
            }
        }
    }
}

/// Handle feeding the notifier actor
#[derive(Clone)]
pub struct ChannelNotifier {
    sender: mpsc::Sender<NotifierMessage>,
    dropped: Arc<AtomicU64>,
}

impl ChannelNotifier {
    fn new(sender: mpsc::Sender<NotifierMessage>) -> Self {
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Notifications dropped because the mailbox was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until everything queued so far has been delivered
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(NotifierMessage::Flush(tx))
            .await
            .map_err(|_| Error::Unavailable("Notifier mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Unavailable("Notifier response channel closed".to_string()))
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(NotifierMessage::Shutdown)
            .await
            .map_err(|_| Error::Unavailable("Notifier mailbox closed".to_string()))?;
        Ok(())
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        let lot_id = notification.lot_id;
        if let Err(e) = self.sender.try_send(NotifierMessage::Deliver(notification)) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "mailbox full",
                mpsc::error::TrySendError::Closed(_) => "mailbox closed",
            };
            tracing::warn!(lot_id = %lot_id, reason, "Notification dropped");
        }
    }
}

/// Spawn the notifier actor on the current tokio runtime
pub fn spawn_notifier<S: NotificationSink>(sink: S, capacity: usize) -> ChannelNotifier {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let actor = NotifierActor { sink, mailbox: rx };

    tokio::spawn(async move {
        actor.run().await;
    });

    ChannelNotifier::new(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<Notification>>>);

    impl NotificationSink for RecordingSink {
        fn deliver(&mut self, notification: &Notification) -> Result<()> {
            self.0.lock().push(notification.clone());
            Ok(())
        }
    }

    fn notification(kind: NotificationKind) -> Notification {
        Notification {
            kind,
            lot_id: LotId::new(),
            traceability_code: "202401-FR-00000000".to_string(),
            recipient: Some(EntityId::new("CLIENT")),
            actor: EntityId::new("OWNER"),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_actor_delivers_in_order() {
        let sink = RecordingSink::default();
        let notifier = spawn_notifier(sink.clone(), 16);

        notifier.notify(notification(NotificationKind::Submitted));
        notifier.notify(notification(NotificationKind::Accepted));
        notifier.flush().await.unwrap();

        let delivered = sink.0.lock();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].kind, NotificationKind::Submitted);
        assert_eq!(delivered[1].kind, NotificationKind::Accepted);
        drop(delivered);

        notifier.shutdown().await.unwrap();
    }

    #[test]
    fn test_full_mailbox_drops_without_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let notifier = ChannelNotifier::new(tx);

        notifier.notify(notification(NotificationKind::Submitted));
        notifier.notify(notification(NotificationKind::Submitted));
        assert_eq!(notifier.dropped(), 1);
    }

    #[test]
    fn test_closed_mailbox_drops() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let notifier = ChannelNotifier::new(tx);
        notifier.notify(notification(NotificationKind::Frozen));
        assert_eq!(notifier.dropped(), 1);
    }
}
