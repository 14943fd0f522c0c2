//! Run-scoped fan-out of live events to subscribers.
//!
//! The hub owns a `run_id -> subscribers` table behind a reader-writer lock:
//! publish takes the read side, membership changes take the write side. Each
//! subscriber gets a bounded queue; a subscriber that cannot keep up is
//! disconnected rather than allowed to stall the dispatcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use spool_db::{Database, RunContext, StoreError};

use crate::bus::BusEvent;

/// Default bound for a subscriber's outbound queue.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum FanOutError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("access denied")]
    Forbidden,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<BusEvent>,
}

/// A registered subscriber's receiving half. Dropping it without calling
/// [`FanOutHub::unsubscribe`] is safe; the hub reaps closed queues on the
/// next publish to the run.
pub struct Subscription {
    pub run_id: Uuid,
    pub id: u64,
    pub rx: mpsc::Receiver<BusEvent>,
}

/// The subscriber table plus its dispatcher loop.
pub struct FanOutHub {
    subscribers: RwLock<HashMap<Uuid, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl FanOutHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Registers a subscriber for one run and returns its queue.
    pub fn subscribe(&self, run_id: Uuid, capacity: usize) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers
            .write()
            .entry(run_id)
            .or_default()
            .push(Subscriber { id, tx });
        debug!(%run_id, subscriber = id, "subscriber registered");
        Subscription { run_id, id, rx }
    }

    pub fn unsubscribe(&self, run_id: Uuid, id: u64) {
        let mut table = self.subscribers.write();
        if let Some(subs) = table.get_mut(&run_id) {
            subs.retain(|sub| sub.id != id);
            if subs.is_empty() {
                table.remove(&run_id);
            }
        }
        debug!(%run_id, subscriber = id, "subscriber unregistered");
    }

    pub fn subscriber_count(&self, run_id: Uuid) -> usize {
        self.subscribers
            .read()
            .get(&run_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Delivers an event to every subscriber of its run. Subscribers whose
    /// queue is full (or gone) are dropped: backpressure disconnects the
    /// slowest consumer instead of blocking the dispatcher.
    pub fn publish(&self, event: &BusEvent) {
        let run_id = event.run_id();
        let mut stale: Vec<u64> = Vec::new();

        {
            let table = self.subscribers.read();
            let Some(subs) = table.get(&run_id) else {
                return;
            };
            for sub in subs {
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(%run_id, subscriber = sub.id, "subscriber queue full; disconnecting");
                        stale.push(sub.id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => stale.push(sub.id),
                }
            }
        }

        if !stale.is_empty() {
            let mut table = self.subscribers.write();
            if let Some(subs) = table.get_mut(&run_id) {
                subs.retain(|sub| !stale.contains(&sub.id));
                if subs.is_empty() {
                    table.remove(&run_id);
                }
            }
        }
    }

    /// Dispatcher loop bridging the event bus into the subscriber table.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<BusEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("fan-out dispatcher started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => self.publish(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "fan-out dispatcher lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        info!("fan-out dispatcher stopped");
    }
}

/// Checks that `user_id` owns the project the run belongs to. Returns the
/// resolved ownership chain so callers can reuse it.
pub async fn authorize_subscriber(
    db: &Database,
    run_id: Uuid,
    user_id: Uuid,
) -> Result<RunContext, FanOutError> {
    let context = db
        .run_context(run_id)
        .await
        .map_err(FanOutError::Internal)?
        .ok_or(FanOutError::RunNotFound(run_id))?;

    if context.user_id != user_id {
        return Err(FanOutError::Forbidden);
    }
    Ok(context)
}

/// Token-based variant used straight off a connection request.
pub async fn authorize_token(
    db: &Database,
    run_id: Uuid,
    token: &str,
) -> Result<RunContext, FanOutError> {
    let user_id = db.authenticate_token(token).await.map_err(|err| {
        match err.downcast::<StoreError>() {
            Ok(StoreError::InvalidToken) => FanOutError::Forbidden,
            Ok(other) => FanOutError::Internal(anyhow::Error::new(other)),
            Err(other) => FanOutError::Internal(other),
        }
    })?;
    authorize_subscriber(db, run_id, user_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use spool_db::RunStatus;

    use crate::logstore::{LineLevel, LineRecord};

    fn log_event(run_id: Uuid, content: &str) -> BusEvent {
        BusEvent::log(
            run_id,
            &LineRecord {
                timestamp: Utc::now(),
                level: LineLevel::Stdout,
                content: content.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn events_reach_only_matching_subscribers() {
        let hub = FanOutHub::new();
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();

        let mut sub_a = hub.subscribe(run_a, 8);
        let mut sub_b = hub.subscribe(run_b, 8);

        hub.publish(&log_event(run_a, "for-a"));

        let received = sub_a.rx.recv().await.unwrap();
        assert_eq!(received.run_id(), run_a);
        assert!(sub_b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_subscribers_are_disconnected() {
        let hub = FanOutHub::new();
        let run_id = Uuid::new_v4();

        let _sub = hub.subscribe(run_id, 1);
        assert_eq!(hub.subscriber_count(run_id), 1);

        // Queue capacity 1: the second publish overflows and evicts.
        hub.publish(&log_event(run_id, "1"));
        hub.publish(&log_event(run_id, "2"));

        assert_eq!(hub.subscriber_count(run_id), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_entry() {
        let hub = FanOutHub::new();
        let run_id = Uuid::new_v4();

        let sub = hub.subscribe(run_id, 8);
        let other = hub.subscribe(run_id, 8);
        assert_eq!(hub.subscriber_count(run_id), 2);

        hub.unsubscribe(run_id, sub.id);
        assert_eq!(hub.subscriber_count(run_id), 1);
        hub.unsubscribe(run_id, other.id);
        assert_eq!(hub.subscriber_count(run_id), 0);
    }

    #[tokio::test]
    async fn only_the_owning_user_is_authorized() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let owner = db.create_user("owner", "hash", false).await.unwrap();
        let intruder = db.create_user("intruder", "hash", false).await.unwrap();
        let project = db.get_or_create_project(owner.id, "p").await.unwrap();
        let group = db.get_or_create_group(project.id, "g").await.unwrap();
        let run = db
            .create_run(group.id, spool_db::AiStatus::None)
            .await
            .unwrap();

        let context = authorize_subscriber(&db, run.id, owner.id).await.unwrap();
        assert_eq!(context.user_id, owner.id);
        assert_eq!(context.project_id, project.id);

        assert!(matches!(
            authorize_subscriber(&db, run.id, intruder.id).await,
            Err(FanOutError::Forbidden)
        ));
        assert!(matches!(
            authorize_subscriber(&db, Uuid::new_v4(), owner.id).await,
            Err(FanOutError::RunNotFound(_))
        ));

        // Token-based entry behaves the same and rejects unknown tokens.
        let token = db.create_token(owner.id, "sub").await.unwrap().raw;
        assert!(authorize_token(&db, run.id, &token).await.is_ok());
        assert!(matches!(
            authorize_token(&db, run.id, "bogus").await,
            Err(FanOutError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn dispatcher_bridges_bus_events_until_shutdown() {
        let hub = FanOutHub::new();
        let run_id = Uuid::new_v4();
        let (events_tx, events_rx) = broadcast::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut sub = hub.subscribe(run_id, 8);
        let dispatcher = tokio::spawn(hub.clone().run(events_rx, shutdown_rx));

        events_tx
            .send(BusEvent::status_change(run_id, RunStatus::Completed, Some(0)))
            .unwrap();

        let received = sub.rx.recv().await.unwrap();
        assert!(matches!(received, BusEvent::RunUpdate { .. }));

        shutdown_tx.send(true).unwrap();
        dispatcher.await.unwrap();
    }
}
