//! Process-to-process event bus.
//!
//! Two concerns share one transport: fire-and-forget live events (log lines
//! and run updates on a single channel) and a durable FIFO of analysis tasks
//! with a companion result-notification channel. Live events are not
//! persisted: a late subscriber misses history and the fan-out compensates
//! by replaying from the log store.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tracing::warn;
use uuid::Uuid;

use spool_db::{AiStatus, RunStatus};

use crate::logstore::{LineLevel, LineRecord};

/// Pub/sub channel carrying live log and run-update events.
const EVENTS_CHANNEL: &str = "spool:events";
/// List key backing the durable analysis task queue.
const TASK_QUEUE_KEY: &str = "spool:analysis:queue";
/// Pub/sub channel carrying analysis result notifications.
const RESULTS_CHANNEL: &str = "spool:analysis:notify";

/// Live event published on the shared channel. The serialized form is the
/// wire format delivered to fan-out subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    Log {
        run_id: Uuid,
        timestamp: DateTime<Utc>,
        level: LineLevel,
        content: String,
    },
    RunUpdate {
        run_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<RunStatus>,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ai_status: Option<AiStatus>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ai_report: Option<String>,
    },
}

impl BusEvent {
    pub fn log(run_id: Uuid, line: &LineRecord) -> Self {
        BusEvent::Log {
            run_id,
            timestamp: line.timestamp,
            level: line.level,
            content: line.content.clone(),
        }
    }

    pub fn status_change(run_id: Uuid, status: RunStatus, exit_code: Option<i32>) -> Self {
        BusEvent::RunUpdate {
            run_id,
            status: Some(status),
            exit_code,
            ai_status: None,
            ai_report: None,
        }
    }

    pub fn ai_change(run_id: Uuid, ai_status: AiStatus, ai_report: Option<String>) -> Self {
        BusEvent::RunUpdate {
            run_id,
            status: None,
            exit_code: None,
            ai_status: Some(ai_status),
            ai_report,
        }
    }

    pub fn run_id(&self) -> Uuid {
        match self {
            BusEvent::Log { run_id, .. } => *run_id,
            BusEvent::RunUpdate { run_id, .. } => *run_id,
        }
    }
}

/// Queued analysis job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisTask {
    pub run_id: Uuid,
    pub user_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Completed,
    Failed,
}

/// Outcome notification published after a task is processed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub run_id: Uuid,
    pub status: AnalysisStatus,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connection(String),
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("bus payload encoding error: {0}")]
    Encoding(String),
}

/// The shared transport contract. Publish is fire-and-forget within client
/// buffer limits; `dequeue_task` blocks up to `timeout` and returns `None`
/// when nothing arrived.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish_event(&self, event: &BusEvent) -> Result<(), BusError>;
    fn subscribe_events(&self) -> broadcast::Receiver<BusEvent>;
    async fn enqueue_task(&self, task: &AnalysisTask) -> Result<(), BusError>;
    async fn dequeue_task(&self, timeout: Duration) -> Result<Option<AnalysisTask>, BusError>;
    async fn publish_result(&self, result: &AnalysisResult) -> Result<(), BusError>;
    fn subscribe_results(&self) -> broadcast::Receiver<AnalysisResult>;
    async fn queue_length(&self) -> Result<u64, BusError>;
}

/// Redis-backed bus: pub/sub for live traffic, LPUSH/BRPOP for the queue.
///
/// A forwarder task per pub/sub channel bridges incoming messages into a
/// local broadcast channel so any number of in-process consumers can tail
/// events without holding their own Redis connection.
pub struct RedisEventBus {
    client: redis::Client,
    publish_conn: tokio::sync::Mutex<redis::aio::MultiplexedConnection>,
    events_tx: broadcast::Sender<BusEvent>,
    results_tx: broadcast::Sender<AnalysisResult>,
}

impl RedisEventBus {
    pub async fn connect(url: &str) -> Result<Arc<Self>, BusError> {
        let client =
            redis::Client::open(url).map_err(|err| BusError::Connection(err.to_string()))?;
        let publish_conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| BusError::Connection(err.to_string()))?;

        let (events_tx, _) = broadcast::channel(1_024);
        let (results_tx, _) = broadcast::channel(256);

        tokio::spawn(forward_channel(
            client.clone(),
            EVENTS_CHANNEL,
            events_tx.clone(),
        ));
        tokio::spawn(forward_channel(
            client.clone(),
            RESULTS_CHANNEL,
            results_tx.clone(),
        ));

        Ok(Arc::new(Self {
            client,
            publish_conn: tokio::sync::Mutex::new(publish_conn),
            events_tx,
            results_tx,
        }))
    }
}

/// Bridges one Redis pub/sub channel into a local broadcast sender,
/// resubscribing with a short pause whenever the connection drops.
async fn forward_channel<T>(client: redis::Client, channel: &'static str, tx: broadcast::Sender<T>)
where
    T: DeserializeOwned + Clone + Send + 'static,
{
    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(err) => {
                warn!(channel, error = %err, "bus subscription connect failed; retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        if let Err(err) = pubsub.subscribe(channel).await {
            warn!(channel, error = %err, "bus subscribe failed; retrying");
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }

        let mut messages = pubsub.on_message();
        while let Some(message) = messages.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(channel, error = %err, "unreadable bus payload");
                    continue;
                }
            };
            match serde_json::from_str::<T>(&payload) {
                // Send errors only mean nobody is subscribed right now.
                Ok(parsed) => {
                    let _ = tx.send(parsed);
                }
                Err(err) => warn!(channel, error = %err, "undecodable bus payload"),
            }
        }
        warn!(channel, "bus subscription ended; reconnecting");
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish_event(&self, event: &BusEvent) -> Result<(), BusError> {
        let payload =
            serde_json::to_string(event).map_err(|err| BusError::Encoding(err.to_string()))?;
        let mut conn = self.publish_conn.lock().await;
        conn.publish::<_, _, ()>(EVENTS_CHANNEL, payload)
            .await
            .map_err(|err| BusError::Transport(err.to_string()))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<BusEvent> {
        self.events_tx.subscribe()
    }

    async fn enqueue_task(&self, task: &AnalysisTask) -> Result<(), BusError> {
        let payload =
            serde_json::to_string(task).map_err(|err| BusError::Encoding(err.to_string()))?;
        let mut conn = self.publish_conn.lock().await;
        conn.lpush::<_, _, ()>(TASK_QUEUE_KEY, payload)
            .await
            .map_err(|err| BusError::Transport(err.to_string()))
    }

    async fn dequeue_task(&self, timeout: Duration) -> Result<Option<AnalysisTask>, BusError> {
        // Dedicated connection: BRPOP must not stall the shared publisher.
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| BusError::Connection(err.to_string()))?;

        let popped: Option<(String, String)> = conn
            .brpop(TASK_QUEUE_KEY, timeout.as_secs_f64())
            .await
            .map_err(|err| BusError::Transport(err.to_string()))?;

        match popped {
            Some((_key, payload)) => serde_json::from_str(&payload)
                .map(Some)
                .map_err(|err| BusError::Encoding(err.to_string())),
            None => Ok(None),
        }
    }

    async fn publish_result(&self, result: &AnalysisResult) -> Result<(), BusError> {
        let payload =
            serde_json::to_string(result).map_err(|err| BusError::Encoding(err.to_string()))?;
        let mut conn = self.publish_conn.lock().await;
        conn.publish::<_, _, ()>(RESULTS_CHANNEL, payload)
            .await
            .map_err(|err| BusError::Transport(err.to_string()))
    }

    fn subscribe_results(&self) -> broadcast::Receiver<AnalysisResult> {
        self.results_tx.subscribe()
    }

    async fn queue_length(&self) -> Result<u64, BusError> {
        let mut conn = self.publish_conn.lock().await;
        conn.llen(TASK_QUEUE_KEY)
            .await
            .map_err(|err| BusError::Transport(err.to_string()))
    }
}

/// In-process bus used by tests and single-node deployments.
pub struct MemoryEventBus {
    events_tx: broadcast::Sender<BusEvent>,
    results_tx: broadcast::Sender<AnalysisResult>,
    queue: Mutex<VecDeque<AnalysisTask>>,
    task_added: Notify,
}

impl MemoryEventBus {
    pub fn new() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(1_024);
        let (results_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            events_tx,
            results_tx,
            queue: Mutex::new(VecDeque::new()),
            task_added: Notify::new(),
        })
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish_event(&self, event: &BusEvent) -> Result<(), BusError> {
        let _ = self.events_tx.send(event.clone());
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<BusEvent> {
        self.events_tx.subscribe()
    }

    async fn enqueue_task(&self, task: &AnalysisTask) -> Result<(), BusError> {
        self.queue.lock().push_back(task.clone());
        self.task_added.notify_one();
        Ok(())
    }

    async fn dequeue_task(&self, timeout: Duration) -> Result<Option<AnalysisTask>, BusError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.task_added.notified();
            if let Some(task) = self.queue.lock().pop_front() {
                return Ok(Some(task));
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn publish_result(&self, result: &AnalysisResult) -> Result<(), BusError> {
        let _ = self.results_tx.send(result.clone());
        Ok(())
    }

    fn subscribe_results(&self) -> broadcast::Receiver<AnalysisResult> {
        self.results_tx.subscribe()
    }

    async fn queue_length(&self) -> Result<u64, BusError> {
        Ok(self.queue.lock().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_events_serialize_to_the_subscriber_wire_shape() {
        let run_id = Uuid::new_v4();
        let event = BusEvent::Log {
            run_id,
            timestamp: Utc::now(),
            level: LineLevel::Stderr,
            content: "oops".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "log");
        assert_eq!(json["run_id"], run_id.to_string());
        assert_eq!(json["level"], "stderr");
        assert_eq!(json["content"], "oops");
    }

    #[test]
    fn run_updates_omit_absent_fields() {
        let event = BusEvent::status_change(Uuid::new_v4(), RunStatus::Completed, Some(0));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run_update");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["exit_code"], 0);
        assert!(json.get("ai_status").is_none());
        assert!(json.get("ai_report").is_none());
    }

    #[tokio::test]
    async fn memory_queue_is_fifo() {
        let bus = MemoryEventBus::new();
        let first = AnalysisTask {
            run_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            enqueued_at: Utc::now(),
        };
        let second = AnalysisTask {
            run_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            enqueued_at: Utc::now(),
        };

        bus.enqueue_task(&first).await.unwrap();
        bus.enqueue_task(&second).await.unwrap();
        assert_eq!(bus.queue_length().await.unwrap(), 2);

        let a = bus.dequeue_task(Duration::from_millis(50)).await.unwrap();
        let b = bus.dequeue_task(Duration::from_millis(50)).await.unwrap();
        assert_eq!(a.unwrap().run_id, first.run_id);
        assert_eq!(b.unwrap().run_id, second.run_id);
    }

    #[tokio::test]
    async fn memory_dequeue_times_out_empty() {
        let bus = MemoryEventBus::new();
        let start = tokio::time::Instant::now();
        let task = bus.dequeue_task(Duration::from_millis(30)).await.unwrap();
        assert!(task.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let bus = MemoryEventBus::new();
        let mut rx = bus.subscribe_events();

        let event = BusEvent::status_change(Uuid::new_v4(), RunStatus::Failed, Some(2));
        bus.publish_event(&event).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
