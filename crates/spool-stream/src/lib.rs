//! The log-delivery plane: ingestion protocol engine, append-only log store,
//! event bus and the run-scoped fan-out hub.
//!
//! Everything here is transport-agnostic. The daemon crate adapts WebSocket
//! connections onto the channel-based interfaces so the engines stay testable
//! with in-process stores.

pub mod bus;
pub mod fanout;
pub mod ingest;
pub mod logstore;

pub use bus::{
    AnalysisResult, AnalysisStatus, AnalysisTask, BusError, BusEvent, EventBus, MemoryEventBus,
    RedisEventBus,
};
pub use fanout::{authorize_subscriber, authorize_token, FanOutError, FanOutHub, Subscription};
pub use ingest::{Frame, IngestError, Ingestor, IngestorConfig, Reply, StreamOutcome};
pub use logstore::{LineLevel, LineRecord, LogStore, LogStoreError, LokiLogStore, MemoryLogStore};
