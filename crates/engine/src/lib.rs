pub mod backoff;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod queue;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use config::{
    load_engine_config, parse_engine_config, ConnectionConfig, CorrelationConfig, DedupConfig,
    EngineConfig, LockConfig, QueueConfig, ENDPOINT_ENV,
};
pub use connection::{ConnectionManager, ConnectionStatus};
pub use correlation::{CommandOutcome, CorrelationTable, PendingHandle};
pub use dedup::{generic_similarity, DedupJudge, ExecutedCommandRecord, SimilarityRules};
pub use engine::{CommandEngine, CommandReport, Renderer, SubmitOutcome};
pub use error::EngineError;
pub use lock::{ExecutionLock, LockGuard};
pub use queue::{CommandQueue, EnqueueOutcome, QueuedCommand};
pub use transport::{Connector, Link, TransportEvent, WsConnector};

pub use viewlink_protocol as protocol;
