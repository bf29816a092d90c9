//! The command engine: one connection, one correlation table, one lock,
//! one queue, shared by every surface that submits commands.

use crate::config::EngineConfig;
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::correlation::{CommandOutcome, CorrelationTable, PendingHandle};
use crate::dedup::{DedupJudge, SimilarityRules};
use crate::error::EngineError;
use crate::lock::ExecutionLock;
use crate::metrics;
use crate::queue::{CommandQueue, EnqueueOutcome};
use crate::transport::Connector;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use viewlink_protocol::{
    Command, CommandId, CommandKind, CommandOrigin, InboundMessage, OutboundMessage, Parameters,
};

const REPORT_CHANNEL_CAPACITY: usize = 64;

/// Applies commands to the local view.
#[async_trait]
pub trait Renderer: Send + Sync + 'static {
    async fn apply(&self, command: &Command) -> Result<(), String>;
}

/// Result of executing one command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReport {
    pub command: Command,
    /// Local renderer result.
    pub local: Result<(), String>,
    /// Remote outcome; `None` when the command ran locally only.
    pub remote: Option<CommandOutcome>,
}

impl CommandReport {
    /// Local apply worked and the remote side did not report a failure.
    pub fn assumed_success(&self) -> bool {
        self.local.is_ok()
            && self
                .remote
                .as_ref()
                .map_or(true, CommandOutcome::assumed_success)
    }

    /// Remote side confirmed success.
    pub fn is_confirmed(&self) -> bool {
        self.local.is_ok() && self.remote.as_ref().is_some_and(CommandOutcome::is_confirmed)
    }
}

/// What happened to a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Near-duplicate of a recently executed command; not queued.
    Duplicate,
    Queued(EnqueueOutcome),
}

impl SubmitOutcome {
    /// Whether the command will eventually execute.
    pub fn will_execute(&self) -> bool {
        match self {
            SubmitOutcome::Duplicate => false,
            SubmitOutcome::Queued(outcome) => outcome.is_queued(),
        }
    }

    /// Id of the command that will execute on behalf of this submission.
    pub fn command_id(&self) -> Option<&CommandId> {
        match self {
            SubmitOutcome::Queued(EnqueueOutcome::Enqueued(id))
            | SubmitOutcome::Queued(EnqueueOutcome::Replaced { id, .. }) => Some(id),
            _ => None,
        }
    }
}

pub struct CommandEngine {
    me: Weak<CommandEngine>,
    config: EngineConfig,
    connection: Arc<ConnectionManager>,
    correlation: CorrelationTable,
    dedup: DedupJudge,
    lock: ExecutionLock,
    queue: CommandQueue,
    renderer: Arc<dyn Renderer>,
    draining: AtomicBool,
    reports: broadcast::Sender<CommandReport>,
    client_id: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CommandEngine {
    /// Build the engine and spawn its inbound dispatch and sweep tasks.
    ///
    /// Must be called from within a Tokio runtime. Does not connect.
    ///
    /// # Errors
    /// Returns `ConfigError` if `config` fails validation.
    pub fn start(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        renderer: Arc<dyn Renderer>,
    ) -> Result<Arc<Self>, EngineError> {
        config.validate()?;
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let connection = ConnectionManager::new(
            config.endpoint.clone(),
            connector,
            &config.connection,
            frames_tx,
        );
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);

        let engine = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            correlation: CorrelationTable::new(
                config.correlation.timeout(),
                config.correlation.keep_expired,
            ),
            dedup: DedupJudge::new(&config.dedup),
            lock: ExecutionLock::new(config.lock.max_hold()),
            queue: CommandQueue::new(
                config.queue.replaceable_kinds.clone(),
                SimilarityRules::from(&config.dedup),
            ),
            config,
            connection,
            renderer,
            draining: AtomicBool::new(false),
            reports,
            client_id: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        let dispatcher = tokio::spawn(dispatch(Arc::downgrade(&engine), frames_rx));
        let sweeper = tokio::spawn(sweep(Arc::downgrade(&engine)));
        engine.tasks.lock().extend([dispatcher, sweeper]);

        info!("Command engine started for {}", engine.connection.endpoint());
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn connect(&self) -> Result<(), EngineError> {
        self.connection.connect().await
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub async fn reconnect(&self) -> Result<(), EngineError> {
        self.connection.reconnect().await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.connection.subscribe()
    }

    /// Reports for every executed command, in execution order.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<CommandReport> {
        self.reports.subscribe()
    }

    /// Client id assigned by the server's welcome frame.
    pub fn client_id(&self) -> Option<String> {
        self.client_id.lock().clone()
    }

    pub fn queued(&self) -> Vec<Command> {
        self.queue.snapshot()
    }

    pub fn pending_responses(&self) -> usize {
        self.correlation.pending_count()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn execution_lock(&self) -> &ExecutionLock {
        &self.lock
    }

    pub fn dedup(&self) -> &DedupJudge {
        &self.dedup
    }

    /// Submit a command from any surface.
    pub fn submit(
        &self,
        kind: CommandKind,
        parameters: Parameters,
        origin: CommandOrigin,
    ) -> SubmitOutcome {
        self.submit_command(Command::new(kind, parameters, origin))
    }

    pub fn submit_command(&self, command: Command) -> SubmitOutcome {
        metrics::increment_submitted();

        if self.dedup.is_duplicate(&command.kind, &command.parameters) {
            metrics::increment_suppressed();
            debug!("Suppressed duplicate {} from {:?}", command.kind, command.origin);
            return SubmitOutcome::Duplicate;
        }

        let outcome = self.queue.enqueue(command);
        if !outcome.is_queued() {
            metrics::increment_suppressed();
        }
        self.start_draining();
        SubmitOutcome::Queued(outcome)
    }

    fn start_draining(&self) {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        match self.me.upgrade() {
            Some(engine) => {
                tokio::spawn(engine.drain());
            }
            None => self.draining.store(false, Ordering::SeqCst),
        }
    }

    /// Run queued commands one at a time until the queue is empty.
    async fn drain(self: Arc<Self>) {
        let lock_config = &self.config.lock;
        loop {
            if self.queue.is_empty() {
                self.draining.store(false, Ordering::SeqCst);
                // A submit may have slipped in after the emptiness check.
                if self.queue.is_empty()
                    || self
                        .draining
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                {
                    return;
                }
            }

            let guard = match self
                .lock
                .acquire_with_retry(lock_config.acquire_attempts, lock_config.retry_base())
                .await
            {
                Ok(guard) => guard,
                Err(e) => {
                    debug!("{}; waiting for the current holder", e);
                    tokio::select! {
                        _ = self.lock.released() => {}
                        _ = tokio::time::sleep(self.lock.max_hold()) => {}
                    }
                    continue;
                }
            };

            let Some(queued) = self.queue.dequeue() else {
                continue;
            };
            let waited = queued.enqueued_at.elapsed();
            debug!("Executing {} {} after {:?} in queue", queued.command.kind, queued.command.id, waited);

            self.execute(queued.command).await;
            drop(guard);

            if !self.queue.is_empty() {
                tokio::time::sleep(self.config.queue.inter_command_delay()).await;
            }
        }
    }

    async fn execute(&self, mut command: Command) -> CommandReport {
        let pending = self.send_remote(&mut command);

        let local = self.renderer.apply(&command).await;
        if let Err(e) = &local {
            warn!("{}", EngineError::LocalExecution(e.clone()));
        }

        let remote = match pending {
            Some(handle) => Some(self.correlation.wait(handle).await),
            None => None,
        };

        metrics::increment_executed();
        let report = CommandReport {
            command,
            local,
            remote,
        };
        self.dedup.record(
            report.command.kind.clone(),
            report.command.parameters.clone(),
            report.assumed_success(),
        );

        match &report.remote {
            Some(CommandOutcome::Failed { reason, .. }) => warn!(
                "{} {} failed remotely: {}",
                report.command.kind,
                report.command.id,
                reason.as_deref().unwrap_or("no reason given")
            ),
            Some(outcome) if outcome.is_unknown() => debug!(
                "{} {} outcome unknown, assuming success",
                report.command.kind, report.command.id
            ),
            _ => {}
        }

        if self.reports.send(report.clone()).is_err() {
            debug!("No report subscribers");
        }
        report
    }

    /// Register and send the command when connected. `None` means local-only.
    fn send_remote(&self, command: &mut Command) -> Option<PendingHandle> {
        if command.origin == CommandOrigin::Server {
            return None;
        }
        if !self.connection.is_connected() {
            debug!(
                "{} {} runs locally only ({})",
                command.kind,
                command.id,
                self.connection.status()
            );
            return None;
        }

        let handle = match self.correlation.register_command(command) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("{}; running locally only", e);
                return None;
            }
        };

        match self.connection.send_message(&OutboundMessage::command(command)) {
            Ok(()) => Some(handle),
            Err(e) => {
                warn!("Send of {} failed: {}; running locally only", command.id, e);
                self.correlation.cancel(command.id.as_str());
                None
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring inbound frame: {}", e);
                return;
            }
        };

        match message {
            InboundMessage::Pong { timestamp } => debug!("Pong {:?}", timestamp),
            InboundMessage::Ping => {
                if let Err(e) = self.connection.send_message(&OutboundMessage::pong()) {
                    debug!("Pong not sent: {}", e);
                }
            }
            InboundMessage::Welcome { client_id } => {
                info!("Server welcome, client id {:?}", client_id);
                *self.client_id.lock() = client_id;
            }
            InboundMessage::Command(push) => {
                if let Some(id) = push.id.as_deref().filter(|id| self.correlation.is_pending(id)) {
                    debug!("Command frame for pending {} treated as a reply", id);
                    let outcome = CommandOutcome::Acknowledged { response: push.body };
                    self.correlation.resolve(id, outcome);
                    return;
                }
                let mut command =
                    Command::new(push.kind, push.parameters, CommandOrigin::Server);
                if let Some(id) = push.id {
                    command.id = CommandId::from(id);
                }
                if let Some(target) = push.target {
                    command = command.with_target(target);
                }
                let outcome = self.submit_command(command);
                debug!("Server push {:?}", outcome);
            }
            InboundMessage::Response(response) => {
                self.correlation.resolve_response(response);
            }
            InboundMessage::Other(value) => debug!("Unhandled inbound frame: {}", value),
        }
    }

    /// Disconnect, drop queued commands and stop background tasks.
    pub fn shutdown(&self) {
        self.connection.disconnect();
        let dropped = self.queue.clear();
        if dropped > 0 {
            info!("Dropped {} queued commands on shutdown", dropped);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for CommandEngine {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn dispatch(engine: Weak<CommandEngine>, mut frames: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = frames.recv().await {
        let Some(engine) = engine.upgrade() else {
            return;
        };
        engine.handle_frame(&text);
    }
}

async fn sweep(engine: Weak<CommandEngine>) {
    let period = match engine.upgrade() {
        Some(engine) => engine.config.correlation.sweep_interval(),
        None => return,
    };
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(engine) = engine.upgrade() else {
            return;
        };
        let expired = engine.correlation.expire_due();
        let purged = engine.dedup.purge_expired();
        if expired > 0 || purged > 0 {
            debug!("Sweep: {} responses timed out, {} history records purged", expired, purged);
        }
    }
}
