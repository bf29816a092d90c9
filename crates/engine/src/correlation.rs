//! Request/response correlation with deadlines.

use crate::error::EngineError;
use crate::metrics;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};
use viewlink_protocol::{Command, CommandKind, CommandResponse, Verdict};

/// How a sent command ended, as far as the remote side is concerned.
///
/// `Acknowledged` and `TimedOut` are unknown outcomes: the command went out
/// but nobody confirmed it worked. They count as assumed success so the
/// caller can proceed, without being reported as confirmed.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Succeeded { response: Value },
    Failed { response: Value, reason: Option<String> },
    Acknowledged { response: Value },
    TimedOut { waited: Duration },
}

impl CommandOutcome {
    pub fn from_response(response: CommandResponse) -> Self {
        match response.verdict {
            Verdict::Success => CommandOutcome::Succeeded {
                response: response.body,
            },
            Verdict::Failure => CommandOutcome::Failed {
                response: response.body,
                reason: response.error,
            },
            Verdict::Unspecified => CommandOutcome::Acknowledged {
                response: response.body,
            },
        }
    }

    /// Remote side explicitly reported success.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, CommandOutcome::Succeeded { .. })
    }

    /// Sent, but the result is not known.
    pub fn is_unknown(&self) -> bool {
        matches!(
            self,
            CommandOutcome::Acknowledged { .. } | CommandOutcome::TimedOut { .. }
        )
    }

    /// Low-confidence success flag: everything except an explicit failure.
    pub fn assumed_success(&self) -> bool {
        !matches!(self, CommandOutcome::Failed { .. })
    }
}

/// Completion handle for one registered command.
#[derive(Debug)]
pub struct PendingHandle {
    id: String,
    issued_at: Instant,
    deadline: Instant,
    rx: oneshot::Receiver<CommandOutcome>,
}

impl PendingHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

struct PendingEntry {
    issued_at: Instant,
    deadline: Instant,
    kind: Option<CommandKind>,
    /// `None` once resolved by expiry while the entry is retained.
    completion: Option<oneshot::Sender<CommandOutcome>>,
}

/// Maps outstanding command ids to their completion handles.
pub struct CorrelationTable {
    entries: Mutex<HashMap<String, PendingEntry>>,
    default_timeout: Duration,
    keep_expired: bool,
}

impl CorrelationTable {
    /// # Arguments
    /// * `default_timeout` - Deadline offset for `register_command`
    /// * `keep_expired` - Retain timed-out entries for one more timeout
    ///   window so a late response is logged rather than treated as unknown
    pub fn new(default_timeout: Duration, keep_expired: bool) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_timeout,
            keep_expired,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register `id` with an explicit deadline.
    ///
    /// Overdue entries are expired first.
    ///
    /// # Errors
    /// Returns `DuplicateId` if `id` is already pending.
    pub fn register(&self, id: &str, deadline: Instant) -> Result<PendingHandle, EngineError> {
        self.insert(id, deadline, None)
    }

    /// Register a command with the default timeout.
    ///
    /// An id that is already pending is regenerated once before giving up.
    pub fn register_command(&self, command: &mut Command) -> Result<PendingHandle, EngineError> {
        let deadline = Instant::now() + self.default_timeout;
        match self.insert(command.id.as_str(), deadline, Some(command.kind.clone())) {
            Err(EngineError::DuplicateId(id)) => {
                command.regenerate_id();
                debug!("Command id {} already pending, retrying as {}", id, command.id);
                self.insert(command.id.as_str(), deadline, Some(command.kind.clone()))
            }
            result => result,
        }
    }

    fn insert(
        &self,
        id: &str,
        deadline: Instant,
        kind: Option<CommandKind>,
    ) -> Result<PendingHandle, EngineError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        self.expire_locked(&mut entries, now);

        if let Some(existing) = entries.get(id) {
            if existing.completion.is_some() {
                return Err(EngineError::DuplicateId(id.to_string()));
            }
        }

        let (tx, rx) = oneshot::channel();
        entries.insert(
            id.to_string(),
            PendingEntry {
                issued_at: now,
                deadline,
                kind,
                completion: Some(tx),
            },
        );
        Ok(PendingHandle {
            id: id.to_string(),
            issued_at: now,
            deadline,
            rx,
        })
    }

    /// Resolve `id`. Unknown, expired, or already-resolved ids are logged
    /// and ignored; returns whether a handle was completed.
    pub fn resolve(&self, id: &str, outcome: CommandOutcome) -> bool {
        let entry = self.entries.lock().remove(id);

        let Some(entry) = entry else {
            debug!("Discarding response for unknown command id {}", id);
            metrics::increment_late_response();
            return false;
        };

        let Some(completion) = entry.completion else {
            info!(
                "Late response for expired command {} ({:?}) after {:?}: {:?}",
                id,
                entry.kind,
                entry.issued_at.elapsed(),
                outcome
            );
            metrics::increment_late_response();
            return false;
        };

        metrics::record_round_trip(entry.issued_at.elapsed().as_secs_f64() * 1000.0);
        if completion.send(outcome).is_err() {
            debug!("Caller for command {} stopped waiting", id);
        }
        true
    }

    /// Resolve from a parsed inbound response.
    pub fn resolve_response(&self, response: CommandResponse) -> bool {
        let id = response.id.clone();
        self.resolve(&id, CommandOutcome::from_response(response))
    }

    /// Resolve every overdue entry as `TimedOut`. Returns how many were resolved.
    pub fn expire_due(&self) -> usize {
        let mut entries = self.entries.lock();
        self.expire_locked(&mut entries, Instant::now())
    }

    fn expire_locked(&self, entries: &mut HashMap<String, PendingEntry>, now: Instant) -> usize {
        let mut expired = 0;
        let keep = self.keep_expired;
        let retention = self.default_timeout;

        entries.retain(|id, entry| {
            if entry.deadline > now {
                return true;
            }
            match entry.completion.take() {
                Some(completion) => {
                    let waited = now.saturating_duration_since(entry.issued_at);
                    debug!("Command {} timed out after {:?}; outcome unknown", id, waited);
                    let _ = completion.send(CommandOutcome::TimedOut { waited });
                    metrics::increment_correlation_timeout();
                    expired += 1;
                    keep
                }
                // Already expired and retained: drop once the grace window passes.
                None => entry.deadline + retention > now,
            }
        });
        expired
    }

    /// Drop a registration without resolving it (e.g. the send failed).
    pub fn cancel(&self, id: &str) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    /// Entries still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.completion.is_some())
            .count()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.entries
            .lock()
            .get(id)
            .is_some_and(|e| e.completion.is_some())
    }

    /// Wait for `handle` to resolve, expiring it at its deadline if needed.
    pub async fn wait(&self, handle: PendingHandle) -> CommandOutcome {
        let PendingHandle {
            id,
            issued_at,
            deadline,
            mut rx,
        } = handle;

        tokio::select! {
            result = &mut rx => {
                return result.unwrap_or(CommandOutcome::TimedOut { waited: issued_at.elapsed() });
            }
            _ = tokio::time::sleep_until(deadline) => {}
        }

        self.expire_due();
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!("Registration for {} vanished before resolution", id);
                CommandOutcome::TimedOut {
                    waited: issued_at.elapsed(),
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> CorrelationTable {
        CorrelationTable::new(Duration::from_secs(8), false)
    }

    fn response(id: &str, body: Value) -> CommandResponse {
        let mut body = body;
        body["id"] = json!(id);
        CommandResponse::from_value(body).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let table = table();
        let handle = table.register("a", Instant::now() + Duration::from_secs(5)).unwrap();
        assert!(table.is_pending("a"));

        assert!(table.resolve_response(response("a", json!({"success": true}))));
        let outcome = table.wait(handle).await;
        assert!(outcome.is_confirmed());
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let table = table();
        let _handle = table.register("a", Instant::now() + Duration::from_secs(5)).unwrap();
        let second = table.register("a", Instant::now() + Duration::from_secs(5));
        assert!(matches!(second, Err(EngineError::DuplicateId(id)) if id == "a"));
    }

    #[tokio::test]
    async fn test_second_resolve_is_noop() {
        let table = table();
        let handle = table.register("a", Instant::now() + Duration::from_secs(5)).unwrap();

        assert!(table.resolve("a", CommandOutcome::Acknowledged { response: json!({}) }));
        assert!(!table.resolve("a", CommandOutcome::Succeeded { response: json!({}) }));

        let outcome = table.wait(handle).await;
        assert!(matches!(outcome, CommandOutcome::Acknowledged { .. }));
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let table = table();
        assert!(!table.resolve("ghost", CommandOutcome::Succeeded { response: json!({}) }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_once_and_late_response_ignored() {
        let table = table();
        let handle = table.register("a", Instant::now() + Duration::from_secs(2)).unwrap();

        let outcome = table.wait(handle).await;
        match outcome {
            CommandOutcome::TimedOut { waited } => assert!(waited >= Duration::from_secs(2)),
            other => panic!("Expected TimedOut, got {:?}", other),
        }
        assert!(outcome_is_assumed_success(&CommandOutcome::TimedOut { waited: Duration::ZERO }));

        assert_eq!(table.expire_due(), 0);
        assert!(!table.resolve_response(response("a", json!({"success": true}))));
    }

    fn outcome_is_assumed_success(outcome: &CommandOutcome) -> bool {
        outcome.assumed_success() && outcome.is_unknown() && !outcome.is_confirmed()
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_inline_on_register() {
        let table = table();
        let handle = table.register("old", Instant::now() + Duration::from_millis(100)).unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;

        let _fresh = table.register("new", Instant::now() + Duration::from_secs(5)).unwrap();
        assert!(!table.is_pending("old"));
        assert!(matches!(table.wait(handle).await, CommandOutcome::TimedOut { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_expired_logs_late_response_then_forgets() {
        let table = CorrelationTable::new(Duration::from_secs(1), true);
        let handle = table.register("a", Instant::now() + Duration::from_secs(1)).unwrap();
        assert!(matches!(table.wait(handle).await, CommandOutcome::TimedOut { .. }));

        assert!(!table.is_pending("a"));
        // Retained entry cannot be resolved twice, and the id may be reused.
        assert!(!table.resolve("a", CommandOutcome::Succeeded { response: json!({}) }));
        let again = table.register("a", Instant::now() + Duration::from_secs(1));
        assert!(again.is_ok());
    }

    #[test]
    fn test_failed_outcome_is_not_assumed_success() {
        let outcome = CommandOutcome::from_response(response("x", json!({"status": "error"})));
        assert!(!outcome.assumed_success());
        assert!(!outcome.is_unknown());
    }

    #[tokio::test]
    async fn test_cancel_resolves_waiter_as_unknown() {
        let table = table();
        let handle = table.register("a", Instant::now() + Duration::from_secs(5)).unwrap();
        assert!(table.cancel("a"));
        assert!(matches!(table.wait(handle).await, CommandOutcome::TimedOut { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waited_counts_from_registration() {
        let table = table();
        let handle = table.register("a", Instant::now() + Duration::from_secs(8)).unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        assert!(table.cancel("a"));
        match table.wait(handle).await {
            CommandOutcome::TimedOut { waited } => assert!(waited >= Duration::from_secs(3)),
            other => panic!("Expected TimedOut, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_command_regenerates_colliding_id() {
        use viewlink_protocol::{CommandId, CommandOrigin, Parameters};

        let table = table();
        let _first = table.register("a", Instant::now() + Duration::from_secs(5)).unwrap();

        let mut command = Command::new(CommandKind::Reset, Parameters::new(), CommandOrigin::Ui);
        command.id = CommandId::from("a");
        let handle = table.register_command(&mut command).unwrap();

        assert_ne!(command.id.as_str(), "a");
        assert_eq!(handle.id(), command.id.as_str());
        assert!(table.is_pending("a"));
        assert!(table.is_pending(command.id.as_str()));
        assert_eq!(table.pending_count(), 2);
    }
}
