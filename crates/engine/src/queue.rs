//! Ordered buffer of commands waiting for the execution lock.

use crate::dedup::SimilarityRules;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::time::Instant;
use tracing::debug;
use viewlink_protocol::{Command, CommandId, CommandKind};

/// A command waiting to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    pub command: Command,
    pub enqueued_at: Instant,
}

/// What `enqueue` did with a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended at the back.
    Enqueued(CommandId),
    /// Took the place of an already queued command of the same replaceable kind.
    Replaced { id: CommandId, superseded: CommandId },
    /// A similar command of the same kind is already waiting; the new one was dropped.
    DroppedSimilar { existing: CommandId },
}

impl EnqueueOutcome {
    /// Whether the submitted command will eventually execute.
    pub fn is_queued(&self) -> bool {
        !matches!(self, EnqueueOutcome::DroppedSimilar { .. })
    }
}

pub struct CommandQueue {
    entries: Mutex<VecDeque<QueuedCommand>>,
    replaceable: Vec<CommandKind>,
    rules: SimilarityRules,
}

impl CommandQueue {
    pub fn new(replaceable: Vec<CommandKind>, rules: SimilarityRules) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            replaceable,
            rules,
        }
    }

    pub fn is_replaceable(&self, kind: &CommandKind) -> bool {
        self.replaceable.contains(kind)
    }

    pub fn enqueue(&self, command: Command) -> EnqueueOutcome {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        if self.is_replaceable(&command.kind) {
            if let Some(slot) = entries.iter_mut().find(|e| e.command.kind == command.kind) {
                let superseded = slot.command.id.clone();
                let id = command.id.clone();
                debug!("Queued {} {} replaced by {}", command.kind, superseded, id);
                *slot = QueuedCommand {
                    command,
                    enqueued_at: now,
                };
                return EnqueueOutcome::Replaced { id, superseded };
            }
        } else if let Some(existing) = entries.iter().find(|e| {
            e.command.kind == command.kind
                && self
                    .rules
                    .similar(&command.kind, &e.command.parameters, &command.parameters)
        }) {
            debug!(
                "Dropping {} {}; similar to queued {}",
                command.kind, command.id, existing.command.id
            );
            return EnqueueOutcome::DroppedSimilar {
                existing: existing.command.id.clone(),
            };
        }

        let id = command.id.clone();
        entries.push_back(QueuedCommand {
            command,
            enqueued_at: now,
        });
        EnqueueOutcome::Enqueued(id)
    }

    /// Oldest waiting command.
    pub fn dequeue(&self) -> Option<QueuedCommand> {
        self.entries.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Waiting commands, front first.
    pub fn snapshot(&self) -> Vec<Command> {
        self.entries
            .lock()
            .iter()
            .map(|e| e.command.clone())
            .collect()
    }

    /// Drop everything waiting. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let dropped = entries.len();
        entries.clear();
        dropped
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use viewlink_protocol::{CommandOrigin, Parameters};

    fn queue() -> CommandQueue {
        CommandQueue::new(
            vec![CommandKind::Focus, CommandKind::Reset],
            SimilarityRules::default(),
        )
    }

    fn command(kind: CommandKind, params: Value) -> Command {
        let params: Parameters = params.as_object().cloned().unwrap();
        Command::new(kind, params, CommandOrigin::Ui)
    }

    #[test]
    fn test_fifo_order() {
        let q = queue();
        let a = command(CommandKind::Rotate, json!({"direction": "left", "angle": 45}));
        let b = command(CommandKind::Zoom, json!({"scale": 2.0}));
        let c = command(CommandKind::Rotate, json!({"direction": "up", "angle": 10}));
        let ids = [a.id.clone(), b.id.clone(), c.id.clone()];
        for cmd in [a, b, c] {
            assert!(q.enqueue(cmd).is_queued());
        }

        let drained: Vec<CommandId> = std::iter::from_fn(|| q.dequeue())
            .map(|e| e.command.id)
            .collect();
        assert_eq!(drained, ids);
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn test_focus_replaced_in_place() {
        let q = queue();
        let zoom = command(CommandKind::Zoom, json!({"scale": 2.0}));
        let focus_a = command(CommandKind::Focus, json!({"target": "chair"}));
        let rotate = command(CommandKind::Rotate, json!({"direction": "left", "angle": 45}));
        let focus_b = command(CommandKind::Focus, json!({"target": "table"}));
        let a_id = focus_a.id.clone();
        let b_id = focus_b.id.clone();

        q.enqueue(zoom);
        q.enqueue(focus_a);
        q.enqueue(rotate);
        let outcome = q.enqueue(focus_b);
        assert_eq!(
            outcome,
            EnqueueOutcome::Replaced {
                id: b_id.clone(),
                superseded: a_id
            }
        );

        let queued = q.snapshot();
        assert_eq!(queued.len(), 3);
        let focuses: Vec<&Command> = queued
            .iter()
            .filter(|c| c.kind == CommandKind::Focus)
            .collect();
        assert_eq!(focuses.len(), 1);
        assert_eq!(queued[1].id, b_id);
        assert_eq!(queued[1].parameters["target"], json!("table"));
    }

    #[test]
    fn test_similar_non_replaceable_dropped() {
        let q = queue();
        let first = command(CommandKind::Rotate, json!({"direction": "left", "angle": 45}));
        let first_id = first.id.clone();
        q.enqueue(first);

        let outcome = q.enqueue(command(
            CommandKind::Rotate,
            json!({"direction": "left", "angle": 50}),
        ));
        assert_eq!(outcome, EnqueueOutcome::DroppedSimilar { existing: first_id });
        assert_eq!(q.len(), 1);

        let distinct = q.enqueue(command(
            CommandKind::Rotate,
            json!({"direction": "left", "angle": 120}),
        ));
        assert!(matches!(distinct, EnqueueOutcome::Enqueued(_)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_clear() {
        let q = queue();
        q.enqueue(command(CommandKind::Reset, json!({})));
        assert_eq!(q.clear(), 1);
        assert!(q.is_empty());
    }
}
