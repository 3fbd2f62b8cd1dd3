//! Per-migration task queues.
//!
//! Operator requests are appended from outside while the monitor loop drains
//! them; the map lock is only held for a single push or drain.

use crate::{MigrationError, Result};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Actions requested against a running migration. Unknown tokens are kept so
/// newer producers do not break older monitors; they are skipped when run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationTask {
    ForceComplete,
    Other(String),
}

/// Actions to run if the migration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryTask {
    Unpause,
    Other(String),
}

impl FromStr for MigrationTask {
    type Err = std::convert::Infallible;

    fn from_str(token: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match token {
            "force-complete" => MigrationTask::ForceComplete,
            other => MigrationTask::Other(other.to_string()),
        })
    }
}

impl fmt::Display for MigrationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationTask::ForceComplete => write!(f, "force-complete"),
            MigrationTask::Other(token) => write!(f, "{}", token),
        }
    }
}

impl FromStr for RecoveryTask {
    type Err = std::convert::Infallible;

    fn from_str(token: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match token {
            "unpause" => RecoveryTask::Unpause,
            other => RecoveryTask::Other(other.to_string()),
        })
    }
}

impl fmt::Display for RecoveryTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryTask::Unpause => write!(f, "unpause"),
            RecoveryTask::Other(token) => write!(f, "{}", token),
        }
    }
}

/// Pending forward tasks, keyed by instance uuid.
#[derive(Default)]
pub struct ActiveMigrations {
    queues: Mutex<HashMap<Uuid, VecDeque<MigrationTask>>>,
}

impl ActiveMigrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an empty queue for a migration that is about to start.
    pub fn register(&self, uuid: Uuid) {
        lock(&self.queues).entry(uuid).or_default();
    }

    /// Close the queue, returning whatever was never drained.
    pub fn unregister(&self, uuid: &Uuid) -> Vec<MigrationTask> {
        lock(&self.queues)
            .remove(uuid)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn is_active(&self, uuid: &Uuid) -> bool {
        lock(&self.queues).contains_key(uuid)
    }

    pub fn push(&self, uuid: &Uuid, task: MigrationTask) -> Result<()> {
        match lock(&self.queues).get_mut(uuid) {
            Some(queue) => {
                queue.push_back(task);
                Ok(())
            }
            None => Err(MigrationError::MigrationNotRunning(*uuid)),
        }
    }

    /// Take every task queued so far, oldest first. `None` if the uuid has no queue.
    pub fn drain(&self, uuid: &Uuid) -> Option<Vec<MigrationTask>> {
        lock(&self.queues)
            .get_mut(uuid)
            .map(|queue| queue.drain(..).collect())
    }

    pub fn pending(&self, uuid: &Uuid) -> usize {
        lock(&self.queues).get(uuid).map_or(0, VecDeque::len)
    }
}

/// Recovery tasks for one migration.
#[derive(Default)]
pub struct RecoveryQueue {
    tasks: Mutex<VecDeque<RecoveryTask>>,
}

impl RecoveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: RecoveryTask) {
        lock(&self.tasks).push_back(task);
    }

    /// Take the oldest task.
    pub fn pop(&self) -> Option<RecoveryTask> {
        lock(&self.tasks).pop_front()
    }

    /// Put a task back at the head, ahead of everything still queued.
    pub fn push_front(&self, task: RecoveryTask) {
        lock(&self.tasks).push_front(task);
    }

    pub fn snapshot(&self) -> Vec<RecoveryTask> {
        lock(&self.tasks).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn tokens_parse_and_print() {
        assert_eq!(
            "force-complete".parse::<MigrationTask>().unwrap(),
            MigrationTask::ForceComplete
        );
        assert_eq!(
            "wibble".parse::<MigrationTask>().unwrap(),
            MigrationTask::Other("wibble".into())
        );
        assert_eq!("unpause".parse::<RecoveryTask>().unwrap(), RecoveryTask::Unpause);
        assert_eq!(RecoveryTask::Unpause.to_string(), "unpause");
        assert_eq!(MigrationTask::ForceComplete.to_string(), "force-complete");
    }

    #[test]
    fn push_requires_registered_migration() {
        let active = ActiveMigrations::new();
        let uuid = Uuid::new_v4();

        let err = active.push(&uuid, MigrationTask::ForceComplete).unwrap_err();
        assert!(matches!(err, MigrationError::MigrationNotRunning(u) if u == uuid));
        assert!(active.drain(&uuid).is_none());

        active.register(uuid);
        active.push(&uuid, MigrationTask::ForceComplete).unwrap();
        assert_eq!(active.pending(&uuid), 1);
    }

    #[test]
    fn drain_is_fifo_and_empties_queue() {
        let active = ActiveMigrations::new();
        let uuid = Uuid::new_v4();
        active.register(uuid);
        active.push(&uuid, MigrationTask::Other("a".into())).unwrap();
        active.push(&uuid, MigrationTask::ForceComplete).unwrap();

        assert_eq!(
            active.drain(&uuid).unwrap(),
            vec![MigrationTask::Other("a".into()), MigrationTask::ForceComplete]
        );
        assert_eq!(active.drain(&uuid).unwrap(), Vec::new());
        assert!(active.is_active(&uuid));

        active.push(&uuid, MigrationTask::ForceComplete).unwrap();
        assert_eq!(active.unregister(&uuid), vec![MigrationTask::ForceComplete]);
        assert!(!active.is_active(&uuid));
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let active = Arc::new(ActiveMigrations::new());
        let uuid = Uuid::new_v4();
        active.register(uuid);

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let active = active.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        active.push(&uuid, MigrationTask::ForceComplete).unwrap();
                    }
                })
            })
            .collect();

        let mut drained = 0;
        while drained < 1000 {
            drained += active.drain(&uuid).unwrap().len();
            std::thread::yield_now();
        }
        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(drained, 1000);
        assert_eq!(active.pending(&uuid), 0);
    }

    #[test]
    fn recovery_queue_keeps_order() {
        let queue = RecoveryQueue::new();
        assert!(queue.is_empty());
        queue.push(RecoveryTask::Other("later".into()));
        queue.push(RecoveryTask::Unpause);
        assert_eq!(queue.snapshot().last(), Some(&RecoveryTask::Unpause));
        assert_eq!(queue.pop(), Some(RecoveryTask::Other("later".into())));

        queue.push_front(RecoveryTask::Other("retry".into()));
        assert_eq!(queue.pop(), Some(RecoveryTask::Other("retry".into())));
        assert_eq!(queue.pop(), Some(RecoveryTask::Unpause));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }
}
