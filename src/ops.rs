use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type OperationId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub name: String,
    pub status: OperationStatus,
    pub current: u64,
    pub total: u64,
    pub percentage: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_time: Option<Duration>,
    pub current_item: Option<String>,
    pub items_processed: u64,
    pub items_failed: u64,
    pub status_message: String,
    pub last_error: Option<String>,
}

impl Operation {
    fn new(id: &str, name: &str, total: u64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            status: OperationStatus::Pending,
            current: 0,
            total,
            percentage: 0.0,
            start_time: None,
            end_time: None,
            elapsed_time: None,
            current_item: None,
            items_processed: 0,
            items_failed: 0,
            status_message: String::new(),
            last_error: None,
        }
    }

    fn recompute_percentage(&mut self) {
        if self.total > 0 {
            self.percentage = self.current as f64 / self.total as f64 * 100.0;
        }
    }

    fn finish(&mut self, status: OperationStatus) {
        let end = Utc::now();
        let start = *self.start_time.get_or_insert(end);
        self.status = status;
        self.end_time = Some(end);
        self.elapsed_time = Some((end - start).to_std().unwrap_or_default());
    }
}

pub type Listener = Arc<dyn Fn(&Operation) + Send + Sync>;

#[derive(Default)]
struct Registry {
    operations: HashMap<OperationId, (Operation, CancellationToken)>,
    last_created: Option<OperationId>,
    listeners: Vec<Listener>,
}

/// Single mutation point for every long-running operation. Shared by cloning.
#[derive(Clone, Default)]
pub struct OperationTracker {
    inner: Arc<Mutex<Registry>>,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<prefix>_<uuid>`, unique per call.
    pub fn next_id(prefix: &str) -> OperationId {
        format!("{}_{}", prefix, uuid::Uuid::new_v4())
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_listener(&self, listener: Listener) {
        self.lock().listeners.push(listener);
    }

    pub fn create(&self, id: &str, name: &str, total: u64) -> Operation {
        let snapshot = {
            let mut registry = self.lock();
            let op = Operation::new(id, name, total);
            registry
                .operations
                .insert(id.to_string(), (op.clone(), CancellationToken::new()));
            registry.last_created = Some(id.to_string());
            op
        };
        self.notify(&snapshot);
        snapshot
    }

    /// Moves `id` to Running, creating it (named after its id) when unknown.
    pub fn start(&self, id: &str, total: Option<u64>) -> Operation {
        if self.get(id).is_none() {
            self.create(id, id, total.unwrap_or(0));
        }
        self.apply(id, |op| {
            op.status = OperationStatus::Running;
            op.start_time = Some(Utc::now());
            op.end_time = None;
            op.elapsed_time = None;
            if let Some(total) = total {
                op.total = total;
            }
            op.recompute_percentage();
        })
        .unwrap_or_else(|| Operation::new(id, id, total.unwrap_or(0)))
    }

    pub fn update(
        &self,
        id: &str,
        current: Option<u64>,
        current_item: Option<&str>,
        status_message: Option<&str>,
    ) -> bool {
        self.apply(id, |op| {
            if let Some(current) = current {
                op.current = current;
                op.recompute_percentage();
            }
            if let Some(item) = current_item {
                op.current_item = Some(item.to_string());
                op.items_processed += 1;
            }
            if let Some(message) = status_message {
                op.status_message = message.to_string();
            }
        })
        .is_some()
    }

    /// Sets the expected item count once it is known, keeping the current status.
    pub fn set_total(&self, id: &str, total: u64) -> bool {
        self.apply(id, |op| {
            op.total = total;
            op.recompute_percentage();
        })
        .is_some()
    }

    pub fn record_failure(&self, id: &str, item: &str, error: &str) -> bool {
        self.apply(id, |op| {
            op.items_failed += 1;
            op.current_item = Some(item.to_string());
            op.last_error = Some(error.to_string());
        })
        .is_some()
    }

    pub fn pause(&self, id: &str) -> bool {
        self.apply(id, |op| {
            if op.status == OperationStatus::Running {
                op.status = OperationStatus::Paused;
            }
        })
        .is_some()
    }

    pub fn resume(&self, id: &str) -> bool {
        self.apply(id, |op| {
            if op.status == OperationStatus::Paused {
                op.status = OperationStatus::Running;
            }
        })
        .is_some()
    }

    /// With `id == None`, completes the most recently created operation.
    pub fn complete(&self, id: Option<&str>, success: bool) -> bool {
        let Some(id) = id.map(str::to_string).or_else(|| self.lock().last_created.clone()) else {
            return false;
        };
        self.apply(&id, |op| {
            if success {
                op.current = op.total.max(op.current);
                op.recompute_percentage();
                op.finish(OperationStatus::Completed);
            } else {
                op.finish(OperationStatus::Failed);
            }
        })
        .is_some()
    }

    pub fn fail(&self, id: &str, error: &str) -> bool {
        self.apply(id, |op| {
            op.last_error = Some(error.to_string());
            op.finish(OperationStatus::Failed);
        })
        .is_some()
    }

    /// Signals the operation's token. The worker observes it and calls `mark_cancelled`.
    pub fn cancel(&self, id: &str) -> bool {
        match self.lock().operations.get(id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn mark_cancelled(&self, id: &str) -> bool {
        self.apply(id, |op| {
            op.status_message = "cancelled".into();
            op.finish(OperationStatus::Cancelled);
        })
        .is_some()
    }

    pub fn token(&self, id: &str) -> Option<CancellationToken> {
        self.lock().operations.get(id).map(|(_, token)| token.clone())
    }

    pub fn get(&self, id: &str) -> Option<Operation> {
        self.lock().operations.get(id).map(|(op, _)| op.clone())
    }

    pub fn all(&self) -> Vec<Operation> {
        self.lock()
            .operations
            .values()
            .map(|(op, _)| op.clone())
            .collect()
    }

    pub fn active(&self) -> Vec<Operation> {
        self.all()
            .into_iter()
            .filter(|op| !op.status.is_finished())
            .collect()
    }

    /// Drops finished operations and returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let mut registry = self.lock();
        let before = registry.operations.len();
        registry.operations.retain(|_, (op, _)| !op.status.is_finished());
        before - registry.operations.len()
    }

    fn apply(&self, id: &str, f: impl FnOnce(&mut Operation)) -> Option<Operation> {
        let snapshot = {
            let mut registry = self.lock();
            let (op, _) = registry.operations.get_mut(id)?;
            f(op);
            op.clone()
        };
        self.notify(&snapshot);
        Some(snapshot)
    }

    fn notify(&self, snapshot: &Operation) {
        let listeners = self.lock().listeners.clone();
        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(snapshot))).is_err() {
                log::warn!("Progress listener panicked while handling {}", snapshot.id);
            }
        }
    }
}
