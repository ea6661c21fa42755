use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use taskline_types::{ErrorPayload, SessionId, TaskId, TaskNotification, TaskSnapshot, TaskStatus};
use tokio::sync::{RwLock, RwLockWriteGuard, broadcast, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::runtime::sequencer::FragmentLog;
use crate::runtime::types::TaskError;

/// How many reaped ids are remembered so lookups can answer `Expired`
/// instead of `NotFound`.
const TOMBSTONE_CAPACITY: usize = 4096;

/// Mutable part of a task record. Guarded by the owning [`TaskCell`].
#[derive(Debug)]
pub struct TaskState {
    pub status: TaskStatus,
    pub status_message: Option<String>,
    pub error: Option<ErrorPayload>,
    pub last_updated_at: DateTime<Utc>,
    /// Monotonic time of the terminal transition.
    pub terminal_at: Option<Instant>,
    /// Append-only.
    pub children: Vec<TaskId>,
    pub log: FragmentLog,
    pub cancel_requested: bool,
    /// Merged content, fixed at the terminal transition.
    pub final_content: Option<Arc<Vec<Value>>>,
}

impl TaskState {
    /// Advance `last_updated_at`, never backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_updated_at {
            self.last_updated_at = now;
        }
    }
}

/// One task record.
///
/// Identity fields (`id`, `parent`, `session`, ttl) are immutable and live
/// outside the lock; the parent pointer is therefore write-once by
/// construction. Every mutation of [`TaskState`] goes through
/// [`TaskCell::lock`] and is followed by [`TaskCell::publish`].
#[derive(Debug)]
pub struct TaskCell {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    pub session: SessionId,
    pub method: String,
    pub created_at: DateTime<Utc>,
    pub created_instant: Instant,
    pub ttl: Duration,
    pub poll_interval: Duration,
    /// Number of ancestors.
    pub depth: usize,
    state: Mutex<TaskState>,
    version: watch::Sender<u64>,
    cancel: watch::Sender<bool>,
}

impl TaskCell {
    pub fn new(
        parent: Option<&TaskCell>,
        session: SessionId,
        method: impl Into<String>,
        ttl: Duration,
        poll_interval: Duration,
    ) -> Self {
        let created_at = Utc::now();
        let (version, _) = watch::channel(0);
        let (cancel, _) = watch::channel(false);
        Self {
            id: TaskId::new(),
            parent: parent.map(|p| p.id),
            session: parent.map_or(session, |p| p.session.clone()),
            method: method.into(),
            created_at,
            created_instant: Instant::now(),
            ttl,
            poll_interval,
            depth: parent.map_or(0, |p| p.depth + 1),
            state: Mutex::new(TaskState {
                status: TaskStatus::Working,
                status_message: None,
                error: None,
                last_updated_at: created_at,
                terminal_at: None,
                children: Vec::new(),
                log: FragmentLog::new(),
                cancel_requested: false,
                final_content: None,
            }),
            version,
            cancel,
        }
    }

    /// Lock the mutable state. A poisoned lock is recovered: every writer
    /// leaves the record consistent before it can panic.
    pub fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> TaskStatus {
        self.lock().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Wake everyone waiting on this task.
    pub fn publish(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Ask the producer to stop.
    pub fn signal_cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub fn expires_at(&self) -> Instant {
        self.created_instant + self.ttl
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.lock();
        self.snapshot_of(&state)
    }

    /// Build a snapshot from an already-held guard.
    pub fn snapshot_of(&self, state: &TaskState) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id,
            method: self.method.clone(),
            status: state.status,
            status_message: state.status_message.clone(),
            created_at: self.created_at,
            last_updated_at: state.last_updated_at,
            ttl: duration_ms(self.ttl),
            poll_interval: duration_ms(self.poll_interval),
            parent_task_id: self.parent,
            child_task_ids: state.children.clone(),
            last_seq_nr: state.log.last_assigned(),
            error: state.error.clone(),
        }
    }

    /// Wait until `ready` holds for this task's state.
    ///
    /// With a deadline, gives up with [`TaskError::Timeout`].
    pub async fn wait_for<F>(&self, deadline: Option<Instant>, mut ready: F) -> Result<(), TaskError>
    where
        F: FnMut(&TaskState) -> bool,
    {
        let mut rx = self.subscribe();
        loop {
            let done = ready(&self.lock());
            if done {
                return Ok(());
            }
            match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, rx.changed()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return Err(TaskError::NotFound { task_id: self.id }),
                    Err(_) => return Err(TaskError::Timeout { task_id: self.id }),
                },
                None => {
                    if rx.changed().await.is_err() {
                        return Err(TaskError::NotFound { task_id: self.id });
                    }
                }
            }
        }
    }

    pub async fn wait_terminal(&self, deadline: Option<Instant>) -> Result<(), TaskError> {
        self.wait_for(deadline, |s| s.status.is_terminal()).await
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Default)]
struct Tombstones {
    order: VecDeque<TaskId>,
    ids: HashSet<TaskId>,
}

impl Tombstones {
    fn insert(&mut self, id: TaskId) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > TOMBSTONE_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }
}

/// The single source of truth for task records.
///
/// The map lock only guards membership; each record carries its own lock
/// so tasks are mutated independently. A cell lock is never held while the
/// map lock is being acquired.
#[derive(Debug, Clone)]
pub struct TaskStore {
    cells: Arc<RwLock<HashMap<TaskId, Arc<TaskCell>>>>,
    tombstones: Arc<Mutex<Tombstones>>,
    notifications: broadcast::Sender<TaskNotification>,
}

impl TaskStore {
    pub fn new(notification_capacity: usize) -> Self {
        let (notifications, _) = broadcast::channel(notification_capacity.max(1));
        Self {
            cells: Arc::new(RwLock::new(HashMap::new())),
            tombstones: Arc::new(Mutex::new(Tombstones::default())),
            notifications,
        }
    }

    /// Register a root task.
    pub async fn insert(&self, cell: Arc<TaskCell>) {
        let session = cell.session.clone();
        self.cells.write().await.insert(cell.id, cell);
        self.notify(TaskNotification::TaskListChanged { session });
    }

    /// Exclusive access to membership, for attaching subtasks atomically.
    pub async fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, Arc<TaskCell>>> {
        self.cells.write().await
    }

    pub async fn get(&self, id: &TaskId) -> Result<Arc<TaskCell>, TaskError> {
        if let Some(cell) = self.try_get(id).await {
            return Ok(cell);
        }
        let reaped = self
            .tombstones
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .contains(id);
        if reaped {
            Err(TaskError::Expired { task_id: *id })
        } else {
            Err(TaskError::NotFound { task_id: *id })
        }
    }

    pub async fn try_get(&self, id: &TaskId) -> Option<Arc<TaskCell>> {
        self.cells.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &TaskId) -> bool {
        self.cells.read().await.contains_key(id)
    }

    pub async fn all(&self) -> Vec<Arc<TaskCell>> {
        self.cells.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.cells.read().await.len()
    }

    /// Drop a record and remember its id as reaped.
    pub async fn remove(&self, id: &TaskId) -> Option<Arc<TaskCell>> {
        let removed = self.cells.write().await.remove(id)?;
        self.tombstones
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*id);
        self.notify(TaskNotification::TaskListChanged {
            session: removed.session.clone(),
        });
        Some(removed)
    }

    pub fn notify(&self, notification: TaskNotification) {
        // No subscribers is fine; notifications are advisory.
        if self.notifications.send(notification).is_err() {
            debug!("notification dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskNotification> {
        self.notifications.subscribe()
    }
}
