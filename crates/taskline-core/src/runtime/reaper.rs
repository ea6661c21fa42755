use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use taskline_types::error::codes;
use taskline_types::{ErrorPayload, TaskId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::runtime::config::RuntimeConfig;
use crate::runtime::lifecycle::{TerminalWrite, WriteOrigin, commit_terminal};
use crate::runtime::storage::{TaskCell, TaskStore, duration_ms};
use crate::runtime::tree;

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tasks forced terminal because their (or an ancestor's) TTL elapsed.
    pub expired: Vec<TaskId>,
    /// Records removed, deepest first.
    pub deleted: Vec<TaskId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.deleted.is_empty()
    }
}

/// Forces overdue tasks terminal and deletes expired records.
#[derive(Debug, Clone)]
pub struct Reaper {
    store: TaskStore,
    config: Arc<RuntimeConfig>,
}

impl Reaper {
    pub fn new(store: TaskStore, config: Arc<RuntimeConfig>) -> Self {
        Self { store, config }
    }

    /// Start the periodic sweep on the current runtime.
    pub fn spawn(&self) -> ReaperHandle {
        let (shutdown, rx) = watch::channel(false);
        let join = tokio::spawn(self.clone().run(rx));
        ReaperHandle { shutdown, join }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.reaper_interval.max(MIN_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = duration_ms(period), "ttl reaper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if !report.is_empty() {
                        debug!(
                            expired = report.expired.len(),
                            deleted = report.deleted.len(),
                            "reaper sweep"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("ttl reaper stopped");
    }

    /// One pass: force overdue tasks terminal, then delete eligible records.
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();
        let cells = self.store.all().await;

        let mut overdue: Vec<&Arc<TaskCell>> = cells
            .iter()
            .filter(|c| !c.is_terminal() && c.is_expired(now))
            .collect();
        overdue.sort_by_key(|c| c.depth);
        for cell in overdue {
            if !cell.is_terminal() {
                report.expired.extend(self.expire(cell).await);
            }
        }

        let mut candidates: Vec<Arc<TaskCell>> =
            cells.into_iter().filter(|c| c.is_terminal()).collect();
        candidates.sort_by_key(|c| Reverse(c.depth));
        for cell in candidates {
            if self.deletable(&cell, now).await && self.store.remove(&cell.id).await.is_some() {
                info!(task_id = %cell.id, "task deleted");
                report.deleted.push(cell.id);
            }
        }
        report
    }

    /// Force `cell` and its unfinished descendants terminal, deepest first.
    ///
    /// Returns the ids that this call moved to a terminal state.
    pub async fn expire(&self, cell: &Arc<TaskCell>) -> Vec<TaskId> {
        let mut forced = Vec::new();
        // A subtask attached mid-pass makes its parent's commit fail; go again.
        for _ in 0..3 {
            let nodes = tree::subtree(&self.store, cell).await;
            for node in nodes.iter().rev() {
                if node.is_terminal() {
                    continue;
                }
                let write = self.expiry_write(node);
                if commit_terminal(&self.store, node, write).await.is_ok() {
                    forced.push(node.id);
                }
            }
            if cell.is_terminal() {
                break;
            }
        }
        forced
    }

    fn expiry_write(&self, cell: &TaskCell) -> TerminalWrite {
        let state = cell.lock();
        if state.cancel_requested {
            return TerminalWrite::cancelled().by(WriteOrigin::Expiry);
        }
        if self.config.complete_partial_on_expiry && state.log.has_usable_partial() {
            TerminalWrite::completed(None)
                .by(WriteOrigin::Expiry)
                .with_message("ttl elapsed; partial result kept")
        } else {
            TerminalWrite::failed(ErrorPayload::new(
                codes::TTL_EXPIRED,
                "ttl elapsed before the task finished",
            ))
            .by(WriteOrigin::Expiry)
        }
    }

    /// Past both its TTL and the terminal grace period, every ancestor
    /// terminal, and no child record left.
    async fn deletable(&self, cell: &TaskCell, now: Instant) -> bool {
        let (terminal_at, children) = {
            let state = cell.lock();
            (state.terminal_at, state.children.clone())
        };
        let Some(terminal_at) = terminal_at else {
            return false;
        };
        if now < cell.expires_at() || now < terminal_at + self.config.terminal_grace {
            return false;
        }
        for child in &children {
            if self.store.contains(child).await {
                return false;
            }
        }
        let mut next = cell.parent;
        while let Some(id) = next {
            match self.store.try_get(&id).await {
                Some(parent) if parent.is_terminal() => next = parent.parent,
                Some(_) => return false,
                None => break,
            }
        }
        true
    }

    /// Fail every unfinished task, deepest first. Returns how many moved.
    pub async fn fail_all(&self, reason: &str) -> usize {
        let mut cells: Vec<Arc<TaskCell>> = self
            .store
            .all()
            .await
            .into_iter()
            .filter(|c| !c.is_terminal())
            .collect();
        cells.sort_by_key(|c| Reverse(c.depth));

        let mut failed = 0;
        for cell in cells {
            let write = TerminalWrite::failed(ErrorPayload::new(codes::SHUTDOWN, reason))
                .by(WriteOrigin::Shutdown);
            if commit_terminal(&self.store, &cell, write).await.is_ok() {
                failed += 1;
            }
        }
        failed
    }
}

/// Stops the background sweep.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop without waiting, for use from `Drop`.
    pub fn abort(&self) {
        self.join.abort();
    }

    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(err) = self.join.await {
            warn!(error = %err, "ttl reaper ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskline_types::{SessionId, TaskStatus};

    use crate::runtime::lifecycle::emit;

    fn config() -> Arc<RuntimeConfig> {
        Arc::new(RuntimeConfig {
            terminal_grace: Duration::ZERO,
            ..RuntimeConfig::default()
        })
    }

    fn cell(parent: Option<&TaskCell>, ttl_ms: u64) -> Arc<TaskCell> {
        Arc::new(TaskCell::new(
            parent,
            SessionId::default(),
            "tools/call",
            Duration::from_millis(ttl_ms),
            Duration::from_secs(1),
        ))
    }

    async fn setup() -> (TaskStore, Reaper) {
        let store = TaskStore::new(64);
        let reaper = Reaper::new(store.clone(), config());
        (store, reaper)
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_task_without_output_fails() {
        let (store, reaper) = setup().await;
        let task = cell(None, 1_000);
        store.insert(task.clone()).await;

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(reaper.sweep().await.is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        let report = reaper.sweep().await;
        assert_eq!(report.expired, vec![task.id]);
        let snapshot = task.snapshot();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert_eq!(snapshot.error.map(|e| e.code), Some(codes::TTL_EXPIRED));
        assert!(task.lock().log.last_error().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_task_with_partial_completes() {
        let (store, reaper) = setup().await;
        let task = cell(None, 1_000);
        store.insert(task.clone()).await;
        emit(&task, None, json!("half")).unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        reaper.sweep().await;
        let snapshot = task.snapshot();
        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert!(snapshot.status_message.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expiring_parent_forces_children_first() {
        let (store, reaper) = setup().await;
        let parent = cell(None, 1_000);
        store.insert(parent.clone()).await;
        let child = cell(Some(parent.as_ref()), 60_000);
        tree::attach(&store, &parent, child.clone(), 4).await.unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        let report = reaper.sweep().await;
        assert_eq!(report.expired, vec![child.id, parent.id]);
        assert!(child.is_terminal());
        assert!(parent.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn parent_outlives_longer_lived_child() {
        let (store, reaper) = setup().await;
        let parent = cell(None, 1_000);
        store.insert(parent.clone()).await;
        let child = cell(Some(parent.as_ref()), 10_000);
        tree::attach(&store, &parent, child.clone(), 4).await.unwrap();
        commit_terminal(&store, &child, TerminalWrite::completed(None))
            .await
            .unwrap();
        commit_terminal(&store, &parent, TerminalWrite::completed(None))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(reaper.sweep().await.deleted.is_empty());
        assert!(store.contains(&parent.id).await);

        tokio::time::advance(Duration::from_secs(10)).await;
        let report = reaper.sweep().await;
        assert_eq!(report.deleted, vec![child.id, parent.id]);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_child_of_running_parent_is_kept() {
        let (store, reaper) = setup().await;
        let parent = cell(None, 60_000);
        store.insert(parent.clone()).await;
        let child = cell(Some(parent.as_ref()), 1_000);
        tree::attach(&store, &parent, child.clone(), 4).await.unwrap();
        commit_terminal(&store, &child, TerminalWrite::completed(None))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(reaper.sweep().await.deleted.is_empty());
        assert!(store.contains(&child.id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_delays_deletion() {
        let store = TaskStore::new(8);
        let reaper = Reaper::new(
            store.clone(),
            Arc::new(RuntimeConfig {
                terminal_grace: Duration::from_secs(30),
                ..RuntimeConfig::default()
            }),
        );
        let task = cell(None, 1_000);
        store.insert(task.clone()).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        reaper.sweep().await;
        assert!(task.is_terminal());
        assert!(store.contains(&task.id).await);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(reaper.sweep().await.deleted, vec![task.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_runs_until_stopped() {
        let (store, reaper) = setup().await;
        let task = cell(None, 1_000);
        store.insert(task.clone()).await;

        let handle = reaper.spawn();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(task.is_terminal());
        handle.stop().await;
    }

    #[tokio::test]
    async fn fail_all_fails_children_before_parents() {
        let (store, reaper) = setup().await;
        let parent = cell(None, 60_000);
        store.insert(parent.clone()).await;
        let child = cell(Some(parent.as_ref()), 60_000);
        tree::attach(&store, &parent, child.clone(), 4).await.unwrap();

        assert_eq!(reaper.fail_all("shutting down").await, 2);
        for task in [&parent, &child] {
            let snapshot = task.snapshot();
            assert_eq!(snapshot.status, TaskStatus::Failed);
            assert_eq!(snapshot.error.map(|e| e.code), Some(codes::SHUTDOWN));
        }
    }
}
