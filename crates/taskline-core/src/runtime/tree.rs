use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use taskline_types::{TaskId, TaskNotification, TaskSnapshot};
use tracing::{debug, info};

use crate::runtime::lifecycle::{TerminalWrite, commit_terminal};
use crate::runtime::storage::{TaskCell, TaskStore};
use crate::runtime::types::TaskError;

/// Register `child` under `parent` and make it visible in the store.
///
/// Membership and the parent's `children` list change together while the
/// store's write lock is held, so no reader sees one without the other.
pub async fn attach(
    store: &TaskStore,
    parent: &Arc<TaskCell>,
    child: Arc<TaskCell>,
    max_depth: usize,
) -> Result<(), TaskError> {
    {
        let mut cells = store.write().await;
        validate_link(&cells, parent, &child, max_depth)?;
        {
            let mut state = parent.lock();
            if state.status.is_terminal() || state.cancel_requested {
                return Err(TaskError::ParentClosed { parent: parent.id });
            }
            if state.children.contains(&child.id) {
                return Err(TaskError::DuplicateChild {
                    parent: parent.id,
                    child: child.id,
                });
            }
            state.children.push(child.id);
            state.touch();
        }
        cells.insert(child.id, Arc::clone(&child));
    }

    parent.publish();
    store.notify(TaskNotification::ChildrenChanged {
        task_id: parent.id,
        child_task_id: child.id,
    });
    store.notify(TaskNotification::TaskListChanged {
        session: child.session.clone(),
    });
    debug!(task_id = %child.id, parent_task_id = %parent.id, "subtask attached");
    Ok(())
}

/// Structural checks for a new parent -> child edge.
fn validate_link(
    cells: &HashMap<TaskId, Arc<TaskCell>>,
    parent: &TaskCell,
    child: &TaskCell,
    max_depth: usize,
) -> Result<(), TaskError> {
    if child.id == parent.id {
        return Err(TaskError::SelfReference { task_id: child.id });
    }
    if child.parent != Some(parent.id) {
        return Err(TaskError::Reparent {
            task_id: child.id,
            parent: parent.id,
        });
    }
    if cells.contains_key(&child.id) {
        return Err(TaskError::DuplicateChild {
            parent: parent.id,
            child: child.id,
        });
    }
    if child.depth > max_depth {
        return Err(TaskError::DepthExceeded {
            parent: parent.id,
            max_depth,
        });
    }

    // The chain is bounded by the depth limit; a longer one is itself a cycle.
    let mut next = Some(parent.id);
    let mut hops = 0;
    while let Some(id) = next {
        if id == child.id || hops > max_depth {
            return Err(TaskError::Cycle {
                parent: parent.id,
                child: child.id,
            });
        }
        next = cells.get(&id).and_then(|c| c.parent);
        hops += 1;
    }
    Ok(())
}

/// `root` and all its descendants, parents before children.
pub async fn subtree(store: &TaskStore, root: &Arc<TaskCell>) -> Vec<Arc<TaskCell>> {
    let mut order = Vec::new();
    let mut queue = VecDeque::from([Arc::clone(root)]);
    while let Some(node) = queue.pop_front() {
        let children = node.lock().children.clone();
        for id in children {
            if let Some(child) = store.try_get(&id).await {
                queue.push_back(child);
            }
        }
        order.push(node);
    }
    order
}

/// Cancel `root` and every non-terminal descendant.
///
/// Each node is marked under its own lock before its children are read, so
/// no subtask can be attached behind the sweep. Nodes are then finalized
/// deepest first; a node whose children are still finishing is finalized
/// later, when its last child commits.
pub async fn cancel(store: &TaskStore, root: &Arc<TaskCell>) -> Result<TaskSnapshot, TaskError> {
    {
        let state = root.lock();
        if state.status.is_terminal() {
            return Err(TaskError::AlreadyTerminal {
                task_id: root.id,
                status: state.status,
            });
        }
    }

    let mut marked = Vec::new();
    let mut queue = VecDeque::from([Arc::clone(root)]);
    while let Some(node) = queue.pop_front() {
        let children = {
            let mut state = node.lock();
            if state.status.is_terminal() {
                continue;
            }
            if !state.cancel_requested {
                state.cancel_requested = true;
                state.status_message = Some("cancellation requested".into());
                state.touch();
            }
            state.children.clone()
        };
        node.signal_cancel();
        node.publish();
        for id in children {
            if let Some(child) = store.try_get(&id).await {
                queue.push_back(child);
            }
        }
        marked.push(node);
    }

    for node in marked.iter().rev() {
        match commit_terminal(store, node, TerminalWrite::cancelled()).await {
            Ok(_) => {}
            Err(TaskError::ChildrenPending { pending, .. }) => {
                debug!(task_id = %node.id, pending = pending.len(), "cancellation waiting on subtasks");
            }
            Err(TaskError::AlreadyTerminal { status, .. }) => {
                debug!(task_id = %node.id, status = %status, "settled by its subtasks");
            }
            Err(err) => {
                debug!(task_id = %node.id, error = %err, "cascade cancel not committed");
            }
        }
    }

    info!(task_id = %root.id, descendants = marked.len().saturating_sub(1), "cancellation requested");
    Ok(root.snapshot())
}
