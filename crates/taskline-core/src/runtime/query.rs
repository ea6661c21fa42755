use std::cmp::Ordering;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use taskline_types::{
    FilterCriterion, ListFilter, ListPage, SessionId, SortDirection, SortKey, TaskSnapshot,
};
use tracing::debug;

use crate::runtime::config::FilterSupport;
use crate::runtime::storage::TaskStore;
use crate::runtime::types::TaskError;

const CURSOR_PREFIX: &str = "offset:";

/// Evaluates `list` requests against a session's tasks.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    support: FilterSupport,
    page_size: usize,
    max_page_size: usize,
}

impl QueryEngine {
    pub fn new(support: FilterSupport, page_size: usize, max_page_size: usize) -> Self {
        Self {
            support,
            page_size: page_size.max(1),
            max_page_size: max_page_size.max(1),
        }
    }

    /// One page of the session's tasks matching every supported criterion.
    ///
    /// Unsupported criteria are ignored and named in `dropped_criteria`.
    pub async fn list(
        &self,
        store: &TaskStore,
        session: &SessionId,
        filter: &ListFilter,
    ) -> Result<ListPage, TaskError> {
        filter.validate_paging().map_err(TaskError::MalformedFilter)?;
        let offset = match &filter.cursor {
            Some(cursor) => decode_cursor(cursor)?,
            None => 0,
        };
        let limit = filter
            .limit
            .unwrap_or(self.page_size)
            .clamp(1, self.max_page_size);

        let (applied, dropped): (Vec<FilterCriterion>, Vec<FilterCriterion>) = filter
            .requested()
            .into_iter()
            .partition(|c| self.support.supports(*c));
        applied
            .iter()
            .try_for_each(|c| filter.validate_criterion(*c))
            .map_err(TaskError::MalformedFilter)?;
        if !dropped.is_empty() {
            debug!(?dropped, "ignoring unsupported list criteria");
        }

        let mut tasks: Vec<TaskSnapshot> = store
            .all()
            .await
            .into_iter()
            .filter(|cell| &cell.session == session)
            .map(|cell| cell.snapshot())
            .filter(|snapshot| applied.iter().all(|c| filter.matches_criterion(*c, snapshot)))
            .collect();

        let (key, direction) = if applied.contains(&FilterCriterion::Sort) {
            (
                filter.sort_by.unwrap_or_default(),
                filter.direction.unwrap_or_default(),
            )
        } else {
            (SortKey::default(), SortDirection::default())
        };
        tasks.sort_by(|a, b| compare(a, b, key, direction));

        let total = tasks.len();
        let page: Vec<TaskSnapshot> = tasks.into_iter().skip(offset).take(limit).collect();
        let next = offset + page.len();
        Ok(ListPage {
            tasks: page,
            next_cursor: (next < total).then(|| encode_cursor(next)),
            dropped_criteria: dropped,
        })
    }
}

/// Order by `key`, breaking ties by task id so pages are stable.
fn compare(a: &TaskSnapshot, b: &TaskSnapshot, key: SortKey, direction: SortDirection) -> Ordering {
    let primary = match key {
        SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
        SortKey::LastUpdatedAt => a.last_updated_at.cmp(&b.last_updated_at),
    };
    let ordered = primary.then_with(|| a.task_id.cmp(&b.task_id));
    match direction {
        SortDirection::Asc => ordered,
        SortDirection::Desc => ordered.reverse(),
    }
}

fn encode_cursor(offset: usize) -> String {
    URL_SAFE_NO_PAD.encode(format!("{CURSOR_PREFIX}{offset}"))
}

fn decode_cursor(cursor: &str) -> Result<usize, TaskError> {
    let malformed = || TaskError::MalformedFilter(format!("invalid cursor: {cursor}"));
    let bytes = URL_SAFE_NO_PAD.decode(cursor).map_err(|_| malformed())?;
    let text = String::from_utf8(bytes).map_err(|_| malformed())?;
    text.strip_prefix(CURSOR_PREFIX)
        .and_then(|n| n.parse().ok())
        .ok_or_else(malformed)
}
