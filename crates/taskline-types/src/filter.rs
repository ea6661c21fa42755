use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter};
use utoipa::ToSchema;

use crate::error::ParseError;
use crate::id::TaskId;
use crate::status::TaskStatus;
use crate::task::TaskSnapshot;

/// Field a task listing is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    CreatedAt,
    #[default]
    LastUpdatedAt,
}

impl FromStr for SortKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "createdAt" | "created_at" => Ok(SortKey::CreatedAt),
            "lastUpdatedAt" | "last_updated_at" | "updatedAt" => Ok(SortKey::LastUpdatedAt),
            other => Err(ParseError::Sort(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortDirection {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(ParseError::Sort(other.to_owned())),
        }
    }
}

/// One independently supportable listing criterion.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, ToSchema, Display, AsRefStr, EnumIter,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum FilterCriterion {
    Method,
    TaskIds,
    Status,
    TimeRange,
    Sort,
}

/// Optional criteria for `list`. Absent fields do not constrain the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ids: Option<Vec<TaskId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statuses: Option<Vec<TaskStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<SortKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<SortDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl ListFilter {
    /// Criteria this filter actually sets.
    pub fn requested(&self) -> Vec<FilterCriterion> {
        let mut out = Vec::new();
        if self.methods.is_some() {
            out.push(FilterCriterion::Method);
        }
        if self.task_ids.is_some() {
            out.push(FilterCriterion::TaskIds);
        }
        if self.statuses.is_some() {
            out.push(FilterCriterion::Status);
        }
        if self.created_after.is_some()
            || self.created_before.is_some()
            || self.updated_after.is_some()
            || self.updated_before.is_some()
        {
            out.push(FilterCriterion::TimeRange);
        }
        if self.sort_by.is_some() || self.direction.is_some() {
            out.push(FilterCriterion::Sort);
        }
        out
    }

    /// Evaluate a single selection criterion. `Sort` always matches.
    pub fn matches_criterion(&self, criterion: FilterCriterion, task: &TaskSnapshot) -> bool {
        match criterion {
            FilterCriterion::Method => self
                .methods
                .as_ref()
                .is_none_or(|m| m.iter().any(|name| name == &task.method)),
            FilterCriterion::TaskIds => self
                .task_ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&task.task_id)),
            FilterCriterion::Status => self
                .statuses
                .as_ref()
                .is_none_or(|s| s.contains(&task.status)),
            FilterCriterion::TimeRange => {
                self.created_after.is_none_or(|t| task.created_at >= t)
                    && self.created_before.is_none_or(|t| task.created_at <= t)
                    && self.updated_after.is_none_or(|t| task.last_updated_at >= t)
                    && self.updated_before.is_none_or(|t| task.last_updated_at <= t)
            }
            FilterCriterion::Sort => true,
        }
    }

    /// Evaluate every selection criterion.
    ///
    /// Clients use this to post-filter a page returned by a receiver that
    /// dropped some criteria.
    pub fn matches(&self, task: &TaskSnapshot) -> bool {
        self.requested()
            .into_iter()
            .all(|c| self.matches_criterion(c, task))
    }

    /// Reject bounds that can never match and a zero `limit`.
    pub fn validate(&self) -> Result<(), String> {
        self.requested()
            .into_iter()
            .try_for_each(|c| self.validate_criterion(c))?;
        self.validate_paging()
    }

    /// Check one criterion's values. Only `TimeRange` can be inconsistent.
    pub fn validate_criterion(&self, criterion: FilterCriterion) -> Result<(), String> {
        if criterion != FilterCriterion::TimeRange {
            return Ok(());
        }
        if let (Some(a), Some(b)) = (self.created_after, self.created_before) {
            if a > b {
                return Err("createdAfter is later than createdBefore".into());
            }
        }
        if let (Some(a), Some(b)) = (self.updated_after, self.updated_before) {
            if a > b {
                return Err("updatedAfter is later than updatedBefore".into());
            }
        }
        Ok(())
    }

    /// Paging parameters are honoured whatever criteria a receiver supports.
    pub fn validate_paging(&self) -> Result<(), String> {
        if self.limit == Some(0) {
            return Err("limit must be positive".into());
        }
        Ok(())
    }
}

/// One page of a task listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListPage {
    pub tasks: Vec<TaskSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    /// Criteria the receiver ignored; the page may be broader than asked.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped_criteria: Vec<FilterCriterion>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn snapshot(method: &str, status: TaskStatus) -> TaskSnapshot {
        let now = Utc::now();
        TaskSnapshot {
            task_id: TaskId::new(),
            method: method.into(),
            status,
            status_message: None,
            created_at: now,
            last_updated_at: now,
            ttl: 1_000,
            poll_interval: 100,
            parent_task_id: None,
            child_task_ids: vec![],
            last_seq_nr: None,
            error: None,
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = ListFilter::default();
        assert!(filter.requested().is_empty());
        assert!(filter.matches(&snapshot("tools/call", TaskStatus::Working)));
    }

    #[test]
    fn status_and_method_are_conjunctive() {
        let filter = ListFilter {
            methods: Some(vec!["tools/call".into()]),
            statuses: Some(vec![TaskStatus::Completed]),
            ..Default::default()
        };
        assert!(filter.matches(&snapshot("tools/call", TaskStatus::Completed)));
        assert!(!filter.matches(&snapshot("tools/call", TaskStatus::Working)));
        assert!(!filter.matches(&snapshot("sampling/createMessage", TaskStatus::Completed)));
    }

    #[test]
    fn inverted_time_range_is_rejected() {
        let now = Utc::now();
        let filter = ListFilter {
            created_after: Some(now),
            created_before: Some(now - Duration::seconds(5)),
            ..Default::default()
        };
        assert!(filter.validate().is_err());
        assert!(filter.validate_criterion(FilterCriterion::TimeRange).is_err());
        assert_eq!(filter.validate_criterion(FilterCriterion::Method), Ok(()));
        assert_eq!(filter.validate_paging(), Ok(()));
    }

    #[test]
    fn sort_key_accepts_both_spellings() {
        assert_eq!("createdAt".parse::<SortKey>(), Ok(SortKey::CreatedAt));
        assert_eq!("last_updated_at".parse::<SortKey>(), Ok(SortKey::LastUpdatedAt));
        assert!("priority".parse::<SortKey>().is_err());
        assert_eq!("ASC".parse::<SortDirection>(), Ok(SortDirection::Asc));
    }
}
