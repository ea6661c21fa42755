use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use taskline_core::TaskError;
use taskline_types::{ListFilter, ParseError};
use utoipa::IntoParams;

/// Query of `GET /v1/tasks/{id}/result`.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ResultQuery {
    /// Kept as text so a non-numeric value is reported as an invalid
    /// `lastSeqNr` rather than a generic query rejection.
    pub last_seq_nr: Option<String>,
    pub wait_ms: Option<u64>,
}

impl ResultQuery {
    pub fn wait(&self) -> Option<Duration> {
        self.wait_ms.map(Duration::from_millis)
    }
}

/// Query of `GET /v1/tasks/{id}/stream`.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StreamQuery {
    /// Resume after this `seqNr`.
    pub after: Option<u64>,
}

/// Query of `GET /v1/tasks`. List values are comma separated.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ListQuery {
    pub method: Option<String>,
    pub status: Option<String>,
    pub ids: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub sort_by: Option<String>,
    pub direction: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn into_filter(self) -> Result<ListFilter, TaskError> {
        Ok(ListFilter {
            methods: self.method.map(|raw| split(&raw).map(str::to_owned).collect()),
            task_ids: self.ids.as_deref().map(parse_list).transpose()?,
            statuses: self.status.as_deref().map(parse_list).transpose()?,
            created_after: self.created_after,
            created_before: self.created_before,
            updated_after: self.updated_after,
            updated_before: self.updated_before,
            sort_by: self.sort_by.as_deref().map(str::parse).transpose()?,
            direction: self.direction.as_deref().map(str::parse).transpose()?,
            cursor: self.cursor,
            limit: self.limit,
        })
    }
}

fn split(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_list<T: FromStr<Err = ParseError>>(raw: &str) -> Result<Vec<T>, ParseError> {
    split(raw).map(str::parse).collect()
}
