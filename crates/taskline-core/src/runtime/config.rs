use std::time::Duration;

use taskline_types::{FilterCriterion, ResponseMode};

/// Runtime configuration passed to [`TaskRuntime::new`](crate::TaskRuntime::new).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// TTL assigned when a request does not ask for one.  Defaults to 5 min.
    pub default_ttl: Duration,
    /// Upper bound for requested TTLs.  Defaults to 24 h.
    pub max_ttl: Duration,
    /// Lower bound for requested TTLs.  Defaults to 1 s.
    pub min_ttl: Duration,
    /// Advisory poll cadence returned on task handles.  Defaults to 1 s.
    pub default_poll_interval: Duration,
    /// Minimum time a terminal record stays readable before the reaper may
    /// delete it.  Defaults to 30 s.
    pub terminal_grace: Duration,
    /// Period of the background sweep.  Defaults to 1 s.
    pub reaper_interval: Duration,
    /// How long an `inline` request waits before degrading to a task handle.
    pub inline_wait: Duration,
    /// How long a `stream` request waits for its first fragment.
    pub stream_first_wait: Duration,
    /// Default cap for the blocking final-result call.  Defaults to 300 s.
    pub result_wait: Duration,
    /// Listing page size when the caller gives no limit.
    pub page_size: usize,
    /// Hard cap on a caller-supplied listing limit.
    pub max_page_size: usize,
    /// Deepest allowed subtask nesting (a root task has depth 0).
    pub max_tree_depth: usize,
    /// Buffer of the notification broadcast channel.
    pub notification_capacity: usize,
    /// Response modes this receiver is willing to produce.
    pub supported_modes: Vec<ResponseMode>,
    pub filter_support: FilterSupport,
    /// Keep a completed record after answering an `inline` request.
    pub retain_inline_results: bool,
    /// On TTL expiry, finish as `completed` when a usable partial result
    /// exists instead of failing.
    pub complete_partial_on_expiry: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            max_ttl: Duration::from_secs(24 * 60 * 60),
            min_ttl: Duration::from_secs(1),
            default_poll_interval: Duration::from_secs(1),
            terminal_grace: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(1),
            inline_wait: Duration::from_secs(2),
            stream_first_wait: Duration::from_millis(500),
            result_wait: Duration::from_secs(300),
            page_size: 50,
            max_page_size: 500,
            max_tree_depth: 16,
            notification_capacity: 256,
            supported_modes: vec![ResponseMode::Inline, ResponseMode::Task, ResponseMode::Stream],
            filter_support: FilterSupport::default(),
            retain_inline_results: true,
            complete_partial_on_expiry: true,
        }
    }
}

impl RuntimeConfig {
    /// Resolve a requested TTL against the configured bounds.
    pub fn clamp_ttl(&self, requested: Option<Duration>) -> Duration {
        let ttl = requested.unwrap_or(self.default_ttl);
        ttl.clamp(self.min_ttl, self.max_ttl.max(self.min_ttl))
    }

    /// Resolve a requested listing limit against the configured bounds.
    pub fn page_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.page_size)
            .clamp(1, self.max_page_size.max(1))
    }
}

/// Which listing criteria this receiver evaluates.
///
/// A criterion switched off is dropped from incoming filters and reported
/// back in `ListPage::dropped_criteria`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSupport {
    pub method: bool,
    pub task_ids: bool,
    pub status: bool,
    pub time_range: bool,
    pub sort: bool,
}

impl Default for FilterSupport {
    fn default() -> Self {
        Self::all()
    }
}

impl FilterSupport {
    pub fn all() -> Self {
        Self {
            method: true,
            task_ids: true,
            status: true,
            time_range: true,
            sort: true,
        }
    }

    pub fn none() -> Self {
        Self {
            method: false,
            task_ids: false,
            status: false,
            time_range: false,
            sort: false,
        }
    }

    pub fn supports(&self, criterion: FilterCriterion) -> bool {
        match criterion {
            FilterCriterion::Method => self.method,
            FilterCriterion::TaskIds => self.task_ids,
            FilterCriterion::Status => self.status,
            FilterCriterion::TimeRange => self.time_range,
            FilterCriterion::Sort => self.sort,
        }
    }

    /// Switch one criterion off.
    pub fn without(mut self, criterion: FilterCriterion) -> Self {
        match criterion {
            FilterCriterion::Method => self.method = false,
            FilterCriterion::TaskIds => self.task_ids = false,
            FilterCriterion::Status => self.status = false,
            FilterCriterion::TimeRange => self.time_range = false,
            FilterCriterion::Sort => self.sort = false,
        }
        self
    }
}
