//! Server configuration, loaded from environment variables at startup.

use std::time::Duration;

use taskline_core::{FilterSupport, RuntimeConfig};
use taskline_types::FilterCriterion;

/// Runtime configuration for taskline-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Comma-separated list of allowed CORS origins; `None` allows any.
    pub cors_allowed_origins: Option<String>,

    pub default_ttl: Duration,
    pub max_ttl: Duration,
    pub poll_interval: Duration,
    pub reaper_interval: Duration,
    pub terminal_grace: Duration,
    pub page_size: usize,

    /// Listing criteria this receiver ignores.
    pub disabled_filters: Vec<FilterCriterion>,

    /// Serve Swagger UI at `/swagger-ui` (default: `true`).
    pub enable_swagger: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = RuntimeConfig::default();
        let millis = |key: &str, default: Duration| {
            parse(&get, key)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };
        Self {
            bind_address: get("TASKLINE_BIND").unwrap_or_else(|| "0.0.0.0:3000".to_owned()),
            log_level: get("TASKLINE_LOG").unwrap_or_else(|| "info".to_owned()),
            log_json: get("TASKLINE_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            cors_allowed_origins: get("TASKLINE_CORS_ORIGINS"),
            default_ttl: millis("TASKLINE_DEFAULT_TTL_MS", defaults.default_ttl),
            max_ttl: millis("TASKLINE_MAX_TTL_MS", defaults.max_ttl),
            poll_interval: millis("TASKLINE_POLL_INTERVAL_MS", defaults.default_poll_interval),
            reaper_interval: millis("TASKLINE_REAPER_INTERVAL_MS", defaults.reaper_interval),
            terminal_grace: millis("TASKLINE_TERMINAL_GRACE_MS", defaults.terminal_grace),
            page_size: parse(&get, "TASKLINE_PAGE_SIZE").unwrap_or(defaults.page_size),
            disabled_filters: get("TASKLINE_DISABLE_FILTERS")
                .map(|raw| parse_filter_list(&raw))
                .unwrap_or_default(),
            enable_swagger: get("TASKLINE_ENABLE_SWAGGER")
                .map(|v| !(v == "0" || v.eq_ignore_ascii_case("false")))
                .unwrap_or(true),
        }
    }

    /// The task runtime settings derived from this configuration.
    pub fn runtime_config(&self) -> RuntimeConfig {
        let filter_support = self
            .disabled_filters
            .iter()
            .fold(FilterSupport::all(), |support, c| support.without(*c));
        RuntimeConfig {
            default_ttl: self.default_ttl,
            max_ttl: self.max_ttl,
            default_poll_interval: self.poll_interval,
            reaper_interval: self.reaper_interval,
            terminal_grace: self.terminal_grace,
            page_size: self.page_size,
            filter_support,
            ..RuntimeConfig::default()
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn parse<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|v| v.trim().parse().ok())
}

/// `method,ids,status,time,sort`; unknown names are skipped.
fn parse_filter_list(raw: &str) -> Vec<FilterCriterion> {
    raw.split(',')
        .filter_map(|name| match name.trim().to_ascii_lowercase().as_str() {
            "method" => Some(FilterCriterion::Method),
            "ids" | "taskids" => Some(FilterCriterion::TaskIds),
            "status" => Some(FilterCriterion::Status),
            "time" | "timerange" => Some(FilterCriterion::TimeRange),
            "sort" => Some(FilterCriterion::Sort),
            _ => None,
        })
        .collect()
}
