//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use taskline_core::TaskRuntime;
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// The task subsystem every route talks to.
    pub runtime: Arc<TaskRuntime>,
    /// Flips to `true` once the server starts draining. Long-lived
    /// streams end when they see it.
    pub shutdown: watch::Sender<bool>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let runtime = TaskRuntime::new(config.runtime_config());
        crate::operations::register_all(&runtime);
        Self {
            config: Arc::new(config),
            runtime: Arc::new(runtime),
            shutdown: watch::Sender::new(false),
        }
    }

    /// Resolves once [`AppState::begin_shutdown`] has been called.
    pub fn draining(&self) -> impl Future<Output = ()> + Send + 'static + use<> {
        let mut rx = self.shutdown.subscribe();
        async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    /// End open streams and fail every unfinished task.
    pub async fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
        let failed = self.runtime.shutdown().await;
        info!(failed, "task runtime drained");
    }
}
