use axum::{
    routing::{get, post, put},
    Router,
};
use cronctl_cache::Bucketizer;
use cronctl_core::config::{CronctlConfig, API_NAMESPACE, ENDPOINT_LIST, ENDPOINT_RUN};
use cronctl_scheduler::{
    ActionRegistry, DueQueue, EventRunner, LegacyAdapter, LockManager, Supervisor,
};
use cronctl_store::SharedStore;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state handed to every Axum handler as Arc<AppState>.
pub struct AppState {
    pub config: CronctlConfig,
    pub store: SharedStore,
    pub registry: Arc<ActionRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub queue: DueQueue,
    pub runner: EventRunner,
    pub legacy: LegacyAdapter,
    pub view: Arc<Bucketizer>,
}

impl AppState {
    /// Wire the scheduler components over an opened store.
    ///
    /// Internal handlers are registered into `registry` here; any host
    /// handlers must already be in it so configured internal events can
    /// resolve their callbacks.
    pub fn new(
        config: CronctlConfig,
        store: SharedStore,
        registry: Arc<ActionRegistry>,
        view: Arc<Bucketizer>,
    ) -> anyhow::Result<Self> {
        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            &registry,
            Some(view.clone()),
            &config,
        )?);
        let locks = Arc::new(LockManager::new(store.clone(), &config.scheduler));
        let queue = DueQueue::new(
            store.clone(),
            registry.clone(),
            supervisor.clone(),
            &config.scheduler,
        );
        let runner = EventRunner::new(
            store.clone(),
            registry.clone(),
            supervisor.clone(),
            locks,
            &config.scheduler,
        );
        let legacy = LegacyAdapter::new(store.clone(), view.clone(), supervisor.clone());

        Ok(Self {
            config,
            store,
            registry,
            supervisor,
            queue,
            runner,
            legacy,
            view,
        })
    }
}

/// Assemble the full Axum router.
///
/// Each runner endpoint accepts exactly one method; anything else is a 404
/// so the API surface does not advertise itself.
pub fn build_router(state: Arc<AppState>) -> Router {
    let list_path = format!("/{API_NAMESPACE}/{ENDPOINT_LIST}");
    let run_path = format!("/{API_NAMESPACE}/{ENDPOINT_RUN}");

    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            &list_path,
            post(crate::http::events::list_events).fallback(crate::http::not_found),
        )
        .route(
            &run_path,
            put(crate::http::run::run_event).fallback(crate::http::not_found),
        )
        .fallback(crate::http::not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
