//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agents::{AgentInfo, AgentRegistry, IndexSettings};
use crate::bus::{Broker, FileBroker, InMemoryBroker, MessageBus, INBOUND_QUEUE};
use crate::classifier::Classifier;
use crate::config::{BusBackend, Config, EngineTable};
use crate::dispatch::{DispatchError, DispatchSettings, Dispatcher};
use crate::llm::{EngineRegistry, EngineStatus};
use crate::load_balancer::LoadBalancer;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::task_state::{create_task_store, StoreError, Task};

use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// The request pipeline, with the store, registries and bus it owns
    pub dispatcher: Arc<Dispatcher>,
}

/// Build every component from `config` and wire the dispatcher to the bus.
///
/// Fails when the engine table cannot be loaded, a classifier role has no
/// registered agent, or a persistent directory is held by another process.
pub async fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    let table = EngineTable::load(&config.engines_path)?;
    tracing::info!(
        "Loaded {} engines from {}",
        table.llm_engines.len(),
        config.engines_path.display()
    );
    let balancer = LoadBalancer::from_table(&table)?;
    let engines = EngineRegistry::from_table(&table, &config);

    let agents = AgentRegistry::with_index(IndexSettings::from_config(&config));
    agents.validate(&Classifier::new().roles())?;
    tracing::info!("Registered {} agents", agents.roles().len());

    let store = create_task_store(config.task_store, config.task_state_dir.clone()).await?;
    tracing::info!(
        "Task store ready (persistent: {})",
        store.is_persistent()
    );

    let bus = Arc::new(MessageBus::new(config.nack_policy));
    let broker: Arc<dyn Broker> = match config.bus_backend {
        BusBackend::Memory => Arc::new(InMemoryBroker::new()),
        BusBackend::File => Arc::new(FileBroker::open(config.bus_dir.clone()).await?),
    };
    bus.connect(broker).await?;

    let dispatcher = Arc::new(Dispatcher::new(
        store,
        agents,
        balancer,
        engines,
        Arc::clone(&bus),
        Arc::new(MetricsCollector::new()),
        DispatchSettings::from_config(&config),
    ));
    dispatcher.attach().await?;
    bus.start_consuming().await?;

    Ok(Arc::new(AppState { config, dispatcher }))
}

/// Routes over an already built state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:id", get(get_task))
        .route("/metrics", get(get_metrics))
        .route("/agents", get(list_agents))
        .route("/engines", get(list_engines))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = build_state(config).await?;
    let app = router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop consuming before the process exits so no message is half handled
    let bus = Arc::clone(state.dispatcher.bus());
    if let Err(err) = bus.close().await {
        tracing::warn!("Failed to close message bus: {}", err);
    }
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let dispatcher = &state.dispatcher;
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        bus: dispatcher.bus().state().await.to_string(),
        persistent_store: dispatcher.store().is_persistent(),
        engines: dispatcher.balancer().engines().len(),
        agents: dispatcher.agents().roles().len(),
    })
}

/// Queue a new task. Processing is asynchronous; poll `GET /tasks/:id`.
async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), (StatusCode, String)> {
    if req.prompt.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "prompt must not be empty".to_string()));
    }

    match state
        .dispatcher
        .submit(&req.prompt, req.profile, req.role)
        .await
    {
        Ok(task_id) => Ok((
            StatusCode::ACCEPTED,
            Json(CreateTaskResponse {
                task_id,
                status: "Queued",
            }),
        )),
        Err(DispatchError::Bus(err)) => {
            tracing::error!("Task not queued: {}", err);
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Task could not be queued: {}", err),
            ))
        }
        Err(err) => {
            tracing::error!("Task not created: {}", err);
            Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
        }
    }
}

/// Get an active or finalized task.
async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Task>, (StatusCode, String)> {
    match state.dispatcher.store().lookup(&id).await {
        Ok(task) => Ok(Json(task)),
        Err(StoreError::NotFound(_)) => {
            Err((StatusCode::NOT_FOUND, format!("Task {} not found", id)))
        }
        Err(err) => Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string())),
    }
}

/// List in-flight tasks.
async fn list_tasks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Task>>, (StatusCode, String)> {
    state
        .dispatcher
        .store()
        .list_active()
        .await
        .map(Json)
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    let dispatcher = &state.dispatcher;
    let queue_length = dispatcher.bus().queue_length(INBOUND_QUEUE).await;
    Json(
        dispatcher
            .metrics()
            .snapshot(dispatcher.engines().llm_status(), queue_length),
    )
}

async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<AgentInfo>> {
    Json(state.dispatcher.agents().list())
}

async fn list_engines(State(state): State<Arc<AppState>>) -> Json<EnginesResponse> {
    let dispatcher = &state.dispatcher;
    let balancer = dispatcher.balancer();
    let engines = balancer
        .engines()
        .iter()
        .map(|config| {
            let status = match dispatcher.engines().get(&config.name) {
                Some(handle) => handle.status(),
                None if !config.toggle => EngineStatus::Disabled,
                None if config.locked => EngineStatus::Locked,
                None => EngineStatus::Active,
            };
            EngineView::new(config, status)
        })
        .collect();

    Json(EnginesResponse {
        engines,
        default_engine: balancer.default_engine().map(str::to_string),
        rules: balancer
            .rules()
            .iter()
            .map(|rule| format!("{} -> {}", rule.condition, rule.engine))
            .collect(),
    })
}
