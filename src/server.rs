//! # Server Configuration
//!
//! Router and listener for the operator-facing status API. When a dispatcher
//! is supplied the server also runs its reconcile loop until shutdown.

use std::sync::Arc;

use axum::{
    Router,
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::dispatcher::ExecutionDispatcher;
use crate::handlers;
use crate::registry::JobRegistry;
use crate::telemetry::{self, TRACE_ID_HEADER, TraceContext};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<dyn JobRegistry>,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/jobs", get(handlers::jobs::list_jobs))
        .route("/jobs/{id}", get(handlers::jobs::get_job))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Scope each request in a [`TraceContext`] and echo its id back.
async fn trace_context_middleware(mut request: Request, next: Next) -> Response {
    let incoming = request
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(|value| value.to_str().ok());
    let context = TraceContext::from_header(incoming);
    let trace_id = context.trace_id.clone();
    request.extensions_mut().insert(context.clone());

    let mut response = telemetry::with_trace_context(context, next.run(request)).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    response
}

/// Serves the API until `shutdown` fires.
pub async fn run_server(
    config: Arc<AppConfig>,
    registry: Arc<dyn JobRegistry>,
    dispatcher: Option<Arc<ExecutionDispatcher>>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;

    let reconciler = dispatcher.map(|dispatcher| {
        tokio::spawn(dispatcher.run_reconciler(
            config.dispatcher.reconcile_interval(),
            shutdown.clone(),
        ))
    });

    let app = create_app(AppState {
        config: Arc::clone(&config),
        registry,
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, profile = %config.profile, "Server listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    shutdown.cancel();
    if let Some(reconciler) = reconciler {
        let _ = reconciler.await;
    }

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::jobs::list_jobs,
        crate::handlers::jobs::get_job,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::JobStatus,
            crate::models::FailureCause,
            crate::models::FailureKind,
            crate::handlers::jobs::JobStatusView,
            crate::handlers::jobs::JobsResponse,
            crate::error::ApiError,
        )
    ),
    tags(
        (name = "root", description = "Service information"),
        (name = "jobs", description = "Reindex job status")
    ),
    info(
        title = "Solr Reindex API",
        description = "Status of bulk Solr reindex jobs",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
