//! Integration tests for the reindex status API over a real socket.

mod test_utils;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reindex::config::AppConfig;
use reindex::copier::BatchCopier;
use reindex::dispatcher::{
    DispatcherSettings, ExecutionDispatcher, ExecutionStatus, LocalExecutionBackend,
};
use reindex::registry::{DatabaseJobRegistry, InMemoryJobRegistry, JobRegistry};
use reindex::server::{AppState, create_app, run_server};
use reindex::worker::ReindexWorker;
use reqwest::Client;
use serde_json::Value;
use test_utils::{FakeSolr, setup_test_db, spec};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Helper function to get a random available port
async fn get_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Helper function to start the server on a random port
async fn start_test_server(registry: Arc<dyn JobRegistry>) -> String {
    let port = get_available_port().await;
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let state = AppState {
        config: Arc::new(AppConfig::default()),
        registry,
    };

    let app = create_app(state);
    let listener = TcpListener::bind(addr).await.unwrap();

    // Start the server in the background
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(100)).await;

    format!("http://127.0.0.1:{}", port)
}

#[tokio::test]
async fn test_root_endpoint() {
    let server_url = start_test_server(Arc::new(InMemoryJobRegistry::new())).await;
    let client = Client::new();

    let response = client
        .get(format!("{}/", server_url))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );

    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["service"], "solrex-reindex");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_openapi_endpoint() {
    let server_url = start_test_server(Arc::new(InMemoryJobRegistry::new())).await;
    let client = Client::new();

    let response = client
        .get(format!("{}/openapi.json", server_url))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert!(body.get("openapi").is_some());
    assert_eq!(body["info"]["title"], "Solr Reindex API");
    assert!(body["paths"].get("/jobs/{id}").is_some());
    assert!(body["components"]["schemas"].get("JobStatusView").is_some());
}

#[tokio::test]
async fn test_completed_job_is_visible_over_http() {
    let db = setup_test_db().await.expect("test database");
    let registry: Arc<dyn JobRegistry> = Arc::new(DatabaseJobRegistry::new(db));
    let solr = Arc::new(FakeSolr::with_docs(120));
    let worker = ReindexWorker::new(
        Arc::clone(&registry),
        BatchCopier::new(solr.clone(), solr.clone()),
    );
    let dispatcher = ExecutionDispatcher::new(
        Arc::clone(&registry),
        Arc::new(LocalExecutionBackend::new(worker)),
        DispatcherSettings {
            liveness_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(5),
        },
    );

    let handle = dispatcher.submit(spec(50, 3)).await.unwrap();
    assert_eq!(
        dispatcher.wait(&handle).await.unwrap(),
        ExecutionStatus::Succeeded
    );

    let server_url = start_test_server(Arc::clone(&registry)).await;
    let client = Client::new();

    let job: Value = client
        .get(format!("{}/jobs/{}", server_url, handle.job_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["status"], "completed");
    assert_eq!(job["docs_copied"], 120);
    assert_eq!(job["batches_completed"], 3);
    assert_eq!(job["execution_id"], handle.execution_id.to_string());

    let listed: Value = client
        .get(format!("{}/jobs?status=completed", server_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let jobs = listed["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["id"], handle.job_id.to_string());
}

#[tokio::test]
async fn test_run_server_stops_on_shutdown() {
    let port = get_available_port().await;
    let config = AppConfig {
        api_bind_addr: format!("127.0.0.1:{}", port),
        ..AppConfig::default()
    };
    let registry: Arc<dyn JobRegistry> = Arc::new(InMemoryJobRegistry::new());
    let shutdown = CancellationToken::new();

    let trigger = shutdown.clone();
    let url = format!("http://127.0.0.1:{}/", port);
    let request = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = Client::new().get(url).send().await.map(|r| r.status());
        trigger.cancel();
        status
    });

    let served = tokio::time::timeout(
        Duration::from_secs(5),
        run_server(Arc::new(config), registry, None, shutdown),
    )
    .await
    .expect("server stops after shutdown");
    assert!(served.is_ok());

    let status = request.await.unwrap().expect("server answered");
    assert_eq!(status, 200);
}
