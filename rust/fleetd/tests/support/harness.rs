use anyhow::Context;
use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use fleetd::{
    config::AppConfig,
    engine::FleetEngine,
    models::{Node, NodeAttributes},
    server::Server,
    store::MemoryStore,
};
use serde::Serialize;
use serde_json::Value;
use std::{env, fs, future::Future, net::SocketAddr, sync::Arc, sync::Once, time::Duration};
use tokio_postgres::NoTls;
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key";
pub const ROOT: &str = "root";

const FLEET_TABLES: &str = "TRUNCATE nodes, archived_nodes, node_history_hostname, \
    node_history_localname, node_history_ipaddress, node_history_username, \
    distributed_queries, distributed_query_targets, distributed_query_executions, \
    admin_users RESTART IDENTITY;";

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

pub fn environments() -> Vec<String> {
    vec!["prod".to_string(), "dev".to_string(), "staging".to_string()]
}

/// Engine over a fresh in-memory store with `root` bootstrapped as admin.
#[allow(dead_code)]
pub async fn memory_engine() -> FleetEngine {
    init_tracing();
    let mut config = AppConfig::embedded(environments());
    config.api_key = Some(API_KEY.to_string());
    let engine = FleetEngine::new(Arc::new(config), Arc::new(MemoryStore::new()));
    engine
        .ensure_admin(ROOT)
        .await
        .expect("bootstrap admin should be created");
    engine
}

#[allow(dead_code)]
pub async fn enroll(engine: &FleetEngine, uuid: &str, environment: &str, hostname: &str) -> Node {
    let attrs = NodeAttributes {
        platform: "ubuntu".into(),
        hostname: hostname.into(),
        localname: format!("{hostname}.local"),
        ip_address: "10.0.0.1".into(),
        username: "root".into(),
        environment: environment.into(),
        ..NodeAttributes::default()
    };
    engine
        .enroll(uuid, &node_key(uuid), attrs)
        .await
        .expect("enrollment should succeed")
}

pub fn node_key(uuid: &str) -> String {
    format!("key-{}", uuid.to_lowercase())
}

/// Runs a test closure against the router backed by the in-memory engine.
#[allow(dead_code)]
pub async fn with_memory_harness<F, Fut>(test: F)
where
    F: FnOnce(FleetTestHarness) -> Fut,
    Fut: Future<Output = ()>,
{
    let engine = memory_engine().await;
    let router = Server::with_engine(engine.clone()).router();
    test(FleetTestHarness {
        router,
        engine,
        api_key: API_KEY.to_string(),
    })
    .await;
}

/// Runs a test closure against a Postgres-backed server. Skips unless
/// `FLEETD_TEST_DATABASE_URL` (or `FLEETD_TEST_DATABASE_URL_FILE`) is set.
#[allow(dead_code)]
pub async fn with_postgres_harness<F, Fut>(test: F)
where
    F: FnOnce(FleetTestHarness) -> Fut,
    Fut: Future<Output = ()>,
{
    init_tracing();

    let database_url = match read_env_value("FLEETD_TEST_DATABASE_URL")
        .expect("failed to read FLEETD_TEST_DATABASE_URL")
    {
        Some(url) => url,
        None => {
            eprintln!("[fleetd-test] skipping Postgres harness: FLEETD_TEST_DATABASE_URL is not set");
            return;
        }
    };

    let server = Server::new(test_config(database_url.clone()))
        .await
        .expect("failed to boot fleetd server for Postgres harness");
    reset_tables(&database_url)
        .await
        .expect("failed to reset fleet tables");

    let config = Arc::new(test_config(database_url));
    let pool = fleetd::db::connect_pool(&config)
        .await
        .expect("failed to connect harness pool");
    let engine = FleetEngine::new(config, Arc::new(fleetd::store::PgStore::new(pool)));
    engine
        .ensure_admin(ROOT)
        .await
        .expect("bootstrap admin should be created");

    test(FleetTestHarness {
        router: server.router(),
        engine,
        api_key: API_KEY.to_string(),
    })
    .await;
}

fn test_config(database_url: String) -> AppConfig {
    AppConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        database_url,
        max_pool_size: 5,
        pg_ssl_root_cert: env::var("PGSSLROOTCERT").ok(),
        pg_ssl_cert: env::var("PGSSLCERT").ok(),
        pg_ssl_key: env::var("PGSSLKEY").ok(),
        api_key: Some(API_KEY.to_string()),
        bootstrap_admin: None,
        environments: environments(),
        inactive_hours: 72,
        request_timeout: Duration::from_secs(30),
        apply_schema: true,
    }
}

async fn reset_tables(database_url: &str) -> anyhow::Result<()> {
    let (client, connection) = tokio_postgres::connect(database_url, NoTls)
        .await
        .context("failed to connect for table reset")?;
    let task = tokio::spawn(async move {
        let _ = connection.await;
    });
    client.batch_execute(FLEET_TABLES).await?;
    drop(client);
    let _ = task.await;
    Ok(())
}

#[derive(Clone)]
pub struct FleetTestHarness {
    router: Router,
    pub engine: FleetEngine,
    api_key: String,
}

#[allow(dead_code)]
impl FleetTestHarness {
    /// Node-facing call: no API key, no actor.
    pub async fn node_post<T: Serialize>(&self, path: &str, payload: &T) -> http::Response<Body> {
        self.request("POST", path, Some(payload), None, false).await
    }

    pub async fn admin_post<T: Serialize>(
        &self,
        path: &str,
        actor: &str,
        payload: &T,
    ) -> http::Response<Body> {
        self.request("POST", path, Some(payload), Some(actor), true)
            .await
    }

    pub async fn admin_get(&self, path: &str, actor: &str) -> http::Response<Body> {
        self.request::<()>("GET", path, None, Some(actor), true).await
    }

    pub async fn post_without_api_key<T: Serialize>(
        &self,
        path: &str,
        actor: &str,
        payload: &T,
    ) -> http::Response<Body> {
        self.request("POST", path, Some(payload), Some(actor), false)
            .await
    }

    async fn request<T>(
        &self,
        method: &str,
        path: &str,
        payload: Option<&T>,
        actor: Option<&str>,
        include_api_key: bool,
    ) -> http::Response<Body>
    where
        T: Serialize,
    {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/json");

        if include_api_key {
            builder = builder.header("x-api-key", &self.api_key);
        }
        if let Some(actor) = actor {
            builder = builder.header("x-fleet-user", actor);
        }

        let body = match payload {
            Some(payload) => {
                Body::from(serde_json::to_vec(payload).expect("request payload should serialize"))
            }
            None => Body::empty(),
        };
        let request = builder
            .body(body)
            .expect("failed to build harness request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }
}

/// Status plus parsed JSON body; `Value::Null` for empty bodies.
#[allow(dead_code)]
pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should be readable");
    if bytes.is_empty() {
        return (status, Value::Null);
    }
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}

fn read_env_value(key: &str) -> anyhow::Result<Option<String>> {
    if let Ok(value) = env::var(key) {
        if value.trim().is_empty() {
            anyhow::bail!("{key} is set but empty");
        }
        return Ok(Some(value));
    }
    let file_key = format!("{key}_FILE");
    if let Ok(path) = env::var(&file_key) {
        let value = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {file_key} ({path})"))?
            .trim()
            .to_string();
        if value.is_empty() {
            anyhow::bail!("{file_key} points to an empty file");
        }
        return Ok(Some(value));
    }
    Ok(None)
}
