use crate::{
    config::AppConfig,
    db,
    engine::{FleetEngine, QueryHandle, ResultsReport},
    error::{Result, ServiceError},
    models::{
        ArchivedNode, DistributedQuery, NewAdminUser, Node, NodeAttributes, NodeMetadata,
        QueryListFilter, QueryTarget, QueryType, StatsData,
    },
    permissions::Permissions,
    queries::QueryAction,
    registry::NodeAction,
    state::AppState,
    store::PgStore,
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc};
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

const ACTOR_HEADER: &str = "x-fleet-user";

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let pool = db::connect_pool(&config).await?;
        if config.apply_schema {
            db::apply_schema(&pool).await?;
        }
        let config = Arc::new(config);
        let engine = FleetEngine::new(Arc::clone(&config), Arc::new(PgStore::new(pool)));
        if let Some(admin) = &config.bootstrap_admin {
            engine.ensure_admin(admin).await?;
        }
        Ok(Self::with_engine(engine))
    }

    /// Serves an engine built elsewhere, e.g. one over the in-memory store.
    pub fn with_engine(engine: FleetEngine) -> Self {
        let config = Arc::clone(engine.config());
        let state = AppState::new(Arc::clone(&config), engine);
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/v1/enroll", post(Self::enroll))
            .route("/api/v1/nodes/config", post(Self::node_config))
            .route("/api/v1/nodes/queries", post(Self::node_queries))
            .route("/api/v1/nodes/results", post(Self::node_results))
            .route("/api/v1/queries", post(Self::create_query).get(Self::list_queries))
            .route("/api/v1/queries/actions", post(Self::query_action))
            .route("/api/v1/carves", post(Self::create_carve))
            .route("/api/v1/nodes/actions", post(Self::node_action))
            .route("/api/v1/users", post(Self::add_user))
            .route(
                "/api/v1/users/:username/permissions",
                post(Self::set_permissions),
            )
            .route("/api/v1/users/:username/admin", post(Self::set_admin))
            .route("/api/v1/stats/environments/:env", get(Self::environment_stats))
            .with_state(self.state.clone())
            .layer(TimeoutLayer::new(self.config.request_timeout))
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "fleetd listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health() -> Json<serde_json::Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn enroll(
        State(state): State<AppState>,
        Json(request): Json<EnrollRequest>,
    ) -> Result<Json<Node>> {
        let node = state
            .engine
            .enroll(&request.uuid, &request.node_key, request.attributes)
            .await?;
        Ok(Json(node))
    }

    async fn node_config(
        State(state): State<AppState>,
        Json(request): Json<MetadataRequest>,
    ) -> Result<Json<Node>> {
        let node = state
            .engine
            .update_metadata(&request.node_key, &request.metadata)
            .await?;
        Ok(Json(node))
    }

    async fn node_queries(
        State(state): State<AppState>,
        Json(request): Json<NodeRequest>,
    ) -> Result<Json<PollResponse>> {
        let queries = state.engine.poll_for_queries(&request.node_key).await?;
        Ok(Json(PollResponse { queries }))
    }

    async fn node_results(
        State(state): State<AppState>,
        Json(request): Json<ResultsRequest>,
    ) -> Result<Json<ResultsReport>> {
        let report = state
            .engine
            .submit_results(&request.node_key, &request.statuses)
            .await?;
        Ok(Json(report))
    }

    async fn create_query(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<CreateQueryRequest>,
    ) -> Result<(StatusCode, Json<QueryHandle>)> {
        let actor = admin_actor(&headers, &state.config)?;
        let kind = match request.kind.as_deref() {
            Some(kind) => kind.parse()?,
            None => QueryType::Standard,
        };
        let targets = parse_targets(request.targets)?;
        let handle = state
            .engine
            .create_query(&actor, &request.query, targets, kind)
            .await?;
        Ok((StatusCode::CREATED, Json(handle)))
    }

    async fn list_queries(
        State(state): State<AppState>,
        headers: HeaderMap,
        Query(params): Query<ListQueriesParams>,
    ) -> Result<Json<Vec<DistributedQuery>>> {
        let actor = admin_actor(&headers, &state.config)?;
        let filter = match params.target.as_deref() {
            Some(target) => target.parse()?,
            None => QueryListFilter::default(),
        };
        Ok(Json(state.engine.list_queries(&actor, filter).await?))
    }

    async fn query_action(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<QueryActionRequest>,
    ) -> Result<StatusCode> {
        let actor = admin_actor(&headers, &state.config)?;
        let action: QueryAction = request.action.parse()?;
        state
            .engine
            .query_action(&actor, action, &request.names)
            .await?;
        Ok(StatusCode::NO_CONTENT)
    }

    async fn create_carve(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<CreateCarveRequest>,
    ) -> Result<(StatusCode, Json<QueryHandle>)> {
        let actor = admin_actor(&headers, &state.config)?;
        let targets = parse_targets(request.targets)?;
        let handle = state
            .engine
            .create_carve(&actor, &request.path, targets)
            .await?;
        Ok((StatusCode::CREATED, Json(handle)))
    }

    async fn node_action(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<NodeActionRequest>,
    ) -> Result<Json<Vec<ArchivedNode>>> {
        let actor = admin_actor(&headers, &state.config)?;
        let action: NodeAction = request.action.parse()?;
        let action = match (action, request.trigger) {
            (NodeAction::Archive { .. }, Some(trigger)) if !trigger.trim().is_empty() => {
                NodeAction::Archive { trigger }
            }
            (action, _) => action,
        };
        let archived = state
            .engine
            .node_action(&actor, action, &request.uuids)
            .await?;
        Ok(Json(archived))
    }

    async fn add_user(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(user): Json<NewAdminUser>,
    ) -> Result<StatusCode> {
        let actor = admin_actor(&headers, &state.config)?;
        state.engine.add_user(&actor, user).await?;
        Ok(StatusCode::CREATED)
    }

    async fn set_permissions(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(username): Path<String>,
        Json(permissions): Json<Permissions>,
    ) -> Result<StatusCode> {
        let actor = admin_actor(&headers, &state.config)?;
        state
            .engine
            .set_permissions(&actor, &username, &permissions)
            .await?;
        Ok(StatusCode::NO_CONTENT)
    }

    async fn set_admin(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(username): Path<String>,
        Json(request): Json<AdminFlagRequest>,
    ) -> Result<StatusCode> {
        let actor = admin_actor(&headers, &state.config)?;
        state
            .engine
            .set_admin(&actor, &username, request.admin)
            .await?;
        Ok(StatusCode::NO_CONTENT)
    }

    async fn environment_stats(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(env): Path<String>,
    ) -> Result<Json<StatsData>> {
        let actor = admin_actor(&headers, &state.config)?;
        Ok(Json(state.engine.node_stats(&actor, &env).await?))
    }
}

#[derive(Debug, Deserialize)]
struct EnrollRequest {
    uuid: String,
    node_key: String,
    #[serde(flatten)]
    attributes: NodeAttributes,
}

#[derive(Debug, Deserialize)]
struct MetadataRequest {
    node_key: String,
    #[serde(flatten)]
    metadata: NodeMetadata,
}

#[derive(Debug, Deserialize)]
struct NodeRequest {
    node_key: String,
}

#[derive(Debug, Serialize)]
struct PollResponse {
    queries: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ResultsRequest {
    node_key: String,
    #[serde(default)]
    statuses: BTreeMap<String, i32>,
}

#[derive(Debug, Deserialize)]
struct TargetRequest {
    kind: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct CreateQueryRequest {
    query: String,
    #[serde(default)]
    targets: Vec<TargetRequest>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateCarveRequest {
    path: String,
    #[serde(default)]
    targets: Vec<TargetRequest>,
}

#[derive(Debug, Deserialize)]
struct ListQueriesParams {
    target: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryActionRequest {
    action: String,
    names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct NodeActionRequest {
    action: String,
    uuids: Vec<String>,
    #[serde(default)]
    trigger: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AdminFlagRequest {
    admin: bool,
}

fn parse_targets(targets: Vec<TargetRequest>) -> Result<Vec<QueryTarget>> {
    targets
        .into_iter()
        .map(|target| QueryTarget::parse(&target.kind, &target.value))
        .collect()
}

/// Checks the service API key and returns the acting administrator.
fn admin_actor(headers: &HeaderMap, config: &AppConfig) -> Result<String> {
    enforce_api_key(headers, config)?;
    headers
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|actor| !actor.is_empty())
        .map(str::to_string)
        .ok_or(ServiceError::Auth)
}

fn enforce_api_key(headers: &HeaderMap, config: &AppConfig) -> Result<()> {
    if let Some(expected) = &config.api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());

        if provided != Some(expected.as_str()) {
            return Err(ServiceError::Auth);
        }
    }

    Ok(())
}
