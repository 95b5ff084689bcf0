//! Facade that sequences the registry, query store, resolver, tracker and
//! permission checks for node traffic and administrative calls.

use crate::{
    config::AppConfig,
    error::{Result, ServiceError},
    executions::ExecutionTracker,
    models::{
        ArchivedNode, DistributedQuery, LastEvent, NewAdminUser, NewQuery, Node, NodeAttributes,
        NodeMetadata, QueryListFilter, QueryTarget, QueryType, StatsData, TargetKind,
    },
    permissions::{AccessLevel, Permissions},
    queries::{carve_query, generate_carve_name, generate_query_name, QueryAction, QueryManager},
    registry::{NodeAction, NodeRegistry},
    store::{FleetStore, NodeStore, QueryStore, UserStore},
    targeting::TargetingResolver,
    users::UserManager,
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};
use tracing::{debug, info};

/// Name and reach of a freshly created query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryHandle {
    pub name: String,
    pub expected: usize,
}

/// Outcome of a result batch, one list per disposition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResultsReport {
    pub recorded: Vec<String>,
    pub duplicates: Vec<String>,
    pub unknown: Vec<String>,
}

#[derive(Clone)]
pub struct FleetEngine {
    config: Arc<AppConfig>,
    registry: NodeRegistry,
    queries: QueryManager,
    resolver: TargetingResolver,
    executions: ExecutionTracker,
    users: UserManager,
}

impl FleetEngine {
    pub fn new<S>(config: Arc<AppConfig>, store: Arc<S>) -> Self
    where
        S: FleetStore + 'static,
    {
        Self::from_parts(config, store.clone(), store.clone(), store)
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        nodes: Arc<dyn NodeStore>,
        queries: Arc<dyn QueryStore>,
        users: Arc<dyn UserStore>,
    ) -> Self {
        let registry = NodeRegistry::new(nodes);
        Self {
            resolver: TargetingResolver::new(Arc::clone(&queries), registry.clone()),
            executions: ExecutionTracker::new(Arc::clone(&queries)),
            queries: QueryManager::new(queries),
            users: UserManager::new(users),
            registry,
            config,
        }
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn queries(&self) -> &QueryManager {
        &self.queries
    }

    pub fn resolver(&self) -> &TargetingResolver {
        &self.resolver
    }

    pub fn executions(&self) -> &ExecutionTracker {
        &self.executions
    }

    pub fn users(&self) -> &UserManager {
        &self.users
    }

    // Node traffic.

    pub async fn enroll(&self, uuid: &str, node_key: &str, attrs: NodeAttributes) -> Result<Node> {
        if !self.config.has_environment(&attrs.environment) {
            return Err(ServiceError::InvalidRequest(format!(
                "unknown environment '{}'",
                attrs.environment
            )));
        }
        self.registry.enroll_or_get(uuid, node_key, attrs).await
    }

    pub async fn update_metadata(&self, node_key: &str, observed: &NodeMetadata) -> Result<Node> {
        let node = self.registry.get_by_key(node_key).await?;
        let node = self.registry.update_attributes(&node.uuid, observed).await?;
        self.registry
            .refresh_last_event(&node.uuid, LastEvent::Status)
            .await?;
        Ok(node)
    }

    /// IP-only refresh used when a node submits logs.
    pub async fn update_ip_address(&self, node_key: &str, ip_address: &str) -> Result<Node> {
        let node = self.registry.get_by_key(node_key).await?;
        self.registry.update_ip_address(&node.uuid, ip_address).await
    }

    pub async fn poll_for_queries(&self, node_key: &str) -> Result<BTreeMap<String, String>> {
        let node = self.registry.get_by_key(node_key).await?;
        let pending = self.resolver.node_queries(&node).await?;
        self.registry
            .refresh_last_event(&node.uuid, LastEvent::QueryRead)
            .await?;
        Ok(pending)
    }

    pub async fn submit_result(&self, node_key: &str, name: &str, result: i32) -> Result<()> {
        let node = self.registry.get_by_key(node_key).await?;
        self.executions
            .record_result(name, &node.uuid, result)
            .await?;
        self.registry
            .refresh_last_event(&node.uuid, LastEvent::QueryWrite)
            .await
    }

    /// Records a batch of statuses from one node. Names already recorded or
    /// unknown to the store are reported back instead of failing the batch.
    pub async fn submit_results(
        &self,
        node_key: &str,
        statuses: &BTreeMap<String, i32>,
    ) -> Result<ResultsReport> {
        let node = self.registry.get_by_key(node_key).await?;
        let mut report = ResultsReport::default();
        for (name, status) in statuses {
            match self.executions.record_result(name, &node.uuid, *status).await {
                Ok(()) => report.recorded.push(name.clone()),
                Err(ServiceError::AlreadyRecorded(_)) => report.duplicates.push(name.clone()),
                Err(ServiceError::NotFound(_)) => {
                    debug!(uuid = %node.uuid, name = %name, "result for unknown query");
                    report.unknown.push(name.clone());
                }
                Err(err) => return Err(err),
            }
        }
        if !report.recorded.is_empty() {
            self.registry
                .refresh_last_event(&node.uuid, LastEvent::QueryWrite)
                .await?;
        }
        Ok(report)
    }

    // Administration.

    pub async fn authorize(
        &self,
        actor: &str,
        level: AccessLevel,
        environment: Option<&str>,
    ) -> Result<bool> {
        self.users.authorize(actor, level, environment).await
    }

    pub async fn create_query(
        &self,
        actor: &str,
        text: &str,
        targets: Vec<QueryTarget>,
        kind: QueryType,
    ) -> Result<QueryHandle> {
        self.users.require(actor, AccessLevel::Query, None).await?;
        let query = NewQuery::ready(generate_query_name(), actor, text, kind);
        self.launch(query, targets).await
    }

    pub async fn create_carve(
        &self,
        actor: &str,
        path: &str,
        targets: Vec<QueryTarget>,
    ) -> Result<QueryHandle> {
        self.users.require(actor, AccessLevel::Carve, None).await?;
        let path = path.trim();
        if path.is_empty() {
            return Err(ServiceError::InvalidRequest("carve requires a path".into()));
        }
        let mut query =
            NewQuery::ready(generate_carve_name(), actor, &carve_query(path), QueryType::Carve);
        query.path = Some(path.to_string());
        self.launch(query, targets).await
    }

    async fn launch(&self, mut query: NewQuery, targets: Vec<QueryTarget>) -> Result<QueryHandle> {
        if targets.is_empty() {
            return Err(ServiceError::InvalidTarget(
                "query requires at least one target".into(),
            ));
        }
        let targets = self.resolve_targets(targets).await?;
        if targets.is_empty() {
            return Err(ServiceError::InvalidTarget(
                "no target matches an enrolled node or configured environment".into(),
            ));
        }

        let expected = self
            .resolver
            .expected_count(&targets, self.config.inactive_hours)
            .await?;
        query.expected = i32::try_from(expected).map_err(|_| {
            ServiceError::InvalidRequest(format!("expected count {expected} out of range"))
        })?;
        let created = self.queries.create_with_targets(query, &targets).await?;

        info!(name = %created.name, targets = targets.len(), expected, "query launched");
        Ok(QueryHandle {
            name: created.name,
            expected,
        })
    }

    /// Deduplicates targets and drops the ones that select nothing known.
    async fn resolve_targets(&self, targets: Vec<QueryTarget>) -> Result<Vec<QueryTarget>> {
        let mut seen = HashSet::new();
        let mut platforms: Option<Vec<String>> = None;
        let mut resolved = Vec::with_capacity(targets.len());

        for target in targets {
            if !seen.insert(target.clone()) {
                continue;
            }
            let known = match target.kind {
                TargetKind::Environment => self.config.has_environment(&target.value),
                TargetKind::Platform => {
                    if platforms.is_none() {
                        platforms = Some(self.registry.platforms().await?);
                    }
                    platforms
                        .as_deref()
                        .is_some_and(|known| known.iter().any(|p| *p == target.value))
                }
                TargetKind::Uuid => self.registry.exists_by_uuid(&target.value).await?,
                TargetKind::Localname => self.registry.exists_by_host(&target.value).await?,
            };
            if known {
                resolved.push(target);
            } else {
                debug!(kind = %target.kind, value = %target.value, "skipping target with no match");
            }
        }
        Ok(resolved)
    }

    pub async fn list_queries(
        &self,
        actor: &str,
        filter: QueryListFilter,
    ) -> Result<Vec<DistributedQuery>> {
        self.users.require(actor, AccessLevel::Query, None).await?;
        self.queries.gets(filter).await
    }

    /// Applies `action` to every named query. All names are checked before any
    /// flag changes.
    pub async fn query_action(
        &self,
        actor: &str,
        action: QueryAction,
        names: &[String],
    ) -> Result<()> {
        self.users.require(actor, AccessLevel::Query, None).await?;
        for name in names {
            self.queries.get(name).await?;
        }
        for name in names {
            self.queries.apply(name, action).await?;
        }
        Ok(())
    }

    pub async fn node_action(
        &self,
        actor: &str,
        action: NodeAction,
        uuids: &[String],
    ) -> Result<Vec<ArchivedNode>> {
        self.users.require(actor, AccessLevel::Admin, None).await?;
        for uuid in uuids {
            self.registry.get_by_uuid(uuid).await?;
        }

        let mut archived = Vec::with_capacity(uuids.len());
        for uuid in uuids {
            let snapshot = match &action {
                NodeAction::Delete => self.registry.archive_and_delete(uuid).await?,
                NodeAction::Archive { trigger } => self.registry.archive(uuid, trigger).await?,
            };
            archived.push(snapshot);
        }
        info!(actor, count = archived.len(), ?action, "node action applied");
        Ok(archived)
    }

    pub async fn add_user(&self, actor: &str, user: NewAdminUser) -> Result<()> {
        self.users.require(actor, AccessLevel::Admin, None).await?;
        self.users.add_user(user, &self.config.environments).await?;
        Ok(())
    }

    pub async fn set_admin(&self, actor: &str, username: &str, admin: bool) -> Result<()> {
        self.users.require(actor, AccessLevel::Admin, None).await?;
        self.users
            .change_admin(username, admin, &self.config.environments)
            .await
    }

    pub async fn set_permissions(
        &self,
        actor: &str,
        username: &str,
        permissions: &Permissions,
    ) -> Result<()> {
        self.users.require(actor, AccessLevel::Admin, None).await?;
        self.users.change_permissions(username, permissions).await
    }

    pub async fn node_stats(&self, actor: &str, environment: &str) -> Result<StatsData> {
        self.users
            .require(actor, AccessLevel::Environment, Some(environment))
            .await?;
        self.registry
            .stats_by_environment(environment, self.config.inactive_hours)
            .await
    }

    /// Creates `username` as an admin unless an account by that name exists.
    pub async fn ensure_admin(&self, username: &str) -> Result<()> {
        if self.users.exists(username).await? {
            return Ok(());
        }
        let user = NewAdminUser {
            username: username.to_string(),
            admin: true,
            ..NewAdminUser::default()
        };
        match self.users.add_user(user, &self.config.environments).await {
            Ok(_) | Err(ServiceError::AlreadyExists(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
