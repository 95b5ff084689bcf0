mod support;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetd::{
    config::AppConfig,
    engine::FleetEngine,
    error::{Result, ServiceError},
    models::{
        Activity, ArchivedNode, DistributedQuery, ExecutionRecord, HistoryEntry, HistoryKind,
        LastEvent, NewArchivedNode, NewExecution, NewNode, NewQuery, Node, NodeMetadata,
        NodeSelector, QueryListFilter, QueryTarget, QueryType,
    },
    permissions::{generate_permissions, AccessLevel},
    queries::QueryAction,
    registry::NodeAction,
    store::{
        FlagUpdate, HistorySeed, MemoryStore, NodeLookup, NodeStore, QueryCounter, QueryStore,
    },
};
use pretty_assertions::assert_eq;
use std::{collections::BTreeMap, sync::Arc};
use support::{enroll, memory_engine, node_key, ROOT};

fn target(kind: &str, value: &str) -> QueryTarget {
    QueryTarget::parse(kind, value).unwrap()
}

#[tokio::test]
async fn prod_query_reaches_only_prod_node_once() {
    let engine = memory_engine().await;
    enroll(&engine, "n1", "prod", "web-1").await;
    enroll(&engine, "n2", "staging", "web-2").await;

    let handle = engine
        .create_query(
            ROOT,
            "SELECT * FROM osquery_info;",
            vec![target("environment", "prod")],
            QueryType::Standard,
        )
        .await
        .unwrap();
    assert_eq!(handle.expected, 1);

    let n1 = engine.poll_for_queries(&node_key("n1")).await.unwrap();
    assert_eq!(
        n1,
        BTreeMap::from([(handle.name.clone(), "SELECT * FROM osquery_info;".to_string())])
    );
    assert!(engine.poll_for_queries(&node_key("n2")).await.unwrap().is_empty());

    engine
        .submit_result(&node_key("n1"), &handle.name, 0)
        .await
        .unwrap();
    assert!(engine.poll_for_queries(&node_key("n1")).await.unwrap().is_empty());

    let query = engine.queries().get(&handle.name).await.unwrap();
    assert_eq!(query.expected, 1);
    assert_eq!(query.executions, 1);
    assert_eq!(query.errors, 0);
}

#[tokio::test]
async fn node_sees_query_until_its_result_is_recorded() {
    let engine = memory_engine().await;
    let node = enroll(&engine, "n1", "prod", "web-1").await;
    let handle = engine
        .create_query(ROOT, "SELECT 1;", vec![target("uuid", "n1")], QueryType::Standard)
        .await
        .unwrap();

    for _ in 0..3 {
        let pending = engine.poll_for_queries(&node_key("n1")).await.unwrap();
        assert!(pending.contains_key(&handle.name));
    }

    engine
        .submit_result(&node_key("n1"), &handle.name, 1)
        .await
        .unwrap();
    let err = engine
        .submit_result(&node_key("n1"), &handle.name, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AlreadyRecorded(_)));

    for _ in 0..3 {
        let pending = engine.poll_for_queries(&node_key("n1")).await.unwrap();
        assert!(!pending.contains_key(&handle.name));
    }
    assert!(engine
        .executions()
        .has_executed(&handle.name, &node.uuid)
        .await
        .unwrap());

    let query = engine.queries().get(&handle.name).await.unwrap();
    assert_eq!((query.executions, query.errors), (1, 1));

    let refreshed = engine.registry().get_by_uuid("n1").await.unwrap();
    assert!(refreshed.last_query_read.is_some());
    assert!(refreshed.last_query_write.is_some());
}

#[tokio::test]
async fn overlapping_targets_count_each_node_once() {
    let engine = memory_engine().await;
    enroll(&engine, "n1", "prod", "web-1").await;
    enroll(&engine, "n2", "prod", "web-2").await;
    enroll(&engine, "n3", "dev", "web-3").await;

    let handle = engine
        .create_query(
            ROOT,
            "SELECT 1;",
            vec![
                target("environment", "prod"),
                target("uuid", "N1"),
                target("hostname", "web-2.local"),
                target("platform", "ubuntu"),
            ],
            QueryType::Standard,
        )
        .await
        .unwrap();
    assert_eq!(handle.expected, 3);

    let env_and_member = engine
        .create_query(
            ROOT,
            "SELECT 2;",
            vec![target("environment", "prod"), target("uuid", "n2")],
            QueryType::Standard,
        )
        .await
        .unwrap();
    assert_eq!(env_and_member.expected, 2);
}

#[tokio::test]
async fn duplicate_and_unknown_targets_are_dropped_before_insert() {
    let engine = memory_engine().await;
    enroll(&engine, "n1", "prod", "web-1").await;

    let handle = engine
        .create_query(
            ROOT,
            "SELECT 1;",
            vec![
                target("environment", "prod"),
                target("context", "prod"),
                target("uuid", "does-not-exist"),
                target("platform", "windows"),
            ],
            QueryType::Standard,
        )
        .await
        .unwrap();

    let stored = engine.queries().targets(&handle.name).await.unwrap();
    assert_eq!(stored, vec![target("environment", "prod")]);
}

#[tokio::test]
async fn unknown_target_kind_is_rejected_without_creating_a_query() {
    let err = QueryTarget::parse("subnet", "10.0.0.0/8").unwrap_err();
    assert!(matches!(err, ServiceError::InvalidTarget(_)));

    let engine = memory_engine().await;
    let err = engine
        .create_query(ROOT, "SELECT 1;", Vec::new(), QueryType::Standard)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidTarget(_)));
    assert!(engine
        .queries()
        .gets(QueryListFilter::All)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn archive_and_delete_leaves_a_delete_snapshot() {
    let engine = memory_engine().await;
    enroll(&engine, "n1", "prod", "web-1").await;

    let archived = engine
        .node_action(ROOT, NodeAction::Delete, &["n1".to_string()])
        .await
        .unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].archive_trigger, "delete");
    assert_eq!(archived[0].uuid, "N1");

    let err = engine.registry().get_by_uuid("n1").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(engine.registry().archived("n1").await.unwrap().len(), 1);

    let hostnames = engine
        .registry()
        .history("n1", HistoryKind::Hostname)
        .await
        .unwrap();
    assert_eq!(hostnames.len(), 1);
    assert_eq!(hostnames[0].value, "web-1");
    assert_eq!(
        engine
            .registry()
            .history("n1", HistoryKind::IpAddress)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn archive_keeps_the_node_live() {
    let engine = memory_engine().await;
    enroll(&engine, "n1", "prod", "web-1").await;

    let archived = engine
        .node_action(
            ROOT,
            NodeAction::Archive {
                trigger: "decommission".into(),
            },
            &["N1".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(archived[0].archive_trigger, "decommission");
    assert!(engine.registry().exists_by_uuid("n1").await.unwrap());
}

#[tokio::test]
async fn deleting_a_missing_node_is_not_found() {
    let engine = memory_engine().await;
    let err = engine
        .node_action(ROOT, NodeAction::Delete, &["ghost".to_string()])
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

/// Delegates to a memory store but refuses every archive write.
struct FailingArchive {
    inner: MemoryStore,
}

#[async_trait]
impl NodeStore for FailingArchive {
    async fn insert_node(&self, node: NewNode, seeds: Vec<HistorySeed>) -> Result<Node> {
        self.inner.insert_node(node, seeds).await
    }

    async fn find_node(&self, lookup: &NodeLookup) -> Result<Option<Node>> {
        self.inner.find_node(lookup).await
    }

    async fn find_nodes_by_host(&self, host: &str) -> Result<Vec<Node>> {
        self.inner.find_nodes_by_host(host).await
    }

    async fn list_nodes(
        &self,
        selector: &NodeSelector,
        activity: Activity,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Node>> {
        self.inner.list_nodes(selector, activity, cutoff).await
    }

    async fn count_nodes(
        &self,
        selector: &NodeSelector,
        activity: Activity,
        cutoff: DateTime<Utc>,
    ) -> Result<i64> {
        self.inner.count_nodes(selector, activity, cutoff).await
    }

    async fn platforms(&self) -> Result<Vec<String>> {
        self.inner.platforms().await
    }

    async fn apply_observation(&self, uuid: &str, observed: &NodeMetadata) -> Result<Node> {
        self.inner.apply_observation(uuid, observed).await
    }

    async fn touch_event(&self, uuid: &str, event: LastEvent, at: DateTime<Utc>) -> Result<()> {
        self.inner.touch_event(uuid, event, at).await
    }

    async fn insert_archive(&self, _archive: NewArchivedNode) -> Result<ArchivedNode> {
        Err(ServiceError::Internal(anyhow::anyhow!("archive table unavailable")))
    }

    async fn archived(&self, uuid: &str) -> Result<Vec<ArchivedNode>> {
        self.inner.archived(uuid).await
    }

    async fn delete_node(&self, uuid: &str) -> Result<()> {
        self.inner.delete_node(uuid).await
    }

    async fn history(&self, uuid: &str, kind: HistoryKind) -> Result<Vec<HistoryEntry>> {
        self.inner.history(uuid, kind).await
    }
}

#[tokio::test]
async fn failed_archive_keeps_the_node_live() {
    let shared = Arc::new(MemoryStore::new());
    let engine = FleetEngine::from_parts(
        Arc::new(AppConfig::embedded(support::environments())),
        Arc::new(FailingArchive {
            inner: MemoryStore::new(),
        }),
        shared.clone(),
        shared,
    );
    engine.ensure_admin(ROOT).await.unwrap();
    enroll(&engine, "n1", "prod", "web-1").await;

    let err = engine.registry().archive_and_delete("n1").await.unwrap_err();
    assert!(matches!(err, ServiceError::Internal(_)));
    assert!(engine.registry().exists_by_uuid("n1").await.unwrap());
    assert!(engine.registry().archived("n1").await.unwrap().is_empty());
}

#[tokio::test]
async fn hostname_history_appends_while_ip_history_counts() {
    let engine = memory_engine().await;
    enroll(&engine, "n1", "prod", "h1").await;
    let registry = engine.registry();

    let renamed = NodeMetadata {
        hostname: "h2".into(),
        ..NodeMetadata::default()
    };
    registry.update_attributes("n1", &renamed).await.unwrap();
    registry.update_attributes("n1", &renamed).await.unwrap();

    let hostnames: Vec<String> = registry
        .history("n1", HistoryKind::Hostname)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.value)
        .collect();
    assert_eq!(hostnames, vec!["h1".to_string(), "h2".to_string()]);
    assert_eq!(registry.get_by_uuid("n1").await.unwrap().hostname, "h2");

    let moved = NodeMetadata {
        ip_address: "10.0.0.2".into(),
        ..NodeMetadata::default()
    };
    registry.update_attributes("n1", &moved).await.unwrap();
    registry.update_attributes("n1", &moved).await.unwrap();

    let ips = registry.history("n1", HistoryKind::IpAddress).await.unwrap();
    let counts: Vec<(String, i32)> = ips
        .into_iter()
        .map(|entry| (entry.value, entry.count))
        .collect();
    assert_eq!(
        counts,
        vec![("10.0.0.1".to_string(), 1), ("10.0.0.2".to_string(), 2)]
    );
}

#[tokio::test]
async fn metadata_update_refreshes_status_and_ip_only_updates() {
    let engine = memory_engine().await;
    enroll(&engine, "n1", "prod", "web-1").await;

    let observed = NodeMetadata {
        agent_version: "5.12.1".into(),
        config_hash: "abc123".into(),
        ..NodeMetadata::default()
    };
    let node = engine
        .update_metadata(&node_key("n1"), &observed)
        .await
        .unwrap();
    assert_eq!(node.agent_version, "5.12.1");
    assert_eq!(node.config_hash, "abc123");
    let node = engine.registry().get_by_uuid("n1").await.unwrap();
    assert!(node.last_status.is_some());

    let node = engine
        .update_ip_address(&node_key("n1"), "192.168.1.7")
        .await
        .unwrap();
    assert_eq!(node.ip_address, "192.168.1.7");
}

#[tokio::test]
async fn enrollment_is_idempotent_and_checks_environment() {
    let engine = memory_engine().await;
    let first = enroll(&engine, "n1", "prod", "web-1").await;
    let again = enroll(&engine, "n1", "prod", "renamed").await;
    assert_eq!(first.id, again.id);
    assert_eq!(again.hostname, "web-1");

    let attrs = fleetd::models::NodeAttributes {
        environment: "moon".into(),
        ..Default::default()
    };
    let err = engine.enroll("n9", "key-n9", attrs).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidRequest(_)));
}

#[tokio::test]
async fn lifecycle_listings_partition_live_queries() {
    let engine = memory_engine().await;
    enroll(&engine, "n1", "prod", "web-1").await;
    let mut names = Vec::new();
    for text in ["SELECT 1;", "SELECT 2;", "SELECT 3;"] {
        let handle = engine
            .create_query(ROOT, text, vec![target("environment", "prod")], QueryType::Standard)
            .await
            .unwrap();
        names.push(handle.name);
    }

    engine
        .query_action(ROOT, QueryAction::Complete, &names[1..2])
        .await
        .unwrap();
    engine
        .query_action(ROOT, QueryAction::Delete, &names[2..3])
        .await
        .unwrap();

    let listed = |filter: QueryListFilter| {
        let engine = engine.clone();
        async move {
            engine
                .list_queries(ROOT, filter)
                .await
                .unwrap()
                .into_iter()
                .map(|query| query.name)
                .collect::<Vec<_>>()
        }
    };
    assert_eq!(listed(QueryListFilter::Active).await, vec![names[0].clone()]);
    assert_eq!(listed(QueryListFilter::Completed).await, vec![names[1].clone()]);
    assert_eq!(listed(QueryListFilter::Deleted).await, vec![names[2].clone()]);
    assert_eq!(
        listed(QueryListFilter::All).await,
        vec![names[0].clone(), names[1].clone()]
    );

    let pending = engine.poll_for_queries(&node_key("n1")).await.unwrap();
    assert_eq!(pending.keys().cloned().collect::<Vec<_>>(), vec![names[0].clone()]);

    engine
        .query_action(ROOT, QueryAction::Activate, &names[1..2])
        .await
        .unwrap();
    let pending = engine.poll_for_queries(&node_key("n1")).await.unwrap();
    assert_eq!(pending.len(), 2);
}

#[tokio::test]
async fn query_action_checks_every_name_first() {
    let engine = memory_engine().await;
    enroll(&engine, "n1", "prod", "web-1").await;
    let handle = engine
        .create_query(ROOT, "SELECT 1;", vec![target("environment", "prod")], QueryType::Standard)
        .await
        .unwrap();

    let err = engine
        .query_action(
            ROOT,
            QueryAction::Delete,
            &[handle.name.clone(), "query_missing".to_string()],
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    let query = engine.queries().get(&handle.name).await.unwrap();
    assert!(!query.deleted);
    assert!(query.active);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reports_record_exactly_once() {
    let engine = memory_engine().await;
    enroll(&engine, "n1", "prod", "web-1").await;
    let handle = engine
        .create_query(ROOT, "SELECT 1;", vec![target("uuid", "n1")], QueryType::Standard)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        let name = handle.name.clone();
        tasks.push(tokio::spawn(async move {
            engine.executions().record_result(&name, "N1", 0).await
        }));
    }

    let mut recorded = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => recorded += 1,
            Err(ServiceError::AlreadyRecorded(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(recorded, 1);
    let query = engine.queries().get(&handle.name).await.unwrap();
    assert_eq!(query.executions, 1);
}

#[tokio::test]
async fn operations_are_gated_by_access_level() {
    let engine = memory_engine().await;
    enroll(&engine, "n1", "prod", "web-1").await;
    let analyst = fleetd::models::NewAdminUser {
        username: "analyst".into(),
        ..Default::default()
    };
    engine.add_user(ROOT, analyst).await.unwrap();

    let err = engine
        .create_query("analyst", "SELECT 1;", vec![target("uuid", "n1")], QueryType::Standard)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::PermissionDenied(_)));
    let err = engine.node_stats("analyst", "prod").await.unwrap_err();
    assert!(matches!(err, ServiceError::PermissionDenied(_)));

    let mut permissions = generate_permissions(&["prod", "dev"], false);
    permissions.query = true;
    permissions.environments.insert("prod".into(), true);
    engine
        .set_permissions(ROOT, "analyst", &permissions)
        .await
        .unwrap();

    engine
        .create_query("analyst", "SELECT 1;", vec![target("uuid", "n1")], QueryType::Standard)
        .await
        .unwrap();
    let err = engine
        .create_carve("analyst", "/etc/passwd", vec![target("uuid", "n1")])
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::PermissionDenied(_)));

    let stats = engine.node_stats("analyst", "prod").await.unwrap();
    assert_eq!((stats.total, stats.active, stats.inactive), (1, 1, 0));
    assert!(matches!(
        engine.node_stats("analyst", "dev").await,
        Err(ServiceError::PermissionDenied(_))
    ));

    let err = engine
        .node_action("analyst", NodeAction::Delete, &["n1".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::PermissionDenied(_)));
}

#[tokio::test]
async fn generated_grants_open_every_environment() {
    let engine = memory_engine().await;
    let user = fleetd::models::NewAdminUser {
        username: "ops".into(),
        ..Default::default()
    };
    engine.add_user(ROOT, user).await.unwrap();
    assert!(!engine
        .authorize("ops", AccessLevel::Environment, Some("dev"))
        .await
        .unwrap());

    let granted = generate_permissions(&["prod", "dev"], true);
    engine.set_permissions(ROOT, "ops", &granted).await.unwrap();
    assert!(engine
        .authorize("ops", AccessLevel::Environment, Some("dev"))
        .await
        .unwrap());

    engine.set_admin(ROOT, "ops", true).await.unwrap();
    for level in [
        AccessLevel::Admin,
        AccessLevel::Query,
        AccessLevel::Carve,
        AccessLevel::Environment,
    ] {
        assert!(engine.authorize("ops", level, Some("nowhere")).await.unwrap());
    }
}

#[tokio::test]
async fn carve_queries_carry_their_path() {
    let engine = memory_engine().await;
    enroll(&engine, "n1", "prod", "web-1").await;

    let handle = engine
        .create_carve(ROOT, "/var/log/it's.log", vec![target("localname", "web-1")])
        .await
        .unwrap();
    assert!(handle.name.starts_with("carve_"));
    assert_eq!(handle.expected, 1);

    let query = engine.queries().get(&handle.name).await.unwrap();
    assert_eq!(query.kind().unwrap(), QueryType::Carve);
    assert_eq!(query.path.as_deref(), Some("/var/log/it's.log"));
    assert_eq!(
        query.query,
        "SELECT * FROM carves WHERE carve=1 AND path = '/var/log/it''s.log';"
    );
}

#[tokio::test]
async fn inactive_nodes_fall_out_of_active_listings() {
    let engine = memory_engine().await;
    enroll(&engine, "n1", "prod", "web-1").await;
    let registry = engine.registry();

    let active = registry
        .list_by_environment("prod", Activity::Active, 72)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    let inactive = registry
        .list_by_environment("prod", Activity::Inactive, 72)
        .await
        .unwrap();
    assert!(inactive.is_empty());

    assert_eq!(registry.platforms().await.unwrap(), vec!["ubuntu".to_string()]);
    let stats = registry.stats_by_platform("ubuntu", 72).await.unwrap();
    assert_eq!(stats.total, 1);
}

#[tokio::test]
async fn targets_matching_nothing_create_no_query() {
    let engine = memory_engine().await;
    enroll(&engine, "n1", "prod", "web-1").await;

    let err = engine
        .create_query(
            ROOT,
            "SELECT 1;",
            vec![target("uuid", "ghost"), target("platform", "windows")],
            QueryType::Standard,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidTarget(_)));

    for filter in [QueryListFilter::All, QueryListFilter::Deleted] {
        assert!(engine.queries().gets(filter).await.unwrap().is_empty());
    }
}

/// Delegates to a memory store; standalone target and expected-count writes
/// always fail, and query creation fails when `fail_create` is set.
struct FailingQueryWrites {
    inner: MemoryStore,
    fail_create: bool,
}

fn store_down() -> ServiceError {
    ServiceError::Internal(anyhow::anyhow!("query store unavailable"))
}

#[async_trait]
impl QueryStore for FailingQueryWrites {
    async fn insert_query(&self, query: NewQuery) -> Result<DistributedQuery> {
        self.inner.insert_query(query).await
    }

    async fn insert_query_with_targets(
        &self,
        query: NewQuery,
        targets: &[QueryTarget],
    ) -> Result<DistributedQuery> {
        if self.fail_create {
            return Err(store_down());
        }
        self.inner.insert_query_with_targets(query, targets).await
    }

    async fn get_query(&self, name: &str) -> Result<Option<DistributedQuery>> {
        self.inner.get_query(name).await
    }

    async fn list_queries(&self, filter: QueryListFilter) -> Result<Vec<DistributedQuery>> {
        self.inner.list_queries(filter).await
    }

    async fn insert_targets(&self, _name: &str, _targets: &[QueryTarget]) -> Result<()> {
        Err(store_down())
    }

    async fn targets(&self, name: &str) -> Result<Vec<QueryTarget>> {
        self.inner.targets(name).await
    }

    async fn set_expected(&self, _name: &str, _expected: i32) -> Result<()> {
        Err(store_down())
    }

    async fn set_flags(&self, name: &str, flags: FlagUpdate) -> Result<()> {
        self.inner.set_flags(name, flags).await
    }

    async fn increment_counter(&self, name: &str, counter: QueryCounter) -> Result<()> {
        self.inner.increment_counter(name, counter).await
    }

    async fn record_execution(&self, record: NewExecution) -> Result<bool> {
        self.inner.record_execution(record).await
    }

    async fn has_execution(&self, name: &str, uuid: &str) -> Result<bool> {
        self.inner.has_execution(name, uuid).await
    }

    async fn executions(&self, name: &str) -> Result<Vec<ExecutionRecord>> {
        self.inner.executions(name).await
    }
}

async fn engine_with_query_store(queries: FailingQueryWrites) -> FleetEngine {
    let shared = Arc::new(MemoryStore::new());
    let engine = FleetEngine::from_parts(
        Arc::new(AppConfig::embedded(support::environments())),
        shared.clone(),
        Arc::new(queries),
        shared,
    );
    engine.ensure_admin(ROOT).await.unwrap();
    enroll(&engine, "n1", "prod", "web-1").await;
    engine
}

#[tokio::test]
async fn query_row_and_targets_are_written_together() {
    let engine = engine_with_query_store(FailingQueryWrites {
        inner: MemoryStore::new(),
        fail_create: false,
    })
    .await;

    let handle = engine
        .create_query(ROOT, "SELECT 1;", vec![target("uuid", "n1")], QueryType::Standard)
        .await
        .unwrap();
    let stored = engine.queries().get(&handle.name).await.unwrap();
    assert_eq!(stored.expected, 1);
    assert_eq!(
        engine.queries().targets(&handle.name).await.unwrap(),
        vec![target("uuid", "N1")]
    );
    let pending = engine.poll_for_queries(&node_key("n1")).await.unwrap();
    assert!(pending.contains_key(&handle.name));
}

#[tokio::test]
async fn failed_create_leaves_no_active_query() {
    let engine = engine_with_query_store(FailingQueryWrites {
        inner: MemoryStore::new(),
        fail_create: true,
    })
    .await;

    let err = engine
        .create_query(ROOT, "SELECT 1;", vec![target("uuid", "n1")], QueryType::Standard)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Internal(_)));
    assert!(engine
        .queries()
        .gets(QueryListFilter::Active)
        .await
        .unwrap()
        .is_empty());
    assert!(engine.poll_for_queries(&node_key("n1")).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_counter_bumps_are_not_lost() {
    let engine = memory_engine().await;
    enroll(&engine, "n1", "prod", "web-1").await;
    let handle = engine
        .create_query(ROOT, "SELECT 1;", vec![target("uuid", "n1")], QueryType::Standard)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..32 {
        let engine = engine.clone();
        let name = handle.name.clone();
        tasks.push(tokio::spawn(async move {
            engine.queries().inc_execution(&name).await?;
            if i % 4 == 0 {
                engine.queries().inc_error(&name).await?;
            }
            Ok::<_, ServiceError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let query = engine.queries().get(&handle.name).await.unwrap();
    assert_eq!((query.executions, query.errors), (32, 8));
}

#[tokio::test]
async fn scoped_lookups_respect_environment_and_key() {
    let engine = memory_engine().await;
    enroll(&engine, "n1", "prod", "web-1").await;
    let registry = engine.registry();

    let node = registry.get_by_uuid_env("n1", "prod").await.unwrap();
    assert_eq!(node.uuid, "N1");
    assert!(registry
        .get_by_uuid_env("n1", "dev")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(registry
        .get_by_uuid_env("ghost", "prod")
        .await
        .unwrap_err()
        .is_not_found());

    assert!(registry.exists_by_key(&node_key("n1")).await.unwrap());
    assert!(!registry.exists_by_key("key-ghost").await.unwrap());
}

#[tokio::test]
async fn result_batch_reports_unknown_queries_and_keeps_the_rest() {
    let engine = memory_engine().await;
    enroll(&engine, "n1", "prod", "web-1").await;
    let mut names = Vec::new();
    for text in ["SELECT 1;", "SELECT 2;"] {
        let handle = engine
            .create_query(ROOT, text, vec![target("uuid", "n1")], QueryType::Standard)
            .await
            .unwrap();
        names.push(handle.name);
    }
    engine
        .submit_result(&node_key("n1"), &names[0], 0)
        .await
        .unwrap();

    let statuses = BTreeMap::from([
        (names[0].clone(), 0),
        ("query_gone".to_string(), 0),
        (names[1].clone(), 1),
    ]);
    let report = engine
        .submit_results(&node_key("n1"), &statuses)
        .await
        .unwrap();
    assert_eq!(report.recorded, vec![names[1].clone()]);
    assert_eq!(report.duplicates, vec![names[0].clone()]);
    assert_eq!(report.unknown, vec!["query_gone".to_string()]);

    let second = engine.queries().get(&names[1]).await.unwrap();
    assert_eq!((second.executions, second.errors), (1, 1));
    assert!(engine
        .submit_results("key-ghost", &statuses)
        .await
        .unwrap_err()
        .is_not_found());
}
