//! Mutex-guarded store used by tests and by embedders that run without Postgres.

use super::{FlagUpdate, HistorySeed, NodeLookup, NodeStore, QueryCounter, QueryStore, UserStore};
use crate::{
    error::{Result, ServiceError},
    models::{
        Activity, AdminUser, ArchivedNode, DistributedQuery, ExecutionRecord, HistoryEntry,
        HistoryKind, LastEvent, NewAdminUser, NewArchivedNode, NewExecution, NewNode, NewQuery,
        Node, NodeMetadata, NodeSelector, QueryListFilter, QueryTarget,
    },
    permissions::Permissions,
    registry::{plan_observation, HistoryChange},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

#[derive(Default)]
struct Tables {
    next_id: i64,
    nodes: Vec<Node>,
    archived: Vec<ArchivedNode>,
    history: HashMap<HistoryKind, Vec<HistoryEntry>>,
    queries: Vec<DistributedQuery>,
    targets: HashMap<String, Vec<QueryTarget>>,
    executions: Vec<ExecutionRecord>,
    users: Vec<AdminUser>,
}

impl Tables {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn node_mut(&mut self, uuid: &str) -> Result<&mut Node> {
        self.nodes
            .iter_mut()
            .find(|node| node.uuid == uuid)
            .ok_or_else(|| ServiceError::NotFound(format!("node {uuid}")))
    }

    fn query_mut(&mut self, name: &str) -> Result<&mut DistributedQuery> {
        self.queries
            .iter_mut()
            .find(|query| query.name == name)
            .ok_or_else(|| ServiceError::NotFound(format!("query {name}")))
    }

    fn user_mut(&mut self, username: &str) -> Result<&mut AdminUser> {
        self.users
            .iter_mut()
            .find(|user| user.username == username)
            .ok_or_else(|| ServiceError::NotFound(format!("user {username}")))
    }

    fn push_history(&mut self, uuid: &str, kind: HistoryKind, value: String, count: i32) {
        let now = Utc::now();
        let id = self.id();
        self.history.entry(kind).or_default().push(HistoryEntry {
            id,
            uuid: uuid.to_string(),
            value,
            count,
            created_at: now,
            updated_at: now,
        });
    }

    fn bump_history(&mut self, uuid: &str, kind: HistoryKind, value: String) {
        let entries = self.history.entry(kind).or_default();
        if let Some(entry) = entries
            .iter_mut()
            .rev()
            .find(|entry| entry.uuid == uuid && entry.value == value)
        {
            entry.count += 1;
            entry.updated_at = Utc::now();
            return;
        }
        self.push_history(uuid, kind, value, 1);
    }
}

fn selected<'a>(
    nodes: &'a [Node],
    selector: &'a NodeSelector,
    activity: Activity,
    cutoff: DateTime<Utc>,
) -> impl Iterator<Item = &'a Node> + 'a {
    nodes
        .iter()
        .filter(move |node| selector.admits(node) && activity.admits(node.updated_at, cutoff))
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn insert_node(&self, node: NewNode, seeds: Vec<HistorySeed>) -> Result<Node> {
        let mut tables = self.tables.lock();
        if tables
            .nodes
            .iter()
            .any(|existing| existing.node_key == node.node_key || existing.uuid == node.uuid)
        {
            return Err(ServiceError::AlreadyExists(format!("node {}", node.uuid)));
        }

        let now = Utc::now();
        let record = Node {
            id: tables.id(),
            node_key: node.node_key,
            uuid: node.uuid,
            platform: node.platform,
            platform_version: node.platform_version,
            agent_version: node.agent_version,
            hostname: node.hostname,
            localname: node.localname,
            ip_address: node.ip_address,
            username: node.username,
            agent_user: node.agent_user,
            environment: node.environment,
            cpu: node.cpu,
            memory: node.memory,
            hardware_serial: node.hardware_serial,
            daemon_hash: node.daemon_hash,
            config_hash: node.config_hash,
            raw_enrollment: node.raw_enrollment,
            last_status: None,
            last_result: None,
            last_config: None,
            last_query_read: None,
            last_query_write: None,
            created_at: now,
            updated_at: now,
        };
        for seed in seeds {
            tables.push_history(&record.uuid, seed.kind, seed.value, seed.count);
        }
        tables.nodes.push(record.clone());
        Ok(record)
    }

    async fn find_node(&self, lookup: &NodeLookup) -> Result<Option<Node>> {
        let tables = self.tables.lock();
        let found = tables.nodes.iter().find(|node| match lookup {
            NodeLookup::Key(key) => node.node_key == *key,
            NodeLookup::Uuid(uuid) => node.uuid == *uuid,
        });
        Ok(found.cloned())
    }

    async fn find_nodes_by_host(&self, host: &str) -> Result<Vec<Node>> {
        let tables = self.tables.lock();
        Ok(tables
            .nodes
            .iter()
            .filter(|node| node.hostname == host || node.localname == host)
            .cloned()
            .collect())
    }

    async fn list_nodes(
        &self,
        selector: &NodeSelector,
        activity: Activity,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Node>> {
        let tables = self.tables.lock();
        Ok(selected(&tables.nodes, selector, activity, cutoff)
            .cloned()
            .collect())
    }

    async fn count_nodes(
        &self,
        selector: &NodeSelector,
        activity: Activity,
        cutoff: DateTime<Utc>,
    ) -> Result<i64> {
        let tables = self.tables.lock();
        Ok(selected(&tables.nodes, selector, activity, cutoff).count() as i64)
    }

    async fn platforms(&self) -> Result<Vec<String>> {
        let tables = self.tables.lock();
        let platforms: BTreeSet<String> = tables
            .nodes
            .iter()
            .map(|node| node.platform.clone())
            .collect();
        Ok(platforms.into_iter().collect())
    }

    async fn apply_observation(&self, uuid: &str, observed: &NodeMetadata) -> Result<Node> {
        let mut tables = self.tables.lock();
        let update = {
            let node = tables.node_mut(uuid)?;
            let update = plan_observation(node, observed);
            update.apply_to(node);
            node.updated_at = Utc::now();
            update
        };
        for change in update.history {
            match change {
                HistoryChange::Append { kind, value, count } => {
                    tables.push_history(uuid, kind, value, count)
                }
                HistoryChange::Increment { kind, value } => tables.bump_history(uuid, kind, value),
            }
        }
        Ok(tables.node_mut(uuid)?.clone())
    }

    async fn touch_event(&self, uuid: &str, event: LastEvent, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock();
        let node = tables.node_mut(uuid)?;
        let slot = match event {
            LastEvent::Status => &mut node.last_status,
            LastEvent::Result => &mut node.last_result,
            LastEvent::Config => &mut node.last_config,
            LastEvent::QueryRead => &mut node.last_query_read,
            LastEvent::QueryWrite => &mut node.last_query_write,
        };
        *slot = Some(at);
        node.updated_at = at;
        Ok(())
    }

    async fn insert_archive(&self, archive: NewArchivedNode) -> Result<ArchivedNode> {
        let mut tables = self.tables.lock();
        let record = ArchivedNode {
            id: tables.id(),
            archive_trigger: archive.archive_trigger,
            node_key: archive.node_key,
            uuid: archive.uuid,
            platform: archive.platform,
            platform_version: archive.platform_version,
            agent_version: archive.agent_version,
            hostname: archive.hostname,
            localname: archive.localname,
            ip_address: archive.ip_address,
            username: archive.username,
            agent_user: archive.agent_user,
            environment: archive.environment,
            cpu: archive.cpu,
            memory: archive.memory,
            hardware_serial: archive.hardware_serial,
            daemon_hash: archive.daemon_hash,
            config_hash: archive.config_hash,
            raw_enrollment: archive.raw_enrollment,
            last_status: archive.last_status,
            last_result: archive.last_result,
            last_config: archive.last_config,
            last_query_read: archive.last_query_read,
            last_query_write: archive.last_query_write,
            enrolled_at: archive.enrolled_at,
            archived_at: archive.archived_at,
        };
        tables.archived.push(record.clone());
        Ok(record)
    }

    async fn archived(&self, uuid: &str) -> Result<Vec<ArchivedNode>> {
        let tables = self.tables.lock();
        Ok(tables
            .archived
            .iter()
            .filter(|archive| archive.uuid == uuid)
            .cloned()
            .collect())
    }

    async fn delete_node(&self, uuid: &str) -> Result<()> {
        let mut tables = self.tables.lock();
        let before = tables.nodes.len();
        tables.nodes.retain(|node| node.uuid != uuid);
        if tables.nodes.len() == before {
            return Err(ServiceError::NotFound(format!("node {uuid}")));
        }
        Ok(())
    }

    async fn history(&self, uuid: &str, kind: HistoryKind) -> Result<Vec<HistoryEntry>> {
        let tables = self.tables.lock();
        Ok(tables
            .history
            .get(&kind)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.uuid == uuid)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl QueryStore for MemoryStore {
    async fn insert_query(&self, query: NewQuery) -> Result<DistributedQuery> {
        self.insert_query_with_targets(query, &[]).await
    }

    async fn insert_query_with_targets(
        &self,
        query: NewQuery,
        targets: &[QueryTarget],
    ) -> Result<DistributedQuery> {
        let mut tables = self.tables.lock();
        if tables.queries.iter().any(|existing| existing.name == query.name) {
            return Err(ServiceError::AlreadyExists(format!("query {}", query.name)));
        }
        let now = Utc::now();
        let record = DistributedQuery {
            id: tables.id(),
            name: query.name,
            creator: query.creator,
            query: query.query,
            executions: 0,
            errors: 0,
            expected: query.expected,
            active: query.active,
            completed: query.completed,
            deleted: query.deleted,
            repeat_interval: query.repeat_interval,
            query_type: query.query_type,
            path: query.path,
            created_at: now,
            updated_at: now,
        };
        if !targets.is_empty() {
            tables
                .targets
                .entry(record.name.clone())
                .or_default()
                .extend_from_slice(targets);
        }
        tables.queries.push(record.clone());
        Ok(record)
    }

    async fn get_query(&self, name: &str) -> Result<Option<DistributedQuery>> {
        let tables = self.tables.lock();
        Ok(tables.queries.iter().find(|query| query.name == name).cloned())
    }

    async fn list_queries(&self, filter: QueryListFilter) -> Result<Vec<DistributedQuery>> {
        let tables = self.tables.lock();
        Ok(tables
            .queries
            .iter()
            .filter(|query| filter.admits(query))
            .cloned()
            .collect())
    }

    async fn insert_targets(&self, name: &str, targets: &[QueryTarget]) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.query_mut(name)?;
        tables
            .targets
            .entry(name.to_string())
            .or_default()
            .extend_from_slice(targets);
        Ok(())
    }

    async fn targets(&self, name: &str) -> Result<Vec<QueryTarget>> {
        let tables = self.tables.lock();
        Ok(tables.targets.get(name).cloned().unwrap_or_default())
    }

    async fn set_expected(&self, name: &str, expected: i32) -> Result<()> {
        let mut tables = self.tables.lock();
        let query = tables.query_mut(name)?;
        query.expected = expected;
        query.updated_at = Utc::now();
        Ok(())
    }

    async fn set_flags(&self, name: &str, flags: FlagUpdate) -> Result<()> {
        let mut tables = self.tables.lock();
        let query = tables.query_mut(name)?;
        if let Some(active) = flags.active {
            query.active = active;
        }
        if let Some(completed) = flags.completed {
            query.completed = completed;
        }
        if let Some(deleted) = flags.deleted {
            query.deleted = deleted;
        }
        query.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_counter(&self, name: &str, counter: QueryCounter) -> Result<()> {
        let mut tables = self.tables.lock();
        let query = tables.query_mut(name)?;
        match counter {
            QueryCounter::Executions => query.executions += 1,
            QueryCounter::Errors => query.errors += 1,
        }
        Ok(())
    }

    async fn record_execution(&self, record: NewExecution) -> Result<bool> {
        let mut tables = self.tables.lock();
        if tables
            .executions
            .iter()
            .any(|existing| existing.name == record.name && existing.uuid == record.uuid)
        {
            return Ok(false);
        }
        let is_error = record.result != 0;
        let query = tables.query_mut(&record.name)?;
        query.executions += 1;
        if is_error {
            query.errors += 1;
        }
        let id = tables.id();
        tables.executions.push(ExecutionRecord {
            id,
            name: record.name,
            uuid: record.uuid,
            result: record.result,
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn has_execution(&self, name: &str, uuid: &str) -> Result<bool> {
        let tables = self.tables.lock();
        Ok(tables
            .executions
            .iter()
            .any(|record| record.name == name && record.uuid == uuid))
    }

    async fn executions(&self, name: &str) -> Result<Vec<ExecutionRecord>> {
        let tables = self.tables.lock();
        Ok(tables
            .executions
            .iter()
            .filter(|record| record.name == name)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn insert_user(&self, user: NewAdminUser) -> Result<AdminUser> {
        let mut tables = self.tables.lock();
        if tables.users.iter().any(|existing| existing.username == user.username) {
            return Err(ServiceError::AlreadyExists(format!("user {}", user.username)));
        }
        let now = Utc::now();
        let record = AdminUser {
            id: tables.id(),
            username: user.username,
            email: user.email,
            fullname: user.fullname,
            admin: user.admin,
            permissions: user.permissions,
            created_at: now,
            updated_at: now,
        };
        tables.users.push(record.clone());
        Ok(record)
    }

    async fn get_user(&self, username: &str) -> Result<Option<AdminUser>> {
        let tables = self.tables.lock();
        Ok(tables.users.iter().find(|user| user.username == username).cloned())
    }

    async fn list_users(&self) -> Result<Vec<AdminUser>> {
        Ok(self.tables.lock().users.clone())
    }

    async fn set_admin(
        &self,
        username: &str,
        admin: bool,
        permissions: &Permissions,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        let user = tables.user_mut(username)?;
        user.admin = admin;
        user.permissions = permissions.clone();
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn set_permissions(&self, username: &str, permissions: &Permissions) -> Result<()> {
        let mut tables = self.tables.lock();
        let user = tables.user_mut(username)?;
        user.permissions = permissions.clone();
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> Result<()> {
        let mut tables = self.tables.lock();
        let before = tables.users.len();
        tables.users.retain(|user| user.username != username);
        if tables.users.len() == before {
            return Err(ServiceError::NotFound(format!("user {username}")));
        }
        Ok(())
    }
}
