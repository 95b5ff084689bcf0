//! Data models for enrolled nodes, distributed queries and admin users.

use crate::{
    error::{Result, ServiceError},
    permissions::Permissions,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Enrolled node as stored in the registry.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::nodes)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Node {
    pub id: i64,
    pub node_key: String,
    pub uuid: String,
    pub platform: String,
    pub platform_version: String,
    pub agent_version: String,
    pub hostname: String,
    pub localname: String,
    pub ip_address: String,
    pub username: String,
    pub agent_user: String,
    pub environment: String,
    pub cpu: String,
    pub memory: String,
    pub hardware_serial: String,
    pub daemon_hash: String,
    pub config_hash: String,
    pub raw_enrollment: Option<serde_json::Value>,
    pub last_status: Option<DateTime<Utc>>,
    pub last_result: Option<DateTime<Utc>>,
    pub last_config: Option<DateTime<Utc>>,
    pub last_query_read: Option<DateTime<Utc>>,
    pub last_query_write: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Attributes reported by an agent when it enrolls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeAttributes {
    pub platform: String,
    pub platform_version: String,
    pub agent_version: String,
    pub hostname: String,
    pub localname: String,
    pub ip_address: String,
    pub username: String,
    pub agent_user: String,
    pub environment: String,
    pub cpu: String,
    pub memory: String,
    pub hardware_serial: String,
    pub daemon_hash: String,
    pub config_hash: String,
    pub raw_enrollment: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::nodes)]
pub struct NewNode {
    pub node_key: String,
    pub uuid: String,
    pub platform: String,
    pub platform_version: String,
    pub agent_version: String,
    pub hostname: String,
    pub localname: String,
    pub ip_address: String,
    pub username: String,
    pub agent_user: String,
    pub environment: String,
    pub cpu: String,
    pub memory: String,
    pub hardware_serial: String,
    pub daemon_hash: String,
    pub config_hash: String,
    pub raw_enrollment: Option<serde_json::Value>,
}

impl NewNode {
    pub fn from_attributes(uuid: &str, node_key: &str, attrs: NodeAttributes) -> Self {
        Self {
            node_key: normalize_node_key(node_key),
            uuid: normalize_uuid(uuid),
            platform: attrs.platform,
            platform_version: attrs.platform_version,
            agent_version: attrs.agent_version,
            hostname: attrs.hostname,
            localname: attrs.localname,
            ip_address: attrs.ip_address,
            username: attrs.username,
            agent_user: attrs.agent_user,
            environment: attrs.environment,
            cpu: attrs.cpu,
            memory: attrs.memory,
            hardware_serial: attrs.hardware_serial,
            daemon_hash: attrs.daemon_hash,
            config_hash: attrs.config_hash,
            raw_enrollment: attrs.raw_enrollment,
        }
    }
}

/// Values observed on a poll. Empty strings mean "not reported".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMetadata {
    pub hostname: String,
    pub localname: String,
    pub ip_address: String,
    pub username: String,
    pub agent_user: String,
    pub agent_version: String,
    pub config_hash: String,
    pub daemon_hash: String,
}

pub fn normalize_uuid(uuid: &str) -> String {
    uuid.trim().to_uppercase()
}

pub fn normalize_node_key(node_key: &str) -> String {
    node_key.trim().to_lowercase()
}

/// Immutable snapshot of a node taken before it leaves the registry.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::archived_nodes)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ArchivedNode {
    pub id: i64,
    #[serde(rename = "trigger")]
    pub archive_trigger: String,
    pub node_key: String,
    pub uuid: String,
    pub platform: String,
    pub platform_version: String,
    pub agent_version: String,
    pub hostname: String,
    pub localname: String,
    pub ip_address: String,
    pub username: String,
    pub agent_user: String,
    pub environment: String,
    pub cpu: String,
    pub memory: String,
    pub hardware_serial: String,
    pub daemon_hash: String,
    pub config_hash: String,
    pub raw_enrollment: Option<serde_json::Value>,
    pub last_status: Option<DateTime<Utc>>,
    pub last_result: Option<DateTime<Utc>>,
    pub last_config: Option<DateTime<Utc>>,
    pub last_query_read: Option<DateTime<Utc>>,
    pub last_query_write: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::archived_nodes)]
pub struct NewArchivedNode {
    pub archive_trigger: String,
    pub node_key: String,
    pub uuid: String,
    pub platform: String,
    pub platform_version: String,
    pub agent_version: String,
    pub hostname: String,
    pub localname: String,
    pub ip_address: String,
    pub username: String,
    pub agent_user: String,
    pub environment: String,
    pub cpu: String,
    pub memory: String,
    pub hardware_serial: String,
    pub daemon_hash: String,
    pub config_hash: String,
    pub raw_enrollment: Option<serde_json::Value>,
    pub last_status: Option<DateTime<Utc>>,
    pub last_result: Option<DateTime<Utc>>,
    pub last_config: Option<DateTime<Utc>>,
    pub last_query_read: Option<DateTime<Utc>>,
    pub last_query_write: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
}

impl NewArchivedNode {
    pub fn snapshot(node: &Node, trigger: &str, archived_at: DateTime<Utc>) -> Self {
        Self {
            archive_trigger: trigger.to_string(),
            node_key: node.node_key.clone(),
            uuid: node.uuid.clone(),
            platform: node.platform.clone(),
            platform_version: node.platform_version.clone(),
            agent_version: node.agent_version.clone(),
            hostname: node.hostname.clone(),
            localname: node.localname.clone(),
            ip_address: node.ip_address.clone(),
            username: node.username.clone(),
            agent_user: node.agent_user.clone(),
            environment: node.environment.clone(),
            cpu: node.cpu.clone(),
            memory: node.memory.clone(),
            hardware_serial: node.hardware_serial.clone(),
            daemon_hash: node.daemon_hash.clone(),
            config_hash: node.config_hash.clone(),
            raw_enrollment: node.raw_enrollment.clone(),
            last_status: node.last_status,
            last_result: node.last_result,
            last_config: node.last_config,
            last_query_read: node.last_query_read,
            last_query_write: node.last_query_write,
            enrolled_at: node.created_at,
            archived_at,
        }
    }
}

/// Tracked node attributes with an append-only history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Hostname,
    Localname,
    IpAddress,
    Username,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryKind::Hostname => "hostname",
            HistoryKind::Localname => "localname",
            HistoryKind::IpAddress => "ip_address",
            HistoryKind::Username => "username",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub uuid: String,
    pub value: String,
    pub count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Last-event timestamps refreshed by node traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastEvent {
    Status,
    Result,
    Config,
    QueryRead,
    QueryWrite,
}

/// Activity window applied to node listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    #[default]
    All,
    Active,
    Inactive,
}

impl Activity {
    pub fn admits(&self, updated_at: DateTime<Utc>, cutoff: DateTime<Utc>) -> bool {
        match self {
            Activity::All => true,
            Activity::Active => updated_at > cutoff,
            Activity::Inactive => updated_at < cutoff,
        }
    }
}

impl FromStr for Activity {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "all" => Ok(Activity::All),
            "active" => Ok(Activity::Active),
            "inactive" => Ok(Activity::Inactive),
            other => Err(ServiceError::InvalidRequest(format!(
                "unknown node activity filter '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSelector {
    All,
    Environment(String),
    Platform(String),
}

impl NodeSelector {
    pub fn admits(&self, node: &Node) -> bool {
        match self {
            NodeSelector::All => true,
            NodeSelector::Environment(env) => node.environment == *env,
            NodeSelector::Platform(platform) => node.platform == *platform,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsData {
    pub total: i64,
    pub active: i64,
    pub inactive: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    #[serde(rename = "query")]
    Standard,
    Carve,
    Metadata,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Standard => "query",
            QueryType::Carve => "carve",
            QueryType::Metadata => "metadata",
        }
    }
}

impl FromStr for QueryType {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "query" | "standard" => Ok(QueryType::Standard),
            "carve" => Ok(QueryType::Carve),
            "metadata" => Ok(QueryType::Metadata),
            other => Err(ServiceError::InvalidRequest(format!(
                "unknown query type '{other}'"
            ))),
        }
    }
}

/// Administrator-issued on-demand query.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::distributed_queries)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DistributedQuery {
    pub id: i64,
    pub name: String,
    pub creator: String,
    pub query: String,
    pub executions: i32,
    pub errors: i32,
    pub expected: i32,
    pub active: bool,
    pub completed: bool,
    pub deleted: bool,
    pub repeat_interval: i32,
    #[serde(rename = "type")]
    pub query_type: String,
    pub path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle position derived from the stored flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Active,
    Completed,
    Inactive,
    Deleted,
}

impl DistributedQuery {
    pub fn state(&self) -> QueryState {
        match (self.deleted, self.active, self.completed) {
            (true, _, _) => QueryState::Deleted,
            (false, true, false) => QueryState::Active,
            (false, false, true) => QueryState::Completed,
            _ => QueryState::Inactive,
        }
    }

    pub fn kind(&self) -> Result<QueryType> {
        self.query_type.parse()
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::distributed_queries)]
pub struct NewQuery {
    pub name: String,
    pub creator: String,
    pub query: String,
    pub expected: i32,
    pub active: bool,
    pub completed: bool,
    pub deleted: bool,
    pub repeat_interval: i32,
    pub query_type: String,
    pub path: Option<String>,
}

impl NewQuery {
    /// A query ready to be served: active, not completed, no expected count yet.
    pub fn ready(name: String, creator: &str, text: &str, kind: QueryType) -> Self {
        Self {
            name,
            creator: creator.to_string(),
            query: text.to_string(),
            expected: 0,
            active: true,
            completed: false,
            deleted: false,
            repeat_interval: 0,
            query_type: kind.as_str().to_string(),
            path: None,
        }
    }
}

/// Listing views over the query table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryListFilter {
    #[default]
    Active,
    Completed,
    All,
    Deleted,
}

impl QueryListFilter {
    pub fn admits(&self, query: &DistributedQuery) -> bool {
        match self {
            QueryListFilter::Active => query.active && !query.completed && !query.deleted,
            QueryListFilter::Completed => !query.active && query.completed && !query.deleted,
            QueryListFilter::All => !query.deleted,
            QueryListFilter::Deleted => query.deleted,
        }
    }
}

impl FromStr for QueryListFilter {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "active" => Ok(QueryListFilter::Active),
            "completed" => Ok(QueryListFilter::Completed),
            "all" => Ok(QueryListFilter::All),
            "deleted" => Ok(QueryListFilter::Deleted),
            other => Err(ServiceError::InvalidRequest(format!(
                "unknown query listing '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Environment,
    Platform,
    Uuid,
    Localname,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Environment => "environment",
            TargetKind::Platform => "platform",
            TargetKind::Uuid => "uuid",
            TargetKind::Localname => "localname",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "environment" | "context" => Ok(TargetKind::Environment),
            "platform" => Ok(TargetKind::Platform),
            "uuid" => Ok(TargetKind::Uuid),
            "localname" | "hostname" => Ok(TargetKind::Localname),
            other => Err(ServiceError::InvalidTarget(format!(
                "unknown target kind '{other}'"
            ))),
        }
    }
}

/// One (kind, value) predicate of a query target set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryTarget {
    pub kind: TargetKind,
    pub value: String,
}

impl QueryTarget {
    pub fn new(kind: TargetKind, value: impl Into<String>) -> Result<Self> {
        let value = value.into().trim().to_string();
        if value.is_empty() {
            return Err(ServiceError::InvalidTarget(format!(
                "{kind} target requires a value"
            )));
        }
        let value = match kind {
            TargetKind::Uuid => normalize_uuid(&value),
            _ => value,
        };
        Ok(Self { kind, value })
    }

    pub fn parse(kind: &str, value: &str) -> Result<Self> {
        Self::new(kind.parse()?, value)
    }
}

#[derive(Debug, Clone, PartialEq, Queryable)]
pub struct TargetRow {
    pub id: i64,
    pub name: String,
    pub target_type: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TargetRow> for QueryTarget {
    type Error = ServiceError;

    fn try_from(row: TargetRow) -> Result<Self> {
        QueryTarget::parse(&row.target_type, &row.value)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::distributed_query_targets)]
pub struct NewTarget {
    pub name: String,
    pub target_type: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::distributed_query_executions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ExecutionRecord {
    pub id: i64,
    pub name: String,
    pub uuid: String,
    pub result: i32,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn is_error(&self) -> bool {
        self.result != 0
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::distributed_query_executions)]
pub struct NewExecution {
    pub name: String,
    pub uuid: String,
    pub result: i32,
}

/// Administrator account as seen by the permission evaluator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdminUser {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub fullname: String,
    pub admin: bool,
    pub permissions: Permissions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NewAdminUser {
    pub username: String,
    pub email: String,
    pub fullname: String,
    pub admin: bool,
    #[serde(skip)]
    pub permissions: Permissions,
}
