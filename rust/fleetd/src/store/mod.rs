//! Persistence seams for the registry, query store and user records.
//!
//! Two implementations ship with the crate: [`PgStore`] over the diesel-async
//! pool and [`MemoryStore`] for tests and embedders. Every method that the
//! engine relies on for atomicity (observation updates, query creation,
//! execution recording, counter increments) is a single store call so each backend can make it
//! atomic in its own way.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::{
    error::Result,
    models::{
        Activity, AdminUser, ArchivedNode, DistributedQuery, ExecutionRecord, HistoryEntry,
        HistoryKind, LastEvent, NewAdminUser, NewArchivedNode, NewExecution, NewNode, NewQuery,
        Node, NodeMetadata, NodeSelector, QueryListFilter, QueryTarget,
    },
    permissions::Permissions,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeLookup {
    Key(String),
    Uuid(String),
}

/// History row written alongside a freshly enrolled node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistorySeed {
    pub kind: HistoryKind,
    pub value: String,
    pub count: i32,
}

/// Flag columns touched by a lifecycle transition. `None` leaves a flag alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagUpdate {
    pub active: Option<bool>,
    pub completed: Option<bool>,
    pub deleted: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryCounter {
    Executions,
    Errors,
}

#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Inserts the node and its seed history together. Fails with
    /// `AlreadyExists` when the key or UUID is taken.
    async fn insert_node(&self, node: NewNode, seeds: Vec<HistorySeed>) -> Result<Node>;

    async fn find_node(&self, lookup: &NodeLookup) -> Result<Option<Node>>;

    /// Nodes whose hostname or localname equals `host`.
    async fn find_nodes_by_host(&self, host: &str) -> Result<Vec<Node>>;

    async fn list_nodes(
        &self,
        selector: &NodeSelector,
        activity: Activity,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Node>>;

    async fn count_nodes(
        &self,
        selector: &NodeSelector,
        activity: Activity,
        cutoff: DateTime<Utc>,
    ) -> Result<i64>;

    async fn platforms(&self) -> Result<Vec<String>>;

    /// Applies `registry::plan_observation` to the current row while holding
    /// the node exclusively, so concurrent polls for one node serialize.
    async fn apply_observation(&self, uuid: &str, observed: &NodeMetadata) -> Result<Node>;

    async fn touch_event(&self, uuid: &str, event: LastEvent, at: DateTime<Utc>) -> Result<()>;

    async fn insert_archive(&self, archive: NewArchivedNode) -> Result<ArchivedNode>;

    async fn archived(&self, uuid: &str) -> Result<Vec<ArchivedNode>>;

    /// Hard delete of the live row. History rows are kept. `NotFound` if absent.
    async fn delete_node(&self, uuid: &str) -> Result<()>;

    async fn history(&self, uuid: &str, kind: HistoryKind) -> Result<Vec<HistoryEntry>>;
}

#[async_trait]
pub trait QueryStore: Send + Sync {
    /// `AlreadyExists` when the name is taken.
    async fn insert_query(&self, query: NewQuery) -> Result<DistributedQuery>;

    /// Inserts the query row and its targets as one unit: either both are
    /// stored or neither is.
    async fn insert_query_with_targets(
        &self,
        query: NewQuery,
        targets: &[QueryTarget],
    ) -> Result<DistributedQuery>;

    async fn get_query(&self, name: &str) -> Result<Option<DistributedQuery>>;

    async fn list_queries(&self, filter: QueryListFilter) -> Result<Vec<DistributedQuery>>;

    async fn insert_targets(&self, name: &str, targets: &[QueryTarget]) -> Result<()>;

    async fn targets(&self, name: &str) -> Result<Vec<QueryTarget>>;

    async fn set_expected(&self, name: &str, expected: i32) -> Result<()>;

    async fn set_flags(&self, name: &str, flags: FlagUpdate) -> Result<()>;

    /// Atomic `+1` on one counter. `NotFound` if the query is absent.
    async fn increment_counter(&self, name: &str, counter: QueryCounter) -> Result<()>;

    /// Inserts the record unless one exists for (name, uuid) and, only when it
    /// was inserted, bumps `executions` (and `errors` for a non-zero result).
    /// Returns whether the record was inserted.
    async fn record_execution(&self, record: NewExecution) -> Result<bool>;

    async fn has_execution(&self, name: &str, uuid: &str) -> Result<bool>;

    async fn executions(&self, name: &str) -> Result<Vec<ExecutionRecord>>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// `AlreadyExists` when the username is taken.
    async fn insert_user(&self, user: NewAdminUser) -> Result<AdminUser>;

    async fn get_user(&self, username: &str) -> Result<Option<AdminUser>>;

    async fn list_users(&self) -> Result<Vec<AdminUser>>;

    /// Sets the admin flag and overwrites permissions in one write.
    async fn set_admin(&self, username: &str, admin: bool, permissions: &Permissions)
        -> Result<()>;

    async fn set_permissions(&self, username: &str, permissions: &Permissions) -> Result<()>;

    async fn delete_user(&self, username: &str) -> Result<()>;
}

/// Convenience bound for a backend that serves all three seams.
pub trait FleetStore: NodeStore + QueryStore + UserStore {}

impl<T> FleetStore for T where T: NodeStore + QueryStore + UserStore {}
