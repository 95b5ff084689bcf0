//! Diesel-async backend over the shared bb8 pool.

use super::{FlagUpdate, HistorySeed, NodeLookup, NodeStore, QueryCounter, QueryStore, UserStore};
use crate::{
    db::{PgConnectionManager, PgPool},
    error::{Result, ServiceError},
    models::{
        Activity, AdminUser, ArchivedNode, DistributedQuery, ExecutionRecord, HistoryEntry,
        HistoryKind, LastEvent, NewAdminUser, NewArchivedNode, NewExecution, NewNode, NewQuery,
        NewTarget, Node, NodeMetadata, NodeSelector, QueryListFilter, QueryTarget, TargetRow,
    },
    permissions::Permissions,
    registry::{plan_observation, AttributeUpdate, HistoryChange},
    schema::{
        admin_users, archived_nodes, distributed_queries, distributed_query_executions,
        distributed_query_targets, nodes,
    },
};
use async_trait::async_trait;
use bb8::PooledConnection;
use chrono::{DateTime, Utc};
use diesel::{
    dsl::count_star,
    pg::Pg,
    prelude::*,
    result::{DatabaseErrorKind, Error as DieselError},
    sql_types::Bool,
};
use diesel_async::{scoped_futures::ScopedFutureExt, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::error;

/// Runs `$body` with `$h` bound to the schema module of the history table for `$kind`.
macro_rules! on_history_table {
    ($kind:expr, |$h:ident| $body:expr) => {
        match $kind {
            HistoryKind::Hostname => {
                use crate::schema::node_history_hostname as $h;
                $body
            }
            HistoryKind::Localname => {
                use crate::schema::node_history_localname as $h;
                $body
            }
            HistoryKind::IpAddress => {
                use crate::schema::node_history_ipaddress as $h;
                $body
            }
            HistoryKind::Username => {
                use crate::schema::node_history_username as $h;
                $body
            }
        }
    };
}

type NodeFilter = Box<dyn BoxableExpression<nodes::table, Pg, SqlType = Bool>>;

fn node_filters(selector: &NodeSelector, activity: Activity, cutoff: DateTime<Utc>) -> Vec<NodeFilter> {
    let mut filters: Vec<NodeFilter> = Vec::new();
    match selector {
        NodeSelector::All => {}
        NodeSelector::Environment(env) => filters.push(Box::new(nodes::environment.eq(env.clone()))),
        NodeSelector::Platform(platform) => {
            filters.push(Box::new(nodes::platform.eq(platform.clone())))
        }
    }
    match activity {
        Activity::All => {}
        Activity::Active => filters.push(Box::new(nodes::updated_at.gt(cutoff))),
        Activity::Inactive => filters.push(Box::new(nodes::updated_at.lt(cutoff))),
    }
    filters
}

fn unique_violation(err: DieselError, what: impl FnOnce() -> String) -> ServiceError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
            ServiceError::AlreadyExists(what())
        }
        other => other.into(),
    }
}

fn target_rows(name: &str, targets: &[QueryTarget]) -> Vec<NewTarget> {
    targets
        .iter()
        .map(|target| NewTarget {
            name: name.to_string(),
            target_type: target.kind.as_str().to_string(),
            value: target.value.clone(),
        })
        .collect()
}

#[derive(AsChangeset)]
#[diesel(table_name = nodes)]
struct NodeChanges {
    hostname: Option<String>,
    localname: Option<String>,
    ip_address: Option<String>,
    username: Option<String>,
    agent_user: Option<String>,
    agent_version: Option<String>,
    config_hash: Option<String>,
    daemon_hash: Option<String>,
    updated_at: DateTime<Utc>,
}

impl NodeChanges {
    fn from_update(update: &AttributeUpdate, now: DateTime<Utc>) -> Self {
        Self {
            hostname: update.hostname.clone(),
            localname: update.localname.clone(),
            ip_address: update.ip_address.clone(),
            username: update.username.clone(),
            agent_user: update.agent_user.clone(),
            agent_version: update.agent_version.clone(),
            config_hash: update.config_hash.clone(),
            daemon_hash: update.daemon_hash.clone(),
            updated_at: now,
        }
    }
}

#[derive(AsChangeset)]
#[diesel(table_name = distributed_queries)]
struct QueryFlags {
    active: Option<bool>,
    completed: Option<bool>,
    deleted: Option<bool>,
    updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = admin_users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct UserRow {
    id: i64,
    username: String,
    email: String,
    fullname: String,
    admin: bool,
    permissions: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for AdminUser {
    type Error = ServiceError;

    fn try_from(row: UserRow) -> Result<Self> {
        let permissions: Permissions =
            serde_json::from_value(row.permissions).map_err(ServiceError::storage)?;
        Ok(AdminUser {
            id: row.id,
            username: row.username,
            email: row.email,
            fullname: row.fullname,
            admin: row.admin,
            permissions,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn permissions_json(permissions: &Permissions) -> Result<serde_json::Value> {
    serde_json::to_value(permissions).map_err(ServiceError::storage)
}

async fn insert_history(
    conn: &mut AsyncPgConnection,
    uuid: &str,
    kind: HistoryKind,
    value: &str,
    count: i32,
) -> Result<()> {
    on_history_table!(kind, |h| {
        diesel::insert_into(h::table)
            .values((h::uuid.eq(uuid), h::value.eq(value), h::count.eq(count)))
            .execute(conn)
            .await?;
    });
    Ok(())
}

async fn bump_history(
    conn: &mut AsyncPgConnection,
    uuid: &str,
    kind: HistoryKind,
    value: &str,
) -> Result<()> {
    let now = Utc::now();
    on_history_table!(kind, |h| {
        let latest: Option<i64> = h::table
            .filter(h::uuid.eq(uuid))
            .filter(h::value.eq(value))
            .order(h::id.desc())
            .select(h::id)
            .first(conn)
            .await
            .optional()?;
        match latest {
            Some(id) => {
                diesel::update(h::table.filter(h::id.eq(id)))
                    .set((h::count.eq(h::count + 1), h::updated_at.eq(now)))
                    .execute(conn)
                    .await?;
            }
            None => insert_history(conn, uuid, kind, value, 1).await?,
        }
    });
    Ok(())
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PooledConnection<'_, PgConnectionManager>> {
        self.pool.get().await.map_err(|err| {
            error!(error = ?err, "failed to acquire database connection");
            ServiceError::Internal(anyhow::anyhow!("{err:?}"))
        })
    }
}

#[async_trait]
impl NodeStore for PgStore {
    async fn insert_node(&self, node: NewNode, seeds: Vec<HistorySeed>) -> Result<Node> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, ServiceError, _>(|conn| {
            async move {
                let uuid = node.uuid.clone();
                let record = diesel::insert_into(nodes::table)
                    .values(&node)
                    .returning(Node::as_returning())
                    .get_result(conn)
                    .await
                    .map_err(|err| unique_violation(err, || format!("node {uuid}")))?;
                for seed in seeds {
                    insert_history(conn, &record.uuid, seed.kind, &seed.value, seed.count).await?;
                }
                Ok(record)
            }
            .scope_boxed()
        })
        .await
    }

    async fn find_node(&self, lookup: &NodeLookup) -> Result<Option<Node>> {
        let mut conn = self.conn().await?;
        let query = nodes::table.select(Node::as_select()).into_boxed();
        let query = match lookup {
            NodeLookup::Key(key) => query.filter(nodes::node_key.eq(key.clone())),
            NodeLookup::Uuid(uuid) => query.filter(nodes::uuid.eq(uuid.clone())),
        };
        Ok(query.first(&mut *conn).await.optional()?)
    }

    async fn find_nodes_by_host(&self, host: &str) -> Result<Vec<Node>> {
        let mut conn = self.conn().await?;
        Ok(nodes::table
            .filter(nodes::hostname.eq(host).or(nodes::localname.eq(host)))
            .select(Node::as_select())
            .order(nodes::id.asc())
            .load(&mut *conn)
            .await?)
    }

    async fn list_nodes(
        &self,
        selector: &NodeSelector,
        activity: Activity,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Node>> {
        let mut conn = self.conn().await?;
        let mut query = nodes::table
            .select(Node::as_select())
            .order(nodes::id.asc())
            .into_boxed();
        for filter in node_filters(selector, activity, cutoff) {
            query = query.filter(filter);
        }
        Ok(query.load(&mut *conn).await?)
    }

    async fn count_nodes(
        &self,
        selector: &NodeSelector,
        activity: Activity,
        cutoff: DateTime<Utc>,
    ) -> Result<i64> {
        let mut conn = self.conn().await?;
        let mut query = nodes::table.select(count_star()).into_boxed();
        for filter in node_filters(selector, activity, cutoff) {
            query = query.filter(filter);
        }
        Ok(query.get_result(&mut *conn).await?)
    }

    async fn platforms(&self) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(nodes::table
            .select(nodes::platform)
            .distinct()
            .order(nodes::platform.asc())
            .load(&mut *conn)
            .await?)
    }

    async fn apply_observation(&self, uuid: &str, observed: &NodeMetadata) -> Result<Node> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, ServiceError, _>(|conn| {
            async move {
                let current: Node = nodes::table
                    .filter(nodes::uuid.eq(uuid))
                    .select(Node::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?
                    .ok_or_else(|| ServiceError::NotFound(format!("node {uuid}")))?;

                let update = plan_observation(&current, observed);
                let changes = NodeChanges::from_update(&update, Utc::now());
                let node = diesel::update(nodes::table.filter(nodes::id.eq(current.id)))
                    .set(&changes)
                    .returning(Node::as_returning())
                    .get_result(conn)
                    .await?;

                for change in update.history {
                    match change {
                        HistoryChange::Append { kind, value, count } => {
                            insert_history(conn, uuid, kind, &value, count).await?
                        }
                        HistoryChange::Increment { kind, value } => {
                            bump_history(conn, uuid, kind, &value).await?
                        }
                    }
                }
                Ok(node)
            }
            .scope_boxed()
        })
        .await
    }

    async fn touch_event(&self, uuid: &str, event: LastEvent, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn().await?;
        let target = nodes::table.filter(nodes::uuid.eq(uuid));
        let stamp = Some(at);
        let updated = match event {
            LastEvent::Status => {
                diesel::update(target)
                    .set((nodes::last_status.eq(stamp), nodes::updated_at.eq(at)))
                    .execute(&mut *conn)
                    .await?
            }
            LastEvent::Result => {
                diesel::update(target)
                    .set((nodes::last_result.eq(stamp), nodes::updated_at.eq(at)))
                    .execute(&mut *conn)
                    .await?
            }
            LastEvent::Config => {
                diesel::update(target)
                    .set((nodes::last_config.eq(stamp), nodes::updated_at.eq(at)))
                    .execute(&mut *conn)
                    .await?
            }
            LastEvent::QueryRead => {
                diesel::update(target)
                    .set((nodes::last_query_read.eq(stamp), nodes::updated_at.eq(at)))
                    .execute(&mut *conn)
                    .await?
            }
            LastEvent::QueryWrite => {
                diesel::update(target)
                    .set((nodes::last_query_write.eq(stamp), nodes::updated_at.eq(at)))
                    .execute(&mut *conn)
                    .await?
            }
        };
        if updated == 0 {
            return Err(ServiceError::NotFound(format!("node {uuid}")));
        }
        Ok(())
    }

    async fn insert_archive(&self, archive: NewArchivedNode) -> Result<ArchivedNode> {
        let mut conn = self.conn().await?;
        Ok(diesel::insert_into(archived_nodes::table)
            .values(&archive)
            .returning(ArchivedNode::as_returning())
            .get_result(&mut *conn)
            .await?)
    }

    async fn archived(&self, uuid: &str) -> Result<Vec<ArchivedNode>> {
        let mut conn = self.conn().await?;
        Ok(archived_nodes::table
            .filter(archived_nodes::uuid.eq(uuid))
            .select(ArchivedNode::as_select())
            .order(archived_nodes::id.asc())
            .load(&mut *conn)
            .await?)
    }

    async fn delete_node(&self, uuid: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(nodes::table.filter(nodes::uuid.eq(uuid)))
            .execute(&mut *conn)
            .await?;
        if deleted == 0 {
            return Err(ServiceError::NotFound(format!("node {uuid}")));
        }
        Ok(())
    }

    async fn history(&self, uuid: &str, kind: HistoryKind) -> Result<Vec<HistoryEntry>> {
        let mut conn = self.conn().await?;
        let entries = on_history_table!(kind, |h| {
            h::table
                .filter(h::uuid.eq(uuid))
                .order(h::id.asc())
                .load::<HistoryEntry>(&mut *conn)
                .await?
        });
        Ok(entries)
    }
}

#[async_trait]
impl QueryStore for PgStore {
    async fn insert_query(&self, query: NewQuery) -> Result<DistributedQuery> {
        let mut conn = self.conn().await?;
        let name = query.name.clone();
        diesel::insert_into(distributed_queries::table)
            .values(&query)
            .returning(DistributedQuery::as_returning())
            .get_result(&mut *conn)
            .await
            .map_err(|err| unique_violation(err, || format!("query {name}")))
    }

    async fn insert_query_with_targets(
        &self,
        query: NewQuery,
        targets: &[QueryTarget],
    ) -> Result<DistributedQuery> {
        let rows = target_rows(&query.name, targets);
        let mut conn = self.conn().await?;
        conn.transaction::<_, ServiceError, _>(|conn| {
            async move {
                let name = query.name.clone();
                let created = diesel::insert_into(distributed_queries::table)
                    .values(&query)
                    .returning(DistributedQuery::as_returning())
                    .get_result(conn)
                    .await
                    .map_err(|err| unique_violation(err, || format!("query {name}")))?;
                if !rows.is_empty() {
                    diesel::insert_into(distributed_query_targets::table)
                        .values(&rows)
                        .execute(conn)
                        .await?;
                }
                Ok(created)
            }
            .scope_boxed()
        })
        .await
    }

    async fn get_query(&self, name: &str) -> Result<Option<DistributedQuery>> {
        let mut conn = self.conn().await?;
        Ok(distributed_queries::table
            .filter(distributed_queries::name.eq(name))
            .select(DistributedQuery::as_select())
            .first(&mut *conn)
            .await
            .optional()?)
    }

    async fn list_queries(&self, filter: QueryListFilter) -> Result<Vec<DistributedQuery>> {
        use crate::schema::distributed_queries::dsl::{active, completed, deleted, id};

        let mut conn = self.conn().await?;
        let query = distributed_queries::table
            .select(DistributedQuery::as_select())
            .order(id.asc())
            .into_boxed();
        let query = match filter {
            QueryListFilter::Active => query
                .filter(active.eq(true))
                .filter(completed.eq(false))
                .filter(deleted.eq(false)),
            QueryListFilter::Completed => query
                .filter(active.eq(false))
                .filter(completed.eq(true))
                .filter(deleted.eq(false)),
            QueryListFilter::All => query.filter(deleted.eq(false)),
            QueryListFilter::Deleted => query.filter(deleted.eq(true)),
        };
        Ok(query.load(&mut *conn).await?)
    }

    async fn insert_targets(&self, name: &str, targets: &[QueryTarget]) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let rows = target_rows(name, targets);
        let mut conn = self.conn().await?;
        diesel::insert_into(distributed_query_targets::table)
            .values(&rows)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn targets(&self, name: &str) -> Result<Vec<QueryTarget>> {
        let mut conn = self.conn().await?;
        let rows: Vec<TargetRow> = distributed_query_targets::table
            .filter(distributed_query_targets::name.eq(name))
            .order(distributed_query_targets::id.asc())
            .load(&mut *conn)
            .await?;
        rows.into_iter().map(QueryTarget::try_from).collect()
    }

    async fn set_expected(&self, name: &str, expected: i32) -> Result<()> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            distributed_queries::table.filter(distributed_queries::name.eq(name)),
        )
        .set((
            distributed_queries::expected.eq(expected),
            distributed_queries::updated_at.eq(Utc::now()),
        ))
        .execute(&mut *conn)
        .await?;
        if updated == 0 {
            return Err(ServiceError::NotFound(format!("query {name}")));
        }
        Ok(())
    }

    async fn set_flags(&self, name: &str, flags: FlagUpdate) -> Result<()> {
        let mut conn = self.conn().await?;
        let changes = QueryFlags {
            active: flags.active,
            completed: flags.completed,
            deleted: flags.deleted,
            updated_at: Utc::now(),
        };
        let updated = diesel::update(
            distributed_queries::table.filter(distributed_queries::name.eq(name)),
        )
        .set(&changes)
        .execute(&mut *conn)
        .await?;
        if updated == 0 {
            return Err(ServiceError::NotFound(format!("query {name}")));
        }
        Ok(())
    }

    async fn increment_counter(&self, name: &str, counter: QueryCounter) -> Result<()> {
        use crate::schema::distributed_queries::dsl::{errors, executions};

        let mut conn = self.conn().await?;
        let target = distributed_queries::table.filter(distributed_queries::name.eq(name));
        let updated = match counter {
            QueryCounter::Executions => {
                diesel::update(target)
                    .set(executions.eq(executions + 1))
                    .execute(&mut *conn)
                    .await?
            }
            QueryCounter::Errors => {
                diesel::update(target)
                    .set(errors.eq(errors + 1))
                    .execute(&mut *conn)
                    .await?
            }
        };
        if updated == 0 {
            return Err(ServiceError::NotFound(format!("query {name}")));
        }
        Ok(())
    }

    async fn record_execution(&self, record: NewExecution) -> Result<bool> {
        use crate::schema::distributed_queries::dsl::{errors, executions};

        let mut conn = self.conn().await?;
        conn.transaction::<_, ServiceError, _>(|conn| {
            async move {
                let inserted = diesel::insert_into(distributed_query_executions::table)
                    .values(&record)
                    .on_conflict((
                        distributed_query_executions::name,
                        distributed_query_executions::uuid,
                    ))
                    .do_nothing()
                    .execute(conn)
                    .await?;
                if inserted == 0 {
                    return Ok(false);
                }

                let error_bump = i32::from(record.result != 0);
                let updated = diesel::update(
                    distributed_queries::table.filter(distributed_queries::name.eq(&record.name)),
                )
                .set((
                    executions.eq(executions + 1),
                    errors.eq(errors + error_bump),
                ))
                .execute(conn)
                .await?;
                if updated == 0 {
                    return Err(ServiceError::NotFound(format!("query {}", record.name)));
                }
                Ok(true)
            }
            .scope_boxed()
        })
        .await
    }

    async fn has_execution(&self, name: &str, uuid: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let count: i64 = distributed_query_executions::table
            .filter(distributed_query_executions::name.eq(name))
            .filter(distributed_query_executions::uuid.eq(uuid))
            .count()
            .get_result(&mut *conn)
            .await?;
        Ok(count > 0)
    }

    async fn executions(&self, name: &str) -> Result<Vec<ExecutionRecord>> {
        let mut conn = self.conn().await?;
        Ok(distributed_query_executions::table
            .filter(distributed_query_executions::name.eq(name))
            .select(ExecutionRecord::as_select())
            .order(distributed_query_executions::id.asc())
            .load(&mut *conn)
            .await?)
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn insert_user(&self, user: NewAdminUser) -> Result<AdminUser> {
        let permissions = permissions_json(&user.permissions)?;
        let mut conn = self.conn().await?;
        let row: UserRow = diesel::insert_into(admin_users::table)
            .values((
                admin_users::username.eq(&user.username),
                admin_users::email.eq(&user.email),
                admin_users::fullname.eq(&user.fullname),
                admin_users::admin.eq(user.admin),
                admin_users::permissions.eq(permissions),
            ))
            .returning(UserRow::as_returning())
            .get_result(&mut *conn)
            .await
            .map_err(|err| unique_violation(err, || format!("user {}", user.username)))?;
        row.try_into()
    }

    async fn get_user(&self, username: &str) -> Result<Option<AdminUser>> {
        let mut conn = self.conn().await?;
        let row: Option<UserRow> = admin_users::table
            .filter(admin_users::username.eq(username))
            .select(UserRow::as_select())
            .first(&mut *conn)
            .await
            .optional()?;
        row.map(AdminUser::try_from).transpose()
    }

    async fn list_users(&self) -> Result<Vec<AdminUser>> {
        let mut conn = self.conn().await?;
        let rows: Vec<UserRow> = admin_users::table
            .select(UserRow::as_select())
            .order(admin_users::id.asc())
            .load(&mut *conn)
            .await?;
        rows.into_iter().map(AdminUser::try_from).collect()
    }

    async fn set_admin(
        &self,
        username: &str,
        admin: bool,
        permissions: &Permissions,
    ) -> Result<()> {
        let permissions = permissions_json(permissions)?;
        let mut conn = self.conn().await?;
        let updated = diesel::update(admin_users::table.filter(admin_users::username.eq(username)))
            .set((
                admin_users::admin.eq(admin),
                admin_users::permissions.eq(permissions),
                admin_users::updated_at.eq(Utc::now()),
            ))
            .execute(&mut *conn)
            .await?;
        if updated == 0 {
            return Err(ServiceError::NotFound(format!("user {username}")));
        }
        Ok(())
    }

    async fn set_permissions(&self, username: &str, permissions: &Permissions) -> Result<()> {
        let permissions = permissions_json(permissions)?;
        let mut conn = self.conn().await?;
        let updated = diesel::update(admin_users::table.filter(admin_users::username.eq(username)))
            .set((
                admin_users::permissions.eq(permissions),
                admin_users::updated_at.eq(Utc::now()),
            ))
            .execute(&mut *conn)
            .await?;
        if updated == 0 {
            return Err(ServiceError::NotFound(format!("user {username}")));
        }
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(admin_users::table.filter(admin_users::username.eq(username)))
            .execute(&mut *conn)
            .await?;
        if deleted == 0 {
            return Err(ServiceError::NotFound(format!("user {username}")));
        }
        Ok(())
    }
}
