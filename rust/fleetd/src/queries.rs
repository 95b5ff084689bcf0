//! Distributed query store: creation, targets and lifecycle.

use crate::{
    error::{Result, ServiceError},
    models::{DistributedQuery, ExecutionRecord, NewQuery, QueryListFilter, QueryTarget},
    store::{FlagUpdate, QueryCounter, QueryStore},
};
use std::{str::FromStr, sync::Arc};
use tracing::info;
use uuid::Uuid;

/// Lifecycle transitions an administrator can request for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryAction {
    Activate,
    Complete,
    Delete,
}

impl QueryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryAction::Activate => "activate",
            QueryAction::Complete => "complete",
            QueryAction::Delete => "delete",
        }
    }

    pub fn flags(&self) -> FlagUpdate {
        match self {
            QueryAction::Activate => FlagUpdate {
                active: Some(true),
                completed: Some(false),
                deleted: None,
            },
            QueryAction::Complete => FlagUpdate {
                active: Some(false),
                completed: Some(true),
                deleted: None,
            },
            QueryAction::Delete => FlagUpdate {
                active: Some(false),
                completed: None,
                deleted: Some(true),
            },
        }
    }
}

impl FromStr for QueryAction {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "activate" => Ok(QueryAction::Activate),
            "complete" => Ok(QueryAction::Complete),
            "delete" => Ok(QueryAction::Delete),
            other => Err(ServiceError::InvalidAction(format!(
                "unknown query action '{other}'"
            ))),
        }
    }
}

pub fn generate_query_name() -> String {
    format!("query_{}", Uuid::new_v4().simple())
}

pub fn generate_carve_name() -> String {
    format!("carve_{}", Uuid::new_v4().simple())
}

/// Query text that asks an agent to carve the file at `path`.
pub fn carve_query(path: &str) -> String {
    format!(
        "SELECT * FROM carves WHERE carve=1 AND path = '{}';",
        path.replace('\'', "''")
    )
}

#[derive(Clone)]
pub struct QueryManager {
    store: Arc<dyn QueryStore>,
}

impl QueryManager {
    pub fn new(store: Arc<dyn QueryStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, query: NewQuery) -> Result<DistributedQuery> {
        self.create_with_targets(query, &[]).await
    }

    /// Stores the query together with its targets; nothing is written if
    /// either part fails.
    pub async fn create_with_targets(
        &self,
        query: NewQuery,
        targets: &[QueryTarget],
    ) -> Result<DistributedQuery> {
        if query.active && query.completed {
            return Err(ServiceError::InvalidRequest(format!(
                "query {} cannot be both active and completed",
                query.name
            )));
        }
        if query.name.trim().is_empty() || query.query.trim().is_empty() {
            return Err(ServiceError::InvalidRequest(
                "query requires a name and text".into(),
            ));
        }
        let created = self.store.insert_query_with_targets(query, targets).await?;
        info!(
            name = %created.name,
            creator = %created.creator,
            kind = %created.query_type,
            targets = targets.len(),
            "query created"
        );
        Ok(created)
    }

    pub async fn create_target(&self, name: &str, target: QueryTarget) -> Result<()> {
        self.store.insert_targets(name, &[target]).await
    }

    pub async fn create_targets(&self, name: &str, targets: &[QueryTarget]) -> Result<()> {
        self.store.insert_targets(name, targets).await
    }

    pub async fn set_expected(&self, name: &str, expected: usize) -> Result<()> {
        let expected = i32::try_from(expected).map_err(|_| {
            ServiceError::InvalidRequest(format!("expected count {expected} out of range"))
        })?;
        self.store.set_expected(name, expected).await
    }

    pub async fn apply(&self, name: &str, action: QueryAction) -> Result<()> {
        self.store.set_flags(name, action.flags()).await?;
        info!(name, action = action.as_str(), "query lifecycle updated");
        Ok(())
    }

    pub async fn activate(&self, name: &str) -> Result<()> {
        self.apply(name, QueryAction::Activate).await
    }

    pub async fn complete(&self, name: &str) -> Result<()> {
        self.apply(name, QueryAction::Complete).await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.apply(name, QueryAction::Delete).await
    }

    pub async fn inc_execution(&self, name: &str) -> Result<()> {
        self.store
            .increment_counter(name, QueryCounter::Executions)
            .await
    }

    pub async fn inc_error(&self, name: &str) -> Result<()> {
        self.store.increment_counter(name, QueryCounter::Errors).await
    }

    pub async fn get(&self, name: &str) -> Result<DistributedQuery> {
        self.store
            .get_query(name)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("query {name}")))
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.store.get_query(name).await?.is_some())
    }

    pub async fn gets(&self, filter: QueryListFilter) -> Result<Vec<DistributedQuery>> {
        self.store.list_queries(filter).await
    }

    pub async fn targets(&self, name: &str) -> Result<Vec<QueryTarget>> {
        self.store.targets(name).await
    }

    pub async fn executions(&self, name: &str) -> Result<Vec<ExecutionRecord>> {
        self.store.executions(name).await
    }
}
