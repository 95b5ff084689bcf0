//! Per-node execution records and the aggregate counters they drive.

use crate::{
    error::{Result, ServiceError},
    models::{normalize_uuid, NewExecution},
    store::QueryStore,
};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct ExecutionTracker {
    store: Arc<dyn QueryStore>,
}

impl ExecutionTracker {
    pub fn new(store: Arc<dyn QueryStore>) -> Self {
        Self { store }
    }

    /// Records that `uuid` ran query `name`. The record and the counter bumps
    /// land in one store operation, so a repeat report never double-counts.
    pub async fn record_result(&self, name: &str, uuid: &str, result: i32) -> Result<()> {
        if self.store.get_query(name).await?.is_none() {
            return Err(ServiceError::NotFound(format!("query {name}")));
        }

        let uuid = normalize_uuid(uuid);
        let record = NewExecution {
            name: name.to_string(),
            uuid: uuid.clone(),
            result,
        };
        if !self.store.record_execution(record).await? {
            debug!(name, uuid = %uuid, "duplicate execution report");
            return Err(ServiceError::AlreadyRecorded(format!(
                "query {name} already executed by {uuid}"
            )));
        }

        info!(name, uuid = %uuid, result, "execution recorded");
        Ok(())
    }

    pub async fn has_executed(&self, name: &str, uuid: &str) -> Result<bool> {
        self.store.has_execution(name, &normalize_uuid(uuid)).await
    }
}
