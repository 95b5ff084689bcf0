//! Resolves which active queries apply to a node, and how many nodes a target
//! set reaches.

use crate::{
    error::Result,
    models::{Activity, Node, QueryListFilter, QueryTarget, TargetKind},
    registry::NodeRegistry,
    store::QueryStore,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::debug;

/// True when any target selects the node. Targets are OR-ed together.
pub fn matches(node: &Node, targets: &[QueryTarget]) -> bool {
    targets.iter().any(|target| match target.kind {
        TargetKind::Uuid => node.uuid == target.value,
        TargetKind::Environment => node.environment == target.value,
        TargetKind::Platform => node.platform == target.value,
        TargetKind::Localname => node.hostname == target.value || node.localname == target.value,
    })
}

#[derive(Clone)]
pub struct TargetingResolver {
    queries: Arc<dyn QueryStore>,
    registry: NodeRegistry,
}

impl TargetingResolver {
    pub fn new(queries: Arc<dyn QueryStore>, registry: NodeRegistry) -> Self {
        Self { queries, registry }
    }

    /// Active queries targeting `node` that it has not executed yet, keyed by
    /// query name.
    pub async fn node_queries(&self, node: &Node) -> Result<BTreeMap<String, String>> {
        let mut pending = BTreeMap::new();
        for query in self.queries.list_queries(QueryListFilter::Active).await? {
            let targets = self.queries.targets(&query.name).await?;
            if !matches(node, &targets) {
                continue;
            }
            if self.queries.has_execution(&query.name, &node.uuid).await? {
                continue;
            }
            pending.insert(query.name, query.query);
        }
        debug!(uuid = %node.uuid, pending = pending.len(), "resolved node queries");
        Ok(pending)
    }

    /// Size of the union of node UUIDs selected by `targets`. Environment and
    /// platform targets count active nodes only.
    pub async fn expected_count(
        &self,
        targets: &[QueryTarget],
        inactive_hours: i64,
    ) -> Result<usize> {
        let mut uuids = BTreeSet::new();
        for target in targets {
            match target.kind {
                TargetKind::Environment => {
                    let nodes = self
                        .registry
                        .list_by_environment(&target.value, Activity::Active, inactive_hours)
                        .await?;
                    uuids.extend(nodes.into_iter().map(|node| node.uuid));
                }
                TargetKind::Platform => {
                    let nodes = self
                        .registry
                        .list_by_platform(&target.value, Activity::Active, inactive_hours)
                        .await?;
                    uuids.extend(nodes.into_iter().map(|node| node.uuid));
                }
                TargetKind::Uuid => {
                    if self.registry.exists_by_uuid(&target.value).await? {
                        uuids.insert(target.value.clone());
                    }
                }
                TargetKind::Localname => {
                    let nodes = self.registry.find_by_host(&target.value).await?;
                    uuids.extend(nodes.into_iter().map(|node| node.uuid));
                }
            }
        }
        Ok(uuids.len())
    }
}
