//! Node registry: enrollment, attribute history, archival and fleet listings.

use crate::{
    error::{Result, ServiceError},
    models::{
        normalize_node_key, normalize_uuid, Activity, ArchivedNode, HistoryEntry, HistoryKind,
        LastEvent, NewArchivedNode, NewNode, Node, NodeAttributes, NodeMetadata, NodeSelector,
        StatsData,
    },
    store::{HistorySeed, NodeLookup, NodeStore},
};
use chrono::{DateTime, Duration, Utc};
use std::{str::FromStr, sync::Arc};
use tracing::{debug, info};

pub const DELETE_TRIGGER: &str = "delete";

/// A history write produced by comparing an observation with the stored node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryChange {
    Append {
        kind: HistoryKind,
        value: String,
        count: i32,
    },
    /// Bump the most recent entry holding `value`, or start one at 1.
    Increment { kind: HistoryKind, value: String },
}

/// Column updates and history writes for one observation. `None` fields are
/// left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeUpdate {
    pub hostname: Option<String>,
    pub localname: Option<String>,
    pub ip_address: Option<String>,
    pub username: Option<String>,
    pub agent_user: Option<String>,
    pub agent_version: Option<String>,
    pub config_hash: Option<String>,
    pub daemon_hash: Option<String>,
    pub history: Vec<HistoryChange>,
}

impl AttributeUpdate {
    pub fn apply_to(&self, node: &mut Node) {
        let fields = [
            (&self.hostname, &mut node.hostname),
            (&self.localname, &mut node.localname),
            (&self.ip_address, &mut node.ip_address),
            (&self.username, &mut node.username),
            (&self.agent_user, &mut node.agent_user),
            (&self.agent_version, &mut node.agent_version),
            (&self.config_hash, &mut node.config_hash),
            (&self.daemon_hash, &mut node.daemon_hash),
        ];
        for (update, slot) in fields {
            if let Some(value) = update {
                *slot = value.clone();
            }
        }
    }
}

fn changed(observed: &str, stored: &str) -> Option<String> {
    if !observed.is_empty() && observed != stored {
        Some(observed.to_string())
    } else {
        None
    }
}

/// Compares an observation against the stored node.
///
/// Hostname, localname and username form a pure change log: a differing value
/// is stored and appended, an unchanged one writes nothing. IP addresses also
/// count repeat sightings: an unchanged address bumps its history count.
pub fn plan_observation(node: &Node, observed: &NodeMetadata) -> AttributeUpdate {
    let mut update = AttributeUpdate {
        hostname: changed(&observed.hostname, &node.hostname),
        localname: changed(&observed.localname, &node.localname),
        ip_address: changed(&observed.ip_address, &node.ip_address),
        username: changed(&observed.username, &node.username),
        agent_user: changed(&observed.agent_user, &node.agent_user),
        agent_version: changed(&observed.agent_version, &node.agent_version),
        config_hash: changed(&observed.config_hash, &node.config_hash),
        daemon_hash: changed(&observed.daemon_hash, &node.daemon_hash),
        history: Vec::new(),
    };

    let logged = [
        (HistoryKind::Username, &update.username),
        (HistoryKind::Hostname, &update.hostname),
        (HistoryKind::Localname, &update.localname),
    ];
    for (kind, value) in logged {
        if let Some(value) = value {
            update.history.push(HistoryChange::Append {
                kind,
                value: value.clone(),
                count: 0,
            });
        }
    }

    match &update.ip_address {
        Some(ip) => update.history.push(HistoryChange::Append {
            kind: HistoryKind::IpAddress,
            value: ip.clone(),
            count: 1,
        }),
        None if !observed.ip_address.is_empty() => {
            update.history.push(HistoryChange::Increment {
                kind: HistoryKind::IpAddress,
                value: observed.ip_address.clone(),
            })
        }
        None => {}
    }

    update
}

fn seed_history(node: &NewNode) -> Vec<HistorySeed> {
    vec![
        HistorySeed {
            kind: HistoryKind::Hostname,
            value: node.hostname.clone(),
            count: 0,
        },
        HistorySeed {
            kind: HistoryKind::Localname,
            value: node.localname.clone(),
            count: 0,
        },
        HistorySeed {
            kind: HistoryKind::IpAddress,
            value: node.ip_address.clone(),
            count: 1,
        },
        HistorySeed {
            kind: HistoryKind::Username,
            value: node.username.clone(),
            count: 0,
        },
    ]
}

/// Bulk action an administrator can apply to a set of nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAction {
    Delete,
    Archive { trigger: String },
}

impl FromStr for NodeAction {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "delete" => Ok(NodeAction::Delete),
            "archive" => Ok(NodeAction::Archive {
                trigger: "archive".to_string(),
            }),
            other => Err(ServiceError::InvalidAction(format!(
                "unknown node action '{other}'"
            ))),
        }
    }
}

#[derive(Clone)]
pub struct NodeRegistry {
    store: Arc<dyn NodeStore>,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self { store }
    }

    /// Returns the node already enrolled under `node_key`, or enrolls a new one
    /// with seed history for each tracked attribute.
    pub async fn enroll_or_get(
        &self,
        uuid: &str,
        node_key: &str,
        attrs: NodeAttributes,
    ) -> Result<Node> {
        let key = normalize_node_key(node_key);
        if key.is_empty() || normalize_uuid(uuid).is_empty() {
            return Err(ServiceError::InvalidRequest(
                "enrollment requires a uuid and node_key".into(),
            ));
        }
        if let Some(existing) = self.store.find_node(&NodeLookup::Key(key)).await? {
            debug!(uuid = %existing.uuid, "node already enrolled");
            return Ok(existing);
        }

        let node = NewNode::from_attributes(uuid, node_key, attrs);
        let seeds = seed_history(&node);
        let node = self.store.insert_node(node, seeds).await?;
        info!(uuid = %node.uuid, environment = %node.environment, platform = %node.platform, "node enrolled");
        Ok(node)
    }

    pub async fn update_attributes(&self, uuid: &str, observed: &NodeMetadata) -> Result<Node> {
        self.store
            .apply_observation(&normalize_uuid(uuid), observed)
            .await
    }

    /// IP-only observation, as reported alongside log submissions.
    pub async fn update_ip_address(&self, uuid: &str, ip_address: &str) -> Result<Node> {
        let observed = NodeMetadata {
            ip_address: ip_address.to_string(),
            ..NodeMetadata::default()
        };
        self.update_attributes(uuid, &observed).await
    }

    pub async fn archive(&self, uuid: &str, trigger: &str) -> Result<ArchivedNode> {
        let node = self.get_by_uuid(uuid).await?;
        let archived = self
            .store
            .insert_archive(NewArchivedNode::snapshot(&node, trigger, Utc::now()))
            .await?;
        info!(uuid = %node.uuid, trigger, "node archived");
        Ok(archived)
    }

    /// Archives with the `delete` trigger and only then removes the live row.
    pub async fn archive_and_delete(&self, uuid: &str) -> Result<ArchivedNode> {
        let archived = self.archive(uuid, DELETE_TRIGGER).await?;
        self.store.delete_node(&archived.uuid).await?;
        info!(uuid = %archived.uuid, "node deleted");
        Ok(archived)
    }

    pub async fn archived(&self, uuid: &str) -> Result<Vec<ArchivedNode>> {
        self.store.archived(&normalize_uuid(uuid)).await
    }

    pub async fn get_by_key(&self, node_key: &str) -> Result<Node> {
        let key = normalize_node_key(node_key);
        self.store
            .find_node(&NodeLookup::Key(key))
            .await?
            .ok_or_else(|| ServiceError::NotFound("node with the provided node_key".into()))
    }

    pub async fn get_by_uuid(&self, uuid: &str) -> Result<Node> {
        let uuid = normalize_uuid(uuid);
        self.store
            .find_node(&NodeLookup::Uuid(uuid.clone()))
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("node {uuid}")))
    }

    pub async fn get_by_uuid_env(&self, uuid: &str, environment: &str) -> Result<Node> {
        let node = self.get_by_uuid(uuid).await?;
        if node.environment != environment {
            return Err(ServiceError::NotFound(format!(
                "node {} in environment {environment}",
                node.uuid
            )));
        }
        Ok(node)
    }

    /// Nodes whose hostname or localname is `host`; empty when none match.
    pub async fn find_by_host(&self, host: &str) -> Result<Vec<Node>> {
        self.store.find_nodes_by_host(host).await
    }

    pub async fn get_by_host(&self, host: &str) -> Result<Vec<Node>> {
        let nodes = self.find_by_host(host).await?;
        if nodes.is_empty() {
            return Err(ServiceError::NotFound(format!("node with host {host}")));
        }
        Ok(nodes)
    }

    pub async fn exists_by_key(&self, node_key: &str) -> Result<bool> {
        exists(self.get_by_key(node_key).await)
    }

    pub async fn exists_by_uuid(&self, uuid: &str) -> Result<bool> {
        exists(self.get_by_uuid(uuid).await)
    }

    pub async fn exists_by_host(&self, host: &str) -> Result<bool> {
        Ok(!self.find_by_host(host).await?.is_empty())
    }

    pub async fn list(
        &self,
        selector: &NodeSelector,
        activity: Activity,
        inactive_hours: i64,
    ) -> Result<Vec<Node>> {
        self.store
            .list_nodes(selector, activity, activity_cutoff(Utc::now(), inactive_hours))
            .await
    }

    pub async fn list_by_environment(
        &self,
        environment: &str,
        activity: Activity,
        inactive_hours: i64,
    ) -> Result<Vec<Node>> {
        let selector = NodeSelector::Environment(environment.to_string());
        self.list(&selector, activity, inactive_hours).await
    }

    pub async fn list_by_platform(
        &self,
        platform: &str,
        activity: Activity,
        inactive_hours: i64,
    ) -> Result<Vec<Node>> {
        let selector = NodeSelector::Platform(platform.to_string());
        self.list(&selector, activity, inactive_hours).await
    }

    pub async fn platforms(&self) -> Result<Vec<String>> {
        self.store.platforms().await
    }

    pub async fn stats(&self, selector: &NodeSelector, inactive_hours: i64) -> Result<StatsData> {
        let cutoff = activity_cutoff(Utc::now(), inactive_hours);
        Ok(StatsData {
            total: self.store.count_nodes(selector, Activity::All, cutoff).await?,
            active: self.store.count_nodes(selector, Activity::Active, cutoff).await?,
            inactive: self.store.count_nodes(selector, Activity::Inactive, cutoff).await?,
        })
    }

    pub async fn stats_by_environment(
        &self,
        environment: &str,
        inactive_hours: i64,
    ) -> Result<StatsData> {
        self.stats(&NodeSelector::Environment(environment.to_string()), inactive_hours)
            .await
    }

    pub async fn stats_by_platform(&self, platform: &str, inactive_hours: i64) -> Result<StatsData> {
        self.stats(&NodeSelector::Platform(platform.to_string()), inactive_hours)
            .await
    }

    pub async fn refresh_last_event(&self, uuid: &str, event: LastEvent) -> Result<()> {
        self.store
            .touch_event(&normalize_uuid(uuid), event, Utc::now())
            .await
    }

    pub async fn history(&self, uuid: &str, kind: HistoryKind) -> Result<Vec<HistoryEntry>> {
        self.store.history(&normalize_uuid(uuid), kind).await
    }
}

fn exists(lookup: Result<Node>) -> Result<bool> {
    match lookup {
        Ok(_) => Ok(true),
        Err(err) if err.is_not_found() => Ok(false),
        Err(err) => Err(err),
    }
}

pub fn activity_cutoff(now: DateTime<Utc>, inactive_hours: i64) -> DateTime<Utc> {
    now - Duration::hours(inactive_hours)
}
