//! Access decisions for administrative actions.
//!
//! `admin` supersedes every other grant. Non-admin users hold a `query` flag,
//! a `carve` flag and a per-environment map; environments missing from the map
//! are denied.

use crate::error::{Result, ServiceError};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Admin,
    Query,
    Carve,
    Environment,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Admin => "admin",
            AccessLevel::Query => "query",
            AccessLevel::Carve => "carve",
            AccessLevel::Environment => "environment",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "admin" => Ok(AccessLevel::Admin),
            "query" => Ok(AccessLevel::Query),
            "carve" => Ok(AccessLevel::Carve),
            "environment" | "env" => Ok(AccessLevel::Environment),
            other => Err(ServiceError::InvalidRequest(format!(
                "unknown access level '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    pub environments: BTreeMap<String, bool>,
    pub query: bool,
    pub carve: bool,
}

impl Permissions {
    pub fn environment(&self, name: &str) -> bool {
        self.environments.get(name).copied().unwrap_or(false)
    }
}

/// The pieces of a user record the evaluator looks at.
pub trait Principal {
    fn is_admin(&self) -> bool;
    fn permissions(&self) -> &Permissions;
}

impl Principal for crate::models::AdminUser {
    fn is_admin(&self) -> bool {
        self.admin
    }

    fn permissions(&self) -> &Permissions {
        &self.permissions
    }
}

pub fn check<P: Principal + ?Sized>(
    user: &P,
    level: AccessLevel,
    environment: Option<&str>,
) -> bool {
    if user.is_admin() {
        return true;
    }

    let perms = user.permissions();
    match level {
        AccessLevel::Admin => false,
        AccessLevel::Query => perms.query,
        AccessLevel::Carve => perms.carve,
        AccessLevel::Environment => environment.is_some_and(|env| perms.environment(env)),
    }
}

/// Every named environment plus `query` and `carve` set to `grant_all`.
pub fn generate_permissions<S: AsRef<str>>(environments: &[S], grant_all: bool) -> Permissions {
    Permissions {
        environments: environments
            .iter()
            .map(|env| (env.as_ref().to_string(), grant_all))
            .collect(),
        query: grant_all,
        carve: grant_all,
    }
}
