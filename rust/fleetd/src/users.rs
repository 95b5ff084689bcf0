//! Administrator records consulted by the permission evaluator.
//!
//! Credentials are not stored here; callers hand in an already
//! authenticated username.

use crate::{
    error::{Result, ServiceError},
    models::{AdminUser, NewAdminUser},
    permissions::{self, AccessLevel, Permissions},
    store::UserStore,
};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct UserManager {
    store: Arc<dyn UserStore>,
}

impl UserManager {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }

    /// Creates the user with permissions baselined from `environments`: full
    /// grants for admins, nothing for everyone else.
    pub async fn add_user<S: AsRef<str>>(
        &self,
        mut user: NewAdminUser,
        environments: &[S],
    ) -> Result<AdminUser> {
        user.username = user.username.trim().to_string();
        if user.username.is_empty() {
            return Err(ServiceError::InvalidRequest("username is required".into()));
        }
        user.permissions = permissions::generate_permissions(environments, user.admin);
        let created = self.store.insert_user(user).await?;
        info!(username = %created.username, admin = created.admin, "user created");
        Ok(created)
    }

    pub async fn get(&self, username: &str) -> Result<AdminUser> {
        self.store
            .get_user(username)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("user {username}")))
    }

    pub async fn exists(&self, username: &str) -> Result<bool> {
        Ok(self.store.get_user(username).await?.is_some())
    }

    pub async fn all(&self) -> Result<Vec<AdminUser>> {
        self.store.list_users().await
    }

    /// Toggles the admin flag and overwrites permissions with a fresh baseline.
    pub async fn change_admin<S: AsRef<str>>(
        &self,
        username: &str,
        admin: bool,
        environments: &[S],
    ) -> Result<()> {
        let baseline = permissions::generate_permissions(environments, admin);
        self.store.set_admin(username, admin, &baseline).await?;
        info!(username, admin, "user admin flag changed");
        Ok(())
    }

    pub async fn change_permissions(&self, username: &str, permissions: &Permissions) -> Result<()> {
        self.store.set_permissions(username, permissions).await?;
        info!(username, "user permissions changed");
        Ok(())
    }

    pub async fn delete(&self, username: &str) -> Result<()> {
        self.store.delete_user(username).await?;
        info!(username, "user deleted");
        Ok(())
    }

    /// Access decision for `username`. Unknown users are denied.
    pub async fn authorize(
        &self,
        username: &str,
        level: AccessLevel,
        environment: Option<&str>,
    ) -> Result<bool> {
        let Some(user) = self.store.get_user(username).await? else {
            warn!(username, level = %level, "authorization for unknown user");
            return Ok(false);
        };
        let allowed = permissions::check(&user, level, environment);
        if !allowed {
            warn!(username, level = %level, environment = ?environment, "access denied");
        }
        Ok(allowed)
    }

    pub async fn require(
        &self,
        username: &str,
        level: AccessLevel,
        environment: Option<&str>,
    ) -> Result<()> {
        if self.authorize(username, level, environment).await? {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied(match environment {
                Some(env) => format!("{username} lacks {level} access to {env}"),
                None => format!("{username} lacks {level} access"),
            }))
        }
    }
}
