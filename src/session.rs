use crate::errors::{AppError, AppResult};
use crate::models::Role;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    pub id: String,
    pub role: Role,
}

pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<CurrentUser>;
}

pub trait TenantProvider: Send + Sync {
    fn scope(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct StaticIdentity(pub Option<CurrentUser>);

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<CurrentUser> {
        self.0.clone()
    }
}

#[derive(Debug, Clone)]
pub struct StaticTenant(pub String);

impl TenantProvider for StaticTenant {
    fn scope(&self) -> String {
        self.0.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub user_id: String,
    pub role: Role,
    pub scope: String,
}

impl SessionContext {
    pub fn new(user_id: impl Into<String>, role: Role, scope: impl Into<String>) -> AppResult<Self> {
        let context = Self {
            user_id: user_id.into(),
            role,
            scope: scope.into(),
        };
        context.validate()?;
        Ok(context)
    }

    pub fn resolve(identity: &dyn IdentityProvider, tenant: &dyn TenantProvider) -> AppResult<Self> {
        let Some(user) = identity.current_user() else {
            return Err(AppError::Forbidden("no signed-in user".to_string()));
        };
        Self::new(user.id, user.role, tenant.scope())
    }

    pub fn from_providers(identity: Arc<dyn IdentityProvider>, tenant: Arc<dyn TenantProvider>) -> AppResult<Self> {
        Self::resolve(identity.as_ref(), tenant.as_ref())
    }

    fn validate(&self) -> AppResult<()> {
        if self.user_id.trim().is_empty() {
            return Err(AppError::Validation("user id cannot be empty".to_string()));
        }
        if self.scope.trim().is_empty() {
            return Err(AppError::Validation("scope cannot be empty".to_string()));
        }
        Ok(())
    }
}
