use crate::errors::{AppError, AppResult};
use crate::models::Role;
use crate::session::SessionContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    GenerateNotifications,
    CleanupResolved,
    ClearNotifications,
    RegenerateNotifications,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GenerateNotifications => "generate_notifications",
            Self::CleanupResolved => "cleanup_resolved",
            Self::ClearNotifications => "clear_notifications",
            Self::RegenerateNotifications => "regenerate_notifications",
        }
    }

    fn allowed_roles(self) -> &'static [Role] {
        match self {
            Self::GenerateNotifications | Self::CleanupResolved => &[Role::Owner, Role::Manager, Role::Employee],
            Self::ClearNotifications | Self::RegenerateNotifications => &[Role::Owner, Role::Manager],
        }
    }
}

pub fn authorize(context: &SessionContext, action: Action) -> AppResult<()> {
    if action.allowed_roles().contains(&context.role) {
        return Ok(());
    }
    tracing::warn!(
        user_id = %context.user_id,
        role = context.role.as_str(),
        action = action.as_str(),
        "action denied"
    );
    Err(AppError::Forbidden(format!(
        "role '{}' may not {}",
        context.role.as_str(),
        action.as_str()
    )))
}
