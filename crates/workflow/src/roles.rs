use std::sync::Arc;

use tracing::info;

use nsmr_core::audit::CallContext;
use nsmr_core::authz::{AccessPolicy, AccessRequest};
use nsmr_core::clock::Clock;
use nsmr_core::domain::identity::{Principal, UserRole, DEFAULT_ROLE};
use nsmr_core::errors::WorkflowError;
use nsmr_db::repositories::RoleRepository;

/// Maps verified identities to roles. Unknown identities resolve to [`DEFAULT_ROLE`].
#[derive(Clone)]
pub struct RoleRegistry {
    roles: Arc<dyn RoleRepository>,
    clock: Arc<dyn Clock>,
    policy: AccessPolicy,
}

impl RoleRegistry {
    pub fn new(roles: Arc<dyn RoleRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { roles, clock, policy: AccessPolicy }
    }

    pub async fn role_of(&self, identity: &Principal) -> Result<UserRole, WorkflowError> {
        Ok(self.roles.role_of(identity).await?.unwrap_or(DEFAULT_ROLE))
    }

    pub async fn is_admin(&self, identity: &Principal) -> Result<bool, WorkflowError> {
        Ok(self.role_of(identity).await?.is_admin())
    }

    /// Fails with `PermissionDenied` unless `caller` currently holds the admin role.
    pub async fn require_admin(
        &self,
        caller: &Principal,
        request: &AccessRequest,
    ) -> Result<(), WorkflowError> {
        let role = self.role_of(caller).await?;
        self.policy.evaluate(caller, role, request).into_result()?;
        Ok(())
    }

    pub async fn set_role(
        &self,
        context: &CallContext,
        target: &Principal,
        role: UserRole,
    ) -> Result<(), WorkflowError> {
        self.require_admin(&context.caller, &AccessRequest::AssignRoles { target: target.clone() })
            .await?;
        self.roles.set_role(target, role, self.clock.now()).await?;
        Ok(())
    }

    /// Grants `admin` to each identity without an authorization check. Startup only.
    pub async fn bootstrap_admins(&self, admins: &[Principal]) -> Result<usize, WorkflowError> {
        let mut granted = 0;
        for admin in admins {
            if self.roles.role_of(admin).await? == Some(UserRole::Admin) {
                continue;
            }
            self.roles.set_role(admin, UserRole::Admin, self.clock.now()).await?;
            info!(event_name = "identity.bootstrap_admin", principal = %admin, "granted admin role");
            granted += 1;
        }
        Ok(granted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nsmr_core::audit::CallContext;
    use nsmr_core::clock::MonotonicClock;
    use nsmr_core::domain::identity::{Principal, UserRole};
    use nsmr_core::errors::WorkflowError;
    use nsmr_db::repositories::InMemoryRoleRepository;

    use super::RoleRegistry;

    fn registry() -> RoleRegistry {
        RoleRegistry::new(
            Arc::new(InMemoryRoleRepository::default()),
            Arc::new(MonotonicClock::default()),
        )
    }

    #[tokio::test]
    async fn unseen_identities_are_guests() {
        let registry = registry();
        assert_eq!(registry.role_of(&Principal::new("stranger")).await, Ok(UserRole::Guest));
        assert_eq!(registry.is_admin(&Principal::new("stranger")).await, Ok(false));
    }

    #[tokio::test]
    async fn only_admins_may_assign_roles() {
        let registry = registry();
        let admin = Principal::new("plant-admin");
        let target = Principal::new("operator");
        registry.bootstrap_admins(&[admin.clone()]).await.expect("bootstrap");

        let denied = registry
            .set_role(&CallContext::new(target.clone(), "corr-1"), &target, UserRole::Admin)
            .await;
        assert!(matches!(denied, Err(WorkflowError::PermissionDenied(_))));
        assert_eq!(registry.role_of(&target).await, Ok(UserRole::Guest));

        registry
            .set_role(&CallContext::new(admin, "corr-2"), &target, UserRole::User)
            .await
            .expect("admin assigns");
        assert_eq!(registry.role_of(&target).await, Ok(UserRole::User));
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let registry = registry();
        let admins = [Principal::new("a"), Principal::new("b")];

        assert_eq!(registry.bootstrap_admins(&admins).await, Ok(2));
        assert_eq!(registry.bootstrap_admins(&admins).await, Ok(0));
        assert_eq!(registry.is_admin(&admins[1]).await, Ok(true));
    }
}
