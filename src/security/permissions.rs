//! Role-based permission checks.
//!
//! A user's textual role resolves through the org's roles table to a
//! permission set. A missing role row falls back to a hard-coded map (kept
//! as a migration affordance) and logs that the fallback fired. Every
//! failure path denies.

use diesel::prelude::*;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::shared::models::schema;
use crate::shared::state::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ViewOrders,
    EditOrders,
    DeleteOrders,
    ViewPii,
    ManageUsers,
    ManageBilling,
    ManageApiKeys,
    ViewAnalytics,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ViewOrders => "view_orders",
            Self::EditOrders => "edit_orders",
            Self::DeleteOrders => "delete_orders",
            Self::ViewPii => "view_pii",
            Self::ManageUsers => "manage_users",
            Self::ManageBilling => "manage_billing",
            Self::ManageApiKeys => "manage_api_keys",
            Self::ViewAnalytics => "view_analytics",
        }
    }
}

const ALL_PERMISSIONS: [Permission; 8] = [
    Permission::ViewOrders,
    Permission::EditOrders,
    Permission::DeleteOrders,
    Permission::ViewPii,
    Permission::ManageUsers,
    Permission::ManageBilling,
    Permission::ManageApiKeys,
    Permission::ViewAnalytics,
];

/// Hard-coded permission sets used when the org has no role row yet.
pub fn fallback_permissions(role: &str) -> &'static [Permission] {
    match role {
        "owner" | "admin" => &ALL_PERMISSIONS,
        "manager" => &[
            Permission::ViewOrders,
            Permission::EditOrders,
            Permission::DeleteOrders,
            Permission::ViewPii,
            Permission::ViewAnalytics,
        ],
        "staff" => &[Permission::ViewOrders, Permission::EditOrders],
        _ => &[Permission::ViewOrders],
    }
}

/// Resolves whether `user_id` holds `permission` inside `org_id`. Any lookup
/// failure denies.
pub async fn has_permission(
    pool: &DbPool,
    user_id: &str,
    org_id: Uuid,
    permission: Permission,
) -> bool {
    let pool = pool.clone();
    let user_id = user_id.to_string();

    let result = tokio::task::spawn_blocking(move || -> Result<bool, anyhow::Error> {
        let mut conn = pool.get()?;

        let role_name: Option<String> = {
            use schema::users::dsl::*;
            users
                .filter(id.eq(&user_id))
                .filter(organization_id.eq(Some(org_id)))
                .select(role)
                .first::<Option<String>>(&mut conn)
                .optional()?
                .flatten()
        };

        let Some(role_name) = role_name else {
            return Ok(false);
        };

        let stored: Option<Value> = {
            use schema::roles::dsl::*;
            roles
                .filter(organization_id.eq(org_id))
                .filter(name.eq(&role_name))
                .select(permissions)
                .first::<Value>(&mut conn)
                .optional()?
        };

        match stored {
            Some(permissions) => Ok(permissions
                .as_array()
                .map(|list| list.iter().any(|p| p.as_str() == Some(permission.as_str())))
                .unwrap_or(false)),
            None => {
                warn!(
                    role = %role_name,
                    org_id = %org_id,
                    "role row missing, using fallback permission set"
                );
                Ok(fallback_permissions(&role_name).contains(&permission))
            }
        }
    })
    .await;

    match result {
        Ok(Ok(allowed)) => allowed,
        Ok(Err(err)) => {
            warn!("permission lookup failed, denying: {err}");
            false
        }
        Err(err) => {
            warn!("permission lookup task failed, denying: {err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_owner_has_everything() {
        for permission in ALL_PERMISSIONS {
            assert!(fallback_permissions("owner").contains(&permission));
            assert!(fallback_permissions("admin").contains(&permission));
        }
    }

    #[test]
    fn fallback_staff_is_limited() {
        let staff = fallback_permissions("staff");
        assert!(staff.contains(&Permission::ViewOrders));
        assert!(staff.contains(&Permission::EditOrders));
        assert!(!staff.contains(&Permission::ViewPii));
        assert!(!staff.contains(&Permission::ManageApiKeys));
    }

    #[test]
    fn fallback_unknown_role_can_only_view() {
        let unknown = fallback_permissions("intern");
        assert_eq!(unknown, &[Permission::ViewOrders]);
    }

    #[test]
    fn permission_names_match_the_closed_enumeration() {
        let names: Vec<&str> = ALL_PERMISSIONS.iter().map(|p| p.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "view_orders",
                "edit_orders",
                "delete_orders",
                "view_pii",
                "manage_users",
                "manage_billing",
                "manage_api_keys",
                "view_analytics",
            ]
        );
    }
}
