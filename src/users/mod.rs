//! User identity records and the admin operations that mutate them.
//!
//! Role and status changes run inside one transaction together with their
//! audit record, re-reading the acting user's role so a concurrent demotion
//! cannot be raced past, and enforcing self-action protection.

pub mod storage;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::audit::{self, Actor, AuditClass, RequestMeta};
use crate::error::{AuthError, Result};
use crate::policy::LoggingLevel;

/// Password-hash sentinel written by anonymization. Never parses as a PHC
/// string, so verification can never succeed against it.
pub const ANONYMIZED_PASSWORD_SENTINEL: &str = "!";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    SuperAdmin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::SuperAdmin => "super_admin",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "user" => Some(Self::User),
            "admin" => Some(Self::Admin),
            "super_admin" => Some(Self::SuperAdmin),
            _ => None,
        }
    }

    /// Whether this role may assign `target` to another user.
    ///
    /// Only a super admin can mint (or touch) super admins; admins manage
    /// the rest.
    #[must_use]
    pub fn can_assign(self, target: Role) -> bool {
        match target {
            Role::SuperAdmin => self == Role::SuperAdmin,
            Role::Admin | Role::User => self >= Role::Admin,
        }
    }
}

/// Effective lifecycle state. Exactly one applies at a time; anonymization
/// is terminal and implies archival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Active,
    Disabled,
    Archived,
    Anonymized,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub email_verified: bool,
    pub mfa_setup_required: bool,
    pub mfa_grace_start: Option<DateTime<Utc>>,
    pub mfa_grace_end: Option<DateTime<Utc>>,
    pub mfa_setup_completed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub anonymized_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        if self.anonymized_at.is_some() {
            Lifecycle::Anonymized
        } else if self.archived_at.is_some() {
            Lifecycle::Archived
        } else if self.is_active {
            Lifecycle::Active
        } else {
            Lifecycle::Disabled
        }
    }

    /// Whether this account can authenticate at all.
    #[must_use]
    pub fn can_login(&self) -> bool {
        self.lifecycle() == Lifecycle::Active
    }
}

/// Admin-facing update DTO; unknown keys are rejected.
#[derive(Debug, Clone, Default, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct UserAdminUpdate {
    pub role: Option<Role>,
    pub is_active: Option<bool>,
}

/// Change a user's role. The acting user's current role is re-read inside
/// the transaction; the audit row commits atomically with the change.
pub async fn change_role(
    pool: &PgPool,
    logging: LoggingLevel,
    actor_id: i64,
    target_id: i64,
    new_role: Role,
    meta: &RequestMeta<'_>,
) -> Result<()> {
    if actor_id == target_id {
        return Err(AuthError::NotAllowed);
    }

    let mut tx = pool.begin().await.map_err(AuthError::from)?;

    let actor = storage::fetch_user_for_update(&mut tx, actor_id)
        .await?
        .ok_or(AuthError::NotFound)?;
    let target = storage::fetch_user_for_update(&mut tx, target_id)
        .await?
        .ok_or(AuthError::NotFound)?;

    if !actor.role.can_assign(new_role) || !actor.role.can_assign(target.role) {
        return Err(AuthError::NotAllowed);
    }

    storage::set_role(&mut tx, target_id, new_role).await?;

    audit::append(
        &mut tx,
        logging,
        AuditClass::StateChange,
        &audit::Record {
            actor: Actor::Admin {
                id: actor.id,
                email: actor.email.clone(),
            },
            action: "USER_ROLE_CHANGE",
            target_type: "user",
            target_id: Some(target_id),
            details: serde_json::json!({
                "from": target.role.as_str(),
                "to": new_role.as_str(),
            }),
            meta,
        },
    )
    .await?;

    tx.commit().await.map_err(AuthError::from)?;
    Ok(())
}

/// Activate or deactivate a user. Deactivating yourself is rejected.
pub async fn change_status(
    pool: &PgPool,
    logging: LoggingLevel,
    actor_id: i64,
    target_id: i64,
    active: bool,
    meta: &RequestMeta<'_>,
) -> Result<()> {
    if actor_id == target_id && !active {
        return Err(AuthError::NotAllowed);
    }

    let mut tx = pool.begin().await.map_err(AuthError::from)?;

    let actor = storage::fetch_user_for_update(&mut tx, actor_id)
        .await?
        .ok_or(AuthError::NotFound)?;
    let target = storage::fetch_user_for_update(&mut tx, target_id)
        .await?
        .ok_or(AuthError::NotFound)?;

    if actor.role < Role::Admin || !actor.role.can_assign(target.role) {
        return Err(AuthError::NotAllowed);
    }

    storage::set_active(&mut tx, target_id, active).await?;

    audit::append(
        &mut tx,
        logging,
        AuditClass::StateChange,
        &audit::Record {
            actor: Actor::Admin {
                id: actor.id,
                email: actor.email.clone(),
            },
            action: if active {
                "USER_ACTIVATE"
            } else {
                "USER_DEACTIVATE"
            },
            target_type: "user",
            target_id: Some(target_id),
            details: serde_json::json!({}),
            meta,
        },
    )
    .await?;

    tx.commit().await.map_err(AuthError::from)?;
    Ok(())
}

/// Archive a user: login is refused but the record is retained.
pub async fn archive(
    pool: &PgPool,
    logging: LoggingLevel,
    actor_id: i64,
    target_id: i64,
    meta: &RequestMeta<'_>,
) -> Result<()> {
    if actor_id == target_id {
        return Err(AuthError::NotAllowed);
    }

    let mut tx = pool.begin().await.map_err(AuthError::from)?;

    let actor = storage::fetch_user_for_update(&mut tx, actor_id)
        .await?
        .ok_or(AuthError::NotFound)?;
    let target = storage::fetch_user_for_update(&mut tx, target_id)
        .await?
        .ok_or(AuthError::NotFound)?;

    if actor.role < Role::Admin || !actor.role.can_assign(target.role) {
        return Err(AuthError::NotAllowed);
    }

    storage::archive_user(&mut tx, target_id).await?;
    crate::session::storage::revoke_all_for_user(&mut tx, target_id).await?;

    audit::append(
        &mut tx,
        logging,
        AuditClass::StateChange,
        &audit::Record {
            actor: Actor::Admin {
                id: actor.id,
                email: actor.email.clone(),
            },
            action: "USER_ARCHIVE",
            target_type: "user",
            target_id: Some(target_id),
            details: serde_json::json!({}),
            meta,
        },
    )
    .await?;

    tx.commit().await.map_err(AuthError::from)?;
    Ok(())
}

/// Anonymize a user: content is scrubbed, the id survives, and the password
/// hash becomes a sentinel that can never verify.
pub async fn anonymize(
    pool: &PgPool,
    logging: LoggingLevel,
    actor_id: i64,
    target_id: i64,
    meta: &RequestMeta<'_>,
) -> Result<()> {
    if actor_id == target_id {
        return Err(AuthError::NotAllowed);
    }

    let mut tx = pool.begin().await.map_err(AuthError::from)?;

    let actor = storage::fetch_user_for_update(&mut tx, actor_id)
        .await?
        .ok_or(AuthError::NotFound)?;
    let target = storage::fetch_user_for_update(&mut tx, target_id)
        .await?
        .ok_or(AuthError::NotFound)?;

    if actor.role < Role::Admin || !actor.role.can_assign(target.role) {
        return Err(AuthError::NotAllowed);
    }

    storage::anonymize_user(&mut tx, target_id).await?;
    crate::session::storage::revoke_all_for_user(&mut tx, target_id).await?;

    audit::append(
        &mut tx,
        logging,
        AuditClass::StateChange,
        &audit::Record {
            actor: Actor::Admin {
                id: actor.id,
                email: actor.email.clone(),
            },
            action: "USER_ANONYMIZE",
            target_type: "user",
            target_id: Some(target_id),
            details: serde_json::json!({}),
            meta,
        },
    )
    .await?;

    tx.commit().await.map_err(AuthError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering_reflects_privilege() {
        assert!(Role::SuperAdmin > Role::Admin);
        assert!(Role::Admin > Role::User);
    }

    #[test]
    fn only_super_admin_assigns_super_admin() {
        assert!(!Role::Admin.can_assign(Role::SuperAdmin));
        assert!(Role::SuperAdmin.can_assign(Role::SuperAdmin));
        assert!(Role::Admin.can_assign(Role::Admin));
        assert!(Role::Admin.can_assign(Role::User));
        assert!(!Role::User.can_assign(Role::User));
    }

    #[test]
    fn role_parse_round_trips() {
        for role in [Role::User, Role::Admin, Role::SuperAdmin] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("root"), None);
    }

    fn sample_user() -> User {
        User {
            id: 1,
            username: "alice".to_string(),
            email: "alice@x.com".to_string(),
            password_hash: Some("$argon2id$...".to_string()),
            role: Role::User,
            is_active: true,
            email_verified: true,
            mfa_setup_required: false,
            mfa_grace_start: None,
            mfa_grace_end: None,
            mfa_setup_completed_at: None,
            archived_at: None,
            anonymized_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn lifecycle_precedence() {
        let mut user = sample_user();
        assert_eq!(user.lifecycle(), Lifecycle::Active);
        assert!(user.can_login());

        user.is_active = false;
        assert_eq!(user.lifecycle(), Lifecycle::Disabled);

        user.archived_at = Some(Utc::now());
        assert_eq!(user.lifecycle(), Lifecycle::Archived);

        user.anonymized_at = Some(Utc::now());
        assert_eq!(user.lifecycle(), Lifecycle::Anonymized);
        assert!(!user.can_login());
    }

    #[test]
    fn anonymized_sentinel_never_verifies() {
        assert!(!crate::password::verify(
            "Secure1!",
            ANONYMIZED_PASSWORD_SENTINEL
        ));
    }

    #[test]
    fn admin_update_dto_rejects_unknown_fields() {
        let parsed: Result<UserAdminUpdate, _> =
            serde_json::from_str(r#"{"role": "admin", "password": "x"}"#);
        assert!(parsed.is_err());
    }
}
