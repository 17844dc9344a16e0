//! Administrative endpoints: system and role MFA configuration, enforcement
//! controls, and user management.
//!
//! Every state change commits its audit row in the same transaction.
//! Configuration writes require the super admin role; the rest require
//! admin. Self-action protection lives in the `users` core module.

use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use utoipa::ToSchema;

use super::{require_admin, transport_meta, ApiResult};
use crate::audit::{self, Actor, AuditClass, RequestMeta, Severity};
use crate::auth::Orchestrator;
use crate::enforcement;
use crate::error::AuthError;
use crate::otp::storage as otp_storage;
use crate::policy::{
    self, MfaMethod, RoleMfaConfig, RoleMfaConfigUpdate, SystemMfaConfigUpdate,
};
use crate::users::{self, Role, User, UserAdminUpdate};

fn admin_actor(user: &User) -> Actor {
    Actor::Admin {
        id: user.id,
        email: user.email.clone(),
    }
}

fn request_meta(meta: &crate::auth::TransportMeta) -> RequestMeta<'_> {
    RequestMeta {
        ip: meta.ip.as_deref(),
        user_agent: meta.user_agent.as_deref(),
    }
}

#[utoipa::path(
    get,
    path = "/v1/admin/mfa/config",
    responses(
        (status = 200, description = "Current system MFA config"),
        (status = 403, description = "Admin role required")
    ),
    tag = "admin"
)]
pub async fn get_system_config(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
) -> ApiResult<Response> {
    require_admin(&headers, orchestrator.sessions(), &pool).await?;
    let config = policy::fetch_system_config(&pool).await?;
    Ok(Json(config).into_response())
}

#[utoipa::path(
    put,
    path = "/v1/admin/mfa/config",
    responses(
        (status = 200, description = "Updated config"),
        (status = 403, description = "Super admin role required")
    ),
    tag = "admin"
)]
pub async fn update_system_config(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Json(update): Json<SystemMfaConfigUpdate>,
) -> ApiResult<Response> {
    let actor = require_admin(&headers, orchestrator.sessions(), &pool).await?;
    if actor.role < Role::SuperAdmin {
        return Err(AuthError::NotAllowed.into());
    }

    let current = policy::fetch_system_config(&pool).await?;
    let next = current.merged(&update);

    let meta = transport_meta(&headers);
    let mut tx = pool.begin().await.map_err(AuthError::from)?;
    policy::update_system_config(&mut tx, &next).await?;
    audit::append(
        &mut tx,
        next.logging_level,
        AuditClass::StateChange,
        &audit::Record {
            actor: admin_actor(&actor),
            action: "MFA_CONFIG_UPDATE",
            target_type: "mfa_config",
            target_id: None,
            details: serde_json::json!({
                "from_mode": current.mode.as_str(),
                "to_mode": next.mode.as_str(),
            }),
            meta: &request_meta(&meta),
        },
    )
    .await?;
    tx.commit().await.map_err(AuthError::from)?;

    Ok(Json(next).into_response())
}

#[utoipa::path(
    get,
    path = "/v1/admin/mfa/roles/{role}",
    responses(
        (status = 200, description = "Role MFA config"),
        (status = 404, description = "No config for role")
    ),
    tag = "admin"
)]
pub async fn get_role_config(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Path(role): Path<String>,
) -> ApiResult<Response> {
    require_admin(&headers, orchestrator.sessions(), &pool).await?;
    let role = Role::parse(&role)
        .ok_or_else(|| AuthError::InvalidInput(format!("unknown role: {role}")))?;
    let config = policy::fetch_role_config(&pool, role)
        .await?
        .ok_or(AuthError::NotFound)?;
    Ok(Json(config).into_response())
}

#[utoipa::path(
    put,
    path = "/v1/admin/mfa/roles/{role}",
    responses(
        (status = 200, description = "Updated role config"),
        (status = 400, description = "Required role without methods"),
        (status = 403, description = "Super admin role required")
    ),
    tag = "admin"
)]
pub async fn update_role_config(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Path(role): Path<String>,
    Json(update): Json<RoleMfaConfigUpdate>,
) -> ApiResult<Response> {
    let actor = require_admin(&headers, orchestrator.sessions(), &pool).await?;
    if actor.role < Role::SuperAdmin {
        return Err(AuthError::NotAllowed.into());
    }
    let role = Role::parse(&role)
        .ok_or_else(|| AuthError::InvalidInput(format!("unknown role: {role}")))?;

    let current = policy::fetch_role_config(&pool, role)
        .await?
        .unwrap_or(RoleMfaConfig {
            role,
            required: false,
            allowed_methods: vec![MfaMethod::Totp, MfaMethod::Email],
            code_expiration_minutes: None,
            max_failed_attempts: None,
            lockout_behavior: None,
            lockout_duration_minutes: None,
            exempt_from_enforcement: false,
        });

    let next = RoleMfaConfig {
        role,
        required: update.required.unwrap_or(current.required),
        allowed_methods: update.allowed_methods.unwrap_or(current.allowed_methods),
        code_expiration_minutes: update
            .code_expiration_minutes
            .unwrap_or(current.code_expiration_minutes),
        max_failed_attempts: update
            .max_failed_attempts
            .unwrap_or(current.max_failed_attempts),
        lockout_behavior: update.lockout_behavior.unwrap_or(current.lockout_behavior),
        lockout_duration_minutes: update
            .lockout_duration_minutes
            .unwrap_or(current.lockout_duration_minutes),
        exempt_from_enforcement: update
            .exempt_from_enforcement
            .unwrap_or(current.exempt_from_enforcement),
    };

    // A required role must keep at least one way to satisfy it.
    if next.required && next.allowed_methods.is_empty() {
        return Err(
            AuthError::InvalidInput("required role needs allowed methods".to_string()).into(),
        );
    }

    let system = policy::fetch_system_config(&pool).await?;
    let meta = transport_meta(&headers);
    let mut tx = pool.begin().await.map_err(AuthError::from)?;
    policy::upsert_role_config(&mut tx, &next).await?;
    audit::append(
        &mut tx,
        system.logging_level,
        AuditClass::StateChange,
        &audit::Record {
            actor: admin_actor(&actor),
            action: "MFA_ROLE_CONFIG_UPDATE",
            target_type: "mfa_role_config",
            target_id: None,
            details: serde_json::json!({ "role": role.as_str() }),
            meta: &request_meta(&meta),
        },
    )
    .await?;
    tx.commit().await.map_err(AuthError::from)?;

    Ok(Json(next).into_response())
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct EnforceRequest {
    pub grace_days: Option<i32>,
}

#[utoipa::path(
    post,
    path = "/v1/admin/mfa/enforce",
    request_body = EnforceRequest,
    responses(
        (status = 200, description = "Grace windows applied"),
        (status = 403, description = "Admin role required")
    ),
    tag = "admin"
)]
pub async fn apply_enforcement(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Json(request): Json<EnforceRequest>,
) -> ApiResult<Response> {
    let actor = require_admin(&headers, orchestrator.sessions(), &pool).await?;
    let system = policy::fetch_system_config(&pool).await?;
    let grace_days = request.grace_days.unwrap_or(system.enforcement_grace_days);

    let affected = enforcement::apply_to_existing_users(&pool, grace_days).await?;

    let meta = transport_meta(&headers);
    let record = audit::Record {
        actor: admin_actor(&actor),
        action: "MFA_ENFORCEMENT_APPLY",
        target_type: "users",
        target_id: None,
        details: serde_json::json!({ "grace_days": grace_days, "affected": affected }),
        meta: &request_meta(&meta),
    };
    audit::append_pool(&pool, system.logging_level, AuditClass::StateChange, &record).await?;

    Ok(Json(serde_json::json!({ "affected": affected, "grace_days": grace_days }))
        .into_response())
}

#[utoipa::path(
    post,
    path = "/v1/admin/users/{id}/unlock",
    responses(
        (status = 204, description = "Locks cleared"),
        (status = 403, description = "Admin role required")
    ),
    tag = "admin"
)]
pub async fn unlock_user(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Path(user_id): Path<i64>,
) -> ApiResult<Response> {
    let actor = require_admin(&headers, orchestrator.sessions(), &pool).await?;
    let system = policy::fetch_system_config(&pool).await?;
    let meta = transport_meta(&headers);

    // Lock clearing and its audit row commit together.
    let mut tx = pool.begin().await.map_err(AuthError::from)?;
    let cleared = otp_storage::clear_locks(&mut tx, user_id).await?;
    audit::append(
        &mut tx,
        system.logging_level,
        AuditClass::StateChange,
        &audit::Record {
            actor: admin_actor(&actor),
            action: "USER_MFA_UNLOCK",
            target_type: "user",
            target_id: Some(user_id),
            details: serde_json::json!({ "cleared": cleared }),
            meta: &request_meta(&meta),
        },
    )
    .await?;
    audit::record_security_event(
        &mut tx,
        user_id,
        "mfa_unlocked_by_admin",
        Severity::Warning,
        serde_json::json!({ "admin_id": actor.id }),
    )
    .await?;
    tx.commit().await.map_err(AuthError::from)?;

    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct ForceTransitionRequest {
    pub grace_days: Option<i32>,
}

#[utoipa::path(
    post,
    path = "/v1/admin/users/{id}/force-transition",
    request_body = ForceTransitionRequest,
    responses(
        (status = 204, description = "User pushed back into setup"),
        (status = 404, description = "Unknown user")
    ),
    tag = "admin"
)]
pub async fn force_transition(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Path(user_id): Path<i64>,
    Json(request): Json<ForceTransitionRequest>,
) -> ApiResult<Response> {
    let actor = require_admin(&headers, orchestrator.sessions(), &pool).await?;
    let system = policy::fetch_system_config(&pool).await?;

    enforcement::force_transition(&pool, user_id, request.grace_days).await?;

    let meta = transport_meta(&headers);
    let record = audit::Record {
        actor: admin_actor(&actor),
        action: "USER_MFA_FORCE_TRANSITION",
        target_type: "user",
        target_id: Some(user_id),
        details: serde_json::json!({ "grace_days": request.grace_days }),
        meta: &request_meta(&meta),
    };
    audit::append_pool(&pool, system.logging_level, AuditClass::StateChange, &record).await?;

    Ok(StatusCode::NO_CONTENT.into_response())
}

#[utoipa::path(
    put,
    path = "/v1/admin/users/{id}",
    responses(
        (status = 204, description = "User updated"),
        (status = 403, description = "Not allowed")
    ),
    tag = "admin"
)]
pub async fn update_user(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Path(user_id): Path<i64>,
    Json(update): Json<UserAdminUpdate>,
) -> ApiResult<Response> {
    let actor = require_admin(&headers, orchestrator.sessions(), &pool).await?;
    let system = policy::fetch_system_config(&pool).await?;
    let meta = transport_meta(&headers);
    let request_meta = request_meta(&meta);

    if let Some(role) = update.role {
        users::change_role(&pool, system.logging_level, actor.id, user_id, role, &request_meta)
            .await?;
    }
    if let Some(active) = update.is_active {
        users::change_status(
            &pool,
            system.logging_level,
            actor.id,
            user_id,
            active,
            &request_meta,
        )
        .await?;
    }

    Ok(StatusCode::NO_CONTENT.into_response())
}

#[utoipa::path(
    post,
    path = "/v1/admin/users/{id}/archive",
    responses(
        (status = 204, description = "User archived")
    ),
    tag = "admin"
)]
pub async fn archive_user(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Path(user_id): Path<i64>,
) -> ApiResult<Response> {
    let actor = require_admin(&headers, orchestrator.sessions(), &pool).await?;
    let system = policy::fetch_system_config(&pool).await?;
    let meta = transport_meta(&headers);
    users::archive(
        &pool,
        system.logging_level,
        actor.id,
        user_id,
        &request_meta(&meta),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[utoipa::path(
    post,
    path = "/v1/admin/users/{id}/anonymize",
    responses(
        (status = 204, description = "User anonymized")
    ),
    tag = "admin"
)]
pub async fn anonymize_user(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Path(user_id): Path<i64>,
) -> ApiResult<Response> {
    let actor = require_admin(&headers, orchestrator.sessions(), &pool).await?;
    let system = policy::fetch_system_config(&pool).await?;
    let meta = transport_meta(&headers);
    users::anonymize(
        &pool,
        system.logging_level,
        actor.id,
        user_id,
        &request_meta(&meta),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct RetentionRequest {
    pub days: i32,
}

#[utoipa::path(
    post,
    path = "/v1/admin/audit/retention",
    request_body = RetentionRequest,
    responses(
        (status = 200, description = "Expired audit rows deleted"),
        (status = 403, description = "Super admin role required")
    ),
    tag = "admin"
)]
pub async fn audit_retention(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Json(request): Json<RetentionRequest>,
) -> ApiResult<Response> {
    let actor = require_admin(&headers, orchestrator.sessions(), &pool).await?;
    if actor.role < Role::SuperAdmin {
        return Err(AuthError::NotAllowed.into());
    }
    if request.days < 1 {
        return Err(AuthError::InvalidInput("retention must be at least one day".to_string()).into());
    }

    let deleted = audit::delete_older_than(&pool, request.days).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })).into_response())
}

#[utoipa::path(
    post,
    path = "/v1/admin/users/{id}/revoke-sessions",
    responses(
        (status = 200, description = "Sessions revoked")
    ),
    tag = "admin"
)]
pub async fn revoke_sessions(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Path(user_id): Path<i64>,
) -> ApiResult<Response> {
    let actor = require_admin(&headers, orchestrator.sessions(), &pool).await?;
    let system = policy::fetch_system_config(&pool).await?;
    let meta = transport_meta(&headers);

    // Revocation and its audit row commit together.
    let mut tx = pool.begin().await.map_err(AuthError::from)?;
    let revoked = crate::session::storage::revoke_all_for_user(&mut tx, user_id).await?;
    audit::append(
        &mut tx,
        system.logging_level,
        AuditClass::StateChange,
        &audit::Record {
            actor: admin_actor(&actor),
            action: "USER_SESSIONS_REVOKE",
            target_type: "user",
            target_id: Some(user_id),
            details: serde_json::json!({ "revoked": revoked }),
            meta: &request_meta(&meta),
        },
    )
    .await?;
    tx.commit().await.map_err(AuthError::from)?;

    Ok(Json(serde_json::json!({ "revoked": revoked })).into_response())
}
