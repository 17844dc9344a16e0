//! Security visibility endpoints: login attempts and security events.

use axum::{
    extract::{Extension, Query},
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use utoipa::ToSchema;

use super::{require_user, ApiResult};
use crate::audit;
use crate::auth::Orchestrator;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

#[utoipa::path(
    get,
    path = "/v1/security/login-attempts",
    responses(
        (status = 200, description = "The caller's login attempts, newest first"),
        (status = 401, description = "Unauthorized")
    ),
    tag = "security"
)]
pub async fn list_login_attempts(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Response> {
    let user = require_user(&headers, orchestrator.sessions(), &pool).await?;
    let attempts =
        audit::list_login_attempts(&pool, user.id, clamp_limit(query.limit)).await?;
    Ok(Json(attempts).into_response())
}

#[utoipa::path(
    get,
    path = "/v1/security/events",
    responses(
        (status = 200, description = "The caller's security events, newest first"),
        (status = 401, description = "Unauthorized")
    ),
    tag = "security"
)]
pub async fn list_security_events(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Response> {
    let user = require_user(&headers, orchestrator.sessions(), &pool).await?;
    let events =
        audit::list_security_events(&pool, user.id, clamp_limit(query.limit)).await?;
    Ok(Json(events).into_response())
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct AcknowledgeRequest {
    pub event_ids: Vec<i64>,
}

#[utoipa::path(
    post,
    path = "/v1/security/events/acknowledge",
    request_body = AcknowledgeRequest,
    responses(
        (status = 200, description = "Events acknowledged"),
        (status = 401, description = "Unauthorized")
    ),
    tag = "security"
)]
pub async fn acknowledge_events(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Json(request): Json<AcknowledgeRequest>,
) -> ApiResult<Response> {
    let user = require_user(&headers, orchestrator.sessions(), &pool).await?;
    let acknowledged =
        audit::acknowledge_security_events(&pool, user.id, &request.event_ids).await?;
    Ok(Json(serde_json::json!({ "acknowledged": acknowledged })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_clamped_to_bounds() {
        assert_eq!(clamp_limit(None), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(10)), 10);
        assert_eq!(clamp_limit(Some(10_000)), MAX_LIMIT);
    }
}
