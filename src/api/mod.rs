//! Server assembly: pool, startup checks, router, layers, and background
//! workers.

use crate::{
    auth::{challenge, Orchestrator},
    cli::globals::GlobalArgs,
    otp::{totp::TotpEngine, OtpEngine},
    policy,
    session::{storage as session_storage, SessionConfig, SessionManager},
    token::MasterKey,
};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request,
    },
    routing::{delete, get, post, put},
    Extension, Router,
};
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{info, info_span, warn, Span};
use ulid::Ulid;

pub(crate) mod email;
pub(crate) mod handlers;
mod openapi;

pub use openapi::ApiDoc;

const MAINTENANCE_INTERVAL_SECONDS: u64 = 5 * 60;

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(port: u16, dsn: String, globals: &GlobalArgs) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(20)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    // Fail the boot, not the first request, on a bad master key.
    let master_key = MasterKey::parse(globals.email_encryption_key.expose_secret())
        .context("Invalid EMAIL_ENCRYPTION_KEY")?;
    master_key.probe().context("Master key probe failed")?;

    // Deterministic singleton init: the config row exists before the
    // listener binds, so the first two requests cannot race over it.
    let config = policy::load_or_init_system_config(&pool).await?;
    info!(mode = config.mode.as_str(), "system MFA config loaded");

    let session_config = SessionConfig::new(globals.jwt_secret.clone())
        .with_access_ttl_seconds(globals.access_ttl_seconds)
        .with_refresh_ttl_seconds(globals.refresh_ttl_seconds);
    let sessions = SessionManager::new(pool.clone(), session_config);
    let otp = OtpEngine::new(pool.clone());
    let totp = TotpEngine::new(pool.clone(), master_key, "identeco".to_string());
    let orchestrator = Arc::new(Orchestrator::new(pool.clone(), sessions, otp, totp));

    // Background worker polls email_outbox (DB-backed queue) for pending
    // rows, delivers them, and retries failures with backoff.
    email::spawn_outbox_worker(
        pool.clone(),
        Arc::new(email::LogEmailSender),
        email::EmailWorkerConfig::new(),
    );
    spawn_maintenance(pool.clone());

    let cors = CorsLayer::new()
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static("x-device-fingerprint"),
        ])
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_origin(AllowOrigin::mirror_request());

    let app = router()
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(orchestrator))
                .layer(Extension(pool.clone())),
        )
        .layer(Extension(pool));

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

/// All documented routes.
fn router() -> Router {
    Router::new()
        .route("/", get(|| async { env!("CARGO_PKG_NAME") }))
        .route("/health", get(handlers::health))
        .route("/openapi.json", get(openapi::openapi_json))
        .route("/v1/auth/register", post(handlers::auth::register))
        .route("/v1/auth/login", post(handlers::auth::login))
        .route("/v1/auth/mfa/verify", post(handlers::auth::verify_mfa))
        .route("/v1/auth/mfa/resend", post(handlers::auth::resend_code))
        .route("/v1/auth/refresh", post(handlers::auth::refresh))
        .route("/v1/auth/logout", post(handlers::auth::logout))
        .route("/v1/auth/verify-email", post(handlers::auth::verify_email))
        .route(
            "/v1/auth/password-reset/request",
            post(handlers::auth::password_reset_request),
        )
        .route(
            "/v1/auth/password-reset/confirm",
            post(handlers::auth::password_reset_confirm),
        )
        .route("/v1/me/password", post(handlers::auth::change_password))
        .route(
            "/v1/mfa/totp/enroll/start",
            post(handlers::auth::mfa::totp_enroll_start),
        )
        .route(
            "/v1/mfa/totp/enroll/finish",
            post(handlers::auth::mfa::totp_enroll_finish),
        )
        .route("/v1/mfa/totp", delete(handlers::auth::mfa::totp_disable))
        .route(
            "/v1/mfa/email/enable",
            post(handlers::auth::mfa::email_2fa_enable),
        )
        .route(
            "/v1/mfa/email/disable",
            post(handlers::auth::mfa::email_2fa_disable),
        )
        .route(
            "/v1/mfa/backup-codes/regenerate",
            post(handlers::auth::mfa::backup_codes_regenerate),
        )
        .route(
            "/v1/mfa/alternate-email",
            post(handlers::auth::mfa::alternate_email_set),
        )
        .route(
            "/v1/mfa/alternate-email/verify",
            post(handlers::auth::mfa::alternate_email_verify),
        )
        .route(
            "/v1/mfa/preferred-method",
            post(handlers::auth::mfa::preferred_method_set),
        )
        .route("/v1/mfa/status", get(handlers::auth::mfa::mfa_status))
        .route(
            "/v1/admin/mfa/config",
            get(handlers::admin::get_system_config).put(handlers::admin::update_system_config),
        )
        .route(
            "/v1/admin/mfa/roles/:role",
            get(handlers::admin::get_role_config).put(handlers::admin::update_role_config),
        )
        .route(
            "/v1/admin/mfa/enforce",
            post(handlers::admin::apply_enforcement),
        )
        .route(
            "/v1/admin/users/:id",
            put(handlers::admin::update_user),
        )
        .route(
            "/v1/admin/users/:id/unlock",
            post(handlers::admin::unlock_user),
        )
        .route(
            "/v1/admin/users/:id/force-transition",
            post(handlers::admin::force_transition),
        )
        .route(
            "/v1/admin/users/:id/archive",
            post(handlers::admin::archive_user),
        )
        .route(
            "/v1/admin/users/:id/anonymize",
            post(handlers::admin::anonymize_user),
        )
        .route(
            "/v1/admin/users/:id/revoke-sessions",
            post(handlers::admin::revoke_sessions),
        )
        .route(
            "/v1/admin/audit/retention",
            post(handlers::admin::audit_retention),
        )
        .route(
            "/v1/security/login-attempts",
            get(handlers::security::list_login_attempts),
        )
        .route(
            "/v1/security/events",
            get(handlers::security::list_security_events),
        )
        .route(
            "/v1/security/events/acknowledge",
            post(handlers::security::acknowledge_events),
        )
}

/// Periodic sweeper: stale challenges and expired device trust.
fn spawn_maintenance(pool: sqlx::PgPool) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(MAINTENANCE_INTERVAL_SECONDS)).await;
            if let Err(err) = challenge::delete_stale(&pool).await {
                warn!("challenge sweep failed: {err}");
            }
            if let Err(err) = session_storage::delete_expired_trusted_devices(&pool).await {
                warn!("trusted device sweep failed: {err}");
            }
        }
    })
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_builds() {
        // Route registration panics on malformed paths; building is the test.
        let _ = router();
    }
}
