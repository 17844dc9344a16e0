//! OpenAPI document assembled from the annotated handlers.

use axum::response::Json;
use utoipa::OpenApi;

use crate::api::handlers;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "identeco",
        description = "Authentication, MFA and session lifecycle service"
    ),
    paths(
        handlers::health::health,
        handlers::auth::register,
        handlers::auth::login,
        handlers::auth::verify_mfa,
        handlers::auth::resend_code,
        handlers::auth::refresh,
        handlers::auth::logout,
        handlers::auth::verify_email,
        handlers::auth::password_reset_request,
        handlers::auth::password_reset_confirm,
        handlers::auth::change_password,
        handlers::auth::mfa::totp_enroll_start,
        handlers::auth::mfa::totp_enroll_finish,
        handlers::auth::mfa::totp_disable,
        handlers::auth::mfa::email_2fa_enable,
        handlers::auth::mfa::email_2fa_disable,
        handlers::auth::mfa::backup_codes_regenerate,
        handlers::auth::mfa::alternate_email_set,
        handlers::auth::mfa::alternate_email_verify,
        handlers::auth::mfa::preferred_method_set,
        handlers::auth::mfa::mfa_status,
        handlers::admin::get_system_config,
        handlers::admin::update_system_config,
        handlers::admin::get_role_config,
        handlers::admin::update_role_config,
        handlers::admin::apply_enforcement,
        handlers::admin::unlock_user,
        handlers::admin::force_transition,
        handlers::admin::update_user,
        handlers::admin::archive_user,
        handlers::admin::anonymize_user,
        handlers::admin::revoke_sessions,
        handlers::admin::audit_retention,
        handlers::security::list_login_attempts,
        handlers::security::list_security_events,
        handlers::security::acknowledge_events,
    ),
    tags(
        (name = "auth", description = "Login, registration, MFA verification"),
        (name = "mfa", description = "Self-service MFA management"),
        (name = "admin", description = "Administrative configuration and user management"),
        (name = "security", description = "Login attempts and security events"),
        (name = "health", description = "Service health")
    )
)]
pub struct ApiDoc;

/// Serve the document as JSON.
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_contains_core_paths() {
        let doc = ApiDoc::openapi();
        let paths = &doc.paths.paths;
        assert!(paths.contains_key("/v1/auth/login"));
        assert!(paths.contains_key("/v1/auth/mfa/verify"));
        assert!(paths.contains_key("/v1/auth/refresh"));
        assert!(paths.contains_key("/v1/admin/mfa/config"));
        assert!(paths.contains_key("/health"));
    }
}
