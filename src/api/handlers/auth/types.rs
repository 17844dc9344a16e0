//! Request/response types for auth endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::users::{Role, User};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegisterResponse {
    pub user_id: i64,
    pub username: String,
    pub email: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct UserInfo {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub role: Role,
}

impl From<&User> for UserInfo {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub access_expires_at: DateTime<Utc>,
    pub user: UserInfo,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MfaRequiredResponse {
    pub mfa_required: bool,
    pub challenge_token: String,
    pub allowed_methods: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct VerifyMfaRequest {
    pub challenge_token: String,
    /// One of `totp`, `email`, `backup_code`.
    pub method: String,
    pub code: String,
    #[serde(default)]
    pub trust_device: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MfaPartialResponse {
    pub mfa_required: bool,
    pub verified_methods: Vec<String>,
    pub pending_methods: Vec<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MfaFallbackResponse {
    pub mfa_required: bool,
    pub fallback_engaged: bool,
    pub allowed_methods: Vec<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ResendCodeRequest {
    pub challenge_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ResendCodeResponse {
    pub expires_at: DateTime<Utc>,
    pub can_resend_at: DateTime<Utc>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RefreshResponse {
    pub access_token: String,
    pub token_type: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LogoutRequest {
    pub refresh_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct VerifyEmailRequest {
    pub token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct PasswordResetRequest {
    pub email: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct PasswordResetConfirmRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct PasswordChangeRequest {
    pub current_password: String,
    pub new_password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_request_defaults_remember_me() {
        let request: LoginRequest =
            serde_json::from_str(r#"{"email": "alice@x.com", "password": "pw"}"#).unwrap();
        assert!(!request.remember_me);
    }

    #[test]
    fn verify_request_defaults_trust_device() {
        let request: VerifyMfaRequest = serde_json::from_str(
            r#"{"challenge_token": "t", "method": "totp", "code": "123456"}"#,
        )
        .unwrap();
        assert!(!request.trust_device);
        assert_eq!(request.method, "totp");
    }

    #[test]
    fn session_response_round_trips() {
        let response = SessionResponse {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            token_type: "Bearer".to_string(),
            access_expires_at: Utc::now(),
            user: UserInfo {
                id: 1,
                username: "alice".to_string(),
                email: "alice@x.com".to_string(),
                role: Role::User,
            },
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["token_type"], "Bearer");
        assert_eq!(value["user"]["role"], "user");
    }
}
