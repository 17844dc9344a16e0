//! MFA configuration models: the singleton system row, per-role overrides,
//! and per-user preferences.
//!
//! Textual enum columns are parsed through `from_db` so an unexpected value
//! surfaces as a decode error instead of silently degrading policy.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, PgPool, Row};
use tracing::Instrument;

use crate::users::Role;

fn decode_error(column: &str, value: &str) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("invalid {column} value: {value}"),
    )))
}

/// System-wide MFA mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MfaMode {
    Disabled,
    TotpOnly,
    EmailOnly,
    TotpEmailRequired,
    TotpEmailFallback,
}

impl MfaMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::TotpOnly => "totp_only",
            Self::EmailOnly => "email_only",
            Self::TotpEmailRequired => "totp_email_required",
            Self::TotpEmailFallback => "totp_email_fallback",
        }
    }

    fn from_db(value: &str) -> Result<Self, sqlx::Error> {
        match value {
            "disabled" => Ok(Self::Disabled),
            "totp_only" => Ok(Self::TotpOnly),
            "email_only" => Ok(Self::EmailOnly),
            "totp_email_required" => Ok(Self::TotpEmailRequired),
            "totp_email_fallback" => Ok(Self::TotpEmailFallback),
            other => Err(decode_error("mfa_config.mode", other)),
        }
    }
}

/// Email OTP code shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CodeFormat {
    Numeric6,
    Numeric8,
    Alphanumeric6,
}

impl CodeFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Numeric6 => "numeric_6",
            Self::Numeric8 => "numeric_8",
            Self::Alphanumeric6 => "alphanumeric_6",
        }
    }

    fn from_db(value: &str) -> Result<Self, sqlx::Error> {
        match value {
            "numeric_6" => Ok(Self::Numeric6),
            "numeric_8" => Ok(Self::Numeric8),
            "alphanumeric_6" => Ok(Self::Alphanumeric6),
            other => Err(decode_error("mfa_config.code_format", other)),
        }
    }
}

/// What a lockout means once `max_failed_attempts` is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LockoutBehavior {
    TemporaryLockout,
    RequirePassword,
    AdminIntervention,
}

impl LockoutBehavior {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TemporaryLockout => "temporary_lockout",
            Self::RequirePassword => "require_password",
            Self::AdminIntervention => "admin_intervention",
        }
    }

    fn from_db(value: &str) -> Result<Self, sqlx::Error> {
        match value {
            "temporary_lockout" => Ok(Self::TemporaryLockout),
            "require_password" => Ok(Self::RequirePassword),
            "admin_intervention" => Ok(Self::AdminIntervention),
            other => Err(decode_error("mfa_config.lockout_behavior", other)),
        }
    }
}

/// Who is allowed to change a user's MFA methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UserControl {
    UserManaged,
    AdminControlled,
}

impl UserControl {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserManaged => "user_managed",
            Self::AdminControlled => "admin_controlled",
        }
    }

    fn from_db(value: &str) -> Result<Self, sqlx::Error> {
        match value {
            "user_managed" => Ok(Self::UserManaged),
            "admin_controlled" => Ok(Self::AdminControlled),
            other => Err(decode_error("mfa_config.user_control", other)),
        }
    }
}

/// How an admin-initiated method change lands on existing users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MethodChangeBehavior {
    Immediate,
    GracePeriod,
    Grandfathered,
}

impl MethodChangeBehavior {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::GracePeriod => "grace_period",
            Self::Grandfathered => "grandfathered",
        }
    }

    fn from_db(value: &str) -> Result<Self, sqlx::Error> {
        match value {
            "immediate" => Ok(Self::Immediate),
            "grace_period" => Ok(Self::GracePeriod),
            "grandfathered" => Ok(Self::Grandfathered),
            other => Err(decode_error("mfa_config.method_change_behavior", other)),
        }
    }
}

/// Audit verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoggingLevel {
    Comprehensive,
    SecurityOnly,
    None,
}

impl LoggingLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Comprehensive => "comprehensive",
            Self::SecurityOnly => "security_only",
            Self::None => "none",
        }
    }

    fn from_db(value: &str) -> Result<Self, sqlx::Error> {
        match value {
            "comprehensive" => Ok(Self::Comprehensive),
            "security_only" => Ok(Self::SecurityOnly),
            "none" => Ok(Self::None),
            other => Err(decode_error("mfa_config.logging_level", other)),
        }
    }
}

/// Second-factor methods the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MfaMethod {
    Totp,
    Email,
    BackupCode,
}

impl MfaMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::Email => "email",
            Self::BackupCode => "backup_code",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "totp" => Some(Self::Totp),
            "email" => Some(Self::Email),
            "backup_code" => Some(Self::BackupCode),
            _ => None,
        }
    }
}

/// The singleton system MFA configuration row.
#[derive(Debug, Clone, Serialize)]
pub struct SystemMfaConfig {
    pub mode: MfaMode,
    pub code_format: CodeFormat,
    pub code_expiration_minutes: i32,
    pub max_failed_attempts: i32,
    pub lockout_behavior: LockoutBehavior,
    pub lockout_duration_minutes: i32,
    pub resend_rate_limit: i32,
    pub resend_cooldown_seconds: i32,
    pub fallback_totp_attempts: i32,
    pub backup_codes_for_totp: bool,
    pub backup_codes_for_email: bool,
    pub user_control: UserControl,
    pub method_change_behavior: MethodChangeBehavior,
    pub method_change_grace_days: i32,
    pub device_trust_enabled: bool,
    pub device_trust_duration_days: i32,
    pub enforcement_enabled: bool,
    pub enforcement_grace_days: i32,
    pub enforcement_started_at: Option<DateTime<Utc>>,
    pub logging_level: LoggingLevel,
    pub notification_level: LoggingLevel,
    pub updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for SystemMfaConfig {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let mode: String = row.try_get("mode")?;
        let code_format: String = row.try_get("code_format")?;
        let lockout_behavior: String = row.try_get("lockout_behavior")?;
        let user_control: String = row.try_get("user_control")?;
        let method_change_behavior: String = row.try_get("method_change_behavior")?;
        let logging_level: String = row.try_get("logging_level")?;
        let notification_level: String = row.try_get("notification_level")?;
        Ok(Self {
            mode: MfaMode::from_db(&mode)?,
            code_format: CodeFormat::from_db(&code_format)?,
            code_expiration_minutes: row.try_get("code_expiration_minutes")?,
            max_failed_attempts: row.try_get("max_failed_attempts")?,
            lockout_behavior: LockoutBehavior::from_db(&lockout_behavior)?,
            lockout_duration_minutes: row.try_get("lockout_duration_minutes")?,
            resend_rate_limit: row.try_get("resend_rate_limit")?,
            resend_cooldown_seconds: row.try_get("resend_cooldown_seconds")?,
            fallback_totp_attempts: row.try_get("fallback_totp_attempts")?,
            backup_codes_for_totp: row.try_get("backup_codes_for_totp")?,
            backup_codes_for_email: row.try_get("backup_codes_for_email")?,
            user_control: UserControl::from_db(&user_control)?,
            method_change_behavior: MethodChangeBehavior::from_db(&method_change_behavior)?,
            method_change_grace_days: row.try_get("method_change_grace_days")?,
            device_trust_enabled: row.try_get("device_trust_enabled")?,
            device_trust_duration_days: row.try_get("device_trust_duration_days")?,
            enforcement_enabled: row.try_get("enforcement_enabled")?,
            enforcement_grace_days: row.try_get("enforcement_grace_days")?,
            enforcement_started_at: row.try_get("enforcement_started_at")?,
            logging_level: LoggingLevel::from_db(&logging_level)?,
            notification_level: LoggingLevel::from_db(&notification_level)?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl Default for SystemMfaConfig {
    fn default() -> Self {
        Self {
            mode: MfaMode::Disabled,
            code_format: CodeFormat::Numeric6,
            code_expiration_minutes: 10,
            max_failed_attempts: 5,
            lockout_behavior: LockoutBehavior::TemporaryLockout,
            lockout_duration_minutes: 15,
            resend_rate_limit: 5,
            resend_cooldown_seconds: 60,
            fallback_totp_attempts: 3,
            backup_codes_for_totp: true,
            backup_codes_for_email: false,
            user_control: UserControl::UserManaged,
            method_change_behavior: MethodChangeBehavior::GracePeriod,
            method_change_grace_days: 7,
            device_trust_enabled: false,
            device_trust_duration_days: 30,
            enforcement_enabled: false,
            enforcement_grace_days: 14,
            enforcement_started_at: None,
            logging_level: LoggingLevel::Comprehensive,
            notification_level: LoggingLevel::SecurityOnly,
            updated_at: Utc::now(),
        }
    }
}

/// Explicit update DTO for the system config: absent fields stay untouched,
/// unknown keys are rejected at deserialization.
#[derive(Debug, Clone, Default, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct SystemMfaConfigUpdate {
    pub mode: Option<MfaMode>,
    pub code_format: Option<CodeFormat>,
    pub code_expiration_minutes: Option<i32>,
    pub max_failed_attempts: Option<i32>,
    pub lockout_behavior: Option<LockoutBehavior>,
    pub lockout_duration_minutes: Option<i32>,
    pub resend_rate_limit: Option<i32>,
    pub resend_cooldown_seconds: Option<i32>,
    pub fallback_totp_attempts: Option<i32>,
    pub backup_codes_for_totp: Option<bool>,
    pub backup_codes_for_email: Option<bool>,
    pub user_control: Option<UserControl>,
    pub method_change_behavior: Option<MethodChangeBehavior>,
    pub method_change_grace_days: Option<i32>,
    pub device_trust_enabled: Option<bool>,
    pub device_trust_duration_days: Option<i32>,
    pub enforcement_enabled: Option<bool>,
    pub enforcement_grace_days: Option<i32>,
    pub logging_level: Option<LoggingLevel>,
    pub notification_level: Option<LoggingLevel>,
}

impl SystemMfaConfig {
    /// Merge an update DTO into a copy of this config.
    #[must_use]
    pub fn merged(&self, update: &SystemMfaConfigUpdate) -> Self {
        let mut next = self.clone();
        if let Some(mode) = update.mode {
            next.mode = mode;
        }
        if let Some(code_format) = update.code_format {
            next.code_format = code_format;
        }
        if let Some(v) = update.code_expiration_minutes {
            next.code_expiration_minutes = v;
        }
        if let Some(v) = update.max_failed_attempts {
            next.max_failed_attempts = v;
        }
        if let Some(v) = update.lockout_behavior {
            next.lockout_behavior = v;
        }
        if let Some(v) = update.lockout_duration_minutes {
            next.lockout_duration_minutes = v;
        }
        if let Some(v) = update.resend_rate_limit {
            next.resend_rate_limit = v;
        }
        if let Some(v) = update.resend_cooldown_seconds {
            next.resend_cooldown_seconds = v;
        }
        if let Some(v) = update.fallback_totp_attempts {
            next.fallback_totp_attempts = v;
        }
        if let Some(v) = update.backup_codes_for_totp {
            next.backup_codes_for_totp = v;
        }
        if let Some(v) = update.backup_codes_for_email {
            next.backup_codes_for_email = v;
        }
        if let Some(v) = update.user_control {
            next.user_control = v;
        }
        if let Some(v) = update.method_change_behavior {
            next.method_change_behavior = v;
        }
        if let Some(v) = update.method_change_grace_days {
            next.method_change_grace_days = v;
        }
        if let Some(v) = update.device_trust_enabled {
            next.device_trust_enabled = v;
        }
        if let Some(v) = update.device_trust_duration_days {
            next.device_trust_duration_days = v;
        }
        if let Some(v) = update.enforcement_enabled {
            next.enforcement_enabled = v;
        }
        if let Some(v) = update.enforcement_grace_days {
            next.enforcement_grace_days = v;
        }
        if let Some(v) = update.logging_level {
            next.logging_level = v;
        }
        if let Some(v) = update.notification_level {
            next.notification_level = v;
        }
        next
    }
}

const CONFIG_COLUMNS: &str = r"
    mode, code_format, code_expiration_minutes, max_failed_attempts,
    lockout_behavior, lockout_duration_minutes, resend_rate_limit,
    resend_cooldown_seconds, fallback_totp_attempts, backup_codes_for_totp,
    backup_codes_for_email, user_control, method_change_behavior,
    method_change_grace_days, device_trust_enabled, device_trust_duration_days,
    enforcement_enabled, enforcement_grace_days, enforcement_started_at,
    logging_level, notification_level, updated_at
";

/// Read the singleton config row, creating it with defaults when missing.
///
/// Runs during startup so the first two requests never race over creation.
pub async fn load_or_init_system_config(pool: &PgPool) -> Result<SystemMfaConfig> {
    let insert = r"
        INSERT INTO mfa_config (id)
        VALUES (1)
        ON CONFLICT (id) DO NOTHING
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = insert
    );
    sqlx::query(insert)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to seed mfa_config singleton")?;

    let select = format!("SELECT {CONFIG_COLUMNS} FROM mfa_config WHERE id = 1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = select.as_str()
    );
    let config = sqlx::query_as::<_, SystemMfaConfig>(&select)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to load mfa_config singleton")?;
    Ok(config)
}

/// Fetch the current system config.
pub async fn fetch_system_config(pool: &PgPool) -> Result<SystemMfaConfig> {
    let select = format!("SELECT {CONFIG_COLUMNS} FROM mfa_config WHERE id = 1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = select.as_str()
    );
    sqlx::query_as::<_, SystemMfaConfig>(&select)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to fetch mfa_config")
}

/// Persist a merged config inside the caller's transaction.
pub async fn update_system_config(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    config: &SystemMfaConfig,
) -> Result<()> {
    let query = r"
        UPDATE mfa_config
        SET mode = $1,
            code_format = $2,
            code_expiration_minutes = $3,
            max_failed_attempts = $4,
            lockout_behavior = $5,
            lockout_duration_minutes = $6,
            resend_rate_limit = $7,
            resend_cooldown_seconds = $8,
            fallback_totp_attempts = $9,
            backup_codes_for_totp = $10,
            backup_codes_for_email = $11,
            user_control = $12,
            method_change_behavior = $13,
            method_change_grace_days = $14,
            device_trust_enabled = $15,
            device_trust_duration_days = $16,
            enforcement_enabled = $17,
            enforcement_grace_days = $18,
            enforcement_started_at = $19,
            logging_level = $20,
            notification_level = $21,
            updated_at = NOW()
        WHERE id = 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(config.mode.as_str())
        .bind(config.code_format.as_str())
        .bind(config.code_expiration_minutes)
        .bind(config.max_failed_attempts)
        .bind(config.lockout_behavior.as_str())
        .bind(config.lockout_duration_minutes)
        .bind(config.resend_rate_limit)
        .bind(config.resend_cooldown_seconds)
        .bind(config.fallback_totp_attempts)
        .bind(config.backup_codes_for_totp)
        .bind(config.backup_codes_for_email)
        .bind(config.user_control.as_str())
        .bind(config.method_change_behavior.as_str())
        .bind(config.method_change_grace_days)
        .bind(config.device_trust_enabled)
        .bind(config.device_trust_duration_days)
        .bind(config.enforcement_enabled)
        .bind(config.enforcement_grace_days)
        .bind(config.enforcement_started_at)
        .bind(config.logging_level.as_str())
        .bind(config.notification_level.as_str())
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to update mfa_config")?;
    Ok(())
}

/// Per-role MFA overrides.
#[derive(Debug, Clone, Serialize)]
pub struct RoleMfaConfig {
    pub role: Role,
    pub required: bool,
    pub allowed_methods: Vec<MfaMethod>,
    pub code_expiration_minutes: Option<i32>,
    pub max_failed_attempts: Option<i32>,
    pub lockout_behavior: Option<LockoutBehavior>,
    pub lockout_duration_minutes: Option<i32>,
    pub exempt_from_enforcement: bool,
}

impl<'r> FromRow<'r, PgRow> for RoleMfaConfig {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let role: String = row.try_get("role")?;
        let methods: Vec<String> = row.try_get("allowed_methods")?;
        let lockout_behavior: Option<String> = row.try_get("lockout_behavior")?;
        let allowed_methods = methods
            .iter()
            .map(|value| {
                MfaMethod::parse(value)
                    .ok_or_else(|| decode_error("mfa_role_config.allowed_methods", value))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(Self {
            role: Role::parse(&role).ok_or_else(|| decode_error("mfa_role_config.role", &role))?,
            required: row.try_get("required")?,
            allowed_methods,
            code_expiration_minutes: row.try_get("code_expiration_minutes")?,
            max_failed_attempts: row.try_get("max_failed_attempts")?,
            lockout_behavior: lockout_behavior
                .as_deref()
                .map(LockoutBehavior::from_db)
                .transpose()?,
            lockout_duration_minutes: row.try_get("lockout_duration_minutes")?,
            exempt_from_enforcement: row.try_get("exempt_from_enforcement")?,
        })
    }
}

/// Update DTO for one role's config.
#[derive(Debug, Clone, Default, Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct RoleMfaConfigUpdate {
    pub required: Option<bool>,
    pub allowed_methods: Option<Vec<MfaMethod>>,
    pub code_expiration_minutes: Option<Option<i32>>,
    pub max_failed_attempts: Option<Option<i32>>,
    pub lockout_behavior: Option<Option<LockoutBehavior>>,
    pub lockout_duration_minutes: Option<Option<i32>>,
    pub exempt_from_enforcement: Option<bool>,
}

/// Fetch a role's config row, if one has been defined.
pub async fn fetch_role_config(pool: &PgPool, role: Role) -> Result<Option<RoleMfaConfig>> {
    let query = r"
        SELECT role, required, allowed_methods, code_expiration_minutes,
               max_failed_attempts, lockout_behavior, lockout_duration_minutes,
               exempt_from_enforcement
        FROM mfa_role_config
        WHERE role = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, RoleMfaConfig>(query)
        .bind(role.as_str())
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to fetch mfa_role_config")
}

/// Upsert one role's config inside the caller's transaction.
///
/// A required role must keep at least one allowed method.
pub async fn upsert_role_config(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    config: &RoleMfaConfig,
) -> Result<()> {
    let methods: Vec<String> = config
        .allowed_methods
        .iter()
        .map(|m| m.as_str().to_string())
        .collect();
    let query = r"
        INSERT INTO mfa_role_config
            (role, required, allowed_methods, code_expiration_minutes,
             max_failed_attempts, lockout_behavior, lockout_duration_minutes,
             exempt_from_enforcement, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
        ON CONFLICT (role) DO UPDATE SET
            required = EXCLUDED.required,
            allowed_methods = EXCLUDED.allowed_methods,
            code_expiration_minutes = EXCLUDED.code_expiration_minutes,
            max_failed_attempts = EXCLUDED.max_failed_attempts,
            lockout_behavior = EXCLUDED.lockout_behavior,
            lockout_duration_minutes = EXCLUDED.lockout_duration_minutes,
            exempt_from_enforcement = EXCLUDED.exempt_from_enforcement,
            updated_at = NOW()
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(config.role.as_str())
        .bind(config.required)
        .bind(&methods)
        .bind(config.code_expiration_minutes)
        .bind(config.max_failed_attempts)
        .bind(config.lockout_behavior.map(LockoutBehavior::as_str))
        .bind(config.lockout_duration_minutes)
        .bind(config.exempt_from_enforcement)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to upsert mfa_role_config")?;
    Ok(())
}

/// Per-user MFA preferences.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserMfaPreferences {
    pub user_id: i64,
    pub preferred_method: Option<MfaMethod>,
    pub email_2fa_enabled: bool,
    pub email_2fa_enabled_at: Option<DateTime<Utc>>,
    pub alternate_email: Option<String>,
    pub alternate_email_verified: bool,
    pub pending_method_change: Option<MfaMethod>,
    pub pending_change_deadline: Option<DateTime<Utc>>,
    pub grandfathered: bool,
}

impl<'r> FromRow<'r, PgRow> for UserMfaPreferences {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let preferred: Option<String> = row.try_get("preferred_method")?;
        let pending: Option<String> = row.try_get("pending_method_change")?;
        Ok(Self {
            user_id: row.try_get("user_id")?,
            preferred_method: preferred.as_deref().and_then(MfaMethod::parse),
            email_2fa_enabled: row.try_get("email_2fa_enabled")?,
            email_2fa_enabled_at: row.try_get("email_2fa_enabled_at")?,
            alternate_email: row.try_get("alternate_email")?,
            alternate_email_verified: row.try_get("alternate_email_verified")?,
            pending_method_change: pending.as_deref().and_then(MfaMethod::parse),
            pending_change_deadline: row.try_get("pending_change_deadline")?,
            grandfathered: row.try_get("grandfathered")?,
        })
    }
}

/// Fetch a user's preferences; absent row means defaults.
pub async fn fetch_user_preferences(pool: &PgPool, user_id: i64) -> Result<UserMfaPreferences> {
    let query = r"
        SELECT user_id, preferred_method, email_2fa_enabled, email_2fa_enabled_at,
               alternate_email, alternate_email_verified, pending_method_change,
               pending_change_deadline, grandfathered
        FROM user_mfa_preferences
        WHERE user_id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let prefs = sqlx::query_as::<_, UserMfaPreferences>(query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to fetch user_mfa_preferences")?;
    Ok(prefs.unwrap_or(UserMfaPreferences {
        user_id,
        ..UserMfaPreferences::default()
    }))
}

/// Flip the user's email-2FA flag, creating the preferences row on demand.
pub async fn set_email_2fa_enabled(pool: &PgPool, user_id: i64, enabled: bool) -> Result<()> {
    let query = r"
        INSERT INTO user_mfa_preferences (user_id, email_2fa_enabled, email_2fa_enabled_at)
        VALUES ($1, $2, CASE WHEN $2 THEN NOW() ELSE NULL END)
        ON CONFLICT (user_id) DO UPDATE SET
            email_2fa_enabled = EXCLUDED.email_2fa_enabled,
            email_2fa_enabled_at = CASE WHEN EXCLUDED.email_2fa_enabled THEN NOW() ELSE NULL END,
            updated_at = NOW()
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(enabled)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to set email_2fa_enabled")?;
    Ok(())
}

/// Set the preferred second factor.
pub async fn set_preferred_method(
    pool: &PgPool,
    user_id: i64,
    method: Option<MfaMethod>,
) -> Result<()> {
    let query = r"
        INSERT INTO user_mfa_preferences (user_id, preferred_method)
        VALUES ($1, $2)
        ON CONFLICT (user_id) DO UPDATE SET
            preferred_method = EXCLUDED.preferred_method,
            updated_at = NOW()
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(method.map(MfaMethod::as_str))
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to set preferred_method")?;
    Ok(())
}

/// Record an unverified alternate email together with its verification token
/// hash and expiry.
pub async fn set_alternate_email(
    pool: &PgPool,
    user_id: i64,
    email: &str,
    token_hash: &[u8],
    ttl_seconds: i64,
) -> Result<()> {
    let query = r"
        INSERT INTO user_mfa_preferences
            (user_id, alternate_email, alternate_email_verified,
             alternate_email_token_hash, alternate_email_token_expires_at)
        VALUES ($1, $2, FALSE, $3, NOW() + ($4 * INTERVAL '1 second'))
        ON CONFLICT (user_id) DO UPDATE SET
            alternate_email = EXCLUDED.alternate_email,
            alternate_email_verified = FALSE,
            alternate_email_token_hash = EXCLUDED.alternate_email_token_hash,
            alternate_email_token_expires_at = EXCLUDED.alternate_email_token_expires_at,
            updated_at = NOW()
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(email)
        .bind(token_hash)
        .bind(ttl_seconds)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to set alternate email")?;
    Ok(())
}

/// Consume an alternate-email verification token. Returns `false` when the
/// token is unknown, expired, or already consumed.
pub async fn verify_alternate_email(pool: &PgPool, token_hash: &[u8]) -> Result<bool> {
    let query = r"
        UPDATE user_mfa_preferences
        SET alternate_email_verified = TRUE,
            alternate_email_token_hash = NULL,
            alternate_email_token_expires_at = NULL,
            updated_at = NOW()
        WHERE alternate_email_token_hash = $1
          AND alternate_email_token_expires_at > NOW()
          AND alternate_email IS NOT NULL
        RETURNING user_id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to verify alternate email")?;
    Ok(row.is_some())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips() {
        for mode in [
            MfaMode::Disabled,
            MfaMode::TotpOnly,
            MfaMode::EmailOnly,
            MfaMode::TotpEmailRequired,
            MfaMode::TotpEmailFallback,
        ] {
            assert_eq!(MfaMode::from_db(mode.as_str()).unwrap(), mode);
        }
        assert!(MfaMode::from_db("sms_only").is_err());
    }

    #[test]
    fn code_format_round_trips() {
        for format in [
            CodeFormat::Numeric6,
            CodeFormat::Numeric8,
            CodeFormat::Alphanumeric6,
        ] {
            assert_eq!(CodeFormat::from_db(format.as_str()).unwrap(), format);
        }
    }

    #[test]
    fn method_parse_rejects_unknown() {
        assert_eq!(MfaMethod::parse("totp"), Some(MfaMethod::Totp));
        assert_eq!(MfaMethod::parse(" email "), Some(MfaMethod::Email));
        assert_eq!(MfaMethod::parse("push"), None);
    }

    #[test]
    fn merged_applies_only_present_fields() {
        let base = SystemMfaConfig::default();
        let update = SystemMfaConfigUpdate {
            mode: Some(MfaMode::EmailOnly),
            max_failed_attempts: Some(3),
            ..SystemMfaConfigUpdate::default()
        };
        let next = base.merged(&update);
        assert_eq!(next.mode, MfaMode::EmailOnly);
        assert_eq!(next.max_failed_attempts, 3);
        assert_eq!(next.code_expiration_minutes, base.code_expiration_minutes);
        assert_eq!(next.lockout_behavior, base.lockout_behavior);
    }

    #[test]
    fn update_dto_rejects_unknown_keys() {
        let result: Result<SystemMfaConfigUpdate, _> =
            serde_json::from_str(r#"{"mode": "email_only", "surprise": true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn update_dto_parses_snake_case_enums() {
        let update: SystemMfaConfigUpdate =
            serde_json::from_str(r#"{"lockout_behavior": "require_password"}"#).unwrap();
        assert_eq!(
            update.lockout_behavior,
            Some(LockoutBehavior::RequirePassword)
        );
    }
}
