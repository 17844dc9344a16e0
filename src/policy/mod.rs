//! MFA policy resolution.
//!
//! `resolve` is a pure function over the loaded configuration: no clock, no
//! database, no randomness. The orchestrator loads the inputs, asks for the
//! requirement, and acts on it; the enforcement engine layers grace-period
//! state on top separately.

pub mod config;

pub use config::{
    fetch_role_config, fetch_system_config, fetch_user_preferences, load_or_init_system_config,
    set_alternate_email, set_email_2fa_enabled, set_preferred_method, update_system_config,
    upsert_role_config, verify_alternate_email, CodeFormat, LockoutBehavior, LoggingLevel,
    MethodChangeBehavior, MfaMethod, MfaMode, RoleMfaConfig, RoleMfaConfigUpdate, SystemMfaConfig,
    SystemMfaConfigUpdate, UserControl, UserMfaPreferences,
};

use serde::Serialize;

/// Where a requirement came from, for auditing and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementSource {
    Disabled,
    RoleConfig,
    UserPreference,
    SystemMode,
    NotRequired,
}

/// The outcome of policy resolution: whether MFA is needed and which methods
/// satisfy it. For `totp_email_required`, `methods` holds both and all of
/// them must pass within one challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MfaRequirement {
    pub required: bool,
    pub methods: Vec<MfaMethod>,
    pub source: RequirementSource,
}

impl MfaRequirement {
    fn not_required(source: RequirementSource) -> Self {
        Self {
            required: false,
            methods: Vec::new(),
            source,
        }
    }

    /// True when every named method must verify (required-both mode).
    #[must_use]
    pub fn requires_all(&self) -> bool {
        self.methods.len() > 1
    }

    #[must_use]
    pub fn allows(&self, method: MfaMethod) -> bool {
        self.methods.contains(&method)
    }
}

/// Resolve the MFA requirement for one user.
///
/// `has_totp` means an enabled, setup-verified TOTP secret exists;
/// `has_email_enabled` mirrors `prefs.email_2fa_enabled` (passed separately
/// so callers that already joined the flag avoid a second prefs load).
#[must_use]
pub fn resolve(
    system: &SystemMfaConfig,
    role_config: Option<&RoleMfaConfig>,
    prefs: Option<&UserMfaPreferences>,
    has_totp: bool,
    has_email_enabled: bool,
) -> MfaRequirement {
    // Disabled short-circuits everything, including user preferences.
    if system.mode == MfaMode::Disabled {
        return MfaRequirement::not_required(RequirementSource::Disabled);
    }

    if let Some(role_config) = role_config {
        if role_config.required {
            if let Some(&method) = role_config.allowed_methods.first() {
                return MfaRequirement {
                    required: true,
                    methods: vec![method],
                    source: RequirementSource::RoleConfig,
                };
            }
        }
    }

    if has_email_enabled || prefs.is_some_and(|p| p.email_2fa_enabled) {
        return MfaRequirement {
            required: true,
            methods: vec![MfaMethod::Email],
            source: RequirementSource::UserPreference,
        };
    }

    let methods = match system.mode {
        MfaMode::TotpOnly => vec![MfaMethod::Totp],
        MfaMode::EmailOnly => vec![MfaMethod::Email],
        MfaMode::TotpEmailRequired => vec![MfaMethod::Totp, MfaMethod::Email],
        MfaMode::TotpEmailFallback => {
            if has_totp {
                vec![MfaMethod::Totp]
            } else {
                vec![MfaMethod::Email]
            }
        }
        MfaMode::Disabled => unreachable!("disabled handled above"),
    };

    MfaRequirement {
        required: true,
        methods,
        source: RequirementSource::SystemMode,
    }
}

/// OTP settings after applying role overrides onto the system config.
#[derive(Debug, Clone, Copy)]
pub struct EffectiveOtpSettings {
    pub code_format: CodeFormat,
    pub code_expiration_minutes: i32,
    pub max_failed_attempts: i32,
    pub lockout_behavior: LockoutBehavior,
    pub lockout_duration_minutes: i32,
    pub resend_rate_limit: i32,
    pub resend_cooldown_seconds: i32,
}

impl EffectiveOtpSettings {
    #[must_use]
    pub fn derive(system: &SystemMfaConfig, role_config: Option<&RoleMfaConfig>) -> Self {
        Self {
            code_format: system.code_format,
            code_expiration_minutes: role_config
                .and_then(|r| r.code_expiration_minutes)
                .unwrap_or(system.code_expiration_minutes),
            max_failed_attempts: role_config
                .and_then(|r| r.max_failed_attempts)
                .unwrap_or(system.max_failed_attempts),
            lockout_behavior: role_config
                .and_then(|r| r.lockout_behavior)
                .unwrap_or(system.lockout_behavior),
            lockout_duration_minutes: role_config
                .and_then(|r| r.lockout_duration_minutes)
                .unwrap_or(system.lockout_duration_minutes),
            resend_rate_limit: system.resend_rate_limit,
            resend_cooldown_seconds: system.resend_cooldown_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::Role;

    fn system(mode: MfaMode) -> SystemMfaConfig {
        SystemMfaConfig {
            mode,
            ..SystemMfaConfig::default()
        }
    }

    fn prefs_email_enabled() -> UserMfaPreferences {
        UserMfaPreferences {
            user_id: 1,
            email_2fa_enabled: true,
            ..UserMfaPreferences::default()
        }
    }

    #[test]
    fn disabled_mode_wins_over_user_preference() {
        let requirement = resolve(
            &system(MfaMode::Disabled),
            None,
            Some(&prefs_email_enabled()),
            true,
            true,
        );
        assert!(!requirement.required);
        assert_eq!(requirement.source, RequirementSource::Disabled);
    }

    #[test]
    fn role_config_takes_precedence() {
        let role = RoleMfaConfig {
            role: Role::Admin,
            required: true,
            allowed_methods: vec![MfaMethod::Totp, MfaMethod::Email],
            code_expiration_minutes: None,
            max_failed_attempts: None,
            lockout_behavior: None,
            lockout_duration_minutes: None,
            exempt_from_enforcement: false,
        };
        let requirement = resolve(
            &system(MfaMode::EmailOnly),
            Some(&role),
            Some(&prefs_email_enabled()),
            false,
            true,
        );
        assert!(requirement.required);
        assert_eq!(requirement.methods, vec![MfaMethod::Totp]);
        assert_eq!(requirement.source, RequirementSource::RoleConfig);
    }

    #[test]
    fn user_preference_forces_email() {
        let requirement = resolve(
            &system(MfaMode::TotpOnly),
            None,
            Some(&prefs_email_enabled()),
            true,
            true,
        );
        assert!(requirement.required);
        assert_eq!(requirement.methods, vec![MfaMethod::Email]);
        assert_eq!(requirement.source, RequirementSource::UserPreference);
    }

    #[test]
    fn mode_maps_to_methods() {
        let requirement = resolve(&system(MfaMode::TotpOnly), None, None, true, false);
        assert_eq!(requirement.methods, vec![MfaMethod::Totp]);

        let requirement = resolve(&system(MfaMode::EmailOnly), None, None, false, false);
        assert_eq!(requirement.methods, vec![MfaMethod::Email]);

        let requirement = resolve(&system(MfaMode::TotpEmailRequired), None, None, true, false);
        assert_eq!(requirement.methods, vec![MfaMethod::Totp, MfaMethod::Email]);
        assert!(requirement.requires_all());
    }

    #[test]
    fn fallback_mode_picks_totp_when_enrolled() {
        let requirement = resolve(&system(MfaMode::TotpEmailFallback), None, None, true, false);
        assert_eq!(requirement.methods, vec![MfaMethod::Totp]);

        let requirement = resolve(&system(MfaMode::TotpEmailFallback), None, None, false, false);
        assert_eq!(requirement.methods, vec![MfaMethod::Email]);
    }

    #[test]
    fn resolve_is_deterministic() {
        let config = system(MfaMode::TotpEmailRequired);
        let first = resolve(&config, None, None, true, false);
        let second = resolve(&config, None, None, true, false);
        assert_eq!(first, second);
    }

    #[test]
    fn role_overrides_apply_to_otp_settings() {
        let config = SystemMfaConfig::default();
        let role = RoleMfaConfig {
            role: Role::SuperAdmin,
            required: true,
            allowed_methods: vec![MfaMethod::Totp],
            code_expiration_minutes: Some(5),
            max_failed_attempts: Some(3),
            lockout_behavior: Some(LockoutBehavior::AdminIntervention),
            lockout_duration_minutes: None,
            exempt_from_enforcement: false,
        };
        let effective = EffectiveOtpSettings::derive(&config, Some(&role));
        assert_eq!(effective.code_expiration_minutes, 5);
        assert_eq!(effective.max_failed_attempts, 3);
        assert_eq!(
            effective.lockout_behavior,
            LockoutBehavior::AdminIntervention
        );
        assert_eq!(
            effective.lockout_duration_minutes,
            config.lockout_duration_minutes
        );
    }
}
