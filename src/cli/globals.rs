use secrecy::SecretString;

/// Parsed global configuration shared by the server action.
#[derive(Debug, Clone)]
pub struct GlobalArgs {
    pub jwt_secret: SecretString,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub email_encryption_key: SecretString,
    pub redis_url: Option<String>,
}

impl GlobalArgs {
    #[must_use]
    pub fn new(jwt_secret: SecretString, email_encryption_key: SecretString) -> Self {
        Self {
            jwt_secret,
            access_ttl_seconds: 15 * 60,
            refresh_ttl_seconds: 7 * 24 * 60 * 60,
            email_encryption_key,
            redis_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_global_args() {
        let args = GlobalArgs::new(
            SecretString::from("jwt-secret"),
            SecretString::from("key-material"),
        );
        assert_eq!(args.jwt_secret.expose_secret(), "jwt-secret");
        assert_eq!(args.access_ttl_seconds, 900);
        assert_eq!(args.refresh_ttl_seconds, 604_800);
        assert!(args.redis_url.is_none());
    }
}
