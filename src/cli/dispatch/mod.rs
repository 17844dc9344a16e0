use crate::cli::{actions::Action, globals::GlobalArgs};
use crate::session::parse_lifetime;
use anyhow::{Context, Result};
use secrecy::SecretString;

pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let jwt_secret = matches
        .get_one::<String>("jwt-secret")
        .map(|s| SecretString::from(s.clone()))
        .context("missing required argument: --jwt-secret")?;
    let email_encryption_key = matches
        .get_one::<String>("email-encryption-key")
        .map(|s| SecretString::from(s.clone()))
        .context("missing required argument: --email-encryption-key")?;

    let mut globals = GlobalArgs::new(jwt_secret, email_encryption_key);

    if let Some(value) = matches.get_one::<String>("jwt-access-expires-in") {
        globals.access_ttl_seconds =
            parse_lifetime(value).context("invalid --jwt-access-expires-in")?;
    }
    if let Some(value) = matches.get_one::<String>("jwt-refresh-expires-in") {
        globals.refresh_ttl_seconds =
            parse_lifetime(value).context("invalid --jwt-refresh-expires-in")?;
    }
    globals.redis_url = matches.get_one::<String>("redis-url").cloned();

    Ok(Action::Server {
        port: matches.get_one::<u16>("port").copied().unwrap_or(8080),
        dsn: matches
            .get_one("dsn")
            .map(|s: &String| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --dsn"))?,
        globals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;
    use secrecy::ExposeSecret;

    #[test]
    fn handler_builds_server_action() {
        let matches = commands::new().get_matches_from([
            "identeco",
            "--dsn",
            "postgres://localhost/identeco",
            "--jwt-secret",
            "secret",
            "--email-encryption-key",
            "0123456789abcdef0123456789abcdef",
            "--jwt-access-expires-in",
            "30m",
            "--jwt-refresh-expires-in",
            "14d",
        ]);
        let action = handler(&matches).unwrap();
        let Action::Server { port, dsn, globals } = action;
        assert_eq!(port, 8080);
        assert_eq!(dsn, "postgres://localhost/identeco");
        assert_eq!(globals.jwt_secret.expose_secret(), "secret");
        assert_eq!(globals.access_ttl_seconds, 30 * 60);
        assert_eq!(globals.refresh_ttl_seconds, 14 * 24 * 60 * 60);
    }
}
