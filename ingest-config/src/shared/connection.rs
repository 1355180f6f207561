use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

/// Connection settings for the warehouse database.
///
/// This intentionally does not implement [`serde::Serialize`] so the password
/// cannot leak into serialized forms.
#[derive(Clone, Debug, Deserialize)]
pub struct PgConnectionConfig {
    /// Host on which the database is running.
    pub host: String,
    /// Port on which the database is running.
    pub port: u16,
    /// Name of the database to connect to.
    pub name: String,
    /// Username for authentication.
    pub username: String,
    /// Password for authentication.
    pub password: Option<SecretString>,
    /// Require TLS for the connection when true.
    #[serde(default)]
    pub require_tls: bool,
}

impl PgConnectionConfig {
    /// Builds `sqlx` connect options from this configuration.
    pub fn to_connect_options(&self) -> PgConnectOptions {
        let ssl_mode = if self.require_tls {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };

        let mut options = PgConnectOptions::new_without_pgpass()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.username)
            .ssl_mode(ssl_mode);

        if let Some(password) = &self.password {
            options = options.password(password.expose_secret());
        }

        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_is_redacted_in_debug_output() {
        let config = PgConnectionConfig {
            host: "localhost".to_string(),
            port: 5432,
            name: "warehouse".to_string(),
            username: "ingest".to_string(),
            password: Some(SecretString::from("super-secret".to_string())),
            require_tls: false,
        };

        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
    }
}
