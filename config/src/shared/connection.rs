use std::sync::LazyLock;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::Config;
use crate::shared::ValidationError;

const COMMON_DATESTYLE: &str = "ISO";
const COMMON_CLIENT_ENCODING: &str = "UTF8";
const COMMON_TIMEZONE: &str = "UTC";

/// Session settings for connections reading and writing synchronized tables.
pub static SYNC_CONNECTOR_OPTIONS: LazyLock<PgConnectionOptions> =
    LazyLock::new(|| PgConnectionOptions {
        datestyle: COMMON_DATESTYLE.to_string(),
        client_encoding: COMMON_CLIENT_ENCODING.to_string(),
        timezone: COMMON_TIMEZONE.to_string(),
        statement_timeout: 120_000,
        lock_timeout: 30_000,
        application_name: "syncer_connector".to_string(),
    });

/// Session settings for the persisted job and ledger state.
pub static SYNC_STATE_OPTIONS: LazyLock<PgConnectionOptions> =
    LazyLock::new(|| PgConnectionOptions {
        datestyle: COMMON_DATESTYLE.to_string(),
        client_encoding: COMMON_CLIENT_ENCODING.to_string(),
        timezone: COMMON_TIMEZONE.to_string(),
        statement_timeout: 30_000,
        lock_timeout: 10_000,
        application_name: "syncer_state".to_string(),
    });

/// Session settings for running state store migrations.
pub static SYNC_MIGRATION_OPTIONS: LazyLock<PgConnectionOptions> =
    LazyLock::new(|| PgConnectionOptions {
        datestyle: COMMON_DATESTYLE.to_string(),
        client_encoding: COMMON_CLIENT_ENCODING.to_string(),
        timezone: COMMON_TIMEZONE.to_string(),
        statement_timeout: 300_000,
        lock_timeout: 10_000,
        application_name: "syncer_migrations".to_string(),
    });

#[derive(Debug, Clone)]
pub struct PgConnectionOptions {
    pub datestyle: String,
    pub client_encoding: String,
    pub timezone: String,
    pub statement_timeout: u32,
    pub lock_timeout: u32,
    pub application_name: String,
}

impl PgConnectionOptions {
    pub fn to_key_value_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("datestyle".to_string(), self.datestyle.clone()),
            ("client_encoding".to_string(), self.client_encoding.clone()),
            ("timezone".to_string(), self.timezone.clone()),
            (
                "statement_timeout".to_string(),
                self.statement_timeout.to_string(),
            ),
            ("lock_timeout".to_string(), self.lock_timeout.to_string()),
            (
                "application_name".to_string(),
                self.application_name.clone(),
            ),
        ]
    }
}

/// Connection settings of a Postgres database.
///
/// Does not implement [`Serialize`] so the password cannot leak into serialized output.
#[derive(Debug, Clone, Deserialize)]
pub struct PgConnectionConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    pub password: Option<SecretString>,
    #[serde(default = "TlsConfig::disabled")]
    pub tls: TlsConfig,
}

impl PgConnectionConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.tls.validate()
    }
}

impl Config for PgConnectionConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

/// Same as [`PgConnectionConfig`] without the password.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgConnectionConfigWithoutSecrets {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    pub tls: TlsConfig,
}

impl From<PgConnectionConfig> for PgConnectionConfigWithoutSecrets {
    fn from(value: PgConnectionConfig) -> Self {
        PgConnectionConfigWithoutSecrets {
            host: value.host,
            port: value.port,
            name: value.name,
            username: value.username,
            tls: value.tls,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub trusted_root_certs: String,
    pub enabled: bool,
}

impl TlsConfig {
    pub fn disabled() -> Self {
        Self {
            trusted_root_certs: "".to_string(),
            enabled: false,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.enabled && self.trusted_root_certs.is_empty() {
            return Err(ValidationError::MissingTrustedRootCerts);
        }

        Ok(())
    }
}

pub trait IntoConnectOptions<Output> {
    fn without_db(&self, options: Option<&PgConnectionOptions>) -> Output;
    fn with_db(&self, options: Option<&PgConnectionOptions>) -> Output;
}

impl IntoConnectOptions<PgConnectOptions> for PgConnectionConfig {
    fn without_db(&self, options: Option<&PgConnectionOptions>) -> PgConnectOptions {
        let ssl_mode = if self.tls.enabled {
            PgSslMode::VerifyFull
        } else {
            PgSslMode::Prefer
        };
        let mut connect_options = PgConnectOptions::new_without_pgpass()
            .host(&self.host)
            .username(&self.username)
            .port(self.port)
            .ssl_mode(ssl_mode);

        if self.tls.enabled {
            connect_options = connect_options
                .ssl_root_cert_from_pem(self.tls.trusted_root_certs.clone().into_bytes());
        }

        if let Some(password) = &self.password {
            connect_options = connect_options.password(password.expose_secret());
        }

        if let Some(opts) = options {
            connect_options = connect_options.options(opts.to_key_value_pairs());
        }

        connect_options
    }

    fn with_db(&self, options: Option<&PgConnectionOptions>) -> PgConnectOptions {
        self.without_db(options).database(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_tls_requires_root_certs() {
        let tls = TlsConfig {
            trusted_root_certs: String::new(),
            enabled: true,
        };

        assert_eq!(tls.validate(), Err(ValidationError::MissingTrustedRootCerts));
        assert!(TlsConfig::disabled().validate().is_ok());
    }

    #[test]
    fn password_is_dropped_without_secrets() {
        let config: PgConnectionConfig = serde_json::from_str(
            r#"{"host":"localhost","port":5432,"name":"gis","username":"sync","password":"hunter2"}"#,
        )
        .unwrap();

        let without: PgConnectionConfigWithoutSecrets = config.into();
        let json = serde_json::to_string(&without).unwrap();

        assert!(!json.contains("hunter2"));
        assert!(!without.tls.enabled);
    }
}
