use async_trait::async_trait;
use deadpool_postgres::{ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use postgres_native_tls::MakeTlsConnector;
use serde::Deserialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::debug;

use super::query::backend_error;
use crate::backend::BackendConnection;
use crate::engine::UserContext;
use crate::error::BackendError;

/// Connection settings for one PostgreSQL datasource.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PgDatasourceConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Accept invalid/self-signed certificates. Use with caution.
    /// Ignored by the verifying modes.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Optional path to a custom CA certificate file (PEM format).
    /// If not set, the system CA store is used.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Run each statement in its own transaction instead of one per request.
    #[serde(default)]
    pub auto_commit: bool,
    /// Database credentials used on behalf of specific request users.
    #[serde(default)]
    pub users: BTreeMap<String, Credential>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credential {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// SSL/TLS connection modes for PostgreSQL.
///
/// These match the standard PostgreSQL sslmode parameter:
/// - `Disable`: No SSL (unencrypted)
/// - `Prefer`: Try SSL first, fall back to non-SSL (default)
/// - `Require`: Require SSL but don't verify certificate
/// - `VerifyCa`: Require SSL and verify the server certificate is signed by a trusted CA
/// - `VerifyFull`: Like VerifyCa, but also verify the server hostname matches the certificate
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

fn default_host() -> String {
    String::from("localhost")
}

fn default_port() -> u16 {
    5432
}

fn default_pool_size() -> usize {
    8
}

fn default_connect_timeout() -> u64 {
    10
}

impl PgDatasourceConfig {
    pub fn new(database: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: database.into(),
            username: username.into(),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            auto_commit: false,
            users: BTreeMap::new(),
        }
    }

    /// The database login used for `user`: a mapped credential when one is
    /// configured for the request user, the datasource login otherwise.
    pub fn credential_for(&self, user: &UserContext) -> Credential {
        user.username
            .as_ref()
            .and_then(|name| self.users.get(name))
            .cloned()
            .unwrap_or_else(|| Credential {
                username: self.username.clone(),
                password: self.password.clone(),
            })
    }

    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }

    fn pool_config(&self, credential: &Credential) -> deadpool_postgres::Config {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.database.clone());
        cfg.user = Some(credential.username.clone());
        cfg.password = Some(credential.password.clone());
        cfg.connect_timeout = Some(Duration::from_secs(self.connect_timeout_secs));
        cfg.ssl_mode = Some(match self.ssl_mode {
            SslMode::Disable => deadpool_postgres::SslMode::Disable,
            SslMode::Prefer => deadpool_postgres::SslMode::Prefer,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
                deadpool_postgres::SslMode::Require
            }
        });
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(self.pool_size.max(1)));
        cfg
    }
}

/// Build a pool for one credential. Nothing connects until the first checkout.
pub fn create_pool(config: &PgDatasourceConfig, credential: &Credential) -> Result<Pool, BackendError> {
    let cfg = config.pool_config(credential);
    let pool = match config.ssl_mode {
        SslMode::Disable => cfg.create_pool(Some(Runtime::Tokio1), NoTls),
        SslMode::Prefer | SslMode::Require => {
            cfg.create_pool(Some(Runtime::Tokio1), build_tls_connector(config, false)?)
        }
        SslMode::VerifyCa | SslMode::VerifyFull => {
            cfg.create_pool(Some(Runtime::Tokio1), build_tls_connector(config, true)?)
        }
    };
    debug!(datasource = %config.display_string(), user = %credential.username, "pool created");
    pool.map_err(|e| BackendError::connection(format!("failed to create pool: {}", e)))
}

/// Build a TLS connector with appropriate certificate configuration.
///
/// # Arguments
/// * `config` - Datasource configuration
/// * `strict_verify` - If true, always verify certificates (for verify-ca/verify-full modes)
fn build_tls_connector(
    config: &PgDatasourceConfig,
    strict_verify: bool,
) -> Result<MakeTlsConnector, BackendError> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let pem = std::fs::read(ca_path).map_err(|e| {
            BackendError::connection(format!("failed to read CA certificate file {}: {}", ca_path, e))
        })?;
        let cert = native_tls::Certificate::from_pem(&pem).map_err(|e| {
            BackendError::connection(format!("invalid CA certificate in {}: {}", ca_path, e))
        })?;
        builder.add_root_certificate(cert);
    }

    let connector = builder
        .build()
        .map_err(|e| BackendError::connection(format!("failed to build TLS connector: {}", e)))?;
    Ok(MakeTlsConnector::new(connector))
}

/// A pooled client checked out for one request.
pub struct PgConnection {
    pub(crate) client: deadpool_postgres::Object,
    in_transaction: bool,
}

impl PgConnection {
    /// Check out a client and open the request's transaction unless the
    /// datasource runs in auto-commit mode.
    pub async fn open(pool: &Pool, auto_commit: bool) -> Result<Self, BackendError> {
        let client = pool
            .get()
            .await
            .map_err(|e| BackendError::connection(format!("failed to get connection: {}", e)))?;
        if !auto_commit {
            client
                .batch_execute("BEGIN")
                .await
                .map_err(|e| backend_error(&e))?;
        }
        Ok(Self {
            client,
            in_transaction: !auto_commit,
        })
    }

    async fn end(&mut self, statement: &str) -> Result<(), BackendError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.client
            .batch_execute(statement)
            .await
            .map_err(|e| backend_error(&e))
    }
}

#[async_trait]
impl BackendConnection for PgConnection {
    async fn commit(&mut self) -> Result<(), BackendError> {
        self.end("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        self.end("ROLLBACK").await
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
