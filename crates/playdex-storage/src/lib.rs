//! Relational storage for the normalized catalog: connection config, store
//! traits, and the Postgres and in-memory backends.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use playdex_core::{
    AppSearch, AppSearchRow, Application, CategoryRating, DateField, Dimension, DimensionKind,
    RatingBucket, YearCount,
};
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use thiserror::Error;
use tracing::warn;

mod memory;
mod postgres;

pub use memory::{MemoryState, MemoryStore};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "playdex-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid reference: {0}")]
    InvalidReference(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StorageError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }
}

/// Where the database password comes from. Never stored inline in config files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialSource {
    #[default]
    None,
    Env {
        var: String,
    },
    File {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Full connection URL; when set it wins over the discrete fields.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub credentials: CredentialSource,
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            database: "playstore".to_string(),
            username: "postgres".to_string(),
            credentials: CredentialSource::None,
            max_connections: 5,
        }
    }
}

impl DbConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Overlay environment-provided values; `lookup` abstracts the environment for tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL") {
            self.url = Some(url);
        }
        if let Some(host) = lookup("PLAYDEX_DB_HOST") {
            self.host = host;
        }
        if let Some(port) = parse_env_number(&lookup, "PLAYDEX_DB_PORT") {
            self.port = port;
        }
        if let Some(database) = lookup("PLAYDEX_DB_NAME") {
            self.database = database;
        }
        if let Some(username) = lookup("PLAYDEX_DB_USER") {
            self.username = username;
        }
        if let Some(var) = lookup("PLAYDEX_DB_PASSWORD_ENV") {
            self.credentials = CredentialSource::Env { var };
        } else if let Some(path) = lookup("PLAYDEX_DB_PASSWORD_FILE") {
            self.credentials = CredentialSource::File {
                path: PathBuf::from(path),
            };
        }
        if let Some(max) = parse_env_number(&lookup, "PLAYDEX_DB_MAX_CONNECTIONS") {
            self.max_connections = max;
        }
    }

    pub fn password(&self) -> Result<Option<String>, StorageError> {
        match &self.credentials {
            CredentialSource::None => Ok(None),
            CredentialSource::Env { var } => std::env::var(var).map(Some).map_err(|_| {
                StorageError::Config(format!("password variable {var} is not set"))
            }),
            CredentialSource::File { path } => std::fs::read_to_string(path)
                .map(|text| Some(text.trim_end_matches(['\r', '\n']).to_string()))
                .map_err(|err| {
                    StorageError::Config(format!("reading password file {}: {err}", path.display()))
                }),
        }
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions, StorageError> {
        if let Some(url) = &self.url {
            return url
                .parse::<PgConnectOptions>()
                .map_err(|err| StorageError::Config(format!("invalid DATABASE_URL: {err}")));
        }
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.username);
        if let Some(password) = self.password()? {
            options = options.password(&password);
        }
        Ok(options)
    }

    /// Connection target without credentials, for logs and reports.
    pub fn describe(&self) -> String {
        match &self.url {
            Some(url) => match url.parse::<PgConnectOptions>() {
                Ok(opts) => format!(
                    "postgres://{}:{}/{}",
                    opts.get_host(),
                    opts.get_port(),
                    opts.get_database().unwrap_or_default()
                ),
                Err(_) => "postgres://<invalid url>".to_string(),
            },
            None => format!("postgres://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// Outcome of an insert-if-absent on a single row.
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert<T> {
    Created(T),
    Existing(T),
}

impl<T> Upsert<T> {
    pub fn created(&self) -> bool {
        matches!(self, Upsert::Created(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Upsert::Created(row) | Upsert::Existing(row) => row,
        }
    }
}

/// Write side of the catalog: batch loads used by the normalizer plus per-row CRUD.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Insert-if-absent on `name`; returns how many rows were new.
    async fn insert_dimension_names(
        &self,
        kind: DimensionKind,
        names: &[String],
    ) -> Result<u64, StorageError>;

    async fn dimension_ids(&self, kind: DimensionKind) -> Result<HashMap<String, i32>, StorageError>;

    /// Insert-if-absent on `app_id`; returns how many rows were new.
    async fn insert_applications(&self, rows: &[Application]) -> Result<u64, StorageError>;

    async fn create_dimension(
        &self,
        kind: DimensionKind,
        name: &str,
    ) -> Result<Upsert<Dimension>, StorageError>;

    async fn get_dimension(&self, kind: DimensionKind, id: i32) -> Result<Dimension, StorageError>;

    async fn update_dimension(
        &self,
        kind: DimensionKind,
        id: i32,
        name: &str,
    ) -> Result<Dimension, StorageError>;

    async fn delete_dimension(&self, kind: DimensionKind, id: i32) -> Result<(), StorageError>;

    async fn create_application(&self, app: &Application) -> Result<Upsert<Application>, StorageError>;

    async fn get_application(&self, app_id: &str) -> Result<Application, StorageError>;

    /// Replaces every column of the row keyed by `app_id`. The key itself never changes.
    async fn update_application(
        &self,
        app_id: &str,
        app: &Application,
    ) -> Result<Application, StorageError>;

    async fn delete_application(&self, app_id: &str) -> Result<(), StorageError>;
}

/// Read-only aggregate queries backing the reporting endpoints.
#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn search_applications(&self, filter: &AppSearch) -> Result<Vec<AppSearchRow>, StorageError>;

    async fn free_applications(&self, categories: &[String]) -> Result<Vec<String>, StorageError>;

    async fn yearly_counts(
        &self,
        categories: &[String],
        field: DateField,
    ) -> Result<Vec<YearCount>, StorageError>;

    async fn average_rating_by_category(&self) -> Result<Vec<CategoryRating>, StorageError>;

    async fn rating_distribution(&self) -> Result<Vec<RatingBucket>, StorageError>;
}

pub trait Store: CatalogStore + ReportStore {}

impl<T: CatalogStore + ReportStore> Store for T {}

/// Reads a numeric setting; a value that does not parse is logged and skipped.
pub fn parse_env_number<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    var: &str,
) -> Option<T> {
    let raw = lookup(var)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var, value = %raw, "ignoring unparseable setting, keeping previous value");
            None
        }
    }
}
