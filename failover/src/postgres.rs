//! PostgreSQL [`Backend`] over an sqlx connection pool.
use failover_core::{Backend, BackendError, ConfigError, DatabaseConfig, SyntheticRecord, TestConfig};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::{Connection, PgConnection};
use std::str::FromStr;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn};

pub struct PgBackend {
    pool: PgPool,
    /// Kept for the probe's dedicated connections.
    options: PgConnectOptions,
    create_sql: String,
    insert_sql: String,
    count_sql: String,
}

impl PgBackend {
    /// Builds a lazily connecting pool. Nothing touches the network until [`Backend::prepare`].
    pub fn connect(config: &TestConfig) -> Result<Self, ConfigError> {
        config.database.validate()?;
        let options = connect_options(&config.database)?.options([(
            "statement_timeout",
            config.statement_timeout.as_millis().to_string(),
        )]);

        let pool = PgPoolOptions::new()
            .min_connections(config.pool_min)
            .max_connections(config.pool_max)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy_with(options.clone());

        let table = &config.database.table;
        Ok(Self {
            pool,
            options,
            create_sql: format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 id BIGSERIAL PRIMARY KEY, \
                 run_id TEXT NOT NULL, \
                 worker_id BIGINT NOT NULL, \
                 sequence BIGINT NOT NULL, \
                 created_at TIMESTAMPTZ NOT NULL DEFAULT now())"
            ),
            insert_sql: format!(
                "INSERT INTO {table} (run_id, worker_id, sequence) VALUES ($1, $2, $3)"
            ),
            count_sql: format!("SELECT COUNT(*) FROM {table}"),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn connect_options(db: &DatabaseConfig) -> Result<PgConnectOptions, ConfigError> {
    let mut options = PgConnectOptions::new()
        .host(&db.host)
        .port(db.port())
        .database(&db.database)
        .username(&db.user)
        .password(&db.password)
        .application_name("failover-test");

    if let Some(mode) = &db.ssl_mode {
        let mode = PgSslMode::from_str(mode)
            .map_err(|err| ConfigError::Invalid(format!("ssl mode {mode:?}: {err}")))?;
        options = options.ssl_mode(mode);
    }
    Ok(options)
}

/// Maps driver errors onto the worker error taxonomy.
pub(crate) fn classify(err: sqlx::Error) -> BackendError {
    let detail = err.to_string();
    match &err {
        sqlx::Error::PoolTimedOut => BackendError::Timeout(detail),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_)
        | sqlx::Error::Configuration(_) => BackendError::Connection(detail),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // invalid_authorization_specification, invalid_password
            Some(code) if code.starts_with("28") => BackendError::Auth(detail),
            // query_canceled, raised by statement_timeout
            Some("57014") => BackendError::Timeout(detail),
            // connection_exception, admin_shutdown and friends
            Some(code) if code.starts_with("08") || code.starts_with("57P") => {
                BackendError::Connection(detail)
            }
            _ => BackendError::Query(detail),
        },
        _ => BackendError::Query(detail),
    }
}

impl Backend for PgBackend {
    async fn prepare(&self) -> Result<(), BackendError> {
        sqlx::query(&self.create_sql)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        info!("Record table ready");
        Ok(())
    }

    async fn count_records(&self) -> Result<u64, BackendError> {
        let count: i64 = sqlx::query_scalar(&self.count_sql)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        Ok(count.max(0) as u64)
    }

    async fn insert_record(&self, record: &SyntheticRecord) -> Result<(), BackendError> {
        sqlx::query(&self.insert_sql)
            .bind(record.run_id.to_string())
            .bind(record.worker_id as i64)
            .bind(record.sequence as i64)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let mut conn = PgConnection::connect_with(&self.options)
            .await
            .map_err(classify)?;
        sqlx::query("SELECT 1")
            .execute(&mut conn)
            .await
            .map_err(classify)?;
        if let Err(err) = conn.close().await {
            trace!("Closing probe connection failed: {err}");
        }
        Ok(())
    }
}
