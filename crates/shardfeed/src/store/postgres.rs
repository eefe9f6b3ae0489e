use super::{quote_ident, tls::tls_connector, InsertStatement, ShardStore, StoreConnection, StoreError};
use crate::source::Value;
use async_trait::async_trait;
use bytes::BytesMut;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use shardfeed_types::{PoolSettings, StoreConfig, TlsMode};
use std::error::Error as StdError;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_postgres::config::SslMode;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::NoTls;
use tracing::{debug, info};

/// PostgreSQL-backed shard store.  Every shard is a schema in the configured
/// database.
pub struct PgStore {
    pool: Pool,
    settings: PoolSettings,
}

impl PgStore {
    /// Builds the connection pool and checks that the database is reachable.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let settings = config.connection_pool.with_defaults();

        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&config.host)
            .port(config.port)
            .user(&config.user)
            .dbname(&config.dbname)
            .application_name("shardfeed");
        if let Some(password) = &config.password {
            pg_config.password(password);
        }

        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = match config.tls.mode {
            TlsMode::Disable => {
                debug!("connecting to postgres without TLS");
                Manager::from_config(pg_config, NoTls, manager_config)
            }
            mode => {
                pg_config.ssl_mode(if mode == TlsMode::Require {
                    SslMode::Require
                } else {
                    SslMode::Prefer
                });
                debug!("connecting to postgres with TLS ({mode:?})");
                Manager::from_config(pg_config, tls_connector(&config.tls)?, manager_config)
            }
        };

        let pool = Pool::builder(manager)
            .max_size(settings.max_open_conns)
            .runtime(Runtime::Tokio1)
            .wait_timeout(Some(settings.acquire_timeout()))
            .create_timeout(Some(settings.acquire_timeout()))
            .build()
            .map_err(|e| StoreError::Build(e.to_string()))?;

        let store = Self { pool, settings };
        store.check_connection().await?;
        info!(
            "connected to postgres at {}:{}/{} (max_open_conns: {}, max_idle_conns: {}, conn_max_lifetime: {}s)",
            config.host,
            config.port,
            config.dbname,
            settings.max_open_conns,
            settings.max_idle_conns,
            settings.conn_max_lifetime
        );
        Ok(store)
    }

    /// Checks that Postgres can be reached by executing a simple query.
    pub async fn check_connection(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| StoreError::postgres("checking the connection", e))?;
        Ok(())
    }

    async fn execute_ddl(&self, ddl: String) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .batch_execute(&ddl)
            .await
            .map_err(|e| StoreError::postgres(format!("executing `{ddl}`"), e))
    }
}

#[async_trait]
impl ShardStore for PgStore {
    async fn ensure_shard(&self, shard: &str) -> Result<(), StoreError> {
        self.execute_ddl(format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(shard)))
            .await
    }

    async fn ensure_table(
        &self,
        shard: &str,
        table: &str,
        schema: &str,
    ) -> Result<(), StoreError> {
        self.execute_ddl(format!(
            "CREATE TABLE IF NOT EXISTS {}.{} {schema}",
            quote_ident(shard),
            quote_ident(table)
        ))
        .await
    }

    async fn acquire(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        let client = self.pool.get().await?;
        Ok(Box::new(PgConnection { client }))
    }

    fn idle_connections(&self) -> usize {
        usize::try_from(self.pool.status().available).unwrap_or(0)
    }

    fn evict_expired(&self) {
        let max_lifetime = self.settings.conn_max_lifetime();
        let max_idle = self.settings.max_idle_conns;
        let kept = AtomicUsize::new(0);

        // Only idle connections are visited.
        self.pool.retain(|_, metrics| {
            metrics.created.elapsed() < max_lifetime
                && kept.fetch_add(1, Ordering::Relaxed) < max_idle
        });
    }
}

/// A connection checked out of the pool.  Returned to the pool on drop.
struct PgConnection {
    client: Object,
}

#[async_trait]
impl StoreConnection for PgConnection {
    async fn begin(&mut self) -> Result<(), StoreError> {
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| StoreError::postgres("beginning a transaction", e))
    }

    async fn insert(
        &mut self,
        statement: &InsertStatement,
        values: &[Value],
    ) -> Result<u64, StoreError> {
        let context = || format!("inserting into {}.{}", statement.shard, statement.table);

        let prepared = self
            .client
            .prepare_cached(&statement.sql)
            .await
            .map_err(|e| StoreError::postgres(context(), e))?;
        let params = values
            .iter()
            .map(|v| v as &(dyn ToSql + Sync))
            .collect::<Vec<_>>();
        self.client
            .execute(&prepared, &params)
            .await
            .map_err(|e| StoreError::postgres(context(), e))
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.client
            .batch_execute("COMMIT")
            .await
            .map_err(|e| StoreError::postgres("committing a transaction", e))
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.client
            .batch_execute("ROLLBACK")
            .await
            .map_err(|e| StoreError::postgres("rolling back a transaction", e))
    }

    async fn ping(&mut self) -> Result<(), StoreError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| StoreError::postgres("pinging the database", e))?;
        Ok(())
    }
}

type BoxedError = Box<dyn StdError + Sync + Send>;

fn mismatch(value: &Value, ty: &Type) -> BoxedError {
    format!("cannot store {value} in a column of type {ty}").into()
}

/// Encodes a source value for whatever column type the server reports,
/// converting between numeric widths where the value fits.
impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxedError> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => match *ty {
                Type::BOOL => b.to_sql(ty, out),
                Type::JSON | Type::JSONB => serde_json::Value::Bool(*b).to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            Value::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::INT8 => i.to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                Type::BOOL => (*i != 0).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                    i.to_string().as_str().to_sql(ty, out)
                }
                Type::JSON | Type::JSONB => serde_json::Value::from(*i).to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            Value::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::FLOAT8 => f.to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                    f.to_string().as_str().to_sql(ty, out)
                }
                Type::JSON | Type::JSONB => serde_json::Value::from(*f).to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            Value::Text(s) => match *ty {
                Type::JSON | Type::JSONB => serde_json::Value::from(s.as_str()).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
                    s.as_str().to_sql(ty, out)
                }
                _ => Err(mismatch(self, ty)),
            },
            Value::Json(j) => match *ty {
                Type::JSON | Type::JSONB => j.to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                    j.to_string().as_str().to_sql(ty, out)
                }
                _ => Err(mismatch(self, ty)),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}
