//! Backing store access.
//!
//! The pipeline talks to the store through two traits: [`ShardStore`] owns
//! the connection pool and the DDL operations, [`StoreConnection`] is a single
//! pooled connection.  [`PgStore`] implements both on top of PostgreSQL,
//! where a shard is a schema.

use crate::source::Value;
use async_trait::async_trait;

mod error;
mod postgres;
mod tls;

pub use error::StoreError;
pub use postgres::PgStore;

/// Quotes an SQL identifier, doubling any embedded quote.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// A parameterized insert into one shard table.
///
/// Columns follow the source's field order and every column gets exactly
/// one positional placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStatement {
    pub shard: String,
    pub table: String,
    pub columns: Vec<String>,
    pub sql: String,
}

impl InsertStatement {
    pub fn new(shard: &str, table: &str, columns: &[String]) -> Self {
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");

        Self {
            shard: shard.to_string(),
            table: table.to_string(),
            columns: columns.to_vec(),
            sql: format!(
                "INSERT INTO {}.{} ({column_list}) VALUES ({placeholders})",
                quote_ident(shard),
                quote_ident(table),
            ),
        }
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }
}

/// Shared connection source for every worker and the health check.
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Creates the shard if it does not exist yet.
    async fn ensure_shard(&self, shard: &str) -> Result<(), StoreError>;

    /// Creates `shard.table` with the given column definitions if it does not
    /// exist yet.
    async fn ensure_table(&self, shard: &str, table: &str, schema: &str)
        -> Result<(), StoreError>;

    /// Takes a connection out of the pool.  Dropping the returned handle puts
    /// it back.
    async fn acquire(&self) -> Result<Box<dyn StoreConnection>, StoreError>;

    /// Number of connections currently sitting idle in the pool.
    fn idle_connections(&self) -> usize;

    /// Drops idle connections that exceed the pool's lifetime or idle limits.
    fn evict_expired(&self) {}
}

/// One pooled connection.
#[async_trait]
pub trait StoreConnection: Send {
    async fn begin(&mut self) -> Result<(), StoreError>;

    async fn insert(
        &mut self,
        statement: &InsertStatement,
        values: &[Value],
    ) -> Result<u64, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;

    /// Cheap liveness probe.
    async fn ping(&mut self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod test {
    use super::{quote_ident, InsertStatement};

    #[test]
    fn quoting() {
        assert_eq!(quote_ident("events"), r#""events""#);
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
    }

    #[test]
    fn insert_statement() {
        let stmt = InsertStatement::new(
            "prefix1",
            "events",
            &["id".to_string(), "name".to_string()],
        );
        assert_eq!(
            stmt.sql,
            r#"INSERT INTO "prefix1"."events" ("id", "name") VALUES ($1, $2)"#
        );
        assert_eq!(stmt.arity(), 2);
    }
}
