//! Parameterized SQL gateway over sqlx, with Postgres and SQLite backends.
//!
//! Statements are written with SQLite-style numbered placeholders (`?1`, `?2`);
//! the Postgres backend rewrites them to `$1`, `$2` before preparing.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Column, Database, Decode, Encode, Row, Type};
use thiserror::Error;

/// Typed bind parameter / column value. Nulls keep their type so Postgres
/// can infer the parameter OID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Integer(Option<i64>),
    Text(Option<String>),
}

impl SqlValue {
    pub fn text(value: impl Into<String>) -> Self {
        SqlValue::Text(Some(value.into()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Integer(None) | SqlValue::Text(None))
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(Some(value.to_string()))
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(Some(value))
    }
}

impl From<Option<String>> for SqlValue {
    fn from(value: Option<String>) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(Some(value))
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        SqlValue::Integer(Some(i64::from(value)))
    }
}

impl From<Option<u32>> for SqlValue {
    fn from(value: Option<u32>) -> Self {
        SqlValue::Integer(value.map(i64::from))
    }
}

/// One result row keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlRow {
    columns: BTreeMap<String, SqlValue>,
}

impl SqlRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: SqlValue) {
        self.columns.insert(name.into(), value);
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.columns.get(name) {
            Some(SqlValue::Text(Some(v))) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.columns.get(name) {
            Some(SqlValue::Integer(Some(v))) => Some(*v),
            Some(SqlValue::Text(Some(v))) => v.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("{context}: {source}")]
    Backend {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("unsupported database url {0:?}")]
    UnsupportedUrl(String),
    #[error("{0}")]
    Message(String),
}

impl DbError {
    fn backend(context: &'static str) -> impl FnOnce(sqlx::Error) -> DbError {
        move |source| DbError::Backend { context, source }
    }
}

#[async_trait]
pub trait DbGateway: Send + Sync {
    async fn query_all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError>;

    async fn run(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError>;

    /// Executes all statements in one transaction; any failure rolls back the lot.
    async fn run_batch(&self, statements: &[Statement]) -> Result<u64, DbError>;
}

/// Opens a gateway for a `postgres://` or `sqlite:` url.
pub async fn connect_gateway(database_url: &str) -> Result<Arc<dyn DbGateway>, DbError> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        Ok(Arc::new(PgGateway::connect(database_url, 5).await?))
    } else if database_url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteGateway::connect(database_url).await?))
    } else {
        Err(DbError::UnsupportedUrl(database_url.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(DbError::backend("connect postgres"))?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DbGateway for PgGateway {
    async fn query_all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError> {
        let sql = rewrite_placeholders(sql);
        let rows = bind_all(sqlx::query(&sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::backend("postgres query"))?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn run(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        let sql = rewrite_placeholders(sql);
        let done = bind_all(sqlx::query(&sql), params)
            .execute(&self.pool)
            .await
            .map_err(DbError::backend("postgres execute"))?;
        Ok(done.rows_affected())
    }

    async fn run_batch(&self, statements: &[Statement]) -> Result<u64, DbError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(DbError::backend("begin postgres batch"))?;
        let mut affected = 0;
        for statement in statements {
            let sql = rewrite_placeholders(&statement.sql);
            affected += bind_all(sqlx::query(&sql), &statement.params)
                .execute(&mut *tx)
                .await
                .map_err(DbError::backend("postgres batch statement"))?
                .rows_affected();
        }
        tx.commit()
            .await
            .map_err(DbError::backend("commit postgres batch"))?;
        Ok(affected)
    }
}

#[derive(Debug, Clone)]
pub struct SqliteGateway {
    pool: SqlitePool,
}

impl SqliteGateway {
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(DbError::backend("parse sqlite url"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(DbError::backend("connect sqlite"))?;
        Ok(Self { pool })
    }

    /// Private in-memory database; a single pinned connection keeps it alive.
    pub async fn in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(DbError::backend("parse sqlite url"))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(DbError::backend("open in-memory sqlite"))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl DbGateway for SqliteGateway {
    async fn query_all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError> {
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::backend("sqlite query"))?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn run(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        let done = bind_all(sqlx::query(sql), params)
            .execute(&self.pool)
            .await
            .map_err(DbError::backend("sqlite execute"))?;
        Ok(done.rows_affected())
    }

    async fn run_batch(&self, statements: &[Statement]) -> Result<u64, DbError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(DbError::backend("begin sqlite batch"))?;
        let mut affected = 0;
        for statement in statements {
            affected += bind_all(sqlx::query(&statement.sql), &statement.params)
                .execute(&mut *tx)
                .await
                .map_err(DbError::backend("sqlite batch statement"))?
                .rows_affected();
        }
        tx.commit()
            .await
            .map_err(DbError::backend("commit sqlite batch"))?;
        Ok(affected)
    }
}

fn bind_all<'q, DB>(
    mut query: Query<'q, DB, <DB as Database>::Arguments<'q>>,
    params: &[SqlValue],
) -> Query<'q, DB, <DB as Database>::Arguments<'q>>
where
    DB: Database,
    Option<i64>: Encode<'q, DB> + Type<DB>,
    Option<String>: Encode<'q, DB> + Type<DB>,
{
    for param in params {
        query = match param {
            SqlValue::Integer(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
        };
    }
    query
}

fn decode_row<R>(row: &R) -> SqlRow
where
    R: Row,
    usize: sqlx::ColumnIndex<R>,
    for<'r> String: Decode<'r, R::Database>,
    String: Type<R::Database>,
    for<'r> i64: Decode<'r, R::Database>,
    i64: Type<R::Database>,
    for<'r> i32: Decode<'r, R::Database>,
    i32: Type<R::Database>,
{
    let mut out = SqlRow::new();
    for (index, column) in row.columns().iter().enumerate() {
        let name = column.name();
        if let Ok(Some(v)) = row.try_get::<Option<String>, _>(index) {
            out.insert(name, SqlValue::Text(Some(v)));
            continue;
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(index) {
            out.insert(name, SqlValue::Integer(Some(v)));
            continue;
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(index) {
            out.insert(name, SqlValue::Integer(Some(i64::from(v))));
            continue;
        }
        out.insert(name, SqlValue::Text(None));
    }
    out
}

/// `?N` → `$N`; bare `?` is left untouched.
fn rewrite_placeholders(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0usize;
    while i < chars.len() {
        if chars[i] == '?' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_ascii_digit() {
                j += 1;
            }
            if j > i + 1 {
                out.push('$');
                out.extend(&chars[(i + 1)..j]);
                i = j;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_rewritten_for_postgres() {
        assert_eq!(
            rewrite_placeholders("SELECT * FROM race WHERE id IN (?1, ?12) AND x = ?"),
            "SELECT * FROM race WHERE id IN ($1, $12) AND x = ?"
        );
    }

    #[test]
    fn row_accessors_coerce_numeric_text() {
        let mut row = SqlRow::new();
        row.insert("distance", SqlValue::text("2400"));
        row.insert("race_number", SqlValue::from(11u32));
        row.insert("grade", SqlValue::Text(None));
        assert_eq!(row.integer("distance"), Some(2400));
        assert_eq!(row.integer("race_number"), Some(11));
        assert_eq!(row.text("grade"), None);
        assert_eq!(row.text("missing"), None);
    }

    #[tokio::test]
    async fn sqlite_gateway_round_trips_values() {
        let db = SqliteGateway::in_memory().await.expect("sqlite");
        db.run("CREATE TABLE t (id TEXT PRIMARY KEY, n BIGINT, note TEXT)", &[])
            .await
            .expect("create");
        db.run_batch(&[
            Statement::new(
                "INSERT INTO t (id, n, note) VALUES (?1, ?2, ?3)",
                vec!["a".into(), 1i64.into(), SqlValue::Text(None)],
            ),
            Statement::new(
                "INSERT INTO t (id, n, note) VALUES (?1, ?2, ?3)",
                vec!["b".into(), SqlValue::Integer(None), "x".into()],
            ),
        ])
        .await
        .expect("batch");

        let rows = db
            .query_all("SELECT id, n, note FROM t ORDER BY id", &[])
            .await
            .expect("query");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].text("id"), Some("a"));
        assert_eq!(rows[0].integer("n"), Some(1));
        assert_eq!(rows[0].text("note"), None);
        assert_eq!(rows[1].integer("n"), None);
        assert_eq!(rows[1].text("note"), Some("x"));
    }

    #[tokio::test]
    async fn failed_batches_roll_back() {
        let db = SqliteGateway::in_memory().await.expect("sqlite");
        db.run("CREATE TABLE t (id TEXT PRIMARY KEY)", &[])
            .await
            .expect("create");
        let err = db
            .run_batch(&[
                Statement::new("INSERT INTO t (id) VALUES (?1)", vec!["a".into()]),
                Statement::new("INSERT INTO nope (id) VALUES (?1)", vec!["b".into()]),
            ])
            .await;
        assert!(err.is_err());
        let rows = db.query_all("SELECT id FROM t", &[]).await.expect("query");
        assert!(rows.is_empty());
    }
}
