//! PostgreSQL client built on `sqlx`

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow};
use sqlx::query::Query;
use sqlx::{Connection as _, Postgres, Row as _};

use super::service::{Connection, Database, Transaction};
use super::types::{DbError, DbErrorKind, Row, SqlArg};

/// `application_name` reported by every session opened by noisia
pub const APPLICATION_NAME: &str = "noisia";

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) => DbError::with_code(code.into_owned(), db_err.message()),
                None => DbError::new(DbErrorKind::Query, db_err.message()),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => DbError::new(DbErrorKind::Connection, err.to_string()),
            _ => DbError::new(DbErrorKind::Other, err.to_string()),
        }
    }
}

/// Connection factory for a PostgreSQL server
#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    options: PgConnectOptions,
}

impl PostgresDatabase {
    /// Parse a `postgres://` URL
    pub fn new(conninfo: &str) -> Result<Self, DbError> {
        let options = PgConnectOptions::from_str(conninfo)?.application_name(APPLICATION_NAME);
        Ok(Self { options })
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    async fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
        let conn = PgConnection::connect_with(&self.options).await?;
        Ok(Box::new(PostgresConnection { conn }))
    }
}

/// A dedicated server session
pub struct PostgresConnection {
    conn: PgConnection,
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn execute(&mut self, sql: &str, args: &[SqlArg]) -> Result<u64, DbError> {
        execute_on(&mut self.conn, sql, args).await
    }

    async fn query(&mut self, sql: &str, args: &[SqlArg]) -> Result<Vec<Row>, DbError> {
        query_on(&mut self.conn, sql, args).await
    }

    async fn begin<'a>(&'a mut self) -> Result<Box<dyn Transaction + 'a>, DbError> {
        let tx = self.conn.begin().await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn close(self: Box<Self>) -> Result<(), DbError> {
        self.conn.close().await?;
        Ok(())
    }
}

/// Transaction on a borrowed session; `sqlx` rolls it back when dropped
pub struct PostgresTransaction<'c> {
    tx: sqlx::Transaction<'c, Postgres>,
}

#[async_trait]
impl<'c> Transaction for PostgresTransaction<'c> {
    async fn execute(&mut self, sql: &str, args: &[SqlArg]) -> Result<u64, DbError> {
        execute_on(&mut *self.tx, sql, args).await
    }

    async fn query(&mut self, sql: &str, args: &[SqlArg]) -> Result<Vec<Row>, DbError> {
        query_on(&mut *self.tx, sql, args).await
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn bind_args<'q>(sql: &'q str, args: &'q [SqlArg]) -> Query<'q, Postgres, PgArguments> {
    args.iter().fold(sqlx::query(sql), |query, arg| match arg {
        SqlArg::Int(v) => query.bind(*v),
        SqlArg::Text(v) => query.bind(v.as_str()),
    })
}

async fn execute_on(conn: &mut PgConnection, sql: &str, args: &[SqlArg]) -> Result<u64, DbError> {
    // Statements without parameters go through the simple protocol so
    // utility commands (SET, LOCK, COPY) are not prepared.
    let result = if args.is_empty() {
        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(sql)).await?
    } else {
        bind_args(sql, args).execute(&mut *conn).await?
    };
    Ok(result.rows_affected())
}

async fn query_on(conn: &mut PgConnection, sql: &str, args: &[SqlArg]) -> Result<Vec<Row>, DbError> {
    let rows = bind_args(sql, args).fetch_all(&mut *conn).await?;
    rows.iter().map(decode_row).collect()
}

fn decode_row(row: &PgRow) -> Result<Row, DbError> {
    let columns = (0..row.len())
        .map(|i| row.try_get::<Option<String>, _>(i))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Row::new(columns))
}
