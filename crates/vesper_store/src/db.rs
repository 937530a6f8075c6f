use sea_orm::sea_query;
use sea_orm::sea_query::{
    MysqlQueryBuilder, PostgresQueryBuilder, QueryStatementWriter, SqliteQueryBuilder,
};
use sea_orm::{ConnectionTrait, DatabaseBackend, QueryResult, Statement};
use sea_orm_migration::prelude::Iden;

use vesper_core::VesperResult;

#[derive(Iden, Clone, Copy)]
pub enum VesperMutations {
    Table,
    Id,
    RequestContext,
    ChangeCount,
    ChangesByNode,
    CommittedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum VesperChanges {
    Table,
    MutationId,
    Sequence,
    Node,
    Kind,
    OldValue,
    NewValue,
    ExecutedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum VesperAssignments {
    Table,
    SubscriptionId,
    Node,
    Owner,
    LastVisitedMutationId,
    LeaseExpiresAt,
    Since,
    CreatedAt,
}

pub fn col_name(column: impl sea_query::Iden) -> String {
    column.to_string()
}

pub fn build_stmt<S: QueryStatementWriter>(
    backend: DatabaseBackend,
    stmt: &S,
) -> (String, sea_query::Values) {
    match backend {
        DatabaseBackend::Sqlite => stmt.build(SqliteQueryBuilder),
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        #[allow(unreachable_patterns)]
        _ => stmt.build(SqliteQueryBuilder),
    }
}

/// Runs a statement and returns the number of affected rows.
pub async fn exec<C, S>(conn: &C, stmt: &S) -> VesperResult<u64>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let result = conn
        .execute(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(result.rows_affected())
}

pub async fn query_all<C, S>(conn: &C, stmt: &S) -> VesperResult<Vec<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let rows = conn
        .query_all(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(rows)
}

pub async fn query_one<C, S>(conn: &C, stmt: &S) -> VesperResult<Option<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let row = conn
        .query_one(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(row)
}
