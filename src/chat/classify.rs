//! Read/write classification of LLM-generated queries.
//!
//! The driver layer needs to know whether a query mutates so writes get
//! a wrapping transaction, and the chat service needs it to decide
//! whether execution waits for a confirming click. SQL text is
//! classified by parsing with sqlparser; the LLM's own `query_type`
//! label is advisory only.

use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::{ClickHouseDialect, GenericDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;

use crate::db::{DatabaseType, QueryType};

/// Classifies a query for the given engine.
pub fn classify_query(db_type: DatabaseType, query: &str) -> QueryType {
    match db_type {
        DatabaseType::MongoDb => classify_mongo(query),
        _ => classify_sql(db_type, query),
    }
}

fn classify_sql(db_type: DatabaseType, query: &str) -> QueryType {
    let statements = match db_type {
        DatabaseType::MySql => Parser::parse_sql(&MySqlDialect {}, query),
        DatabaseType::ClickHouse => Parser::parse_sql(&ClickHouseDialect {}, query),
        DatabaseType::Postgres
        | DatabaseType::Yugabyte
        | DatabaseType::Spreadsheet
        | DatabaseType::GoogleSheets => Parser::parse_sql(&PostgreSqlDialect {}, query),
        DatabaseType::MongoDb => Parser::parse_sql(&GenericDialect {}, query),
    };

    let Ok(statements) = statements else {
        return classify_by_keyword(query);
    };

    // Multi-statement input takes the most conservative class.
    statements
        .iter()
        .map(classify_statement)
        .max_by_key(|t| match t {
            QueryType::Read => 0,
            QueryType::Write => 1,
            QueryType::Ddl => 2,
        })
        .unwrap_or(QueryType::Read)
}

fn classify_statement(statement: &Statement) -> QueryType {
    match statement {
        // A query can smuggle mutations in through CTE bodies.
        Statement::Query(query) => classify_inner_query(query),
        Statement::Explain { .. } | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. } | Statement::ShowVariable { .. } => QueryType::Read,
        Statement::Insert { .. }
        | Statement::Update { .. }
        | Statement::Delete { .. }
        | Statement::Merge { .. }
        | Statement::Copy { .. } => QueryType::Write,
        Statement::CreateTable { .. }
        | Statement::CreateView { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateSchema { .. }
        | Statement::AlterTable { .. }
        | Statement::Drop { .. }
        | Statement::Truncate { .. } => QueryType::Ddl,
        _ => QueryType::Write,
    }
}

/// Detects data-modifying CTEs (`WITH d AS (DELETE ...) SELECT ...`).
fn classify_inner_query(query: &Query) -> QueryType {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            match cte.query.body.as_ref() {
                SetExpr::Delete(_) | SetExpr::Update(_) | SetExpr::Insert(_) => {
                    return QueryType::Write;
                }
                _ => {
                    if classify_inner_query(&cte.query) == QueryType::Write {
                        return QueryType::Write;
                    }
                }
            }
        }
    }
    QueryType::Read
}

fn classify_mongo(query: &str) -> QueryType {
    let operation = serde_json::from_str::<serde_json::Value>(query)
        .ok()
        .and_then(|v| {
            v.get("operation")
                .and_then(|op| op.as_str())
                .map(str::to_string)
        })
        .unwrap_or_default();

    match operation.as_str() {
        "find" | "findOne" | "aggregate" | "countDocuments" | "distinct" => QueryType::Read,
        "insertOne" | "insertMany" | "updateOne" | "updateMany" | "deleteOne" | "deleteMany"
        | "replaceOne" => QueryType::Write,
        "createCollection" | "dropCollection" | "drop" | "createIndex" | "dropIndex" => {
            QueryType::Ddl
        }
        _ => QueryType::Write,
    }
}

/// Keyword fallback for text the parser cannot handle (engine-specific
/// syntax, hints).
fn classify_by_keyword(query: &str) -> QueryType {
    let first = query
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase();

    match first.as_str() {
        "SELECT" | "SHOW" | "EXPLAIN" | "DESCRIBE" | "WITH" => QueryType::Read,
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "MERGE" => QueryType::Write,
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "RENAME" => QueryType::Ddl,
        _ => QueryType::Write,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_reads() {
        assert_eq!(
            classify_query(DatabaseType::Postgres, "SELECT * FROM users"),
            QueryType::Read
        );
        assert_eq!(
            classify_query(
                DatabaseType::Postgres,
                "WITH top AS (SELECT 1) SELECT * FROM top"
            ),
            QueryType::Read
        );
        assert_eq!(
            classify_query(DatabaseType::MySql, "EXPLAIN SELECT * FROM orders"),
            QueryType::Read
        );
    }

    #[test]
    fn test_classify_writes() {
        assert_eq!(
            classify_query(
                DatabaseType::Postgres,
                "UPDATE users SET name = upper(name)"
            ),
            QueryType::Write
        );
        assert_eq!(
            classify_query(DatabaseType::MySql, "INSERT INTO t (a) VALUES (1)"),
            QueryType::Write
        );
        assert_eq!(
            classify_query(DatabaseType::Postgres, "DELETE FROM users WHERE id = 3"),
            QueryType::Write
        );
    }

    #[test]
    fn test_classify_ddl() {
        assert_eq!(
            classify_query(DatabaseType::Postgres, "DROP TABLE users"),
            QueryType::Ddl
        );
        assert_eq!(
            classify_query(DatabaseType::Postgres, "CREATE TABLE t (id int)"),
            QueryType::Ddl
        );
        assert_eq!(
            classify_query(DatabaseType::ClickHouse, "TRUNCATE TABLE events"),
            QueryType::Ddl
        );
    }

    #[test]
    fn test_multi_statement_takes_most_conservative() {
        assert_eq!(
            classify_query(
                DatabaseType::Postgres,
                "SELECT 1; UPDATE users SET name = 'x'"
            ),
            QueryType::Write
        );
    }

    #[test]
    fn test_classify_mongo_operations() {
        assert_eq!(
            classify_query(
                DatabaseType::MongoDb,
                r#"{"collection":"users","operation":"find","filter":{}}"#
            ),
            QueryType::Read
        );
        assert_eq!(
            classify_query(
                DatabaseType::MongoDb,
                r#"{"collection":"users","operation":"updateMany","filter":{},"update":{}}"#
            ),
            QueryType::Write
        );
        assert_eq!(
            classify_query(
                DatabaseType::MongoDb,
                r#"{"collection":"users","operation":"dropCollection"}"#
            ),
            QueryType::Ddl
        );
    }

    #[test]
    fn test_data_modifying_cte_is_a_write() {
        assert_eq!(
            classify_query(
                DatabaseType::Postgres,
                "WITH gone AS (DELETE FROM logs RETURNING *) SELECT count(*) FROM gone"
            ),
            QueryType::Write
        );
        assert_eq!(
            classify_query(
                DatabaseType::Postgres,
                "WITH active AS (SELECT * FROM users) SELECT * FROM active"
            ),
            QueryType::Read
        );
    }

    #[test]
    fn test_unparseable_falls_back_to_keywords() {
        assert_eq!(
            classify_query(DatabaseType::Postgres, "SHOW search_path TO something"),
            QueryType::Read
        );
        assert_eq!(
            classify_query(DatabaseType::Postgres, "VACUUM FULL users"),
            QueryType::Write
        );
    }
}
