//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. Table names are configurable,
//! so the SQL is a template with `{parsed_emails}`, `{suppliers}` and
//! `{match_history}` placeholders rendered against `TableNames` before it runs.
//! `run_migrations()` checks the current version and applies only the new ones.
//!
//! Versions in `_migrations` are tracked per table set, so several table sets
//! can share one database and each is migrated on its own.

use libsql::Connection;

use crate::config::TableNames;
use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS {parsed_emails} (
                email_id TEXT PRIMARY KEY,
                bucket TEXT NOT NULL,
                object_key TEXT NOT NULL,
                status TEXT NOT NULL,
                sender TEXT,
                subject TEXT,
                received_at TEXT,
                extraction TEXT,
                failure_reason TEXT,
                match_count INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{parsed_emails}_status ON {parsed_emails}(status);

            CREATE TABLE IF NOT EXISTS {suppliers} (
                supplier_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                contact_email TEXT,
                categories TEXT NOT NULL DEFAULT '[]',
                products TEXT NOT NULL DEFAULT '[]',
                description TEXT NOT NULL DEFAULT '',
                region TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS {match_history} (
                email_id TEXT NOT NULL,
                supplier_id TEXT NOT NULL,
                supplier_name TEXT NOT NULL,
                confidence REAL NOT NULL,
                rank INTEGER NOT NULL,
                strategy TEXT NOT NULL,
                matched_at TEXT NOT NULL,
                PRIMARY KEY (email_id, supplier_id)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "listing_indexes",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_{parsed_emails}_updated ON {parsed_emails}(updated_at);
            CREATE INDEX IF NOT EXISTS idx_{suppliers}_active ON {suppliers}(active);
            CREATE INDEX IF NOT EXISTS idx_{match_history}_rank ON {match_history}(email_id, rank);
        "#,
    },
];

/// Substitute configured table names into a SQL template.
pub fn render(sql: &str, tables: &TableNames) -> String {
    sql.replace("{parsed_emails}", &tables.parsed_emails)
        .replace("{suppliers}", &tables.suppliers)
        .replace("{match_history}", &tables.match_history)
}

/// Key under which a table set's versions are recorded.
pub fn scope(tables: &TableNames) -> String {
    format!(
        "{},{},{}",
        tables.parsed_emails, tables.suppliers, tables.match_history
    )
}

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection, tables: &TableNames) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            scope TEXT NOT NULL,
            version INTEGER NOT NULL,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (scope, version)
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let scope = scope(tables);
    let current_version = get_current_version(conn, &scope).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                %scope,
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(&render(migration.sql, tables))
                .await
                .map_err(|e| {
                    DatabaseError::Migration(format!(
                        "Migration V{} ({}) failed for {scope}: {e}",
                        migration.version, migration.name
                    ))
                })?;
            seed_version(conn, &scope, migration.version, migration.name).await?;
        }
    }

    tracing::info!(
        "Database migrations complete for {scope} (at V{})",
        get_current_version(conn, &scope).await?
    );

    Ok(())
}

/// Get the highest version applied to `scope`, or 0 if none.
async fn get_current_version(conn: &Connection, scope: &str) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations WHERE scope = ?1",
            libsql::params![scope],
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(
    conn: &Connection,
    scope: &str,
    version: i64,
    name: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (scope, version, name) VALUES (?1, ?2, ?3)",
        libsql::params![scope, version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, table: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                libsql::params![table],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get::<i64>(0).unwrap() == 1
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn, &TableNames::default()).await.unwrap();

        for table in ["parsed_emails", "suppliers", "match_history", "_migrations"] {
            assert!(table_exists(&conn, table).await, "Table '{table}' should exist");
        }
    }

    #[tokio::test]
    async fn configured_table_names_are_used() {
        let conn = test_conn().await;
        let tables = TableNames {
            parsed_emails: "rfq_parsed".into(),
            suppliers: "rfq_suppliers".into(),
            match_history: "rfq_matches".into(),
        };
        run_migrations(&conn, &tables).await.unwrap();

        assert!(table_exists(&conn, "rfq_parsed").await);
        assert!(table_exists(&conn, "rfq_matches").await);
        assert!(!table_exists(&conn, "parsed_emails").await);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        let tables = TableNames::default();
        run_migrations(&conn, &tables).await.unwrap();
        run_migrations(&conn, &tables).await.unwrap();

        let version = get_current_version(&conn, &scope(&tables)).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn, &TableNames::default()).await.unwrap();

        let mut rows = conn
            .query(
                "SELECT version, name FROM _migrations WHERE scope = ?1 ORDER BY version",
                libsql::params![scope(&TableNames::default())],
            )
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        assert_eq!(row1.get::<i64>(0).unwrap(), 1);
        assert_eq!(row1.get::<String>(1).unwrap(), "initial_schema");

        let row2 = rows.next().await.unwrap().unwrap();
        assert_eq!(row2.get::<i64>(0).unwrap(), 2);
        assert_eq!(row2.get::<String>(1).unwrap(), "listing_indexes");
    }

    #[tokio::test]
    async fn table_sets_migrate_independently() {
        let conn = test_conn().await;
        let custom = TableNames {
            parsed_emails: "rfq_parsed".into(),
            suppliers: "rfq_suppliers".into(),
            match_history: "rfq_matches".into(),
        };
        run_migrations(&conn, &TableNames::default()).await.unwrap();
        run_migrations(&conn, &custom).await.unwrap();

        for table in ["parsed_emails", "match_history", "rfq_parsed", "rfq_suppliers", "rfq_matches"] {
            assert!(table_exists(&conn, table).await, "Table '{table}' should exist");
        }
        assert_eq!(get_current_version(&conn, &scope(&custom)).await.unwrap(), 2);
        assert_eq!(
            get_current_version(&conn, &scope(&TableNames::default())).await.unwrap(),
            2
        );
    }

    #[test]
    fn render_substitutes_every_placeholder() {
        let sql = render(MIGRATIONS[0].sql, &TableNames::default());
        assert!(!sql.contains('{'));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS match_history"));
    }
}
