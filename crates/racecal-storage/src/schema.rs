//! Physical layout: two base tables plus discipline-conditional side tables,
//! all keyed by the shared place/race identifier.

use tracing::info;

use crate::db::{DbError, DbGateway};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS place (
        id            TEXT PRIMARY KEY,
        race_type     TEXT NOT NULL,
        date_time     TEXT NOT NULL,
        location_name TEXT NOT NULL,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS place_type_date_time_idx ON place (race_type, date_time)",
    r#"
    CREATE TABLE IF NOT EXISTS held_day (
        id             TEXT PRIMARY KEY,
        race_type      TEXT NOT NULL,
        held_times     BIGINT NOT NULL,
        held_day_times BIGINT NOT NULL,
        created_at     TEXT NOT NULL,
        updated_at     TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS place_grade (
        id         TEXT PRIMARY KEY,
        race_type  TEXT NOT NULL,
        grade      TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS race (
        id            TEXT PRIMARY KEY,
        place_id      TEXT NOT NULL,
        race_type     TEXT NOT NULL,
        date_time     TEXT NOT NULL,
        location_name TEXT NOT NULL,
        race_number   BIGINT NOT NULL,
        race_name     TEXT NOT NULL,
        grade         TEXT NULL,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS race_type_date_time_idx ON race (race_type, date_time)",
    r#"
    CREATE TABLE IF NOT EXISTS race_condition (
        id           TEXT PRIMARY KEY,
        race_type    TEXT NOT NULL,
        surface_type TEXT NOT NULL,
        distance     BIGINT NOT NULL,
        created_at   TEXT NOT NULL,
        updated_at   TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS race_stage (
        id         TEXT PRIMARY KEY,
        race_type  TEXT NOT NULL,
        stage      TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];

/// Creates any missing tables and indexes. Safe to run repeatedly.
pub async fn migrate(db: &dyn DbGateway) -> Result<(), DbError> {
    for statement in MIGRATIONS {
        db.run(statement, &[]).await?;
    }
    info!(statements = MIGRATIONS.len(), "schema migrated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteGateway;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let db = SqliteGateway::in_memory().await.expect("sqlite");
        migrate(&db).await.expect("first");
        migrate(&db).await.expect("second");
        let rows = db
            .query_all(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                &[],
            )
            .await
            .expect("tables");
        let names: Vec<_> = rows.iter().filter_map(|r| r.text("name")).collect();
        assert_eq!(
            names,
            vec!["held_day", "place", "place_grade", "race", "race_condition", "race_stage"]
        );
    }
}
