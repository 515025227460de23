//! Forward-only schema migrations.
//!
//! `schema_meta.schema_version` holds the last applied step. Each step in [`MIGRATIONS`] is
//! plain SQL, applied in one transaction together with its version bump.

use rusqlite::{Connection, OptionalExtension};

/// `(version, sql)` steps in ascending order. Version 1 is the base schema.
const MIGRATIONS: &[(u32, &str)] = &[(
    2,
    "CREATE INDEX IF NOT EXISTS idx_records_scope ON records(owner_id, scope);",
)];

/// The schema version that the current binary expects.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

fn meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM schema_meta WHERE key = ?1",
        [key],
        |row| row.get(0),
    )
    .optional()
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO schema_meta (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    Ok(meta(conn, "schema_version")?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

/// Model the vector index was built with. `None` until the first index pass.
pub fn get_embedding_model(conn: &Connection) -> rusqlite::Result<Option<String>> {
    meta(conn, "embedding_model")
}

pub fn set_embedding_model(conn: &Connection, model: &str) -> rusqlite::Result<()> {
    set_meta(conn, "embedding_model", model)
}

/// Apply every step newer than the stored version.
pub fn run_migrations(conn: &mut Connection) -> rusqlite::Result<()> {
    let current = get_schema_version(conn)?;
    tracing::debug!(schema_version = current, target = CURRENT_SCHEMA_VERSION, "checking migrations");

    for &(version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        tracing::info!(to = version, "running migration");
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        set_meta(&tx, "schema_version", &version.to_string())?;
        tx.commit()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_schema() -> Connection {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        crate::db::schema::init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn steps_end_at_current_version() {
        assert_eq!(MIGRATIONS.last().map(|(v, _)| *v), Some(CURRENT_SCHEMA_VERSION));
        assert!(MIGRATIONS.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn base_schema_upgrades_to_current() {
        let mut conn = base_schema();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
        run_migrations(&mut conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);

        let index: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_records_scope'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(index, 1);

        run_migrations(&mut conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn embedding_model_round_trips() {
        let conn = base_schema();
        assert!(get_embedding_model(&conn).unwrap().is_none());
        set_embedding_model(&conn, "hashed-trigram-384").unwrap();
        set_embedding_model(&conn, "all-MiniLM-L6-v2").unwrap();
        assert_eq!(
            get_embedding_model(&conn).unwrap().as_deref(),
            Some("all-MiniLM-L6-v2")
        );
    }
}
