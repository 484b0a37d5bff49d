use crate::db::Database;
use crate::error::Result;

const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    CREATE TABLE IF NOT EXISTS active_runs (
        run_id TEXT PRIMARY KEY,
        site_id TEXT NOT NULL,
        program_id TEXT NOT NULL,
        zone_ids TEXT NOT NULL,
        started_at TEXT NOT NULL,
        expected_end_at TEXT
    );

    CREATE TABLE IF NOT EXISTS queued_irrigation_events (
        event_id TEXT PRIMARY KEY,
        site_id TEXT NOT NULL,
        program_id TEXT NOT NULL,
        schedule_id TEXT,
        target_zone_ids TEXT NOT NULL,
        original_scheduled_time TEXT NOT NULL,
        expected_execution_time TEXT NOT NULL,
        queue_reason TEXT NOT NULL,
        status TEXT NOT NULL,
        duration_minutes INTEGER,
        run_id TEXT,
        error_message TEXT,
        queued_at TEXT NOT NULL,
        executed_at TEXT
    );

    CREATE TABLE IF NOT EXISTS interlock_events (
        event_id TEXT PRIMARY KEY,
        site_id TEXT NOT NULL,
        interlock_type TEXT NOT NULL,
        details TEXT NOT NULL,
        run_id TEXT,
        group_id TEXT,
        is_active INTEGER NOT NULL,
        requires_acknowledgment INTEGER NOT NULL,
        trip_timestamp TEXT NOT NULL,
        cleared_by TEXT,
        cleared_at TEXT,
        clear_notes TEXT
    );

    CREATE TABLE IF NOT EXISTS schema_migrations (
        version INTEGER PRIMARY KEY,
        applied_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    "#,
    // Migration 2: Add indexes
    r#"
    CREATE INDEX IF NOT EXISTS idx_active_runs_site
        ON active_runs(site_id);
    CREATE INDEX IF NOT EXISTS idx_queued_events_site_status
        ON queued_irrigation_events(site_id, status, expected_execution_time);
    CREATE INDEX IF NOT EXISTS idx_queued_events_queued_at
        ON queued_irrigation_events(site_id, queued_at);
    CREATE INDEX IF NOT EXISTS idx_interlock_events_site_active
        ON interlock_events(site_id, is_active);
    "#,
];

pub fn run(db: &Database) -> Result<()> {
    db.with_conn_mut(|conn| {
        // Ensure schema_migrations table exists
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        // Apply pending migrations
        for (i, migration) in MIGRATIONS.iter().enumerate() {
            let version = (i + 1) as i32;
            if version > current_version {
                tracing::info!("Applying migration {}", version);
                let tx = conn.transaction()?;
                tx.execute_batch(migration)?;
                tx.execute(
                    "INSERT INTO schema_migrations (version) VALUES (?1)",
                    [version],
                )?;
                tx.commit()?;
            }
        }

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use crate::db::Database;

    #[test]
    fn migrations_are_idempotent() {
        let db = Database::open_in_memory().unwrap();
        super::run(&db).unwrap();
        let version: i32 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |r| {
                    r.get(0)
                })?)
            })
            .unwrap();
        assert_eq!(version, 2);
    }
}
