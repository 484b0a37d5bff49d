use crate::db::Database;
use crate::error::Result;
use crate::models::{ActiveRun, InterlockEvent, InterlockType, QueueStatus, QueuedIrrigationEvent};
use crate::repository::{ActiveRunRepository, InterlockEventRepository, QueuedEventRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Row};
use tracing::warn;
use uuid::Uuid;

// Active Run Queries

#[async_trait]
impl ActiveRunRepository for Database {
    async fn get_active_runs(&self, site_id: &str) -> Result<Vec<ActiveRun>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM active_runs WHERE site_id = ?1 ORDER BY started_at",
            )?;
            let runs = stmt
                .query_map([site_id], row_to_active_run)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(runs)
        })
    }

    async fn insert(&self, run: &ActiveRun) -> Result<()> {
        let zone_ids = serde_json::to_string(&run.active_zone_ids)?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO active_runs
                    (run_id, site_id, program_id, zone_ids, started_at, expected_end_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    run.run_id,
                    run.site_id,
                    run.program_id,
                    zone_ids,
                    run.started_at.to_rfc3339(),
                    run.expected_end_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
    }

    async fn remove(&self, site_id: &str, run_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM active_runs WHERE site_id = ?1 AND run_id = ?2",
                [site_id, run_id],
            )?;
            Ok(deleted > 0)
        })
    }
}

fn row_to_active_run(row: &Row) -> rusqlite::Result<ActiveRun> {
    let zone_ids_json: String = row.get("zone_ids")?;
    let started_at: String = row.get("started_at")?;
    let expected_end_at: Option<String> = row.get("expected_end_at")?;

    let active_zone_ids = serde_json::from_str(&zone_ids_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(ActiveRun {
        run_id: row.get("run_id")?,
        program_id: row.get("program_id")?,
        site_id: row.get("site_id")?,
        active_zone_ids,
        started_at: parse_timestamp(&started_at),
        expected_end_at: expected_end_at.as_deref().map(parse_timestamp),
    })
}

// Queued Event Queries

#[async_trait]
impl QueuedEventRepository for Database {
    async fn create(&self, event: &QueuedIrrigationEvent) -> Result<()> {
        let zone_ids = serde_json::to_string(&event.target_zone_ids)?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO queued_irrigation_events
                    (event_id, site_id, program_id, schedule_id, target_zone_ids,
                     original_scheduled_time, expected_execution_time, queue_reason, status,
                     duration_minutes, run_id, error_message, queued_at, executed_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                "#,
                params![
                    event.event_id.to_string(),
                    event.site_id,
                    event.program_id,
                    event.schedule_id,
                    zone_ids,
                    event.original_scheduled_time.to_rfc3339(),
                    event.expected_execution_time.to_rfc3339(),
                    event.queue_reason,
                    event.status.as_str(),
                    event.duration_minutes,
                    event.run_id,
                    event.error_message,
                    event.queued_at.to_rfc3339(),
                    event.executed_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
    }

    async fn update(&self, event: &QueuedIrrigationEvent) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                UPDATE queued_irrigation_events SET
                    expected_execution_time = ?1, status = ?2, run_id = ?3,
                    error_message = ?4, executed_at = ?5
                WHERE event_id = ?6
                "#,
                params![
                    event.expected_execution_time.to_rfc3339(),
                    event.status.as_str(),
                    event.run_id,
                    event.error_message,
                    event.executed_at.map(|t| t.to_rfc3339()),
                    event.event_id.to_string(),
                ],
            )?;
            Ok(())
        })
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<QueuedIrrigationEvent>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM queued_irrigation_events WHERE event_id = ?1",
                [event_id.to_string()],
                row_to_queued_event,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    async fn list_pending(&self, site_id: &str) -> Result<Vec<QueuedIrrigationEvent>> {
        let mut events = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM queued_irrigation_events WHERE site_id = ?1 AND status = 'Pending'",
            )?;
            let events = stmt
                .query_map([site_id], row_to_queued_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(events)
        })?;
        // RFC 3339 strings with mixed offsets do not sort lexically
        events.sort_by_key(|e| (e.expected_execution_time, e.queued_at));
        Ok(events)
    }

    async fn list_between(
        &self,
        site_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<QueuedIrrigationEvent>> {
        let events = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM queued_irrigation_events WHERE site_id = ?1")?;
            let events = stmt
                .query_map([site_id], row_to_queued_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(events)
        })?;
        Ok(events
            .into_iter()
            .filter(|e| e.queued_at >= from && e.queued_at <= to)
            .collect())
    }
}

fn row_to_queued_event(row: &Row) -> rusqlite::Result<QueuedIrrigationEvent> {
    let event_id: String = row.get("event_id")?;
    let zone_ids_json: String = row.get("target_zone_ids")?;
    let status_str: String = row.get("status")?;
    let original: String = row.get("original_scheduled_time")?;
    let expected: String = row.get("expected_execution_time")?;
    let queued_at: String = row.get("queued_at")?;
    let executed_at: Option<String> = row.get("executed_at")?;

    let status = QueueStatus::from_str(&status_str).unwrap_or_else(|| {
        warn!(status = %status_str, "Unknown queue status in database, treating as Failed");
        QueueStatus::Failed
    });

    Ok(QueuedIrrigationEvent {
        event_id: parse_uuid(&event_id)?,
        site_id: row.get("site_id")?,
        program_id: row.get("program_id")?,
        schedule_id: row.get("schedule_id")?,
        target_zone_ids: serde_json::from_str(&zone_ids_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        original_scheduled_time: parse_timestamp(&original),
        expected_execution_time: parse_timestamp(&expected),
        queue_reason: row.get("queue_reason")?,
        status,
        duration_minutes: row.get("duration_minutes")?,
        run_id: row.get("run_id")?,
        error_message: row.get("error_message")?,
        queued_at: parse_timestamp(&queued_at),
        executed_at: executed_at.as_deref().map(parse_timestamp),
    })
}

// Interlock Event Queries

#[async_trait]
impl InterlockEventRepository for Database {
    async fn create(&self, event: &InterlockEvent) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO interlock_events
                    (event_id, site_id, interlock_type, details, run_id, group_id, is_active,
                     requires_acknowledgment, trip_timestamp, cleared_by, cleared_at, clear_notes)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                params![
                    event.event_id.to_string(),
                    event.site_id,
                    format!("{:?}", event.interlock_type),
                    event.details,
                    event.run_id,
                    event.group_id,
                    event.is_active,
                    event.requires_acknowledgment,
                    event.trip_timestamp.to_rfc3339(),
                    event.cleared_by,
                    event.cleared_at.map(|t| t.to_rfc3339()),
                    event.clear_notes,
                ],
            )?;
            Ok(())
        })
    }

    async fn update(&self, event: &InterlockEvent) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                UPDATE interlock_events SET
                    is_active = ?1, cleared_by = ?2, cleared_at = ?3, clear_notes = ?4
                WHERE event_id = ?5
                "#,
                params![
                    event.is_active,
                    event.cleared_by,
                    event.cleared_at.map(|t| t.to_rfc3339()),
                    event.clear_notes,
                    event.event_id.to_string(),
                ],
            )?;
            Ok(())
        })
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<InterlockEvent>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM interlock_events WHERE event_id = ?1",
                [event_id.to_string()],
                row_to_interlock_event,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    async fn list_active(&self, site_id: &str) -> Result<Vec<InterlockEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM interlock_events WHERE site_id = ?1 AND is_active = 1",
            )?;
            let events = stmt
                .query_map([site_id], row_to_interlock_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(events)
        })
    }
}

fn row_to_interlock_event(row: &Row) -> rusqlite::Result<InterlockEvent> {
    let event_id: String = row.get("event_id")?;
    let type_str: String = row.get("interlock_type")?;
    let trip_timestamp: String = row.get("trip_timestamp")?;
    let cleared_at: Option<String> = row.get("cleared_at")?;

    // An unknown type must still block, so map it to the strictest one
    let interlock_type = InterlockType::from_str(&type_str).unwrap_or_else(|| {
        warn!(
            interlock_type = %type_str,
            "Unknown interlock_type in database, treating as EmergencyStop"
        );
        InterlockType::EmergencyStop
    });

    Ok(InterlockEvent {
        event_id: parse_uuid(&event_id)?,
        site_id: row.get("site_id")?,
        interlock_type,
        details: row.get("details")?,
        run_id: row.get("run_id")?,
        group_id: row.get("group_id")?,
        is_active: row.get("is_active")?,
        requires_acknowledgment: row.get("requires_acknowledgment")?,
        trip_timestamp: parse_timestamp(&trip_timestamp),
        cleared_by: row.get("cleared_by")?,
        cleared_at: cleared_at.as_deref().map(parse_timestamp),
        clear_notes: row.get("clear_notes")?,
    })
}

fn parse_uuid(s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            warn!(timestamp = %s, "Unparseable timestamp in database, using now");
            Utc::now()
        })
}

trait OptionalExt<T> {
    fn optional(self) -> rusqlite::Result<Option<T>>;
}

impl<T> OptionalExt<T> for rusqlite::Result<T> {
    fn optional(self) -> rusqlite::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunRequest;
    use chrono::{Duration, TimeZone};

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn active_runs_insert_list_remove() {
        let db = db();
        let started = Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap();
        let run = ActiveRun {
            run_id: "run-1".into(),
            program_id: "prog-1".into(),
            site_id: "s1".into(),
            active_zone_ids: vec!["z1".into(), "z2".into()],
            started_at: started,
            expected_end_at: Some(started + Duration::minutes(20)),
        };
        ActiveRunRepository::insert(&db, &run).await.unwrap();

        let runs = db.get_active_runs("s1").await.unwrap();
        assert_eq!(runs, vec![run]);
        assert!(db.get_active_runs("s2").await.unwrap().is_empty());

        assert!(db.remove("s1", "run-1").await.unwrap());
        assert!(!db.remove("s1", "run-1").await.unwrap());
    }

    #[tokio::test]
    async fn queued_events_pending_ordering_and_update() {
        let db = db();
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap();
        let request = RunRequest::new("s1", "prog-1", vec!["z1".into()], base);

        let late = QueuedIrrigationEvent::new(&request, base + Duration::minutes(30), "late", base);
        let early = QueuedIrrigationEvent::new(&request, base + Duration::minutes(5), "early", base);
        QueuedEventRepository::create(&db, &late).await.unwrap();
        QueuedEventRepository::create(&db, &early).await.unwrap();

        let pending = db.list_pending("s1").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].event_id, early.event_id);

        let executed = early.mark_executed("run-7", base + Duration::minutes(6)).unwrap();
        QueuedEventRepository::update(&db, &executed).await.unwrap();

        let pending = db.list_pending("s1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_id, late.event_id);

        let stored = QueuedEventRepository::get(&db, executed.event_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, QueueStatus::Executed);
        assert_eq!(stored.run_id.as_deref(), Some("run-7"));

        let window = db
            .list_between("s1", base - Duration::hours(1), base + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn interlock_events_round_trip_and_clear() {
        let db = db();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap();
        let event = InterlockEvent::trip("s1", InterlockType::EcOutOfBounds, "EC 4.0", now)
            .with_group(Some("g1".into()));
        InterlockEventRepository::create(&db, &event).await.unwrap();

        let active = db.list_active("s1").await.unwrap();
        assert_eq!(active, vec![event.clone()]);

        let cleared = event.clear("operator", None, now + Duration::minutes(3));
        InterlockEventRepository::update(&db, &cleared).await.unwrap();
        assert!(db.list_active("s1").await.unwrap().is_empty());

        let stored = InterlockEventRepository::get(&db, cleared.event_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.cleared_by.as_deref(), Some("operator"));
    }
}
