use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::mqtt::{EventMsg, TelemetryMsg};

/// Local history of everything published on the events and telemetry topics.
#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct EventRow {
    pub ts: i64,
    pub category: String,
    pub action: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TelemetryRow {
    pub ts: i64,
    pub moisture_percent: i64,
    pub moisture_status: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub water_on: bool,
    pub fertilizer_on: bool,
    pub transport: String,
    pub queued_notifications: i64,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/plant/plant.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Each in-memory connection is its own database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Audit events
    // ----------------------------

    pub async fn insert_event(&self, ev: &EventMsg) -> Result<()> {
        sqlx::query("INSERT INTO events (ts, category, action, detail) VALUES (?, ?, ?, ?)")
            .bind(ev.ts.unix_timestamp())
            .bind(&ev.category)
            .bind(&ev.action)
            .bind(&ev.detail)
            .execute(&self.pool)
            .await
            .context("insert_event failed")?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent_events(&self, limit: i64) -> Result<Vec<EventRow>> {
        sqlx::query_as::<_, EventRow>(
            "SELECT ts, category, action, detail FROM events ORDER BY ts DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_events failed")
    }

    // ----------------------------
    // Telemetry
    // ----------------------------

    pub async fn insert_telemetry(&self, t: &TelemetryMsg) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO telemetry (
              ts, moisture_percent, moisture_status, temperature, humidity,
              water_on, fertilizer_on, transport, queued_notifications
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(t.ts.unix_timestamp())
        .bind(i64::from(t.moisture_percent))
        .bind(t.moisture_status)
        .bind(t.temperature.map(f64::from))
        .bind(t.humidity.map(f64::from))
        .bind(t.water)
        .bind(t.fertilizer)
        .bind(t.transport.as_str())
        .bind(t.queued_notifications as i64)
        .execute(&self.pool)
        .await
        .context("insert_telemetry failed")?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent_telemetry(&self, limit: i64) -> Result<Vec<TelemetryRow>> {
        sqlx::query_as::<_, TelemetryRow>(
            r#"
            SELECT ts, moisture_percent, moisture_status, temperature, humidity,
                   water_on, fertilizer_on, transport, queued_notifications
            FROM telemetry
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_telemetry failed")
    }

    /// Drop history older than `cutoff`. Returns rows removed.
    pub async fn prune_before(&self, cutoff: OffsetDateTime) -> Result<u64> {
        let ts = cutoff.unix_timestamp();
        let events = sqlx::query("DELETE FROM events WHERE ts < ?")
            .bind(ts)
            .execute(&self.pool)
            .await
            .context("prune events failed")?;
        let telemetry = sqlx::query("DELETE FROM telemetry WHERE ts < ?")
            .bind(ts)
            .execute(&self.pool)
            .await
            .context("prune telemetry failed")?;
        Ok(events.rows_affected() + telemetry.rows_affected())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SessionState;
    use time::macros::datetime;
    use time::Duration;

    async fn db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn event(ts: OffsetDateTime, action: &str) -> EventMsg {
        EventMsg {
            ts,
            category: "water".into(),
            action: action.into(),
            detail: format!("pump {action}"),
        }
    }

    fn telemetry(ts: OffsetDateTime) -> TelemetryMsg {
        TelemetryMsg {
            ts,
            moisture_percent: 72,
            moisture_status: "DRY",
            temperature: Some(23.5),
            humidity: None,
            water: true,
            fertilizer: false,
            transport: SessionState::Error,
            queued_notifications: 3,
        }
    }

    const T0: OffsetDateTime = datetime!(2024-01-01 08:00:00 UTC);

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let db = db().await;
        db.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn events_round_trip_newest_first() {
        let db = db().await;
        db.insert_event(&event(T0, "started")).await.unwrap();
        db.insert_event(&event(T0 + Duration::minutes(10), "stopped"))
            .await
            .unwrap();

        let rows = db.recent_events(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action, "stopped");
        assert_eq!(rows[1].ts, T0.unix_timestamp());
        assert_eq!(rows[1].detail, "pump started");
    }

    #[tokio::test]
    async fn recent_events_respects_limit() {
        let db = db().await;
        for i in 0..5 {
            db.insert_event(&event(T0 + Duration::seconds(i), "started"))
                .await
                .unwrap();
        }
        assert_eq!(db.recent_events(3).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn telemetry_round_trip() {
        let db = db().await;
        db.insert_telemetry(&telemetry(T0)).await.unwrap();

        let rows = db.recent_telemetry(1).await.unwrap();
        assert_eq!(rows.len(), 1);
        let r = &rows[0];
        assert_eq!(r.moisture_percent, 72);
        assert_eq!(r.moisture_status, "DRY");
        assert_eq!(r.temperature, Some(23.5));
        assert_eq!(r.humidity, None);
        assert!(r.water_on);
        assert!(!r.fertilizer_on);
        assert_eq!(r.transport, "error");
        assert_eq!(r.queued_notifications, 3);
    }

    #[tokio::test]
    async fn prune_drops_old_rows_only() {
        let db = db().await;
        db.insert_event(&event(T0, "started")).await.unwrap();
        db.insert_telemetry(&telemetry(T0)).await.unwrap();
        db.insert_event(&event(T0 + Duration::days(2), "stopped"))
            .await
            .unwrap();

        let removed = db.prune_before(T0 + Duration::days(1)).await.unwrap();
        assert_eq!(removed, 2);
        let rows = db.recent_events(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action, "stopped");
    }
}
