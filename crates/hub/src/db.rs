use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::calibration::CalibrationOutcome;
use crate::growth::GrowthStage;
use crate::scheduler::{ChannelOutcome, ExecutionReport};
use crate::sensor::SensorReading;

/// Operational history: readings, actuations, calibrations and stage changes.
#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ReadingRow {
    pub ts: i64,
    pub ph: f64,
    pub ec: f64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ActuationRow {
    pub ts: i64,
    pub channel: String,
    pub held_sec: f64,
    pub result: String,
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/hydro/history.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // every pooled connection to :memory: would be its own database
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
    // Readings
    // ----------------------------

    pub async fn insert_reading(&self, r: &SensorReading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (ts, ph, ec, temperature, humidity)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.timestamp.unix_timestamp())
        .bind(r.ph)
        .bind(r.ec)
        .bind(r.temperature)
        .bind(r.humidity)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent_readings(&self, limit: i64) -> Result<Vec<ReadingRow>> {
        sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT ts, ph, ec, temperature, humidity
            FROM readings
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_readings failed")
    }

    // ----------------------------
    // Actuations
    // ----------------------------

    /// One row per channel that was switched or failed; skipped channels are
    /// not recorded.
    pub async fn insert_actuations(&self, ts: i64, report: &ExecutionReport) -> Result<()> {
        for (channel, outcome) in &report.outcomes {
            let (held_sec, result) = match outcome {
                ChannelOutcome::Skipped => continue,
                ChannelOutcome::Completed { held } => (held.as_secs_f64(), "completed".to_string()),
                ChannelOutcome::Failed(e) => (0.0, format!("failed: {e}")),
            };
            sqlx::query(
                r#"
                INSERT INTO actuations (ts, channel, held_sec, result)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(ts)
            .bind(channel)
            .bind(held_sec)
            .bind(&result)
            .execute(&self.pool)
            .await
            .context("insert_actuations failed")?;
        }
        Ok(())
    }

    pub async fn recent_actuations(&self, limit: i64) -> Result<Vec<ActuationRow>> {
        sqlx::query_as::<_, ActuationRow>(
            r#"
            SELECT ts, channel, held_sec, result
            FROM actuations
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_actuations failed")
    }

    // ----------------------------
    // Calibrations
    // ----------------------------

    pub async fn insert_calibration(&self, ts: i64, outcome: &CalibrationOutcome) -> Result<()> {
        let last = match outcome {
            CalibrationOutcome::Converged { reading, .. } => Some(*reading),
            CalibrationOutcome::Exhausted { last, .. } => *last,
        };
        sqlx::query(
            r#"
            INSERT INTO calibrations (ts, converged, attempts, final_ph, final_ec)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(outcome.converged())
        .bind(outcome.attempts() as i64)
        .bind(last.map(|r| r.ph))
        .bind(last.map(|r| r.ec))
        .execute(&self.pool)
        .await
        .context("insert_calibration failed")?;
        Ok(())
    }

    // ----------------------------
    // Growth stage
    // ----------------------------

    pub async fn insert_stage_transition(
        &self,
        ts: i64,
        from: GrowthStage,
        to: GrowthStage,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stage_transitions (ts, from_stage, to_stage)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(from.number().map(i64::from))
        .bind(to.number().map(i64::from))
        .execute(&self.pool)
        .await
        .context("insert_stage_transition failed")?;
        Ok(())
    }

    /// The most recently committed stage, so a restart resumes where it left
    /// off.
    pub async fn latest_stage(&self) -> Result<Option<GrowthStage>> {
        let n: Option<Option<i64>> = sqlx::query_scalar(
            r#"
            SELECT to_stage FROM stage_transitions
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("latest_stage failed")?;
        Ok(n.map(|n| n.map_or(GrowthStage::Unknown, GrowthStage::from_number)))
    }

    // ----------------------------
    // Replenishment
    // ----------------------------

    pub async fn insert_replenishment(&self, ts: i64, stage: GrowthStage, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO replenishments (ts, stage, reason)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(stage.number().map(i64::from))
        .bind(reason)
        .execute(&self.pool)
        .await
        .context("insert_replenishment failed")?;
        Ok(())
    }

    pub async fn last_replenishment_ts(&self) -> Result<Option<i64>> {
        sqlx::query_scalar("SELECT MAX(ts) FROM replenishments")
            .fetch_one(&self.pool)
            .await
            .context("last_replenishment_ts failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
