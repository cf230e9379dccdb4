use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{
    Channel, DeliveryAttempt, DeliveryOutcome, GestureLabel, Incident, IncidentRecord,
    IncidentState, Location,
};
use crate::store::EvidenceStore;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const INCIDENT_COLUMNS: &str = "incident_id, gesture, confidence, confirmed_at, state, snapshot, \
     latitude, longitude, place, message, suppressed_by, resolved_at";

fn incident_from_row(row: &PgRow) -> anyhow::Result<Incident> {
    let gesture: String = row.get("gesture");
    let state: String = row.get("state");
    let latitude: Option<f64> = row.get("latitude");
    let longitude: Option<f64> = row.get("longitude");

    Ok(Incident {
        id: row.get("incident_id"),
        gesture: GestureLabel::parse(&gesture)
            .with_context(|| format!("unknown gesture {gesture:?} in incident_log"))?,
        confidence: row.get("confidence"),
        confirmed_at: row.get("confirmed_at"),
        state: IncidentState::parse(&state)
            .with_context(|| format!("unknown state {state:?} in incident_log"))?,
        snapshot: row.get("snapshot"),
        location: latitude.zip(longitude).map(|(latitude, longitude)| Location {
            latitude,
            longitude,
            place: row.get("place"),
        }),
        message: row.get("message"),
        suppressed_by: row.get("suppressed_by"),
        resolved_at: row.get("resolved_at"),
    })
}

fn attempt_from_row(row: &PgRow) -> anyhow::Result<DeliveryAttempt> {
    let channel: String = row.get("channel");
    let outcome: String = row.get("outcome");
    let attempt: i32 = row.get("attempt");

    Ok(DeliveryAttempt {
        incident_id: row.get("incident_id"),
        channel: Channel::parse(&channel)
            .with_context(|| format!("unknown channel {channel:?} in delivery_attempts"))?,
        attempt: u32::try_from(attempt).context("negative attempt number")?,
        attempted_at: row.get("attempted_at"),
        outcome: DeliveryOutcome::parse(&outcome)
            .with_context(|| format!("unknown outcome {outcome:?} in delivery_attempts"))?,
        detail: row.get("detail"),
    })
}

/// Evidence store backed by Postgres; both tables are insert-only.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn attempts_for(&self, incident_id: Uuid) -> anyhow::Result<Vec<DeliveryAttempt>> {
        let rows = sqlx::query(
            r#"
            SELECT incident_id, channel, attempt, attempted_at, outcome, detail
            FROM distress_signal.delivery_attempts
            WHERE incident_id = $1
            ORDER BY seq
            "#,
        )
        .bind(incident_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(attempt_from_row).collect()
    }
}

#[async_trait]
impl EvidenceStore for PgStore {
    async fn record(&self, incident: &Incident) -> anyhow::Result<()> {
        let location = incident.location.as_ref();
        sqlx::query(
            r#"
            INSERT INTO distress_signal.incident_log
            (incident_id, gesture, confidence, confirmed_at, state, snapshot,
             latitude, longitude, place, message, suppressed_by, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(incident.id)
        .bind(incident.gesture.as_str())
        .bind(incident.confidence)
        .bind(incident.confirmed_at)
        .bind(incident.state.as_str())
        .bind(incident.snapshot.as_deref())
        .bind(location.map(|l| l.latitude))
        .bind(location.map(|l| l.longitude))
        .bind(location.and_then(|l| l.place.as_deref()))
        .bind(incident.message.as_deref())
        .bind(incident.suppressed_by)
        .bind(incident.resolved_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to record incident {}", incident.id))?;
        Ok(())
    }

    async fn append_attempt(&self, attempt: &DeliveryAttempt) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO distress_signal.delivery_attempts
            (incident_id, channel, attempt, attempted_at, outcome, detail)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(attempt.incident_id)
        .bind(attempt.channel.as_str())
        .bind(i32::try_from(attempt.attempt).context("attempt number out of range")?)
        .bind(attempt.attempted_at)
        .bind(attempt.outcome.as_str())
        .bind(attempt.detail.as_deref())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to record attempt for {}", attempt.incident_id))?;
        Ok(())
    }

    async fn latest_for_active_incident(&self) -> anyhow::Result<Option<Incident>> {
        let query = format!(
            "SELECT {INCIDENT_COLUMNS} FROM distress_signal.incident_log \
             WHERE state <> 'SUPPRESSED' ORDER BY seq DESC LIMIT 1"
        );
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(incident_from_row).transpose()
    }

    async fn incident(&self, id: Uuid) -> anyhow::Result<Option<IncidentRecord>> {
        let query = format!(
            "SELECT {INCIDENT_COLUMNS} FROM distress_signal.incident_log \
             WHERE incident_id = $1 ORDER BY seq DESC LIMIT 1"
        );
        let Some(row) = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        Ok(Some(IncidentRecord {
            incident: incident_from_row(&row)?,
            attempts: self.attempts_for(id).await?,
        }))
    }

    async fn incidents(&self) -> anyhow::Result<Vec<IncidentRecord>> {
        let query = format!(
            "SELECT {cols} FROM distress_signal.incident_log l \
             JOIN (SELECT incident_id AS id, MIN(seq) AS first_seq, MAX(seq) AS last_seq \
                   FROM distress_signal.incident_log GROUP BY incident_id) g \
             ON l.seq = g.last_seq \
             ORDER BY g.first_seq",
            cols = INCIDENT_COLUMNS
                .split(", ")
                .map(|c| format!("l.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let attempt_rows = sqlx::query(
            r#"
            SELECT incident_id, channel, attempt, attempted_at, outcome, detail
            FROM distress_signal.delivery_attempts
            ORDER BY seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut attempts: HashMap<Uuid, Vec<DeliveryAttempt>> = HashMap::new();
        for row in &attempt_rows {
            let attempt = attempt_from_row(row)?;
            attempts.entry(attempt.incident_id).or_default().push(attempt);
        }

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let incident = incident_from_row(row)?;
            records.push(IncidentRecord {
                attempts: attempts.remove(&incident.id).unwrap_or_default(),
                incident,
            });
        }

        Ok(records)
    }
}
