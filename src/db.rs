use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::GatewayError;
use crate::models::{
    CardAverage, CollectionRecord, PersonalLevelWinner, RunCheckpoint, Snapshot, StudentLevelUpdate,
    TeamLevelWinner, TeamStateUpdate,
};
use crate::snapshot::{self, CardRow, StudentRow, TeamRow};
use crate::store::{PersistenceGateway, RunLock, SnapshotSource};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let teams = vec![
        (
            Uuid::parse_str("7a0f3c52-52d1-4f0e-9d38-0f2f6c1b9e11")?,
            "Rivera TA",
        ),
        (
            Uuid::parse_str("b4c6e2d8-1f7a-4c3b-8e5d-2a9f7c4e6b20")?,
            "Okafor TA",
        ),
    ];

    for (id, name) in teams {
        sqlx::query(
            r#"
            INSERT INTO pbis_rewards.teams (id, name)
            VALUES ($1, $2)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(name)
        .execute(pool)
        .await?;
    }

    let students = vec![
        ("Avery Lee", "avery.lee@school.example", "Rivera TA", 30),
        ("Jules Moreno", "jules.moreno@school.example", "Rivera TA", 10),
        ("Kiara Patel", "kiara.patel@school.example", "Okafor TA", 18),
        ("Theo Nakamura", "theo.nakamura@school.example", "Okafor TA", 4),
    ];

    let start = Utc
        .with_ymd_and_hms(2026, 2, 2, 14, 0, 0)
        .single()
        .context("invalid seed date")?;

    for (name, email, team, cards) in students {
        let student_id: Uuid = sqlx::query(
            r#"
            INSERT INTO pbis_rewards.students (id, full_name, email, team_id)
            SELECT $1, $2, $3, t.id FROM pbis_rewards.teams t WHERE t.name = $4
            ON CONFLICT (email) DO UPDATE
            SET full_name = EXCLUDED.full_name, team_id = EXCLUDED.team_id
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(email)
        .bind(team)
        .fetch_one(pool)
        .await?
        .get("id");

        for index in 0..cards {
            sqlx::query(
                r#"
                INSERT INTO pbis_rewards.cards
                (id, student_id, teacher, category, date_given, source_key)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (source_key) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(student_id)
            .bind("Ms. Rivera")
            .bind(if index % 2 == 0 { "respect" } else { "responsibility" })
            .bind(start + Duration::hours(i64::from(index)))
            .bind(format!("seed-{email}-{index:03}"))
            .execute(pool)
            .await?;
        }
    }

    Ok(())
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        student_name: String,
        student_email: String,
        team: String,
        teacher: String,
        category: String,
        date_given: DateTime<Utc>,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let team_id: Uuid = sqlx::query(
            r#"
            INSERT INTO pbis_rewards.teams (id, name)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&row.team)
        .fetch_one(pool)
        .await?
        .get("id");

        let student_id: Uuid = sqlx::query(
            r#"
            INSERT INTO pbis_rewards.students (id, full_name, email, team_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO UPDATE
            SET full_name = EXCLUDED.full_name, team_id = EXCLUDED.team_id
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&row.student_name)
        .bind(&row.student_email)
        .bind(team_id)
        .fetch_one(pool)
        .await?
        .get("id");

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        let result = sqlx::query(
            r#"
            INSERT INTO pbis_rewards.cards
            (id, student_id, teacher, category, date_given, source_key)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(&row.teacher)
        .bind(&row.category)
        .bind(row.date_given)
        .bind(source_key)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

pub async fn fetch_teams(conn: &mut PgConnection) -> anyhow::Result<Vec<TeamRow>> {
    let rows = sqlx::query(
        "SELECT id, name, average_cards_numerator, average_cards_denominator, \
         current_level, current_winner, previous_winner, version \
         FROM pbis_rewards.teams",
    )
    .fetch_all(&mut *conn)
    .await
    .context("failed to load teams")?;

    rows.into_iter()
        .map(|row| -> anyhow::Result<TeamRow> {
            let id: Uuid = row.get("id");
            let average = average_from_db(
                row.get("average_cards_numerator"),
                row.get("average_cards_denominator"),
            )
            .with_context(|| format!("team {id} has an invalid card average"))?;
            Ok(TeamRow {
                id,
                name: row.get("name"),
                average_cards_per_student: average,
                current_level: level_from_db(row.get("current_level")),
                current_winner: row.get("current_winner"),
                previous_winner: row.get("previous_winner"),
                version: row.get("version"),
            })
        })
        .collect()
}

fn average_from_db(numerator: i64, denominator: i64) -> anyhow::Result<CardAverage> {
    if denominator <= 0 {
        anyhow::bail!("denominator {denominator} is not positive");
    }
    Ok(CardAverage::new(i128::from(numerator), i128::from(denominator)))
}

fn average_to_db(average: CardAverage) -> anyhow::Result<(i64, i64)> {
    let numerator = i64::try_from(*average.numer()).context("card average out of range")?;
    let denominator = i64::try_from(*average.denom()).context("card average out of range")?;
    Ok((numerator, denominator))
}

pub async fn student_names(pool: &PgPool) -> anyhow::Result<HashMap<Uuid, String>> {
    let rows = sqlx::query("SELECT id, full_name FROM pbis_rewards.students")
        .fetch_all(pool)
        .await
        .context("failed to load student names")?;
    Ok(rows
        .into_iter()
        .map(|row| (row.get("id"), row.get("full_name")))
        .collect())
}

/// Newest `limit` collection records with their drawing winners in draw order.
pub async fn fetch_recent_collections(
    conn: &mut PgConnection,
    limit: usize,
) -> anyhow::Result<Vec<CollectionRecord>> {
    let rows = sqlx::query(
        "SELECT id, collection_date, collected_cards_count, \
         personal_level_winners, ta_new_level_winners \
         FROM pbis_rewards.collections \
         ORDER BY collection_date DESC \
         LIMIT $1",
    )
    .bind(i64::try_from(limit).context("collection history limit out of range")?)
    .fetch_all(&mut *conn)
    .await
    .context("failed to load recent collections")?;

    let mut records = rows
        .into_iter()
        .map(collection_from_row)
        .collect::<anyhow::Result<Vec<_>>>()?;
    if records.is_empty() {
        return Ok(records);
    }

    let ids: Vec<Uuid> = records.iter().map(|record| record.id).collect();
    let winners = sqlx::query(
        "SELECT collection_id, student_id \
         FROM pbis_rewards.random_drawing_wins \
         WHERE collection_id = ANY($1) \
         ORDER BY collection_id, draw_order",
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await
    .context("failed to load drawing winners")?;

    let mut by_collection: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for row in winners {
        by_collection
            .entry(row.get("collection_id"))
            .or_default()
            .push(row.get("student_id"));
    }
    for record in records.iter_mut() {
        record.random_drawing_winners = by_collection.remove(&record.id).unwrap_or_default();
    }

    Ok(records)
}

fn collection_from_row(row: PgRow) -> anyhow::Result<CollectionRecord> {
    let collected: i64 = row.get("collected_cards_count");
    let Json(personal_level_winners): Json<Vec<PersonalLevelWinner>> =
        row.try_get("personal_level_winners")?;
    let Json(ta_new_level_winners): Json<Vec<TeamLevelWinner>> =
        row.try_get("ta_new_level_winners")?;
    Ok(CollectionRecord {
        id: row.get("id"),
        collection_date: row.get("collection_date"),
        collected_cards_count: u64::try_from(collected).context("negative card count")?,
        personal_level_winners,
        ta_new_level_winners,
        random_drawing_winners: Vec::new(),
    })
}

fn level_from_db(value: i32) -> u32 {
    value.max(0) as u32
}

fn level_to_db(value: u32) -> anyhow::Result<i32> {
    i32::try_from(value).context("level out of range")
}

/// Postgres-backed store. The run lock is a session advisory lock held on a
/// dedicated connection.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_key: i64,
}

impl PgStore {
    pub fn new(pool: PgPool, lock_key: i64) -> Self {
        Self { pool, lock_key }
    }

    async fn entity_marker(
        &self,
        table: &'static str,
        id: Uuid,
    ) -> anyhow::Result<Option<Option<Uuid>>> {
        let query = format!("SELECT last_collection_id FROM pbis_rewards.{table} WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read {table} {id}"))?;
        Ok(row.map(|row| row.get("last_collection_id")))
    }

    /// Turns a zero-row conditional update into success (already applied by
    /// this run), a stale-version error, or a missing-row error.
    async fn resolve_skipped_write(
        &self,
        table: &'static str,
        entity: &'static str,
        id: Uuid,
        run_id: Uuid,
    ) -> Result<(), GatewayError> {
        match self.entity_marker(table, id).await? {
            None => Err(anyhow::anyhow!("{entity} {id} does not exist").into()),
            Some(Some(marker)) if marker == run_id => {
                debug!(%id, entity, "write already applied by this run");
                Ok(())
            }
            Some(_) => Err(GatewayError::Stale { entity, id }),
        }
    }
}

const SNAPSHOT_ISOLATION: &str = "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY";

#[async_trait]
impl SnapshotSource for PgStore {
    /// All reads share one repeatable-read transaction so card totals and
    /// uncounted cards describe the same moment.
    async fn snapshot(&self, now: DateTime<Utc>, config: &EngineConfig) -> anyhow::Result<Snapshot> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open snapshot transaction")?;
        sqlx::query(SNAPSHOT_ISOLATION)
            .execute(&mut *tx)
            .await
            .context("failed to set snapshot isolation")?;

        let latest: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT max(collection_date) FROM pbis_rewards.collections")
                .fetch_one(&mut *tx)
                .await
                .context("failed to read latest collection date")?;
        let cutoff = snapshot::cutoff_date(now, latest, config);

        let teams = fetch_teams(&mut tx).await?;

        let students = sqlx::query(
            "SELECT s.id, s.full_name, s.team_id, s.individual_level, s.version, \
             (SELECT count(*) FROM pbis_rewards.cards c \
              WHERE c.student_id = s.id AND c.date_given <= $1) AS total_cards \
             FROM pbis_rewards.students s \
             WHERE s.team_id IS NOT NULL",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .context("failed to load students")?
        .into_iter()
        .map(|row| -> anyhow::Result<StudentRow> {
            let total: i64 = row.get("total_cards");
            Ok(StudentRow {
                id: row.get("id"),
                name: row.get("full_name"),
                team_id: row.get("team_id"),
                individual_level: level_from_db(row.get("individual_level")),
                version: row.get("version"),
                total_cards: u32::try_from(total).context("card total out of range")?,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

        let cards: Vec<CardRow> = sqlx::query(
            "SELECT id, student_id, date_given, counted \
             FROM pbis_rewards.cards \
             WHERE NOT counted AND date_given > $1 AND date_given <= $2",
        )
        .bind(cutoff)
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .context("failed to load uncounted cards")?
        .into_iter()
        .map(|row| CardRow {
            id: row.get("id"),
            student_id: row.get("student_id"),
            date_given: row.get("date_given"),
            counted: row.get("counted"),
        })
        .collect();

        let recent =
            fetch_recent_collections(&mut tx, config.collections_without_repeat_winners).await?;
        tx.commit().await.context("failed to close snapshot transaction")?;

        Ok(snapshot::assemble(now, cutoff, teams, students, cards, recent))
    }
}

#[async_trait]
impl PersistenceGateway for PgStore {
    async fn create_collection_record(&self, record: &CollectionRecord) -> Result<Uuid, GatewayError> {
        let mut tx = self.pool.begin().await.context("failed to open transaction")?;

        sqlx::query(
            r#"
            INSERT INTO pbis_rewards.collections
            (id, collection_date, collected_cards_count, personal_level_winners, ta_new_level_winners)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.collection_date)
        .bind(i64::try_from(record.collected_cards_count).context("card count out of range")?)
        .bind(Json(&record.personal_level_winners))
        .bind(Json(&record.ta_new_level_winners))
        .execute(&mut *tx)
        .await
        .context("failed to insert collection record")?;

        for (order, student_id) in record.random_drawing_winners.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO pbis_rewards.random_drawing_wins (collection_id, student_id, draw_order)
                VALUES ($1, $2, $3)
                ON CONFLICT (collection_id, student_id) DO NOTHING
                "#,
            )
            .bind(record.id)
            .bind(student_id)
            .bind(i32::try_from(order).context("draw order out of range")?)
            .execute(&mut *tx)
            .await
            .context("failed to insert drawing winner")?;
        }

        tx.commit().await.context("failed to commit collection record")?;
        Ok(record.id)
    }

    async fn update_student_level(
        &self,
        run_id: Uuid,
        update: &StudentLevelUpdate,
    ) -> Result<(), GatewayError> {
        let result = sqlx::query(
            r#"
            UPDATE pbis_rewards.students
            SET individual_level = GREATEST(individual_level, $2),
                version = version + 1,
                last_collection_id = $3
            WHERE id = $1
              AND version = $4
              AND last_collection_id IS DISTINCT FROM $3
            "#,
        )
        .bind(update.student_id)
        .bind(level_to_db(update.new_level)?)
        .bind(run_id)
        .bind(update.expected_version)
        .execute(&self.pool)
        .await
        .context("failed to update student level")?;

        if result.rows_affected() == 0 {
            return self
                .resolve_skipped_write("students", "student", update.student_id, run_id)
                .await;
        }
        Ok(())
    }

    async fn update_team_state(&self, run_id: Uuid, update: &TeamStateUpdate) -> Result<(), GatewayError> {
        let rotate = update.rotation.is_some();
        let current = update.rotation.map(|rotation| rotation.current_winner);
        let previous = update.rotation.and_then(|rotation| rotation.previous_winner);
        let (numerator, denominator) = average_to_db(update.average_cards_per_student)?;

        let result = sqlx::query(
            r#"
            UPDATE pbis_rewards.teams
            SET average_cards_numerator = $2,
                average_cards_denominator = $3,
                current_level = $4,
                current_winner = CASE WHEN $5::boolean THEN $6::uuid ELSE current_winner END,
                previous_winner = CASE WHEN $5::boolean THEN $7::uuid ELSE previous_winner END,
                version = version + 1,
                last_collection_id = $8
            WHERE id = $1
              AND version = $9
              AND last_collection_id IS DISTINCT FROM $8
            "#,
        )
        .bind(update.team_id)
        .bind(numerator)
        .bind(denominator)
        .bind(level_to_db(update.level)?)
        .bind(rotate)
        .bind(current)
        .bind(previous)
        .bind(run_id)
        .bind(update.expected_version)
        .execute(&self.pool)
        .await
        .context("failed to update team state")?;

        if result.rows_affected() == 0 {
            return self
                .resolve_skipped_write("teams", "team", update.team_id, run_id)
                .await;
        }
        Ok(())
    }

    async fn mark_cards_counted(&self, card_ids: &[Uuid]) -> Result<u64, GatewayError> {
        let result = sqlx::query(
            "UPDATE pbis_rewards.cards SET counted = TRUE WHERE id = ANY($1) AND NOT counted",
        )
        .bind(card_ids)
        .execute(&self.pool)
        .await
        .context("failed to mark cards counted")?;
        Ok(result.rows_affected())
    }

    async fn save_checkpoint(&self, checkpoint: &RunCheckpoint) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            INSERT INTO pbis_rewards.collection_runs (id, started_at, checkpoint, finished)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET checkpoint = EXCLUDED.checkpoint, finished = EXCLUDED.finished
            "#,
        )
        .bind(checkpoint.plan.run_id)
        .bind(checkpoint.started_at)
        .bind(Json(checkpoint))
        .bind(checkpoint.finished)
        .execute(&self.pool)
        .await
        .context("failed to save run checkpoint")?;
        Ok(())
    }

    async fn unfinished_checkpoint(&self) -> anyhow::Result<Option<RunCheckpoint>> {
        let checkpoint: Option<Json<RunCheckpoint>> = sqlx::query_scalar(
            "SELECT checkpoint FROM pbis_rewards.collection_runs \
             WHERE NOT finished ORDER BY started_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to read run checkpoints")?;
        Ok(checkpoint.map(|Json(checkpoint)| checkpoint))
    }
}

/// Holds the advisory lock. The connection closes on drop, which releases it.
pub struct AdvisoryLockGuard {
    _conn: PoolConnection<Postgres>,
}

#[async_trait]
impl RunLock for PgStore {
    type Guard = AdvisoryLockGuard;

    async fn try_lock(&self) -> anyhow::Result<Option<Self::Guard>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("failed to acquire connection for collection lock")?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.lock_key)
            .fetch_one(&mut *conn)
            .await
            .context("failed to request advisory lock")?;
        if !acquired {
            return Ok(None);
        }
        conn.close_on_drop();
        Ok(Some(AdvisoryLockGuard { _conn: conn }))
    }
}
