/// Unlock Record Store
///
/// This module handles persistence for the unlock scheduler:
/// - One schedule record per (user, day) with its three slots
/// - One interaction record per (user, tip), the durable "has this user
///   seen this tip" marker used by the content pool
/// - User profiles and the active tip pool, both owned elsewhere and
///   only read here
///
/// Two implementations are provided: `PgStore` (PostgreSQL via sqlx) for
/// production and `MemoryStore` for tests and embedded hosts. Both uphold
/// the same upsert guarantees: uniqueness on (user_id, day_start) and
/// (user_id, tip_id), and `unlocked_at` never changing once set.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::config::Config;
use crate::error::Result;
use crate::schedule::{DailySchedule, UnlockSlot};

/// Read-only view of a user, owned by the accounts layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: i64,

    /// Proficiency level assigned by the placement quiz
    pub level: i32,

    pub quiz_completed: bool,
    pub active: bool,
}

/// Read-only view of a content item, owned by the content admin layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tip {
    pub id: i64,
    pub level: i32,
    pub active: bool,
}

/// Per-(user, tip) interaction record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TipInteraction {
    pub user_id: i64,
    pub tip_id: i64,
    pub is_unlocked: bool,
    pub unlocked_at: Option<DateTime<Utc>>,
    pub unlock_order: Option<i32>,
    pub is_read: bool,
    pub is_favorite: bool,
}

impl TipInteraction {
    fn new(user_id: i64, tip_id: i64) -> Self {
        Self {
            user_id,
            tip_id,
            is_unlocked: false,
            unlocked_at: None,
            unlock_order: None,
            is_read: false,
            is_favorite: false,
        }
    }
}

/// Persistence interface used by the builder, reconciler and content pool.
/// No business logic lives here.
#[async_trait]
pub trait UnlockStore: Send + Sync {
    async fn get_user(&self, user_id: i64) -> Result<Option<UserProfile>>;

    /// Users the background sweep processes: active and quiz-completed
    async fn list_eligible_users(&self) -> Result<Vec<UserProfile>>;

    async fn list_active_tips_for_level(&self, level: i32) -> Result<Vec<Tip>>;

    async fn find_schedule(
        &self,
        user_id: i64,
        day_start: DateTime<Utc>,
    ) -> Result<Option<DailySchedule>>;

    /// Insert or update a schedule. A slot's `unlocked_at`, once non-null,
    /// is never overwritten by this call.
    async fn upsert_schedule(&self, schedule: &DailySchedule) -> Result<()>;

    async fn find_interaction(&self, user_id: i64, tip_id: i64) -> Result<Option<TipInteraction>>;

    /// Tip ids at `level` the user has already unlocked
    async fn list_unlocked_tip_ids(&self, user_id: i64, level: i32) -> Result<Vec<i64>>;

    /// Mark a tip unlocked for a user. Idempotent; the first recorded
    /// `unlocked_at`/`unlock_order` win on repeat calls.
    async fn upsert_interaction(
        &self,
        user_id: i64,
        tip_id: i64,
        unlocked_at: DateTime<Utc>,
        unlock_order: i32,
    ) -> Result<()>;

    /// Clear unlock state on all of the user's interactions for one level
    /// pool. Returns the number of records reset.
    async fn bulk_reset_interactions(&self, user_id: i64, level: i32) -> Result<u64>;

    async fn mark_read(&self, user_id: i64, tip_id: i64) -> Result<()>;

    /// Flip the favorite flag, returning the new value
    async fn toggle_favorite(&self, user_id: i64, tip_id: i64) -> Result<bool>;
}

/// PostgreSQL-backed store
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to PostgreSQL using the configured URL
    pub async fn connect(config: &Config) -> Result<Self> {
        // Check if using connection pooler (pgBouncer)
        let use_pooler = config.database_url.contains(":6543")
            || config.database_url.contains("pgbouncer=true");

        let mut pool_options = sqlx::postgres::PgPoolOptions::new().max_connections(10);

        // Disable prepared statements for connection poolers
        if use_pooler {
            log::info!("Using connection pooler - disabling prepared statements");
            pool_options = pool_options.after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("SET statement_timeout = 0").execute(conn).await?;
                    Ok(())
                })
            });
        }

        let pool = pool_options
            .connect(&config.database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    /// Create tables and indexes if they don't exist
    pub async fn init_schema(&self) -> Result<()> {
        log::info!("Initializing database schema...");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id BIGINT PRIMARY KEY,
                level INT NOT NULL DEFAULT 1,
                quiz_completed BOOLEAN NOT NULL DEFAULT FALSE,
                active BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create users table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tips (
                id BIGINT PRIMARY KEY,
                level INT NOT NULL,
                active BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create tips table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_schedules (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL,
                day_start TIMESTAMPTZ NOT NULL,
                t_first TIMESTAMPTZ NOT NULL,
                t_second TIMESTAMPTZ NOT NULL,
                t_third TIMESTAMPTZ NOT NULL,
                UNIQUE (user_id, day_start)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create daily_schedules table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS unlock_slots (
                schedule_id BIGINT NOT NULL REFERENCES daily_schedules(id),
                position INT NOT NULL,
                tip_id BIGINT NOT NULL,
                unlocked_at TIMESTAMPTZ,
                PRIMARY KEY (schedule_id, position)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create unlock_slots table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tip_interactions (
                user_id BIGINT NOT NULL,
                tip_id BIGINT NOT NULL,
                is_unlocked BOOLEAN NOT NULL DEFAULT FALSE,
                unlocked_at TIMESTAMPTZ,
                unlock_order INT,
                is_read BOOLEAN NOT NULL DEFAULT FALSE,
                is_favorite BOOLEAN NOT NULL DEFAULT FALSE,
                PRIMARY KEY (user_id, tip_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create tip_interactions table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS tips_level_idx ON tips (level) WHERE active",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create tips index")?;

        log::info!("Database schema initialized successfully");
        Ok(())
    }
}

#[async_trait]
impl UnlockStore for PgStore {
    async fn get_user(&self, user_id: i64) -> Result<Option<UserProfile>> {
        let row = sqlx::query(
            "SELECT id, level, quiz_completed, active FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| UserProfile {
            user_id: r.get("id"),
            level: r.get("level"),
            quiz_completed: r.get("quiz_completed"),
            active: r.get("active"),
        }))
    }

    async fn list_eligible_users(&self) -> Result<Vec<UserProfile>> {
        let rows = sqlx::query(
            "SELECT id, level, quiz_completed, active FROM users \
             WHERE active AND quiz_completed ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| UserProfile {
                user_id: r.get("id"),
                level: r.get("level"),
                quiz_completed: r.get("quiz_completed"),
                active: r.get("active"),
            })
            .collect())
    }

    async fn list_active_tips_for_level(&self, level: i32) -> Result<Vec<Tip>> {
        let rows = sqlx::query(
            "SELECT id, level, active FROM tips WHERE active AND level = $1 ORDER BY id",
        )
        .bind(level)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Tip {
                id: r.get("id"),
                level: r.get("level"),
                active: r.get("active"),
            })
            .collect())
    }

    async fn find_schedule(
        &self,
        user_id: i64,
        day_start: DateTime<Utc>,
    ) -> Result<Option<DailySchedule>> {
        let row = sqlx::query(
            "SELECT id, t_first, t_second, t_third FROM daily_schedules \
             WHERE user_id = $1 AND day_start = $2",
        )
        .bind(user_id)
        .bind(day_start)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let schedule_id: i64 = row.get("id");
        let unlock_times = [
            row.get::<DateTime<Utc>, _>("t_first"),
            row.get::<DateTime<Utc>, _>("t_second"),
            row.get::<DateTime<Utc>, _>("t_third"),
        ];

        let slot_rows = sqlx::query(
            "SELECT tip_id, position, unlocked_at FROM unlock_slots \
             WHERE schedule_id = $1 ORDER BY position",
        )
        .bind(schedule_id)
        .fetch_all(&self.pool)
        .await?;

        let slots = slot_rows
            .into_iter()
            .map(|r| UnlockSlot {
                tip_id: r.get("tip_id"),
                position: r.get("position"),
                unlocked_at: r.get("unlocked_at"),
            })
            .collect();

        Ok(Some(DailySchedule {
            user_id,
            day_start,
            unlock_times,
            slots,
        }))
    }

    async fn upsert_schedule(&self, schedule: &DailySchedule) -> Result<()> {
        let row = sqlx::query(
            r#"
            INSERT INTO daily_schedules (user_id, day_start, t_first, t_second, t_third)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, day_start)
            DO UPDATE SET t_first = $3, t_second = $4, t_third = $5
            RETURNING id
            "#,
        )
        .bind(schedule.user_id)
        .bind(schedule.day_start)
        .bind(schedule.unlock_times[0])
        .bind(schedule.unlock_times[1])
        .bind(schedule.unlock_times[2])
        .fetch_one(&self.pool)
        .await?;

        let schedule_id: i64 = row.get("id");

        for slot in &schedule.slots {
            // unlocked_at is append-once: COALESCE keeps the first write
            sqlx::query(
                r#"
                INSERT INTO unlock_slots (schedule_id, position, tip_id, unlocked_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (schedule_id, position)
                DO UPDATE SET unlocked_at = COALESCE(unlock_slots.unlocked_at, EXCLUDED.unlocked_at)
                "#,
            )
            .bind(schedule_id)
            .bind(slot.position)
            .bind(slot.tip_id)
            .bind(slot.unlocked_at)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn find_interaction(&self, user_id: i64, tip_id: i64) -> Result<Option<TipInteraction>> {
        let row = sqlx::query(
            "SELECT user_id, tip_id, is_unlocked, unlocked_at, unlock_order, is_read, is_favorite \
             FROM tip_interactions WHERE user_id = $1 AND tip_id = $2",
        )
        .bind(user_id)
        .bind(tip_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| TipInteraction {
            user_id: r.get("user_id"),
            tip_id: r.get("tip_id"),
            is_unlocked: r.get("is_unlocked"),
            unlocked_at: r.get("unlocked_at"),
            unlock_order: r.get("unlock_order"),
            is_read: r.get("is_read"),
            is_favorite: r.get("is_favorite"),
        }))
    }

    async fn list_unlocked_tip_ids(&self, user_id: i64, level: i32) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT i.tip_id FROM tip_interactions i \
             JOIN tips t ON t.id = i.tip_id \
             WHERE i.user_id = $1 AND i.is_unlocked AND t.level = $2",
        )
        .bind(user_id)
        .bind(level)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get("tip_id")).collect())
    }

    async fn upsert_interaction(
        &self,
        user_id: i64,
        tip_id: i64,
        unlocked_at: DateTime<Utc>,
        unlock_order: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tip_interactions (user_id, tip_id, is_unlocked, unlocked_at, unlock_order)
            VALUES ($1, $2, TRUE, $3, $4)
            ON CONFLICT (user_id, tip_id)
            DO UPDATE SET
                is_unlocked = TRUE,
                unlocked_at = COALESCE(tip_interactions.unlocked_at, EXCLUDED.unlocked_at),
                unlock_order = COALESCE(tip_interactions.unlock_order, EXCLUDED.unlock_order)
            "#,
        )
        .bind(user_id)
        .bind(tip_id)
        .bind(unlocked_at)
        .bind(unlock_order)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn bulk_reset_interactions(&self, user_id: i64, level: i32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tip_interactions AS i
            SET is_unlocked = FALSE, unlocked_at = NULL, unlock_order = NULL
            FROM tips AS t
            WHERE t.id = i.tip_id AND i.user_id = $1 AND t.level = $2
            "#,
        )
        .bind(user_id)
        .bind(level)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_read(&self, user_id: i64, tip_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tip_interactions (user_id, tip_id, is_read)
            VALUES ($1, $2, TRUE)
            ON CONFLICT (user_id, tip_id) DO UPDATE SET is_read = TRUE
            "#,
        )
        .bind(user_id)
        .bind(tip_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn toggle_favorite(&self, user_id: i64, tip_id: i64) -> Result<bool> {
        let row = sqlx::query(
            r#"
            INSERT INTO tip_interactions (user_id, tip_id, is_favorite)
            VALUES ($1, $2, TRUE)
            ON CONFLICT (user_id, tip_id)
            DO UPDATE SET is_favorite = NOT tip_interactions.is_favorite
            RETURNING is_favorite
            "#,
        )
        .bind(user_id)
        .bind(tip_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("is_favorite"))
    }
}

/// In-memory store for tests and embedded hosts
///
/// Maps guarded by RwLocks, one per record family. Guards are never held
/// across await points.
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<i64, UserProfile>>,
    tips: RwLock<HashMap<i64, Tip>>,
    schedules: RwLock<HashMap<(i64, DateTime<Utc>), DailySchedule>>,
    interactions: RwLock<HashMap<(i64, i64), TipInteraction>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: UserProfile) {
        self.users
            .write()
            .expect("lock poisoned")
            .insert(user.user_id, user);
    }

    pub fn add_tip(&self, tip: Tip) {
        self.tips.write().expect("lock poisoned").insert(tip.id, tip);
    }
}

#[async_trait]
impl UnlockStore for MemoryStore {
    async fn get_user(&self, user_id: i64) -> Result<Option<UserProfile>> {
        Ok(self
            .users
            .read()
            .expect("lock poisoned")
            .get(&user_id)
            .cloned())
    }

    async fn list_eligible_users(&self) -> Result<Vec<UserProfile>> {
        let mut users: Vec<UserProfile> = self
            .users
            .read()
            .expect("lock poisoned")
            .values()
            .filter(|u| u.active && u.quiz_completed)
            .cloned()
            .collect();
        users.sort_by_key(|u| u.user_id);
        Ok(users)
    }

    async fn list_active_tips_for_level(&self, level: i32) -> Result<Vec<Tip>> {
        let mut tips: Vec<Tip> = self
            .tips
            .read()
            .expect("lock poisoned")
            .values()
            .filter(|t| t.active && t.level == level)
            .cloned()
            .collect();
        tips.sort_by_key(|t| t.id);
        Ok(tips)
    }

    async fn find_schedule(
        &self,
        user_id: i64,
        day_start: DateTime<Utc>,
    ) -> Result<Option<DailySchedule>> {
        Ok(self
            .schedules
            .read()
            .expect("lock poisoned")
            .get(&(user_id, day_start))
            .cloned())
    }

    async fn upsert_schedule(&self, schedule: &DailySchedule) -> Result<()> {
        let mut schedules = self.schedules.write().expect("lock poisoned");

        match schedules.get_mut(&(schedule.user_id, schedule.day_start)) {
            Some(existing) => {
                existing.unlock_times = schedule.unlock_times;
                for incoming in &schedule.slots {
                    match existing
                        .slots
                        .iter_mut()
                        .find(|s| s.position == incoming.position)
                    {
                        Some(current) => {
                            // Append-once: never clear or change a set unlocked_at
                            if current.unlocked_at.is_none() {
                                current.unlocked_at = incoming.unlocked_at;
                            }
                        }
                        None => existing.slots.push(incoming.clone()),
                    }
                }
                existing.slots.sort_by_key(|s| s.position);
            }
            None => {
                schedules.insert((schedule.user_id, schedule.day_start), schedule.clone());
            }
        }

        Ok(())
    }

    async fn find_interaction(&self, user_id: i64, tip_id: i64) -> Result<Option<TipInteraction>> {
        Ok(self
            .interactions
            .read()
            .expect("lock poisoned")
            .get(&(user_id, tip_id))
            .cloned())
    }

    async fn list_unlocked_tip_ids(&self, user_id: i64, level: i32) -> Result<Vec<i64>> {
        let tips = self.tips.read().expect("lock poisoned");
        Ok(self
            .interactions
            .read()
            .expect("lock poisoned")
            .values()
            .filter(|i| {
                i.user_id == user_id
                    && i.is_unlocked
                    && tips.get(&i.tip_id).map(|t| t.level == level).unwrap_or(false)
            })
            .map(|i| i.tip_id)
            .collect())
    }

    async fn upsert_interaction(
        &self,
        user_id: i64,
        tip_id: i64,
        unlocked_at: DateTime<Utc>,
        unlock_order: i32,
    ) -> Result<()> {
        let mut interactions = self.interactions.write().expect("lock poisoned");
        let record = interactions
            .entry((user_id, tip_id))
            .or_insert_with(|| TipInteraction::new(user_id, tip_id));

        record.is_unlocked = true;
        if record.unlocked_at.is_none() {
            record.unlocked_at = Some(unlocked_at);
        }
        if record.unlock_order.is_none() {
            record.unlock_order = Some(unlock_order);
        }

        Ok(())
    }

    async fn bulk_reset_interactions(&self, user_id: i64, level: i32) -> Result<u64> {
        let tips = self.tips.read().expect("lock poisoned");
        let mut interactions = self.interactions.write().expect("lock poisoned");

        let mut reset = 0;
        for record in interactions.values_mut() {
            let in_pool = record.user_id == user_id
                && tips.get(&record.tip_id).map(|t| t.level == level).unwrap_or(false);
            if in_pool && record.is_unlocked {
                record.is_unlocked = false;
                record.unlocked_at = None;
                record.unlock_order = None;
                reset += 1;
            }
        }

        Ok(reset)
    }

    async fn mark_read(&self, user_id: i64, tip_id: i64) -> Result<()> {
        let mut interactions = self.interactions.write().expect("lock poisoned");
        interactions
            .entry((user_id, tip_id))
            .or_insert_with(|| TipInteraction::new(user_id, tip_id))
            .is_read = true;
        Ok(())
    }

    async fn toggle_favorite(&self, user_id: i64, tip_id: i64) -> Result<bool> {
        let mut interactions = self.interactions.write().expect("lock poisoned");
        let record = interactions
            .entry((user_id, tip_id))
            .or_insert_with(|| TipInteraction::new(user_id, tip_id));
        record.is_favorite = !record.is_favorite;
        Ok(record.is_favorite)
    }
}
