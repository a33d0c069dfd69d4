//! Argus Storage Layer - Database operations

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::ApiError;
use crate::models::*;

/// Aggregate row counts for the admin stats endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub users: i64,
    pub teams: i64,
    pub locations: i64,
    pub annotations: i64,
    pub messages: i64,
    pub monitors: i64,
    pub threats: i64,
}

/// Storage adapter for the Argus core. All writes are single-row unless
/// stated otherwise; transactional guarantees come from the database.
pub struct ArgusStorage {
    pool: SqlitePool,
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ApiError::Internal(anyhow!("malformed timestamp {raw:?}: {e}")))
}

fn parse_uuid(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|e| ApiError::Internal(anyhow!("malformed uuid {raw:?}: {e}")))
}

fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T, ApiError> {
    serde_json::from_str(raw).map_err(|e| ApiError::Internal(anyhow!("malformed stored json: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, ApiError> {
    serde_json::to_string(value).map_err(|e| ApiError::Internal(anyhow!("serialize failed: {e}")))
}

impl ArgusStorage {
    pub async fn new(url: &str) -> Result<Self, ApiError> {
        info!("Initializing Argus storage layer");

        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| ApiError::Internal(anyhow!("invalid DATABASE_URL: {e}")))?
            .create_if_missing(true);
        // An in-memory database exists per connection; a single connection
        // keeps it coherent.
        let mut pool_options = SqlitePoolOptions::new();
        if url.contains(":memory:") {
            pool_options = pool_options.max_connections(1);
        }
        let pool = pool_options.connect_with(options).await?;

        Self::initialize_schema(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory database for tests. A single connection keeps the schema
    /// visible across every query.
    pub async fn new_in_memory() -> Result<Self, ApiError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::initialize_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn initialize_schema(pool: &SqlitePool) -> Result<(), ApiError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                email TEXT,
                password_hash TEXT NOT NULL,
                is_admin INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS teams (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS team_memberships (
                user_id TEXT NOT NULL,
                team_id TEXT NOT NULL,
                PRIMARY KEY (user_id, team_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS locations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                team_id TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                altitude REAL,
                accuracy REAL,
                timestamp INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS annotations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                team_id TEXT NOT NULL,
                category TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                team_id TEXT NOT NULL,
                message_type TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS monitors (
                id TEXT PRIMARY KEY,
                area TEXT NOT NULL,
                focus TEXT,
                allowed_domains TEXT NOT NULL,
                interval_seconds INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 0,
                last_searched_at TEXT,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS threats (
                id TEXT PRIMARY KEY,
                level TEXT NOT NULL,
                threat_type TEXT NOT NULL,
                confidence REAL NOT NULL,
                summary TEXT NOT NULL,
                locations TEXT NOT NULL,
                keywords TEXT NOT NULL,
                citations TEXT NOT NULL,
                area TEXT NOT NULL,
                semantic_hash TEXT NOT NULL,
                update_count INTEGER NOT NULL DEFAULT 0,
                update_history TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS threat_annotations (
                id TEXT PRIMARY KEY,
                threat_id TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                level TEXT NOT NULL,
                threat_type TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS monitor_run_logs (
                id TEXT PRIMARY KEY,
                monitor_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                system_prompt TEXT NOT NULL,
                user_prompt TEXT NOT NULL,
                raw_response TEXT NOT NULL,
                threats_found INTEGER NOT NULL DEFAULT 0,
                citations TEXT,
                request_payload TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ai_usage (
                id TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                estimated_cost_usd REAL NOT NULL,
                call_type TEXT NOT NULL,
                monitor_id TEXT,
                timestamp TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS refresh_tokens (
                token_hash TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_memberships_team ON team_memberships(team_id)",
            "CREATE INDEX IF NOT EXISTS idx_locations_team ON locations(team_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_annotations_team ON annotations(team_id)",
            "CREATE INDEX IF NOT EXISTS idx_messages_team ON messages(team_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_threats_area ON threats(area, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_run_logs_monitor ON monitor_run_logs(monitor_id, timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_threat_annotations_expiry ON threat_annotations(expires_at)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(pool).await?;
        }

        info!("Database schema initialized");
        Ok(())
    }

    // User operations

    pub async fn create_user(&self, user: &User) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, name, email, password_hash, is_admin, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user.id.to_string())
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.is_admin)
        .bind(user.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_user(&self, id: Uuid) -> Result<User, ApiError> {
        let row = sqlx::query_as::<_, (String, String, Option<String>, String, bool, String)>(
            "SELECT id, name, email, password_hash, is_admin, created_at FROM users WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound("user".to_string()))?;

        Self::user_from_row(row)
    }

    pub async fn find_user_by_login(&self, login: &str) -> Result<Option<User>, ApiError> {
        let row = sqlx::query_as::<_, (String, String, Option<String>, String, bool, String)>(
            "SELECT id, name, email, password_hash, is_admin, created_at FROM users WHERE email = ? OR name = ?",
        )
        .bind(login)
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::user_from_row).transpose()
    }

    pub async fn list_users(&self) -> Result<Vec<User>, ApiError> {
        let rows = sqlx::query_as::<_, (String, String, Option<String>, String, bool, String)>(
            "SELECT id, name, email, password_hash, is_admin, created_at FROM users ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::user_from_row).collect()
    }

    pub async fn update_user(&self, user: &User) -> Result<(), ApiError> {
        let result = sqlx::query(
            "UPDATE users SET name = ?, email = ?, password_hash = ?, is_admin = ? WHERE id = ?",
        )
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.is_admin)
        .bind(user.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("user".to_string()));
        }
        Ok(())
    }

    pub async fn delete_user(&self, id: Uuid) -> Result<(), ApiError> {
        sqlx::query("DELETE FROM team_memberships WHERE user_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("user".to_string()));
        }
        Ok(())
    }

    fn user_from_row(
        row: (String, String, Option<String>, String, bool, String),
    ) -> Result<User, ApiError> {
        Ok(User {
            id: parse_uuid(&row.0)?,
            name: row.1,
            email: row.2,
            password_hash: row.3,
            is_admin: row.4,
            created_at: parse_ts(&row.5)?,
        })
    }

    // Team operations

    pub async fn create_team(&self, team: &Team) -> Result<(), ApiError> {
        sqlx::query("INSERT INTO teams (id, name, created_at) VALUES (?, ?, ?)")
            .bind(team.id.to_string())
            .bind(&team.name)
            .bind(team.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_team(&self, id: Uuid) -> Result<Team, ApiError> {
        let row = sqlx::query_as::<_, (String, String, String)>(
            "SELECT id, name, created_at FROM teams WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound("team".to_string()))?;

        Ok(Team {
            id: parse_uuid(&row.0)?,
            name: row.1,
            created_at: parse_ts(&row.2)?,
        })
    }

    pub async fn list_teams(&self) -> Result<Vec<Team>, ApiError> {
        let rows = sqlx::query_as::<_, (String, String, String)>(
            "SELECT id, name, created_at FROM teams ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Team {
                    id: parse_uuid(&row.0)?,
                    name: row.1,
                    created_at: parse_ts(&row.2)?,
                })
            })
            .collect()
    }

    pub async fn update_team_name(&self, id: Uuid, name: &str) -> Result<(), ApiError> {
        let result = sqlx::query("UPDATE teams SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("team".to_string()));
        }
        Ok(())
    }

    pub async fn delete_team(&self, id: Uuid) -> Result<(), ApiError> {
        sqlx::query("DELETE FROM team_memberships WHERE team_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM teams WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("team".to_string()));
        }
        Ok(())
    }

    // Membership operations

    pub async fn add_member(&self, user_id: Uuid, team_id: Uuid) -> Result<(), ApiError> {
        sqlx::query("INSERT OR IGNORE INTO team_memberships (user_id, team_id) VALUES (?, ?)")
            .bind(user_id.to_string())
            .bind(team_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_member(&self, user_id: Uuid, team_id: Uuid) -> Result<(), ApiError> {
        sqlx::query("DELETE FROM team_memberships WHERE user_id = ? AND team_id = ?")
            .bind(user_id.to_string())
            .bind(team_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn is_member(&self, user_id: Uuid, team_id: Uuid) -> Result<bool, ApiError> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM team_memberships WHERE user_id = ? AND team_id = ?",
        )
        .bind(user_id.to_string())
        .bind(team_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0 > 0)
    }

    pub async fn list_members(&self, team_id: Uuid) -> Result<Vec<User>, ApiError> {
        let rows = sqlx::query_as::<_, (String, String, Option<String>, String, bool, String)>(
            r#"
            SELECT u.id, u.name, u.email, u.password_hash, u.is_admin, u.created_at
            FROM users u
            JOIN team_memberships m ON m.user_id = u.id
            WHERE m.team_id = ?
            ORDER BY u.name
            "#,
        )
        .bind(team_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::user_from_row).collect()
    }

    // Location operations

    pub async fn insert_location(&self, sample: &LocationSample) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            INSERT INTO locations (id, user_id, team_id, latitude, longitude, altitude, accuracy, timestamp, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(sample.id.to_string())
        .bind(sample.user_id.to_string())
        .bind(sample.team_id.to_string())
        .bind(sample.latitude)
        .bind(sample.longitude)
        .bind(sample.altitude)
        .bind(sample.accuracy)
        .bind(sample.timestamp)
        .bind(sample.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn recent_locations(
        &self,
        team_id: Uuid,
        window: Duration,
    ) -> Result<Vec<LocationSample>, ApiError> {
        let since = Utc::now() - window;
        let rows = sqlx::query_as::<
            _,
            (String, String, String, f64, f64, Option<f64>, Option<f64>, i64, String),
        >(
            r#"
            SELECT id, user_id, team_id, latitude, longitude, altitude, accuracy, timestamp, created_at
            FROM locations
            WHERE team_id = ? AND created_at >= ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(team_id.to_string())
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(LocationSample {
                    id: parse_uuid(&row.0)?,
                    user_id: parse_uuid(&row.1)?,
                    team_id: parse_uuid(&row.2)?,
                    latitude: row.3,
                    longitude: row.4,
                    altitude: row.5,
                    accuracy: row.6,
                    timestamp: row.7,
                    created_at: parse_ts(&row.8)?,
                })
            })
            .collect()
    }

    pub async fn count_locations(&self, team_id: Uuid) -> Result<i64, ApiError> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM locations WHERE team_id = ?")
            .bind(team_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Retention sweep. `retention_days = 0` disables deletion entirely.
    pub async fn delete_locations_older_than(&self, retention_days: i64) -> Result<u64, ApiError> {
        if retention_days <= 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - Duration::days(retention_days);
        let result = sqlx::query("DELETE FROM locations WHERE created_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        debug!(deleted = result.rows_affected(), "Location retention sweep");
        Ok(result.rows_affected())
    }

    // Annotation operations

    /// Insert-or-merge by identifier. The team and the created timestamp are
    /// preserved across upserts; everything else is last-writer-wins.
    pub async fn upsert_annotation(&self, annotation: &Annotation) -> Result<Annotation, ApiError> {
        sqlx::query(
            r#"
            INSERT INTO annotations (id, user_id, team_id, category, data, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                category = excluded.category,
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(annotation.id.to_string())
        .bind(annotation.user_id.to_string())
        .bind(annotation.team_id.to_string())
        .bind(&annotation.category)
        .bind(to_json(&annotation.data)?)
        .bind(annotation.created_at.to_rfc3339())
        .bind(annotation.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.get_annotation(annotation.id).await
    }

    pub async fn get_annotation(&self, id: Uuid) -> Result<Annotation, ApiError> {
        let row = sqlx::query_as::<_, (String, String, String, String, String, String, String)>(
            "SELECT id, user_id, team_id, category, data, created_at, updated_at FROM annotations WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound("annotation".to_string()))?;

        Ok(Annotation {
            id: parse_uuid(&row.0)?,
            user_id: parse_uuid(&row.1)?,
            team_id: parse_uuid(&row.2)?,
            category: row.3,
            data: from_json(&row.4)?,
            created_at: parse_ts(&row.5)?,
            updated_at: parse_ts(&row.6)?,
        })
    }

    // Message operations

    pub async fn insert_message(&self, message: &Message) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, user_id, team_id, message_type, content, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.id.to_string())
        .bind(message.user_id.to_string())
        .bind(message.team_id.to_string())
        .bind(to_json(&message.message_type)?)
        .bind(&message.content)
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_recent_messages(&self, window: Duration) -> Result<i64, ApiError> {
        let since = Utc::now() - window;
        let row = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM messages WHERE created_at >= ?")
            .bind(since.to_rfc3339())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    // Config operations

    pub async fn get_config(&self, key: &str) -> Result<Option<JsonValue>, ApiError> {
        let row = sqlx::query_as::<_, (String,)>("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| from_json(&r.0)).transpose()
    }

    pub async fn set_config(&self, key: &str, value: &JsonValue) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            INSERT INTO config (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(to_json(value)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // Monitor operations

    pub async fn create_monitor(&self, monitor: &Monitor) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            INSERT INTO monitors (id, area, focus, allowed_domains, interval_seconds, active,
                                  last_searched_at, created_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(monitor.id.to_string())
        .bind(&monitor.area)
        .bind(&monitor.focus)
        .bind(to_json(&monitor.allowed_domains)?)
        .bind(monitor.interval_seconds)
        .bind(monitor.active)
        .bind(monitor.last_searched_at.map(|ts| ts.to_rfc3339()))
        .bind(monitor.created_by.to_string())
        .bind(monitor.created_at.to_rfc3339())
        .bind(monitor.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_monitor(&self, id: Uuid) -> Result<Monitor, ApiError> {
        let rows = self
            .fetch_monitors(
                "SELECT id, area, focus, allowed_domains, interval_seconds, active, last_searched_at, created_by, created_at, updated_at FROM monitors WHERE id = ?",
                Some(id),
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| ApiError::NotFound("monitor".to_string()))
    }

    pub async fn list_monitors(&self, active_only: bool) -> Result<Vec<Monitor>, ApiError> {
        let sql = if active_only {
            "SELECT id, area, focus, allowed_domains, interval_seconds, active, last_searched_at, created_by, created_at, updated_at FROM monitors WHERE active = 1 ORDER BY created_at"
        } else {
            "SELECT id, area, focus, allowed_domains, interval_seconds, active, last_searched_at, created_by, created_at, updated_at FROM monitors ORDER BY created_at"
        };
        self.fetch_monitors(sql, None).await
    }

    async fn fetch_monitors(&self, sql: &str, id: Option<Uuid>) -> Result<Vec<Monitor>, ApiError> {
        use sqlx::Row;

        let mut query = sqlx::query(sql);
        if let Some(id) = id {
            query = query.bind(id.to_string());
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let created_by: String = row.try_get("created_by")?;
                let allowed_domains: String = row.try_get("allowed_domains")?;
                let last_searched_at: Option<String> = row.try_get("last_searched_at")?;
                let created_at: String = row.try_get("created_at")?;
                let updated_at: String = row.try_get("updated_at")?;

                Ok(Monitor {
                    id: parse_uuid(&id)?,
                    area: row.try_get("area")?,
                    focus: row.try_get("focus")?,
                    allowed_domains: from_json(&allowed_domains)?,
                    interval_seconds: row.try_get("interval_seconds")?,
                    active: row.try_get("active")?,
                    last_searched_at: last_searched_at.as_deref().map(parse_ts).transpose()?,
                    created_by: parse_uuid(&created_by)?,
                    created_at: parse_ts(&created_at)?,
                    updated_at: parse_ts(&updated_at)?,
                })
            })
            .collect()
    }

    pub async fn update_monitor(&self, monitor: &Monitor) -> Result<(), ApiError> {
        let result = sqlx::query(
            r#"
            UPDATE monitors
            SET area = ?, focus = ?, allowed_domains = ?, interval_seconds = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&monitor.area)
        .bind(&monitor.focus)
        .bind(to_json(&monitor.allowed_domains)?)
        .bind(monitor.interval_seconds)
        .bind(Utc::now().to_rfc3339())
        .bind(monitor.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("monitor".to_string()));
        }
        Ok(())
    }

    pub async fn set_monitor_active(&self, id: Uuid, active: bool) -> Result<(), ApiError> {
        let result = sqlx::query("UPDATE monitors SET active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("monitor".to_string()));
        }
        Ok(())
    }

    pub async fn set_monitor_last_searched(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        sqlx::query("UPDATE monitors SET last_searched_at = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_monitor(&self, id: Uuid) -> Result<(), ApiError> {
        sqlx::query("DELETE FROM monitor_run_logs WHERE monitor_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM monitors WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("monitor".to_string()));
        }
        Ok(())
    }

    // Threat operations

    pub async fn insert_threat(&self, threat: &Threat) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            INSERT INTO threats (id, level, threat_type, confidence, summary, locations, keywords,
                                 citations, area, semantic_hash, update_count, update_history,
                                 status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(threat.id.to_string())
        .bind(to_json(&threat.level)?)
        .bind(to_json(&threat.threat_type)?)
        .bind(threat.confidence)
        .bind(&threat.summary)
        .bind(to_json(&threat.locations)?)
        .bind(to_json(&threat.keywords)?)
        .bind(to_json(&threat.citations)?)
        .bind(&threat.area)
        .bind(&threat.semantic_hash)
        .bind(threat.update_count)
        .bind(to_json(&threat.update_history)?)
        .bind(to_json(&threat.status)?)
        .bind(threat.created_at.to_rfc3339())
        .bind(threat.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_threat(&self, id: Uuid) -> Result<Threat, ApiError> {
        let threats = self
            .fetch_threats(
                "SELECT id, level, threat_type, confidence, summary, locations, keywords, citations, area, semantic_hash, update_count, update_history, status, created_at, updated_at FROM threats WHERE id = ?",
                vec![id.to_string()],
            )
            .await?;
        threats
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::NotFound("threat".to_string()))
    }

    /// Most recent threats for an area, newest first, capped at 15.
    pub async fn recent_threats_by_area(
        &self,
        area: &str,
        since_hours: i64,
    ) -> Result<Vec<Threat>, ApiError> {
        let since = Utc::now() - Duration::hours(since_hours);
        self.fetch_threats(
            r#"
            SELECT id, level, threat_type, confidence, summary, locations, keywords, citations,
                   area, semantic_hash, update_count, update_history, status, created_at, updated_at
            FROM threats
            WHERE area = ? AND created_at >= ?
            ORDER BY created_at DESC
            LIMIT 15
            "#,
            vec![area.to_string(), since.to_rfc3339()],
        )
        .await
    }

    pub async fn list_threats(&self, limit: i64) -> Result<Vec<Threat>, ApiError> {
        let sql = format!(
            r#"
            SELECT id, level, threat_type, confidence, summary, locations, keywords, citations,
                   area, semantic_hash, update_count, update_history, status, created_at, updated_at
            FROM threats
            ORDER BY updated_at DESC
            LIMIT {}
            "#,
            limit.clamp(1, 500)
        );
        self.fetch_threats(&sql, vec![]).await
    }

    async fn fetch_threats(&self, sql: &str, binds: Vec<String>) -> Result<Vec<Threat>, ApiError> {
        use sqlx::Row;

        let mut query = sqlx::query(sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let level: String = row.try_get("level")?;
                let threat_type: String = row.try_get("threat_type")?;
                let locations: String = row.try_get("locations")?;
                let keywords: String = row.try_get("keywords")?;
                let citations: String = row.try_get("citations")?;
                let update_history: String = row.try_get("update_history")?;
                let status: String = row.try_get("status")?;
                let created_at: String = row.try_get("created_at")?;
                let updated_at: String = row.try_get("updated_at")?;

                Ok(Threat {
                    id: parse_uuid(&id)?,
                    level: from_json(&level)?,
                    threat_type: from_json(&threat_type)?,
                    confidence: row.try_get("confidence")?,
                    summary: row.try_get("summary")?,
                    locations: from_json(&locations)?,
                    keywords: from_json(&keywords)?,
                    citations: from_json(&citations)?,
                    area: row.try_get("area")?,
                    semantic_hash: row.try_get("semantic_hash")?,
                    update_count: row.try_get("update_count")?,
                    update_history: from_json(&update_history)?,
                    status: from_json(&status)?,
                    created_at: parse_ts(&created_at)?,
                    updated_at: parse_ts(&updated_at)?,
                })
            })
            .collect()
    }

    pub async fn update_threat(&self, threat: &Threat) -> Result<(), ApiError> {
        let result = sqlx::query(
            r#"
            UPDATE threats
            SET level = ?, threat_type = ?, confidence = ?, summary = ?, locations = ?,
                keywords = ?, citations = ?, semantic_hash = ?, update_count = ?,
                update_history = ?, status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(to_json(&threat.level)?)
        .bind(to_json(&threat.threat_type)?)
        .bind(threat.confidence)
        .bind(&threat.summary)
        .bind(to_json(&threat.locations)?)
        .bind(to_json(&threat.keywords)?)
        .bind(to_json(&threat.citations)?)
        .bind(&threat.semantic_hash)
        .bind(threat.update_count)
        .bind(to_json(&threat.update_history)?)
        .bind(to_json(&threat.status)?)
        .bind(threat.updated_at.to_rfc3339())
        .bind(threat.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("threat".to_string()));
        }
        Ok(())
    }

    pub async fn update_threat_status(&self, id: Uuid, status: ThreatStatus) -> Result<(), ApiError> {
        let result = sqlx::query("UPDATE threats SET status = ?, updated_at = ? WHERE id = ?")
            .bind(to_json(&status)?)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("threat".to_string()));
        }
        Ok(())
    }

    pub async fn delete_threat(&self, id: Uuid) -> Result<(), ApiError> {
        sqlx::query("DELETE FROM threat_annotations WHERE threat_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM threats WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound("threat".to_string()));
        }
        Ok(())
    }

    /// Threats still relevant for the operator dashboard: not dismissed and
    /// touched within the last 24 hours.
    pub async fn count_active_threats(&self) -> Result<i64, ApiError> {
        let since = Utc::now() - Duration::hours(24);
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM threats WHERE status != ? AND updated_at >= ?",
        )
        .bind(to_json(&ThreatStatus::Dismissed)?)
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    // Threat annotation operations

    pub async fn insert_threat_annotation(
        &self,
        annotation: &ThreatAnnotation,
    ) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            INSERT INTO threat_annotations (id, threat_id, latitude, longitude, level, threat_type,
                                            title, description, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(annotation.id.to_string())
        .bind(annotation.threat_id.to_string())
        .bind(annotation.latitude)
        .bind(annotation.longitude)
        .bind(to_json(&annotation.level)?)
        .bind(to_json(&annotation.threat_type)?)
        .bind(&annotation.title)
        .bind(&annotation.description)
        .bind(annotation.expires_at.to_rfc3339())
        .bind(annotation.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_expired_threat_annotations(&self) -> Result<u64, ApiError> {
        let result = sqlx::query("DELETE FROM threat_annotations WHERE expires_at < ?")
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // Run log operations

    /// Idempotent by id: replaying the same run log is a no-op.
    pub async fn insert_run_log(&self, log: &RunLog) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO monitor_run_logs
                (id, monitor_id, timestamp, system_prompt, user_prompt, raw_response,
                 threats_found, citations, request_payload)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(log.id.to_string())
        .bind(log.monitor_id.to_string())
        .bind(log.timestamp.to_rfc3339())
        .bind(&log.system_prompt)
        .bind(&log.user_prompt)
        .bind(&log.raw_response)
        .bind(log.threats_found)
        .bind(log.citations.as_ref().map(to_json).transpose()?)
        .bind(log.request_payload.as_ref().map(to_json).transpose()?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Enforce run-log retention for one monitor: nothing older than six
    /// hours, at most 100 rows. Rows that found threats are kept first,
    /// then longer responses, then the most recent.
    pub async fn trim_run_logs(&self, monitor_id: Uuid) -> Result<u64, ApiError> {
        let cutoff = Utc::now() - Duration::hours(6);
        let expired = sqlx::query("DELETE FROM monitor_run_logs WHERE monitor_id = ? AND timestamp < ?")
            .bind(monitor_id.to_string())
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;

        let overflow = sqlx::query(
            r#"
            DELETE FROM monitor_run_logs
            WHERE monitor_id = ?1 AND id NOT IN (
                SELECT id FROM monitor_run_logs
                WHERE monitor_id = ?1
                ORDER BY (threats_found > 0) DESC, LENGTH(raw_response) DESC, timestamp DESC
                LIMIT 100
            )
            "#,
        )
        .bind(monitor_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(expired.rows_affected() + overflow.rows_affected())
    }

    pub async fn count_run_logs(&self, monitor_id: Uuid) -> Result<i64, ApiError> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM monitor_run_logs WHERE monitor_id = ?",
        )
        .bind(monitor_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    // AI usage operations

    pub async fn insert_usage(&self, entry: &AiUsageEntry) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO ai_usage
                (id, model, input_tokens, output_tokens, total_tokens, estimated_cost_usd,
                 call_type, monitor_id, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(&entry.model)
        .bind(entry.input_tokens)
        .bind(entry.output_tokens)
        .bind(entry.total_tokens)
        .bind(entry.estimated_cost_usd)
        .bind(to_json(&entry.call_type)?)
        .bind(entry.monitor_id.map(|id| id.to_string()))
        .bind(entry.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // Refresh token operations

    pub async fn insert_refresh_token(
        &self,
        token_hash: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        sqlx::query(
            "INSERT INTO refresh_tokens (token_hash, user_id, expires_at, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(token_hash)
        .bind(user_id.to_string())
        .bind(expires_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Single-use lookup: returns the owner and deletes the row.
    pub async fn consume_refresh_token(&self, token_hash: &str) -> Result<Option<Uuid>, ApiError> {
        let row = sqlx::query_as::<_, (String, String)>(
            "SELECT user_id, expires_at FROM refresh_tokens WHERE token_hash = ?",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        let Some((user_id, expires_at)) = row else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM refresh_tokens WHERE token_hash = ?")
            .bind(token_hash)
            .execute(&self.pool)
            .await?;

        if parse_ts(&expires_at)? < Utc::now() {
            return Ok(None);
        }
        Ok(Some(parse_uuid(&user_id)?))
    }

    pub async fn delete_expired_refresh_tokens(&self) -> Result<u64, ApiError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < ?")
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // Stats

    pub async fn db_stats(&self) -> Result<DbStats, ApiError> {
        let count = |sql: &'static str| async move {
            let row = sqlx::query_as::<_, (i64,)>(sql).fetch_one(&self.pool).await?;
            Ok::<i64, ApiError>(row.0)
        };

        Ok(DbStats {
            users: count("SELECT COUNT(*) FROM users").await?,
            teams: count("SELECT COUNT(*) FROM teams").await?,
            locations: count("SELECT COUNT(*) FROM locations").await?,
            annotations: count("SELECT COUNT(*) FROM annotations").await?,
            messages: count("SELECT COUNT(*) FROM messages").await?,
            monitors: count("SELECT COUNT(*) FROM monitors").await?,
            threats: count("SELECT COUNT(*) FROM threats").await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn storage() -> ArgusStorage {
        ArgusStorage::new_in_memory().await.expect("in-memory storage")
    }

    fn test_user(name: &str) -> User {
        User {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: Some(format!("{name}@example.com")),
            password_hash: "x".to_string(),
            is_admin: false,
            created_at: Utc::now(),
        }
    }

    fn test_team(name: &str) -> Team {
        Team {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
        }
    }

    fn test_threat(area: &str, summary: &str) -> Threat {
        Threat {
            id: Uuid::new_v4(),
            level: ThreatLevel::High,
            threat_type: ThreatType::Violence,
            confidence: 0.9,
            summary: summary.to_string(),
            locations: vec![],
            keywords: vec!["incident".to_string()],
            citations: vec![],
            area: area.to_string(),
            semantic_hash: "abcd1234abcd1234".to_string(),
            update_count: 0,
            update_history: vec![],
            status: ThreatStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_membership_round_trip() {
        let storage = storage().await;
        let user = test_user("alice");
        let team = test_team("bravo");
        storage.create_user(&user).await.unwrap();
        storage.create_team(&team).await.unwrap();

        assert!(!storage.is_member(user.id, team.id).await.unwrap());
        storage.add_member(user.id, team.id).await.unwrap();
        assert!(storage.is_member(user.id, team.id).await.unwrap());
        storage.remove_member(user.id, team.id).await.unwrap();
        assert!(!storage.is_member(user.id, team.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_user_name_conflicts() {
        let storage = storage().await;
        storage.create_user(&test_user("alice")).await.unwrap();
        let err = storage.create_user(&test_user("alice")).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_annotation_upsert_preserves_created() {
        let storage = storage().await;
        let id = Uuid::new_v4();
        let created = Utc::now() - Duration::hours(1);
        let first = Annotation {
            id,
            user_id: Uuid::new_v4(),
            team_id: Uuid::new_v4(),
            category: "marker".to_string(),
            data: json!({"color": "red"}),
            created_at: created,
            updated_at: created,
        };
        let stored = storage.upsert_annotation(&first).await.unwrap();
        assert_eq!(stored.data, json!({"color": "red"}));

        let second = Annotation {
            category: "shape".to_string(),
            data: json!({"color": "blue"}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            ..first.clone()
        };
        let stored = storage.upsert_annotation(&second).await.unwrap();
        assert_eq!(stored.category, "shape");
        assert_eq!(stored.data, json!({"color": "blue"}));
        // created survives the upsert; updated moves forward
        assert_eq!(stored.created_at.timestamp(), created.timestamp());
        assert!(stored.updated_at > stored.created_at);
    }

    #[tokio::test]
    async fn test_recent_threats_by_area_caps_and_orders() {
        let storage = storage().await;
        for i in 0..20 {
            let mut threat = test_threat("seattle", &format!("incident {i}"));
            threat.created_at = Utc::now() - Duration::minutes(20 - i);
            threat.updated_at = threat.created_at;
            storage.insert_threat(&threat).await.unwrap();
        }
        // A different area must not bleed in.
        storage
            .insert_threat(&test_threat("portland", "elsewhere"))
            .await
            .unwrap();

        let recent = storage.recent_threats_by_area("seattle", 24).await.unwrap();
        assert_eq!(recent.len(), 15);
        assert_eq!(recent[0].summary, "incident 19");
        assert!(recent.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn test_trim_run_logs_prefers_hits_then_length() {
        let storage = storage().await;
        let monitor_id = Uuid::new_v4();

        let make = |threats_found: i64, response: &str, age_minutes: i64| RunLog {
            id: Uuid::new_v4(),
            monitor_id,
            timestamp: Utc::now() - Duration::minutes(age_minutes),
            system_prompt: "s".to_string(),
            user_prompt: "u".to_string(),
            raw_response: response.to_string(),
            threats_found,
            citations: None,
            request_payload: None,
        };

        // 105 empty runs plus 3 that found threats.
        for i in 0..105 {
            storage.insert_run_log(&make(0, "short", i)).await.unwrap();
        }
        for i in 0..3 {
            storage
                .insert_run_log(&make(2, &"x".repeat(500), 100 + i))
                .await
                .unwrap();
        }
        // One expired row beyond the six-hour window.
        storage.insert_run_log(&make(5, "old", 60 * 7)).await.unwrap();

        storage.trim_run_logs(monitor_id).await.unwrap();
        let count = storage.count_run_logs(monitor_id).await.unwrap();
        assert!(count <= 100);

        // The threat-bearing rows inside the window must survive.
        let rows = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM monitor_run_logs WHERE monitor_id = ? AND threats_found > 0",
        )
        .bind(monitor_id.to_string())
        .fetch_one(&storage.pool)
        .await
        .unwrap();
        assert_eq!(rows.0, 3);
    }

    #[tokio::test]
    async fn test_insert_run_log_is_idempotent() {
        let storage = storage().await;
        let monitor_id = Uuid::new_v4();
        let log = RunLog {
            id: Uuid::new_v4(),
            monitor_id,
            timestamp: Utc::now(),
            system_prompt: "s".to_string(),
            user_prompt: "u".to_string(),
            raw_response: "r".to_string(),
            threats_found: 1,
            citations: Some(vec!["https://example.com".to_string()]),
            request_payload: None,
        };
        storage.insert_run_log(&log).await.unwrap();
        storage.insert_run_log(&log).await.unwrap();
        assert_eq!(storage.count_run_logs(monitor_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_location_retention_zero_disables() {
        let storage = storage().await;
        let sample = LocationSample {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            team_id: Uuid::new_v4(),
            latitude: 47.6,
            longitude: -122.3,
            altitude: None,
            accuracy: Some(5.0),
            timestamp: Utc::now().timestamp_millis(),
            created_at: Utc::now() - Duration::days(30),
        };
        storage.insert_location(&sample).await.unwrap();

        assert_eq!(storage.delete_locations_older_than(0).await.unwrap(), 0);
        assert_eq!(storage.delete_locations_older_than(7).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_refresh_token_single_use_and_expiry() {
        let storage = storage().await;
        let user_id = Uuid::new_v4();

        storage
            .insert_refresh_token("hash-live", user_id, Utc::now() + Duration::days(30))
            .await
            .unwrap();
        assert_eq!(
            storage.consume_refresh_token("hash-live").await.unwrap(),
            Some(user_id)
        );
        assert_eq!(storage.consume_refresh_token("hash-live").await.unwrap(), None);

        storage
            .insert_refresh_token("hash-stale", user_id, Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(storage.consume_refresh_token("hash-stale").await.unwrap(), None);
    }
}
