//! SQLite-backed document store
//!
//! Schema creation is idempotent (`CREATE TABLE IF NOT EXISTS`) and runs on
//! every open. Timestamps are stored as RFC 3339 text, id lists as JSON text.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::info;

use super::DataStore;
use crate::models::{
    AuditEntry, AuditKind, CheckInEvent, PointsBreakdown, Pub, StoredAggregate, UserPage,
    UserRecord, UserStats,
};
use crate::{Error, Result};

const USER_COLUMNS: &str = "uid, display_name, is_anonymous, real_user, created_at, \
     total_points, verified_pub_count, unverified_pub_count, total_pub_count, \
     badge_count, landlord_count, verified_pubs_claimed, unverified_pubs_claimed, \
     badge_ids, landlord_pub_ids, last_stats_update";

const EVENT_COLUMNS: &str = "id, user_id, pub_id, timestamp, date_key, points_earned, \
     points_breakdown, carpet_image_key, made_user_landlord";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`
    pub async fn open(db_path: &Path) -> Result<Self> {
        let newly_created = !db_path.exists();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(&db_url)
            .await?;

        if newly_created {
            info!("Initialized new database: {}", db_path.display());
        } else {
            info!("Opened existing database: {}", db_path.display());
        }

        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
        // WAL allows concurrent readers alongside the single writer
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    /// Private in-memory database (single connection so it is shared)
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    #[cfg(test)]
    fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                uid TEXT PRIMARY KEY,
                display_name TEXT,
                is_anonymous INTEGER,
                real_user INTEGER,
                created_at TEXT,
                total_points INTEGER,
                verified_pub_count INTEGER,
                unverified_pub_count INTEGER,
                total_pub_count INTEGER,
                badge_count INTEGER,
                landlord_count INTEGER,
                verified_pubs_claimed TEXT,
                unverified_pubs_claimed TEXT,
                badge_ids TEXT,
                landlord_pub_ids TEXT,
                last_stats_update TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS check_ins (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                pub_id TEXT,
                timestamp TEXT,
                date_key TEXT,
                points_earned INTEGER,
                points_breakdown TEXT,
                carpet_image_key TEXT,
                made_user_landlord INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_check_ins_user ON check_ins(user_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_check_ins_date ON check_ins(date_key)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_check_ins_visit ON check_ins(user_id, pub_id, date_key)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pubs (
                id TEXT PRIMARY KEY,
                name TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                source TEXT NOT NULL,
                user_id TEXT,
                message TEXT NOT NULL,
                details TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Writers for externally owned collections (seeding, ingestion tools)
    // ------------------------------------------------------------------

    pub async fn insert_user(&self, user: &UserRecord) -> Result<()> {
        let agg = &user.aggregate;
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO users ({}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            USER_COLUMNS
        ))
        .bind(&user.uid)
        .bind(&user.display_name)
        .bind(user.is_anonymous)
        .bind(user.real_user)
        .bind(user.created_at.map(|t| t.to_rfc3339()))
        .bind(agg.total_points)
        .bind(agg.verified_pub_count)
        .bind(agg.unverified_pub_count)
        .bind(agg.total_pub_count)
        .bind(agg.badge_count)
        .bind(agg.landlord_count)
        .bind(encode_list(&agg.verified_pubs_claimed)?)
        .bind(encode_list(&agg.unverified_pubs_claimed)?)
        .bind(encode_list(&agg.badge_ids)?)
        .bind(encode_list(&agg.landlord_pub_ids)?)
        .bind(agg.last_stats_update.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_event(&self, event: &CheckInEvent) -> Result<()> {
        let breakdown = match &event.points_breakdown {
            Some(b) => Some(serde_json::to_string(b)?),
            None => None,
        };
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO check_ins ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            EVENT_COLUMNS
        ))
        .bind(&event.id)
        .bind(&event.user_id)
        .bind(&event.pub_id)
        .bind(event.timestamp.map(|t| t.to_rfc3339()))
        .bind(&event.date_key)
        .bind(event.points_earned)
        .bind(breakdown)
        .bind(&event.carpet_image_key)
        .bind(event.made_user_landlord)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_pub(&self, pub_ref: &Pub) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO pubs (id, name) VALUES (?, ?)")
            .bind(&pub_ref.id)
            .bind(&pub_ref.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Most recent audit entries, newest first
    pub async fn recent_audit(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT id, kind, source, user_id, message, details, created_at \
             FROM audit_log ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(audit_from_row).collect()
    }

    async fn fetch_events(&self, sql: &str, binds: &[&str]) -> Result<Vec<CheckInEvent>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }
}

#[async_trait]
impl DataStore for SqliteStore {
    async fn get_user(&self, uid: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE uid = ?", USER_COLUMNS))
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn list_users(&self, page: &UserPage) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM users \
             WHERE (?1 IS NULL OR uid > ?1) \
               AND (?2 = 0 OR COALESCE(real_user, \
                    CASE WHEN COALESCE(is_anonymous, 0) = 1 THEN 0 ELSE 1 END) = 1) \
             ORDER BY uid LIMIT ?3",
            USER_COLUMNS
        ))
        .bind(page.after.as_deref())
        .bind(page.real_users_only)
        .bind(page.limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn query_events_by_user(&self, uid: &str) -> Result<Vec<CheckInEvent>> {
        self.fetch_events(
            &format!(
                "SELECT {} FROM check_ins WHERE user_id = ? ORDER BY id",
                EVENT_COLUMNS
            ),
            &[uid],
        )
        .await
    }

    async fn query_events_by_date_range(
        &self,
        start: &str,
        end: &str,
    ) -> Result<Vec<CheckInEvent>> {
        self.fetch_events(
            &format!(
                "SELECT {} FROM check_ins WHERE date_key >= ? AND date_key <= ? ORDER BY id",
                EVENT_COLUMNS
            ),
            &[start, end],
        )
        .await
    }

    async fn query_events_by_visit(
        &self,
        user_id: &str,
        pub_id: &str,
        date_key: &str,
    ) -> Result<Vec<CheckInEvent>> {
        self.fetch_events(
            &format!(
                "SELECT {} FROM check_ins \
                 WHERE user_id = ? AND pub_id = ? AND date_key = ? ORDER BY id",
                EVENT_COLUMNS
            ),
            &[user_id, pub_id, date_key],
        )
        .await
    }

    async fn scan_events(&self, after: Option<&str>, limit: usize) -> Result<Vec<CheckInEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM check_ins WHERE (?1 IS NULL OR id > ?1) ORDER BY id LIMIT ?2",
            EVENT_COLUMNS
        ))
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn get_pub(&self, pub_id: &str) -> Result<Option<Pub>> {
        let row = sqlx::query("SELECT id, name FROM pubs WHERE id = ?")
            .bind(pub_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Pub {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            })),
            None => Ok(None),
        }
    }

    async fn get_unverified_pub_count(&self, uid: &str) -> Result<i64> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT unverified_pub_count FROM users WHERE uid = ?")
                .bind(uid)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((count,)) => Ok(count.unwrap_or(0)),
            None => Err(Error::NotFound(format!("user {}", uid))),
        }
    }

    async fn put_aggregate(&self, stats: &UserStats) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE users SET
                total_points = ?,
                verified_pub_count = ?,
                total_pub_count = ?,
                last_stats_update = ?
            WHERE uid = ?
            "#,
        )
        .bind(stats.total_points)
        .bind(stats.verified_pub_count)
        .bind(stats.total_pub_count)
        .bind(stats.last_calculated_at.to_rfc3339())
        .bind(&stats.user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("user {}", stats.user_id)));
        }
        Ok(())
    }

    async fn init_user_profile(
        &self,
        uid: &str,
        aggregate: &StoredAggregate,
        real_user: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE users SET
                real_user = ?,
                total_points = ?,
                verified_pub_count = ?,
                unverified_pub_count = ?,
                total_pub_count = ?,
                badge_count = ?,
                landlord_count = ?,
                verified_pubs_claimed = ?,
                unverified_pubs_claimed = ?,
                badge_ids = ?,
                landlord_pub_ids = ?,
                last_stats_update = ?
            WHERE uid = ?
            "#,
        )
        .bind(real_user)
        .bind(aggregate.total_points)
        .bind(aggregate.verified_pub_count)
        .bind(aggregate.unverified_pub_count)
        .bind(aggregate.total_pub_count)
        .bind(aggregate.badge_count)
        .bind(aggregate.landlord_count)
        .bind(encode_list(&aggregate.verified_pubs_claimed)?)
        .bind(encode_list(&aggregate.unverified_pubs_claimed)?)
        .bind(encode_list(&aggregate.badge_ids)?)
        .bind(encode_list(&aggregate.landlord_pub_ids)?)
        .bind(aggregate.last_stats_update.map(|t| t.to_rfc3339()))
        .bind(uid)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("user {}", uid)));
        }
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (id, kind, source, user_id, message, details, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(entry.kind.as_str())
        .bind(&entry.source)
        .bind(&entry.user_id)
        .bind(&entry.message)
        .bind(serde_json::to_string(&entry.details)?)
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn encode_list(list: &Option<Vec<String>>) -> Result<Option<String>> {
    match list {
        Some(items) => Ok(Some(serde_json::to_string(items)?)),
        None => Ok(None),
    }
}

fn decode_list(raw: Option<String>) -> Result<Option<Vec<String>>> {
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

fn decode_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    match raw {
        Some(text) => DateTime::parse_from_rfc3339(&text)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| Error::Internal(format!("Invalid stored timestamp '{}': {}", text, e))),
        None => Ok(None),
    }
}

fn user_from_row(row: &SqliteRow) -> Result<UserRecord> {
    Ok(UserRecord {
        uid: row.try_get("uid")?,
        display_name: row.try_get("display_name")?,
        is_anonymous: row.try_get("is_anonymous")?,
        real_user: row.try_get("real_user")?,
        created_at: decode_timestamp(row.try_get("created_at")?)?,
        aggregate: StoredAggregate {
            total_points: row.try_get("total_points")?,
            verified_pub_count: row.try_get("verified_pub_count")?,
            unverified_pub_count: row.try_get("unverified_pub_count")?,
            total_pub_count: row.try_get("total_pub_count")?,
            badge_count: row.try_get("badge_count")?,
            landlord_count: row.try_get("landlord_count")?,
            verified_pubs_claimed: decode_list(row.try_get("verified_pubs_claimed")?)?,
            unverified_pubs_claimed: decode_list(row.try_get("unverified_pubs_claimed")?)?,
            badge_ids: decode_list(row.try_get("badge_ids")?)?,
            landlord_pub_ids: decode_list(row.try_get("landlord_pub_ids")?)?,
            last_stats_update: decode_timestamp(row.try_get("last_stats_update")?)?,
        },
    })
}

fn event_from_row(row: &SqliteRow) -> Result<CheckInEvent> {
    let breakdown: Option<String> = row.try_get("points_breakdown")?;
    let points_breakdown = match breakdown {
        Some(text) => Some(serde_json::from_str::<PointsBreakdown>(&text)?),
        None => None,
    };
    Ok(CheckInEvent {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        pub_id: row.try_get("pub_id")?,
        timestamp: decode_timestamp(row.try_get("timestamp")?)?,
        date_key: row.try_get("date_key")?,
        points_earned: row.try_get("points_earned")?,
        points_breakdown,
        carpet_image_key: row.try_get("carpet_image_key")?,
        made_user_landlord: row.try_get("made_user_landlord")?,
    })
}

fn audit_from_row(row: &SqliteRow) -> Result<AuditEntry> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let details: Option<String> = row.try_get("details")?;
    let created_at: Option<String> = row.try_get("created_at")?;
    Ok(AuditEntry {
        id: id
            .parse()
            .map_err(|e| Error::Internal(format!("Invalid audit id '{}': {}", id, e)))?,
        kind: AuditKind::parse(&kind)
            .ok_or_else(|| Error::Internal(format!("Unknown audit kind '{}'", kind)))?,
        source: row.try_get("source")?,
        user_id: row.try_get("user_id")?,
        message: row.try_get("message")?,
        details: match details {
            Some(text) => serde_json::from_str(&text)?,
            None => serde_json::Value::Null,
        },
        created_at: decode_timestamp(created_at)?
            .ok_or_else(|| Error::Internal("Audit entry without timestamp".to_string()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn seeded() -> SqliteStore {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store
            .insert_user(&UserRecord::new("alice").with_aggregate(StoredAggregate::canonical()))
            .await
            .unwrap();
        store
            .insert_user(&UserRecord::new("bob").anonymous(true))
            .await
            .unwrap();
        store.insert_pub(&Pub::new("p1")).await.unwrap();

        let ts = Utc.with_ymd_and_hms(2026, 5, 2, 20, 0, 0).unwrap();
        store
            .insert_event(&CheckInEvent::new("e1", "alice", "p1", ts).with_points(10))
            .await
            .unwrap();
        store
            .insert_event(&CheckInEvent::new("e2", "alice", "p2", ts).with_points(5))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_user_roundtrip_preserves_uninitialized_fields() {
        let store = seeded().await;
        let bob = store.get_user("bob").await.unwrap().unwrap();
        assert_eq!(bob.is_anonymous, Some(true));
        assert_eq!(bob.aggregate.total_points, None);
        assert!(!bob.aggregate.is_initialized());

        let alice = store.get_user("alice").await.unwrap().unwrap();
        assert!(alice.aggregate.is_canonical());
        assert!(store.get_user("carol").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_users_real_only() {
        let store = seeded().await;
        let page = UserPage {
            after: None,
            limit: 10,
            real_users_only: true,
        };
        let users = store.list_users(&page).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].uid, "alice");

        let page = UserPage {
            after: Some("alice".to_string()),
            limit: 10,
            real_users_only: false,
        };
        let users = store.list_users(&page).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].uid, "bob");
    }

    #[tokio::test]
    async fn test_event_queries() {
        let store = seeded().await;
        let events = store.query_events_by_user("alice").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].points(), 10);
        assert_eq!(events[0].date_key.as_deref(), Some("2026-05-02"));

        let in_month = store
            .query_events_by_date_range("2026-05-01", "2026-05-31")
            .await
            .unwrap();
        assert_eq!(in_month.len(), 2);
        let other_month = store
            .query_events_by_date_range("2026-06-01", "2026-06-31")
            .await
            .unwrap();
        assert!(other_month.is_empty());

        let visit = store
            .query_events_by_visit("alice", "p1", "2026-05-02")
            .await
            .unwrap();
        assert_eq!(visit.len(), 1);

        let first = store.scan_events(None, 1).await.unwrap();
        assert_eq!(first[0].id, "e1");
        let rest = store.scan_events(Some("e1"), 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "e2");
    }

    #[tokio::test]
    async fn test_put_aggregate_writes_derived_fields_only() {
        let store = seeded().await;
        sqlx::query("UPDATE users SET unverified_pub_count = 4 WHERE uid = 'alice'")
            .execute(store.pool())
            .await
            .unwrap();

        let stats = UserStats {
            user_id: "alice".to_string(),
            total_points: 15,
            verified_pub_count: 2,
            unverified_pub_count: 4,
            total_pub_count: 6,
            last_calculated_at: Utc::now(),
        };
        store.put_aggregate(&stats).await.unwrap();

        let alice = store.get_user("alice").await.unwrap().unwrap();
        assert_eq!(alice.aggregate.total_points, Some(15));
        assert_eq!(alice.aggregate.unverified_pub_count, Some(4));
        assert_eq!(alice.aggregate.total_pub_count, Some(6));
        assert!(alice.aggregate.last_stats_update.is_some());
        assert_eq!(store.get_unverified_pub_count("alice").await.unwrap(), 4);

        let missing = UserStats {
            user_id: "ghost".to_string(),
            ..stats
        };
        assert!(store.put_aggregate(&missing).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_init_user_profile_and_audit() {
        let store = seeded().await;
        store
            .init_user_profile("bob", &StoredAggregate::canonical(), false)
            .await
            .unwrap();
        let bob = store.get_user("bob").await.unwrap().unwrap();
        assert!(bob.aggregate.is_canonical());
        assert_eq!(bob.real_user, Some(false));

        let entry = AuditEntry::new(AuditKind::UserCreated, "on_user_created", "created")
            .for_user("bob")
            .with_details(serde_json::json!({ "realUser": false }));
        store.append_audit(&entry).await.unwrap();

        let audit = store.recent_audit(10).await.unwrap();
        assert_eq!(audit, vec![entry]);
    }

    #[tokio::test]
    async fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tally.db");
        let store = SqliteStore::open(&path).await.unwrap();
        store.insert_pub(&Pub::new("p9")).await.unwrap();
        drop(store);

        let reopened = SqliteStore::open(&path).await.unwrap();
        assert!(reopened.get_pub("p9").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_open_enables_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("fk.db")).await.unwrap();
        let enabled: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(enabled, 1);

        let memory = SqliteStore::open_in_memory().await.unwrap();
        let enabled: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(memory.pool())
            .await
            .unwrap();
        assert_eq!(enabled, 1);
    }
}
