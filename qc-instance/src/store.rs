//! SQLite persistence of resource records between lifecycle operations.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::config::ResourceRecord;
use crate::error::Result;

/// A stored record with its bookkeeping.
#[derive(Debug, Clone)]
pub struct RecordEntry {
    /// Local name of the declared instance.
    pub name: String,
    pub record: ResourceRecord,
    pub updated_at: DateTime<Utc>,
}

pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("qc-instance.db");
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Ephemeral store. A single connection keeps the database alive.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                name TEXT PRIMARY KEY,
                resource_id TEXT NOT NULL DEFAULT '',
                record_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn save(&self, name: &str, record: &ResourceRecord) -> Result<()> {
        let record_json = serde_json::to_string(record)?;
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO records (name, resource_id, record_json, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                resource_id = excluded.resource_id,
                record_json = excluded.record_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(&record.id)
        .bind(&record_json)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load(&self, name: &str) -> Result<Option<RecordEntry>> {
        let row = sqlx::query(
            r#"
            SELECT name, record_json, updated_at
            FROM records WHERE name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row_to_entry(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<RecordEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT name, record_json, updated_at
            FROM records ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_entry).collect()
    }

    pub async fn remove(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM records WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> Result<RecordEntry> {
    let name: String = row.get("name");
    let record_json: String = row.get("record_json");
    let updated_at: i64 = row.get("updated_at");

    Ok(RecordEntry {
        name,
        record: serde_json::from_str(&record_json)?,
        updated_at: DateTime::from_timestamp(updated_at, 0).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::InstanceState;
    use crate::config::{Field, FieldValue};

    fn record(id: &str) -> ResourceRecord {
        let mut record = ResourceRecord::new();
        record.id = id.to_string();
        record.fields.insert(Field::Name, FieldValue::from("web"));
        record
            .fields
            .insert(Field::KeypairIds, FieldValue::Set(["kp-1".to_string()].into()));
        record.state = Some(InstanceState::Running);
        record
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = RecordStore::in_memory().await.unwrap();
        store.save("web", &record("i-1")).await.unwrap();

        let entry = store.load("web").await.unwrap().unwrap();
        assert_eq!(entry.name, "web");
        assert_eq!(entry.record, record("i-1"));
        assert!(store.load("db").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let store = RecordStore::in_memory().await.unwrap();
        store.save("web", &record("i-1")).await.unwrap();

        let mut cleared = record("i-1");
        cleared.clear();
        store.save("web", &cleared).await.unwrap();

        let entry = store.load("web").await.unwrap().unwrap();
        assert!(!entry.record.is_created());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = RecordStore::in_memory().await.unwrap();
        store.save("web", &record("i-1")).await.unwrap();

        assert!(store.remove("web").await.unwrap());
        assert!(!store.remove("web").await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }
}
