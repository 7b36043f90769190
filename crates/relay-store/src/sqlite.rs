//! SQLite-backed `InstanceStore` implementation with durable persistence.

use crate::{InstanceStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_types::{
    CommandCategory, CommandEntry, FacadeInstance, InstanceId, InstanceStatus,
    MasterStatusSnapshot,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

const INSTANCE_COLUMNS: &str = r#"
    instance_id, name, facade_cred, master_cred, master_peer, owner_id, quota_limit,
    quota_used, duration_hours, created_at, expires_at, active, status, last_sync
"#;

/// Persistent SQLite store backend for façade instances and their catalogs.
#[derive(Debug)]
pub struct SqliteInstanceStore {
    db_path: PathBuf,
}

impl SqliteInstanceStore {
    /// Creates a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                facade_cred TEXT NOT NULL,
                master_cred TEXT NOT NULL,
                master_peer TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                quota_limit INTEGER NOT NULL,
                quota_used INTEGER NOT NULL DEFAULT 0,
                duration_hours INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                active INTEGER NOT NULL,
                status TEXT NOT NULL,
                last_sync TEXT NULL,
                CHECK (quota_used <= quota_limit)
            );

            CREATE INDEX IF NOT EXISTS idx_instances_owner ON instances (owner_id, created_at);

            CREATE TABLE IF NOT EXISTS commands (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                token TEXT NOT NULL,
                description TEXT NOT NULL,
                usage_template TEXT NULL,
                category TEXT NOT NULL,
                premium INTEGER NOT NULL,
                last_seen TEXT NOT NULL,
                FOREIGN KEY(instance_id) REFERENCES instances(instance_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_commands_instance ON commands (instance_id, id);

            CREATE TABLE IF NOT EXISTS status_snapshots (
                instance_id TEXT PRIMARY KEY,
                reported_id TEXT NOT NULL,
                reported_name TEXT NOT NULL,
                expiry_text TEXT NOT NULL,
                status_text TEXT NOT NULL,
                premium INTEGER NOT NULL,
                captured_at TEXT NOT NULL,
                FOREIGN KEY(instance_id) REFERENCES instances(instance_id) ON DELETE CASCADE
            );
            "#,
        )?;
        Ok(())
    }

    fn query_instances(
        &self,
        filter_sql: &str,
        filter: &[&dyn rusqlite::ToSql],
    ) -> StoreResult<Vec<FacadeInstance>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances {filter_sql} ORDER BY created_at ASC, instance_id ASC"
        ))?;
        let mut rows = statement.query(filter)?;
        let mut instances = Vec::new();
        while let Some(row) = rows.next()? {
            instances.push(instance_from_row(row)?);
        }
        Ok(instances)
    }
}

#[async_trait]
impl InstanceStore for SqliteInstanceStore {
    async fn insert_instance(&self, instance: FacadeInstance) -> StoreResult<()> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;

        let exists = transaction
            .query_row(
                "SELECT 1 FROM instances WHERE instance_id = ?1",
                params![instance.instance_id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::InstanceAlreadyExists(instance.instance_id));
        }

        transaction.execute(
            &format!(
                "INSERT INTO instances ({INSTANCE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                instance.instance_id.as_str(),
                instance.name,
                instance.facade_cred,
                instance.master_cred,
                instance.master_peer,
                instance.owner_id,
                i64::from(instance.quota_limit),
                i64::from(instance.quota_used),
                i64::from(instance.duration_hours),
                timestamp_to_db(instance.created_at),
                timestamp_to_db(instance.expires_at),
                instance.active,
                instance.status.as_str(),
                option_timestamp_to_db(instance.last_sync),
            ],
        )?;
        transaction.commit()?;
        Ok(())
    }

    async fn find_by_id(&self, instance_id: &InstanceId) -> StoreResult<Option<FacadeInstance>> {
        Ok(self
            .query_instances("WHERE instance_id = ?1", &[&instance_id.as_str()])?
            .into_iter()
            .next())
    }

    async fn find_by_owner(&self, owner_id: &str) -> StoreResult<Vec<FacadeInstance>> {
        self.query_instances("WHERE owner_id = ?1", &[&owner_id])
    }

    async fn list_instances(&self) -> StoreResult<Vec<FacadeInstance>> {
        self.query_instances("", &[])
    }

    async fn update_instance_state(
        &self,
        instance_id: &InstanceId,
        active: bool,
        status: InstanceStatus,
    ) -> StoreResult<()> {
        let connection = self.open_connection()?;
        let changed = connection.execute(
            "UPDATE instances SET active = ?1, status = ?2 WHERE instance_id = ?3",
            params![active, status.as_str(), instance_id.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::InstanceNotFound(instance_id.clone()));
        }
        Ok(())
    }

    async fn increment_quota(&self, instance_id: &InstanceId) -> StoreResult<u32> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = transaction.execute(
            r#"
            UPDATE instances
            SET quota_used = quota_used + 1
            WHERE instance_id = ?1 AND quota_used < quota_limit
            "#,
            params![instance_id.as_str()],
        )?;

        let counters: Option<(i64, i64)> = transaction
            .query_row(
                "SELECT quota_used, quota_limit FROM instances WHERE instance_id = ?1",
                params![instance_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((used, limit)) = counters else {
            return Err(StoreError::InstanceNotFound(instance_id.clone()));
        };
        let used = i64_to_u32("quota_used", used)?;
        if changed == 0 {
            return Err(StoreError::QuotaExceeded {
                instance_id: instance_id.clone(),
                used,
                limit: i64_to_u32("quota_limit", limit)?,
            });
        }
        transaction.commit()?;
        Ok(used)
    }

    async fn replace_catalog(
        &self,
        instance_id: &InstanceId,
        entries: Vec<CommandEntry>,
        status: Option<MasterStatusSnapshot>,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let touched = transaction.execute(
            "UPDATE instances SET last_sync = ?1 WHERE instance_id = ?2",
            params![timestamp_to_db(synced_at), instance_id.as_str()],
        )?;
        if touched == 0 {
            return Err(StoreError::InstanceNotFound(instance_id.clone()));
        }

        let removed = transaction.execute(
            "DELETE FROM commands WHERE instance_id = ?1",
            params![instance_id.as_str()],
        )?;
        {
            let mut insert = transaction.prepare(
                r#"
                INSERT INTO commands (
                    instance_id, token, description, usage_template, category, premium, last_seen
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )?;
            for entry in &entries {
                insert.execute(params![
                    instance_id.as_str(),
                    entry.token,
                    entry.description,
                    entry.usage_template,
                    entry.category.as_str(),
                    entry.premium,
                    timestamp_to_db(entry.last_seen),
                ])?;
            }
        }

        if let Some(snapshot) = &status {
            transaction.execute(
                r#"
                INSERT INTO status_snapshots (
                    instance_id, reported_id, reported_name, expiry_text, status_text,
                    premium, captured_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(instance_id) DO UPDATE SET
                    reported_id = excluded.reported_id,
                    reported_name = excluded.reported_name,
                    expiry_text = excluded.expiry_text,
                    status_text = excluded.status_text,
                    premium = excluded.premium,
                    captured_at = excluded.captured_at
                "#,
                params![
                    instance_id.as_str(),
                    snapshot.reported_id,
                    snapshot.reported_name,
                    snapshot.expiry_text,
                    snapshot.status_text,
                    snapshot.premium,
                    timestamp_to_db(snapshot.captured_at),
                ],
            )?;
        }
        transaction.commit()?;

        tracing::debug!(
            instance_id = %instance_id,
            removed,
            inserted = entries.len(),
            status_replaced = status.is_some(),
            "replaced instance catalog"
        );
        Ok(())
    }

    async fn list_commands(&self, instance_id: &InstanceId) -> StoreResult<Vec<CommandEntry>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            r#"
            SELECT token, description, usage_template, category, premium, last_seen
            FROM commands
            WHERE instance_id = ?1
            ORDER BY id ASC
            "#,
        )?;
        let mut rows = statement.query(params![instance_id.as_str()])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(CommandEntry {
                instance_id: instance_id.clone(),
                token: row.get(0)?,
                description: row.get(1)?,
                usage_template: row.get(2)?,
                category: CommandCategory::parse(&row.get::<_, String>(3)?)?,
                premium: row.get(4)?,
                last_seen: timestamp_from_db(&row.get::<_, String>(5)?)?,
            });
        }
        Ok(entries)
    }

    async fn get_status_snapshot(
        &self,
        instance_id: &InstanceId,
    ) -> StoreResult<Option<MasterStatusSnapshot>> {
        let connection = self.open_connection()?;
        let row: Option<(String, String, String, String, bool, String)> = connection
            .query_row(
                r#"
                SELECT reported_id, reported_name, expiry_text, status_text, premium, captured_at
                FROM status_snapshots
                WHERE instance_id = ?1
                "#,
                params![instance_id.as_str()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(
            |(reported_id, reported_name, expiry_text, status_text, premium, captured_at)|
             -> StoreResult<MasterStatusSnapshot> {
                Ok(MasterStatusSnapshot {
                    instance_id: instance_id.clone(),
                    reported_id,
                    reported_name,
                    expiry_text,
                    status_text,
                    premium,
                    captured_at: timestamp_from_db(&captured_at)?,
                })
            },
        )
        .transpose()
    }
}

fn instance_from_row(row: &Row<'_>) -> StoreResult<FacadeInstance> {
    Ok(FacadeInstance {
        instance_id: InstanceId::new(row.get::<_, String>(0)?),
        name: row.get(1)?,
        facade_cred: row.get(2)?,
        master_cred: row.get(3)?,
        master_peer: row.get(4)?,
        owner_id: row.get(5)?,
        quota_limit: i64_to_u32("quota_limit", row.get(6)?)?,
        quota_used: i64_to_u32("quota_used", row.get(7)?)?,
        duration_hours: i64_to_u32("duration_hours", row.get(8)?)?,
        created_at: timestamp_from_db(&row.get::<_, String>(9)?)?,
        expires_at: timestamp_from_db(&row.get::<_, String>(10)?)?,
        active: row.get(11)?,
        status: InstanceStatus::parse(&row.get::<_, String>(12)?)?,
        last_sync: option_timestamp_from_db(row.get(13)?)?,
    })
}

fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn option_timestamp_to_db(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(timestamp_to_db)
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn option_timestamp_from_db(value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value.as_deref().map(timestamp_from_db).transpose()
}

fn i64_to_u32(field: &'static str, value: i64) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}
