// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed instance store.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};

use super::{InstanceFilter, InstanceStore, Result, StoreError};
use crate::model::{
    DatabaseUser, Engine, InstanceStatus, ManagedInstance, NetworkPlacement, NewInstance,
    PortRule, Secret,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const SELECT_INSTANCE: &str = r#"
    SELECT instance_id, owner_id, name, engine, engine_version, instance_size,
           vpc_id, subnet_id, security_group_ids, port, master_username, master_password,
           public_ip, private_ip, port_rules, status, launched_at, terminated_at,
           last_status_check
    FROM managed_instances
"#;

#[derive(Debug, sqlx::FromRow)]
struct InstanceRow {
    instance_id: String,
    owner_id: String,
    name: String,
    engine: String,
    engine_version: String,
    instance_size: String,
    vpc_id: Option<String>,
    subnet_id: Option<String>,
    security_group_ids: String,
    port: i64,
    master_username: String,
    master_password: String,
    public_ip: Option<String>,
    private_ip: Option<String>,
    port_rules: String,
    status: String,
    launched_at: DateTime<Utc>,
    terminated_at: Option<DateTime<Utc>>,
    last_status_check: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    username: String,
    password: String,
    privileges: String,
    created_at: DateTime<Utc>,
}

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool. Migrations must already have been applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and apply migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Open (creating if needed) a database file and apply migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Fresh in-memory database, for tests and tooling.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn write(conn: &mut SqliteConnection, instance: &ManagedInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO managed_instances (
                instance_id, owner_id, name, engine, engine_version, instance_size,
                vpc_id, subnet_id, security_group_ids, port, master_username, master_password,
                public_ip, private_ip, port_rules, status, launched_at, terminated_at,
                last_status_check
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            ON CONFLICT(instance_id) DO UPDATE SET
                owner_id = excluded.owner_id,
                name = excluded.name,
                engine = excluded.engine,
                engine_version = excluded.engine_version,
                instance_size = excluded.instance_size,
                vpc_id = excluded.vpc_id,
                subnet_id = excluded.subnet_id,
                security_group_ids = excluded.security_group_ids,
                port = excluded.port,
                master_username = excluded.master_username,
                master_password = excluded.master_password,
                public_ip = excluded.public_ip,
                private_ip = excluded.private_ip,
                port_rules = excluded.port_rules,
                status = excluded.status,
                launched_at = excluded.launched_at,
                terminated_at = excluded.terminated_at,
                last_status_check = excluded.last_status_check
            "#,
        )
        .bind(instance.instance_id())
        .bind(&instance.owner_id)
        .bind(&instance.name)
        .bind(instance.engine.as_str())
        .bind(&instance.engine_version)
        .bind(&instance.instance_size)
        .bind(&instance.placement.vpc_id)
        .bind(&instance.placement.subnet_id)
        .bind(serde_json::to_string(&instance.placement.security_group_ids)?)
        .bind(i64::from(instance.port))
        .bind(&instance.master_username)
        .bind(instance.master_password.expose())
        .bind(&instance.public_ip)
        .bind(&instance.private_ip)
        .bind(serde_json::to_string(&instance.port_rules)?)
        .bind(instance.status.as_str())
        .bind(instance.launched_at)
        .bind(instance.terminated_at)
        .bind(instance.last_status_check)
        .execute(&mut *conn)
        .await?;

        sqlx::query("DELETE FROM database_users WHERE instance_id = ?")
            .bind(instance.instance_id())
            .execute(&mut *conn)
            .await?;

        for (position, user) in instance.database_users.iter().enumerate() {
            let privileges: Vec<&String> = user.privileges.iter().collect();
            sqlx::query(
                r#"
                INSERT INTO database_users (instance_id, username, password, privileges, created_at, position)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(instance.instance_id())
            .bind(&user.username)
            .bind(user.password.expose())
            .bind(serde_json::to_string(&privileges)?)
            .bind(user.created_at)
            .bind(position as i64)
            .execute(&mut *conn)
            .await?;
        }

        Ok(())
    }

    async fn hydrate(&self, row: InstanceRow) -> Result<ManagedInstance> {
        let corrupt = |details: String| StoreError::Corrupt {
            instance_id: row.instance_id.clone(),
            details,
        };

        let engine: Engine = row.engine.parse().map_err(|_| {
            corrupt(format!("unknown engine '{}'", row.engine))
        })?;
        let status: InstanceStatus = row.status.parse().map_err(corrupt)?;
        let port = u16::try_from(row.port).map_err(|_| corrupt(format!("invalid port {}", row.port)))?;

        let users = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT username, password, privileges, created_at
            FROM database_users
            WHERE instance_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(&row.instance_id)
        .fetch_all(&self.pool)
        .await?;

        let mut database_users = Vec::with_capacity(users.len());
        for user in users {
            let privileges: BTreeSet<String> = serde_json::from_str(&user.privileges)?;
            database_users.push(DatabaseUser {
                username: user.username,
                password: Secret::new(user.password),
                privileges,
                created_at: user.created_at,
            });
        }

        let mut instance = ManagedInstance::new(
            row.instance_id.clone(),
            NewInstance {
                owner_id: row.owner_id,
                name: row.name,
                engine,
                engine_version: row.engine_version,
                instance_size: row.instance_size,
                placement: NetworkPlacement {
                    vpc_id: row.vpc_id,
                    subnet_id: row.subnet_id,
                    security_group_ids: serde_json::from_str(&row.security_group_ids)?,
                },
                port,
                master_username: row.master_username,
                master_password: Secret::new(row.master_password),
                launched_at: row.launched_at,
            },
        );
        instance.database_users = database_users;
        instance.public_ip = row.public_ip;
        instance.private_ip = row.private_ip;
        instance.port_rules = serde_json::from_str::<Vec<PortRule>>(&row.port_rules)?;
        instance.status = status;
        instance.terminated_at = row.terminated_at;
        instance.last_status_check = row.last_status_check;
        Ok(instance)
    }
}

#[async_trait]
impl InstanceStore for SqliteStore {
    async fn insert(&self, instance: &ManagedInstance) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT instance_id FROM managed_instances WHERE instance_id = ?")
                .bind(instance.instance_id())
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            return Err(StoreError::Duplicate(instance.instance_id().to_string()));
        }

        Self::write(&mut tx, instance).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save(&self, instance: &ManagedInstance) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::write(&mut tx, instance).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, instance_id: &str) -> Result<Option<ManagedInstance>> {
        let query = format!("{} WHERE instance_id = ?", SELECT_INSTANCE);
        let row = sqlx::query_as::<_, InstanceRow>(&query)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &InstanceFilter) -> Result<Vec<ManagedInstance>> {
        let query = format!(
            r#"{}
            WHERE (?1 IS NULL OR owner_id = ?1)
              AND (?2 IS NULL OR status = ?2)
              AND (?3 IS NULL OR engine = ?3)
              AND (?4 IS NULL OR launched_at >= ?4)
              AND (?5 IS NULL OR launched_at < ?5)
              AND (NOT ?6 OR status != 'terminated')
            ORDER BY launched_at ASC, instance_id ASC
            "#,
            SELECT_INSTANCE
        );

        let rows = sqlx::query_as::<_, InstanceRow>(&query)
            .bind(&filter.owner_id)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.engine.map(|e| e.as_str()))
            .bind(filter.launched_after)
            .bind(filter.launched_before)
            .bind(filter.exclude_terminated)
            .fetch_all(&self.pool)
            .await?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in rows {
            instances.push(self.hydrate(row).await?);
        }
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instance(id: &str) -> ManagedInstance {
        ManagedInstance::new(
            id,
            NewInstance {
                owner_id: "owner-1".to_string(),
                name: "orders".to_string(),
                engine: Engine::Mysql,
                engine_version: "8.0".to_string(),
                instance_size: "t3.small".to_string(),
                placement: NetworkPlacement {
                    vpc_id: Some("vpc-1".to_string()),
                    subnet_id: Some("subnet-1".to_string()),
                    security_group_ids: vec!["sg-1".to_string()],
                },
                port: 3306,
                master_username: "dbadmin".to_string(),
                master_password: Secret::new("master-pw"),
                launched_at: Utc.with_ymd_and_hms(2025, 2, 1, 8, 30, 0).unwrap(),
            },
        )
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut record = instance("i-1");
        record.port_rules.push(PortRule::tcp(3306, "0.0.0.0/0"));
        store.insert(&record).await.unwrap();

        let loaded = store.get("i-1").await.unwrap().unwrap();
        assert_eq!(loaded.instance_id(), "i-1");
        assert_eq!(loaded.engine, Engine::Mysql);
        assert_eq!(loaded.port, 3306);
        assert_eq!(loaded.master_password.expose(), "master-pw");
        assert_eq!(loaded.placement.security_group_ids, vec!["sg-1"]);
        assert_eq!(loaded.port_rules, vec![PortRule::tcp(3306, "0.0.0.0/0")]);
        assert_eq!(loaded.launched_at, record.launched_at);
        assert_eq!(loaded.status, InstanceStatus::Pending);
    }

    #[tokio::test]
    async fn test_insert_duplicate_rejected() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.insert(&instance("i-1")).await.unwrap();

        let err = store.insert(&instance("i-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(id) if id == "i-1"));
    }

    #[tokio::test]
    async fn test_save_keeps_user_order() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut record = instance("i-1");
        store.insert(&record).await.unwrap();

        for name in ["zeta", "alpha", "mid"] {
            record.database_users.push(DatabaseUser {
                username: name.to_string(),
                password: Secret::new(format!("{}-pw", name)),
                privileges: ["SELECT".to_string()].into_iter().collect(),
                created_at: Utc::now(),
            });
        }
        store.save(&record).await.unwrap();

        let loaded = store.get("i-1").await.unwrap().unwrap();
        let names: Vec<&str> = loaded
            .database_users
            .iter()
            .map(|u| u.username.as_str())
            .collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(loaded.database_users[1].password.expose(), "alpha-pw");

        record.database_users.remove(0);
        store.save(&record).await.unwrap();
        let loaded = store.get("i-1").await.unwrap().unwrap();
        assert_eq!(loaded.database_users.len(), 2);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.get("i-nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_from_path_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dbfleet.db");

        let store = SqliteStore::from_path(&path).await.unwrap();
        store.insert(&instance("i-1")).await.unwrap();

        assert!(path.exists());
        let reopened = SqliteStore::from_path(&path).await.unwrap();
        assert!(reopened.get("i-1").await.unwrap().is_some());
    }
}
