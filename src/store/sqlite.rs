//! SQLite instance store

use super::model::{Lab, LabInstance, NewLab, NewLabInstance, User};
use super::InstanceStore;
use crate::error::{LabError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Default database file name inside the data directory
pub const DEFAULT_DB_FILE: &str = "labrune.db";

const INSTANCE_COLUMNS: &str = "id, lab_id, user_id, container_id, container_name, \
     container_ip, container_port, expires_at, is_active, created_at";

const LAB_COLUMNS: &str =
    "id, name, docker_image, docker_compose, target_port, flag, time_limit, created_at";

/// Instance store persisted in a SQLite database.
///
/// Timestamps are stored as Unix milliseconds so expiry filtering happens in
/// SQL.
#[derive(Debug)]
pub struct SqliteStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        let store = Self {
            path: Some(path),
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            path: None,
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LabError::Lock("Failed to acquire database lock".to_string()))
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS labs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              docker_image TEXT,
              docker_compose TEXT,
              target_port INTEGER,
              flag TEXT NOT NULL,
              time_limit INTEGER NOT NULL DEFAULT 1,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              username TEXT NOT NULL UNIQUE,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS lab_instances (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              lab_id INTEGER NOT NULL REFERENCES labs(id),
              user_id INTEGER NOT NULL REFERENCES users(id),
              container_id TEXT,
              container_name TEXT,
              container_ip TEXT,
              container_port INTEGER,
              expires_at INTEGER,
              is_active INTEGER NOT NULL DEFAULT 1,
              created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_lab_instances_pair
              ON lab_instances(lab_id, user_id, is_active);
            CREATE INDEX IF NOT EXISTS idx_lab_instances_expiry
              ON lab_instances(is_active, expires_at);
            "#,
        )?;
        Ok(())
    }

    fn query_instances(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<LabInstance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, instance_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn opt_from_millis(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(idx)?;
    ms.map(|ms| {
        DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
    })
    .transpose()
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<LabInstance> {
    Ok(LabInstance {
        id: row.get(0)?,
        lab_id: row.get(1)?,
        user_id: row.get(2)?,
        container_id: row.get(3)?,
        container_name: row.get(4)?,
        container_ip: row.get(5)?,
        container_port: row.get(6)?,
        expires_at: opt_from_millis(row, 7)?,
        is_active: row.get(8)?,
        created_at: from_millis(row, 9)?,
    })
}

fn lab_from_row(row: &Row<'_>) -> rusqlite::Result<Lab> {
    Ok(Lab {
        id: row.get(0)?,
        name: row.get(1)?,
        docker_image: row.get(2)?,
        docker_compose: row.get(3)?,
        target_port: row.get(4)?,
        flag: row.get(5)?,
        time_limit: row.get(6)?,
        created_at: from_millis(row, 7)?,
    })
}

impl InstanceStore for SqliteStore {
    fn lab(&self, lab_id: i64) -> Result<Option<Lab>> {
        let conn = self.conn()?;
        let lab = conn
            .query_row(
                &format!("SELECT {} FROM labs WHERE id = ?1", LAB_COLUMNS),
                params![lab_id],
                lab_from_row,
            )
            .optional()?;
        Ok(lab)
    }

    fn user(&self, user_id: i64) -> Result<Option<User>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT id, username, created_at FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        created_at: from_millis(row, 2)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    fn instance(&self, instance_id: i64) -> Result<Option<LabInstance>> {
        let conn = self.conn()?;
        let instance = conn
            .query_row(
                &format!("SELECT {} FROM lab_instances WHERE id = ?1", INSTANCE_COLUMNS),
                params![instance_id],
                instance_from_row,
            )
            .optional()?;
        Ok(instance)
    }

    fn active_instance(&self, lab_id: i64, user_id: i64) -> Result<Option<LabInstance>> {
        let conn = self.conn()?;
        let instance = conn
            .query_row(
                &format!(
                    "SELECT {} FROM lab_instances \
                     WHERE lab_id = ?1 AND user_id = ?2 AND is_active = 1 \
                     ORDER BY id DESC LIMIT 1",
                    INSTANCE_COLUMNS
                ),
                params![lab_id, user_id],
                instance_from_row,
            )
            .optional()?;
        Ok(instance)
    }

    fn insert_instance(&self, instance: NewLabInstance) -> Result<LabInstance> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let lab_exists = tx
            .query_row("SELECT 1 FROM labs WHERE id = ?1", params![instance.lab_id], |_| Ok(()))
            .optional()?
            .is_some();
        if !lab_exists {
            return Err(LabError::LabNotFound(instance.lab_id));
        }
        let user_exists = tx
            .query_row("SELECT 1 FROM users WHERE id = ?1", params![instance.user_id], |_| Ok(()))
            .optional()?
            .is_some();
        if !user_exists {
            return Err(LabError::UserNotFound(instance.user_id));
        }

        tx.execute(
            "INSERT INTO lab_instances (lab_id, user_id, container_id, container_name, \
             container_ip, container_port, expires_at, is_active, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            params![
                instance.lab_id,
                instance.user_id,
                instance.container_id,
                instance.container_name,
                instance.container_ip,
                instance.container_port,
                instance.expires_at.map(to_millis),
                to_millis(instance.created_at),
            ],
        )?;
        let id = tx.last_insert_rowid();
        let row = tx.query_row(
            &format!("SELECT {} FROM lab_instances WHERE id = ?1", INSTANCE_COLUMNS),
            params![id],
            instance_from_row,
        )?;
        tx.commit()?;
        Ok(row)
    }

    fn deactivate(&self, instance_id: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE lab_instances SET is_active = 0 WHERE id = ?1",
            params![instance_id],
        )?;
        if changed == 0 {
            return Err(LabError::InstanceNotFound(instance_id));
        }
        tx.commit()?;
        Ok(())
    }

    fn expired_instances(&self, now: DateTime<Utc>) -> Result<Vec<LabInstance>> {
        self.query_instances(
            &format!(
                "SELECT {} FROM lab_instances \
                 WHERE is_active = 1 AND expires_at IS NOT NULL AND expires_at < ?1 \
                 ORDER BY id",
                INSTANCE_COLUMNS
            ),
            params![to_millis(now)],
        )
    }

    fn active_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM lab_instances WHERE is_active = 1",
            [],
            |row| row.get(0),
        )?;
        usize::try_from(count).map_err(|_| LabError::Store(format!("Invalid count {}", count)))
    }

    fn active_instances(&self) -> Result<Vec<LabInstance>> {
        self.query_instances(
            &format!(
                "SELECT {} FROM lab_instances WHERE is_active = 1 ORDER BY id",
                INSTANCE_COLUMNS
            ),
            [],
        )
    }

    fn user_active_instances(&self, user_id: i64) -> Result<Vec<LabInstance>> {
        self.query_instances(
            &format!(
                "SELECT {} FROM lab_instances WHERE user_id = ?1 AND is_active = 1 ORDER BY id",
                INSTANCE_COLUMNS
            ),
            params![user_id],
        )
    }

    fn insert_lab(&self, lab: NewLab) -> Result<Lab> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO labs (name, docker_image, docker_compose, target_port, flag, \
             time_limit, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                lab.name,
                lab.docker_image,
                lab.docker_compose,
                lab.target_port,
                lab.flag,
                lab.time_limit,
                to_millis(Utc::now()),
            ],
        )?;
        let id = tx.last_insert_rowid();
        let row = tx.query_row(
            &format!("SELECT {} FROM labs WHERE id = ?1", LAB_COLUMNS),
            params![id],
            lab_from_row,
        )?;
        tx.commit()?;
        Ok(row)
    }

    fn labs(&self) -> Result<Vec<Lab>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM labs ORDER BY id", LAB_COLUMNS))?;
        let rows = stmt
            .query_map([], lab_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn insert_user(&self, username: &str) -> Result<User> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let created_at = Utc::now();
        tx.execute(
            "INSERT INTO users (username, created_at) VALUES (?1, ?2)",
            params![username, to_millis(created_at)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(User {
            id,
            username: username.to_string(),
            created_at: DateTime::from_timestamp_millis(to_millis(created_at))
                .unwrap_or(created_at),
        })
    }
}
