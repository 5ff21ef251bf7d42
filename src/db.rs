//! SQLite storage for profiles, host mappings and activity history
//!
//! Components only see the [`Store`] trait; [`Database`] is the rusqlite
//! implementation used by the binary and the tests.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Runtime status of a profile. Never persisted; the supervisor owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProfileStatus {
    Running,
    #[default]
    Stopped,
}

/// A user-defined proxy workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    /// forward, reverse, http, tcp, udp or ss; anything else resolves to the default handler
    #[serde(rename = "type")]
    pub profile_type: String,
    pub listen: String,
    pub remote: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub status: ProfileStatus,
}

/// Transport a host mapping forwards with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MappingProtocol {
    #[default]
    #[serde(rename = "HTTP", alias = "http")]
    Http,
    #[serde(rename = "HTTPS", alias = "https")]
    Https,
    #[serde(rename = "TCP", alias = "tcp")]
    Tcp,
}

impl MappingProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingProtocol::Http => "HTTP",
            MappingProtocol::Https => "HTTPS",
            MappingProtocol::Tcp => "TCP",
        }
    }

    /// Case-insensitive parse; unrecognized values are treated as HTTP
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("https") {
            MappingProtocol::Https
        } else if value.eq_ignore_ascii_case("tcp") {
            MappingProtocol::Tcp
        } else {
            MappingProtocol::Http
        }
    }
}

/// Routes a hostname to a backend ip:port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMapping {
    #[serde(default)]
    pub id: i64,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: MappingProtocol,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl HostMapping {
    /// Upstream origin, e.g. `http://10.0.0.1:9000`
    pub fn origin(&self) -> String {
        let scheme = match self.protocol {
            MappingProtocol::Https => "https",
            _ => "http",
        };
        if self.ip.contains(':') && !self.ip.starts_with('[') {
            format!("{}://[{}]:{}", scheme, self.ip, self.port)
        } else {
            format!("{}://{}:{}", scheme, self.ip, self.port)
        }
    }
}

/// One row of the persisted activity history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLog {
    pub id: i64,
    pub profile_id: i64,
    pub profile_name: String,
    /// created, updated, deleted, started or stopped
    pub action: String,
    pub details: String,
    /// RFC 3339
    pub timestamp: String,
    /// success or error
    pub status: String,
}

/// Storage contract consumed by the supervisor, router and facade
pub trait Store: Send + Sync {
    fn profiles(&self) -> Result<Vec<Profile>>;
    fn profile(&self, id: i64) -> Result<Option<Profile>>;
    /// Insert a profile and return its assigned id
    fn create_profile(&self, profile: &Profile) -> Result<i64>;
    /// Returns false if no profile has this id
    fn update_profile(&self, profile: &Profile) -> Result<bool>;
    fn delete_profile(&self, id: i64) -> Result<bool>;

    fn host_mappings(&self) -> Result<Vec<HostMapping>>;
    /// Update the mapping with the same hostname, or insert it
    fn upsert_host_mapping(&self, mapping: &HostMapping) -> Result<i64>;
    fn delete_host_mapping_by_hostname(&self, hostname: &str) -> Result<bool>;
    fn delete_host_mapping_by_id(&self, id: i64) -> Result<bool>;

    fn log_activity(
        &self,
        profile_id: i64,
        profile_name: &str,
        action: &str,
        details: &str,
        status: &str,
    ) -> Result<i64>;
    /// All activity, newest first
    fn activity(&self) -> Result<Vec<ActivityLog>>;
    fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityLog>>;
    fn profile_activity(&self, profile_id: i64) -> Result<Vec<ActivityLog>>;

    fn close(&self) -> Result<()>;
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Mutex<Option<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self {
            conn: Mutex::new(Some(conn)),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let db = Self {
            conn: Mutex::new(Some(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock();
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => anyhow::bail!("database is closed"),
        }
    }

    fn run_migrations(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
                )",
                [],
            )?;

            let current_version: i32 = conn
                .query_row(
                    "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                    [],
                    |row| row.get(0),
                )
                .unwrap_or(0);

            if current_version < SCHEMA_VERSION {
                info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

                if current_version < 1 {
                    migrate_v1(conn)?;
                }
                if current_version < 2 {
                    migrate_v2(conn)?;
                }
            }
            Ok(())
        })
    }
}

/// Migration v1: profiles and activity history
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Applying migration v1: initial schema");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            listen TEXT NOT NULL,
            remote TEXT NOT NULL,
            username TEXT NOT NULL DEFAULT '',
            password TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS activity_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            profile_id INTEGER NOT NULL,
            profile_name TEXT NOT NULL,
            action TEXT NOT NULL,
            details TEXT NOT NULL DEFAULT '',
            timestamp TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'success'
        );

        CREATE INDEX IF NOT EXISTS idx_activity_profile ON activity_logs(profile_id);
        CREATE INDEX IF NOT EXISTS idx_activity_timestamp ON activity_logs(timestamp DESC);

        INSERT INTO schema_migrations (version) VALUES (1);
    "#,
    )?;

    Ok(())
}

/// Migration v2: host mappings for the router
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Applying migration v2: host mappings");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS host_mappings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hostname TEXT NOT NULL UNIQUE,
            ip TEXT NOT NULL,
            port INTEGER NOT NULL,
            protocol TEXT NOT NULL DEFAULT 'HTTP',
            active INTEGER NOT NULL DEFAULT 1
        );

        INSERT INTO schema_migrations (version) VALUES (2);
    "#,
    )?;

    Ok(())
}

const PROFILE_COLUMNS: &str = "id, name, type, listen, remote, username, password";
const MAPPING_COLUMNS: &str = "id, hostname, ip, port, protocol, active";
const ACTIVITY_COLUMNS: &str = "id, profile_id, profile_name, action, details, timestamp, status";

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    Ok(Profile {
        id: row.get(0)?,
        name: row.get(1)?,
        profile_type: row.get(2)?,
        listen: row.get(3)?,
        remote: row.get(4)?,
        username: row.get(5)?,
        password: row.get(6)?,
        status: ProfileStatus::Stopped,
    })
}

fn mapping_from_row(row: &Row<'_>) -> rusqlite::Result<HostMapping> {
    let protocol: String = row.get(4)?;
    Ok(HostMapping {
        id: row.get(0)?,
        hostname: row.get(1)?,
        ip: row.get(2)?,
        port: row.get(3)?,
        protocol: MappingProtocol::parse(&protocol),
        active: row.get(5)?,
    })
}

fn activity_from_row(row: &Row<'_>) -> rusqlite::Result<ActivityLog> {
    Ok(ActivityLog {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        profile_name: row.get(2)?,
        action: row.get(3)?,
        details: row.get(4)?,
        timestamp: row.get(5)?,
        status: row.get(6)?,
    })
}

impl Store for Database {
    fn profiles(&self) -> Result<Vec<Profile>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM profiles ORDER BY id", PROFILE_COLUMNS))?;
            let profiles = stmt
                .query_map([], profile_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(profiles)
        })
    }

    fn profile(&self, id: i64) -> Result<Option<Profile>> {
        self.with_conn(|conn| {
            let profile = conn
                .query_row(
                    &format!("SELECT {} FROM profiles WHERE id = ?1", PROFILE_COLUMNS),
                    params![id],
                    profile_from_row,
                )
                .optional()?;
            Ok(profile)
        })
    }

    fn create_profile(&self, profile: &Profile) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO profiles (name, type, listen, remote, username, password)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    profile.name,
                    profile.profile_type,
                    profile.listen,
                    profile.remote,
                    profile.username,
                    profile.password
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn update_profile(&self, profile: &Profile) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE profiles SET name = ?1, type = ?2, listen = ?3, remote = ?4,
                 username = ?5, password = ?6 WHERE id = ?7",
                params![
                    profile.name,
                    profile.profile_type,
                    profile.listen,
                    profile.remote,
                    profile.username,
                    profile.password,
                    profile.id
                ],
            )?;
            Ok(changed > 0)
        })
    }

    fn delete_profile(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM profiles WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })
    }

    fn host_mappings(&self) -> Result<Vec<HostMapping>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM host_mappings ORDER BY id",
                MAPPING_COLUMNS
            ))?;
            let mappings = stmt
                .query_map([], mapping_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(mappings)
        })
    }

    fn upsert_host_mapping(&self, mapping: &HostMapping) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO host_mappings (hostname, ip, port, protocol, active)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(hostname) DO UPDATE SET
                    ip = excluded.ip,
                    port = excluded.port,
                    protocol = excluded.protocol,
                    active = excluded.active",
                params![
                    mapping.hostname,
                    mapping.ip,
                    mapping.port,
                    mapping.protocol.as_str(),
                    mapping.active
                ],
            )?;
            let id = conn.query_row(
                "SELECT id FROM host_mappings WHERE hostname = ?1",
                params![mapping.hostname],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    fn delete_host_mapping_by_hostname(&self, hostname: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM host_mappings WHERE hostname = ?1",
                params![hostname],
            )?;
            Ok(changed > 0)
        })
    }

    fn delete_host_mapping_by_id(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM host_mappings WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })
    }

    fn log_activity(
        &self,
        profile_id: i64,
        profile_name: &str,
        action: &str,
        details: &str,
        status: &str,
    ) -> Result<i64> {
        let timestamp = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO activity_logs (profile_id, profile_name, action, details, timestamp, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![profile_id, profile_name, action, details, timestamp, status],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn activity(&self) -> Result<Vec<ActivityLog>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM activity_logs ORDER BY timestamp DESC, id DESC",
                ACTIVITY_COLUMNS
            ))?;
            let records = stmt
                .query_map([], activity_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityLog>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM activity_logs ORDER BY timestamp DESC, id DESC LIMIT ?1",
                ACTIVITY_COLUMNS
            ))?;
            let records = stmt
                .query_map(params![limit as i64], activity_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    fn profile_activity(&self, profile_id: i64) -> Result<Vec<ActivityLog>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM activity_logs WHERE profile_id = ?1
                 ORDER BY timestamp DESC, id DESC",
                ACTIVITY_COLUMNS
            ))?;
            let records = stmt
                .query_map(params![profile_id], activity_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    fn close(&self) -> Result<()> {
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.close()
                .map_err(|(_, e)| e)
                .context("Failed to close database")?;
            debug!("Database closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile(name: &str) -> Profile {
        Profile {
            id: 0,
            name: name.to_string(),
            profile_type: "forward".to_string(),
            listen: ":1080".to_string(),
            remote: "10.0.0.1:22".to_string(),
            username: String::new(),
            password: String::new(),
            status: ProfileStatus::Running,
        }
    }

    fn sample_mapping(hostname: &str, port: u16) -> HostMapping {
        HostMapping {
            id: 0,
            hostname: hostname.to_string(),
            ip: "10.0.0.1".to_string(),
            port,
            protocol: MappingProtocol::Http,
            active: true,
        }
    }

    #[test]
    fn test_profile_crud() {
        let db = Database::open_in_memory().unwrap();

        let first = db.create_profile(&sample_profile("one")).unwrap();
        let second = db.create_profile(&sample_profile("two")).unwrap();
        assert!(second > first);

        let mut loaded = db.profile(first).unwrap().unwrap();
        assert_eq!(loaded.name, "one");
        // Status is never read back from storage
        assert_eq!(loaded.status, ProfileStatus::Stopped);

        loaded.remote = "10.0.0.9:22".to_string();
        assert!(db.update_profile(&loaded).unwrap());
        assert_eq!(db.profile(first).unwrap().unwrap().remote, "10.0.0.9:22");

        assert!(db.delete_profile(first).unwrap());
        assert!(!db.delete_profile(first).unwrap());
        assert!(db.profile(first).unwrap().is_none());
        assert_eq!(db.profiles().unwrap().len(), 1);
    }

    #[test]
    fn test_update_missing_profile() {
        let db = Database::open_in_memory().unwrap();
        let mut profile = sample_profile("ghost");
        profile.id = 42;
        assert!(!db.update_profile(&profile).unwrap());
    }

    #[test]
    fn test_upsert_host_mapping_by_hostname() {
        let db = Database::open_in_memory().unwrap();

        let id = db.upsert_host_mapping(&sample_mapping("a.test", 9000)).unwrap();
        let mut changed = sample_mapping("a.test", 9100);
        changed.protocol = MappingProtocol::Https;
        changed.active = false;
        let same_id = db.upsert_host_mapping(&changed).unwrap();
        assert_eq!(id, same_id);

        let mappings = db.host_mappings().unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].port, 9100);
        assert_eq!(mappings[0].protocol, MappingProtocol::Https);
        assert!(!mappings[0].active);
    }

    #[test]
    fn test_delete_host_mappings() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_host_mapping(&sample_mapping("a.test", 1)).unwrap();
        let b = db.upsert_host_mapping(&sample_mapping("b.test", 2)).unwrap();

        assert!(db.delete_host_mapping_by_hostname("a.test").unwrap());
        assert!(!db.delete_host_mapping_by_hostname("a.test").unwrap());
        assert!(db.delete_host_mapping_by_id(b).unwrap());
        assert!(db.host_mappings().unwrap().is_empty());
    }

    #[test]
    fn test_activity_queries() {
        let db = Database::open_in_memory().unwrap();
        db.log_activity(1, "one", "created", "", "success").unwrap();
        db.log_activity(2, "two", "created", "", "success").unwrap();
        db.log_activity(1, "one", "started", "pid 10", "success").unwrap();

        let all = db.activity().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].action, "started");

        let recent = db.recent_activity(2).unwrap();
        assert_eq!(recent.len(), 2);

        let for_one = db.profile_activity(1).unwrap();
        assert_eq!(for_one.len(), 2);
        assert!(for_one.iter().all(|a| a.profile_name == "one"));
        assert!(chrono::DateTime::parse_from_rfc3339(&for_one[0].timestamp).is_ok());
    }

    #[test]
    fn test_close_rejects_further_use() {
        let db = Database::open_in_memory().unwrap();
        db.close().unwrap();
        // Closing twice is fine
        db.close().unwrap();
        assert!(db.profiles().is_err());
    }

    #[test]
    fn test_open_file_runs_migrations_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gostly.db");
        {
            let db = Database::open(&path).unwrap();
            db.create_profile(&sample_profile("persisted")).unwrap();
            db.close().unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.profiles().unwrap()[0].name, "persisted");
    }

    #[test]
    fn test_mapping_origin() {
        let mut mapping = sample_mapping("a.test", 9000);
        assert_eq!(mapping.origin(), "http://10.0.0.1:9000");
        mapping.protocol = MappingProtocol::Https;
        assert_eq!(mapping.origin(), "https://10.0.0.1:9000");
        mapping.ip = "::1".to_string();
        assert_eq!(mapping.origin(), "https://[::1]:9000");
    }

    #[test]
    fn test_mapping_protocol_parse_and_serde() {
        assert_eq!(MappingProtocol::parse("https"), MappingProtocol::Https);
        assert_eq!(MappingProtocol::parse("Tcp"), MappingProtocol::Tcp);
        assert_eq!(MappingProtocol::parse("gopher"), MappingProtocol::Http);

        let mapping: HostMapping =
            serde_json::from_str(r#"{"hostname":"a.test","ip":"1.2.3.4","port":80,"protocol":"https"}"#)
                .unwrap();
        assert_eq!(mapping.protocol, MappingProtocol::Https);
        assert!(mapping.active);
        let json = serde_json::to_value(&mapping).unwrap();
        assert_eq!(json["protocol"], "HTTPS");
    }
}
