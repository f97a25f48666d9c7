//! Persistent settings store.
//!
//! # Schema
//! Two key/value tables, one per partition:
//! - `settings_local`: secrets and machine-local state (token, device iden,
//!   encryption password, cutoff watermark, cached session blob). Never
//!   leaves this machine.
//! - `settings_roamed`: preferences that may sync across the user's other
//!   installs (nickname, auto-open flags, notification timeout).
//!
//! Writes are atomic per key (single `INSERT OR REPLACE`). Values are
//! stored as TEXT; typed helpers do the encoding.
//!
//! # SQLite settings
//! Applied at open: WAL, synchronous=FULL, foreign_keys=ON.

use rusqlite::{Connection, params};
use std::path::Path;
use thiserror::Error;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS settings_local (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS settings_roamed (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("Encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Invalid stored value for '{key}': {detail}")]
    InvalidValue { key: String, detail: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Which table a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// Secrets and machine-local state; never roamed.
    Local,
    /// Preferences that may sync across installs.
    Roamed,
}

impl Partition {
    fn table(self) -> &'static str {
        match self {
            Partition::Local => "settings_local",
            Partition::Roamed => "settings_roamed",
        }
    }
}

// Key names. Local partition:
pub const KEY_TOKEN: &str = "apiKey";
pub const KEY_DEVICE_IDEN: &str = "deviceIden";
pub const KEY_ENCRYPTION_PASSWORD: &str = "encryptionPassword";
pub const KEY_CUTOFF: &str = "lastModifiedCutoff";
pub const KEY_CACHED_SESSION: &str = "cachedSession";
pub const KEY_REGISTRATION_IN_PROGRESS: &str = "deviceRegistrationInProgress";
pub const KEY_AUTO_OPEN_ON_RECONNECT: &str = "autoOpenLinksOnReconnect";
// Roamed partition:
pub const KEY_DEVICE_NICKNAME: &str = "deviceNickname";
pub const KEY_AUTO_OPEN_LINKS: &str = "autoOpenLinks";
pub const KEY_NOTIFICATION_TIMEOUT_MS: &str = "notificationTimeoutMs";

/// Store handle shared across tasks. `rusqlite::Connection` is `Send` but
/// not `Sync`, hence the async mutex.
pub type SharedStore = std::sync::Arc<tokio::sync::Mutex<Store>>;

/// The settings store for a single agent instance.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store at the given path, creating parent
    /// directories as needed.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let s = Self { conn };
        s.apply_pragmas()?;
        s.apply_schema()?;
        Ok(s)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let s = Self { conn };
        s.apply_pragmas()?;
        s.apply_schema()?;
        Ok(s)
    }

    fn apply_pragmas(&self) -> StoreResult<()> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "FULL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    fn apply_schema(&self) -> StoreResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Raw key/value operations
    // -----------------------------------------------------------------------

    pub fn get(&self, partition: Partition, key: &str) -> StoreResult<Option<String>> {
        let sql = format!("SELECT value FROM {} WHERE key = ?1", partition.table());
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![key], |r| r.get::<_, String>(0))?;
        Ok(rows.next().transpose()?)
    }

    pub fn set(&self, partition: Partition, key: &str, value: &str) -> StoreResult<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
            partition.table()
        );
        self.conn.execute(&sql, params![key, value])?;
        Ok(())
    }

    pub fn remove(&self, partition: Partition, key: &str) -> StoreResult<()> {
        let sql = format!("DELETE FROM {} WHERE key = ?1", partition.table());
        self.conn.execute(&sql, params![key])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Typed helpers: local partition
    // -----------------------------------------------------------------------

    pub fn token(&self) -> StoreResult<Option<String>> {
        self.get(Partition::Local, KEY_TOKEN)
    }

    pub fn set_token(&self, token: &str) -> StoreResult<()> {
        self.set(Partition::Local, KEY_TOKEN, token)
    }

    pub fn clear_token(&self) -> StoreResult<()> {
        self.remove(Partition::Local, KEY_TOKEN)
    }

    pub fn device_iden(&self) -> StoreResult<Option<String>> {
        self.get(Partition::Local, KEY_DEVICE_IDEN)
    }

    pub fn set_device_iden(&self, iden: &str) -> StoreResult<()> {
        self.set(Partition::Local, KEY_DEVICE_IDEN, iden)
    }

    pub fn clear_device_iden(&self) -> StoreResult<()> {
        self.remove(Partition::Local, KEY_DEVICE_IDEN)
    }

    pub fn encryption_password(&self) -> StoreResult<Option<String>> {
        self.get(Partition::Local, KEY_ENCRYPTION_PASSWORD)
    }

    pub fn set_encryption_password(&self, password: &str) -> StoreResult<()> {
        self.set(Partition::Local, KEY_ENCRYPTION_PASSWORD, password)
    }

    /// The incremental pipeline's watermark; 0.0 when unseeded.
    pub fn cutoff(&self) -> StoreResult<f64> {
        match self.get(Partition::Local, KEY_CUTOFF)? {
            None => Ok(0.0),
            Some(raw) => raw.parse::<f64>().map_err(|e| StoreError::InvalidValue {
                key: KEY_CUTOFF.to_owned(),
                detail: e.to_string(),
            }),
        }
    }

    pub fn set_cutoff(&self, cutoff: f64) -> StoreResult<()> {
        self.set(Partition::Local, KEY_CUTOFF, &format!("{cutoff}"))
    }

    /// JSON-encoded cached session blob.
    pub fn cached_session_raw(&self) -> StoreResult<Option<String>> {
        self.get(Partition::Local, KEY_CACHED_SESSION)
    }

    pub fn set_cached_session_raw(&self, blob: &str) -> StoreResult<()> {
        self.set(Partition::Local, KEY_CACHED_SESSION, blob)
    }

    pub fn clear_cached_session(&self) -> StoreResult<()> {
        self.remove(Partition::Local, KEY_CACHED_SESSION)
    }

    /// Guard flag preventing duplicate device registration across
    /// concurrent wakes.
    pub fn registration_in_progress(&self) -> StoreResult<bool> {
        Ok(self
            .get(Partition::Local, KEY_REGISTRATION_IN_PROGRESS)?
            .as_deref()
            == Some("true"))
    }

    pub fn set_registration_in_progress(&self, value: bool) -> StoreResult<()> {
        if value {
            self.set(Partition::Local, KEY_REGISTRATION_IN_PROGRESS, "true")
        } else {
            self.remove(Partition::Local, KEY_REGISTRATION_IN_PROGRESS)
        }
    }

    /// The auto-open-on-reconnect knob stays local: whether links pop
    /// open after a reconnect is a per-machine choice.
    pub fn auto_open_links_on_reconnect(&self) -> StoreResult<Option<bool>> {
        self.get_bool(Partition::Local, KEY_AUTO_OPEN_ON_RECONNECT)
    }

    pub fn set_auto_open_links_on_reconnect(&self, value: bool) -> StoreResult<()> {
        self.set(
            Partition::Local,
            KEY_AUTO_OPEN_ON_RECONNECT,
            if value { "true" } else { "false" },
        )
    }

    // -----------------------------------------------------------------------
    // Typed helpers: roamed partition
    // -----------------------------------------------------------------------

    pub fn device_nickname(&self) -> StoreResult<Option<String>> {
        self.get(Partition::Roamed, KEY_DEVICE_NICKNAME)
    }

    pub fn set_device_nickname(&self, nickname: &str) -> StoreResult<()> {
        self.set(Partition::Roamed, KEY_DEVICE_NICKNAME, nickname)
    }

    pub fn auto_open_links(&self) -> StoreResult<Option<bool>> {
        self.get_bool(Partition::Roamed, KEY_AUTO_OPEN_LINKS)
    }

    pub fn set_auto_open_links(&self, value: bool) -> StoreResult<()> {
        self.set(
            Partition::Roamed,
            KEY_AUTO_OPEN_LINKS,
            if value { "true" } else { "false" },
        )
    }

    pub fn notification_timeout_ms(&self) -> StoreResult<Option<u64>> {
        match self.get(Partition::Roamed, KEY_NOTIFICATION_TIMEOUT_MS)? {
            None => Ok(None),
            Some(raw) => raw
                .parse::<u64>()
                .map(Some)
                .map_err(|e| StoreError::InvalidValue {
                    key: KEY_NOTIFICATION_TIMEOUT_MS.to_owned(),
                    detail: e.to_string(),
                }),
        }
    }

    fn get_bool(&self, partition: Partition, key: &str) -> StoreResult<Option<bool>> {
        Ok(self.get(partition, key)?.map(|raw| raw == "true"))
    }

    // -----------------------------------------------------------------------
    // Logout
    // -----------------------------------------------------------------------

    /// Remove everything tied to the authenticated session.
    ///
    /// Roamed preferences survive: logging out does not forget the user's
    /// nickname or auto-open choices.
    pub fn clear_session_state(&self) -> StoreResult<()> {
        for key in [
            KEY_TOKEN,
            KEY_DEVICE_IDEN,
            KEY_CUTOFF,
            KEY_CACHED_SESSION,
            KEY_REGISTRATION_IN_PROGRESS,
        ] {
            self.remove(Partition::Local, key)?;
        }
        Ok(())
    }
}
