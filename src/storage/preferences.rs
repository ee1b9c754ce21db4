//! Preferences Store
//!
//! SQLite-basierter Key-Value-Store für persistierte Geräte-Präferenzen.
//! Das Schema ist versioniert: Version 1 speicherte nur die nackte
//! Geräte-ID als String, Version 2 ein Objekt aus ID und Label. Die
//! Migration läuft genau einmal beim Öffnen, danach liest jeder Zugriff
//! ausschließlich das aktuelle Format.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Aktuelle Schema-Version
const SCHEMA_VERSION: i64 = 2;

/// Schlüssel für das bevorzugte Eingabegerät
pub const KEY_AUDIO_INPUT: &str = "audio_input_device";

/// Schlüssel für das bevorzugte Ausgabegerät
pub const KEY_AUDIO_OUTPUT: &str = "audio_output_device";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Corrupt preference value for key {0}")]
    CorruptValue(String),
}

// ============================================================================
// DEVICE PREFERENCE
// ============================================================================

/// Persistierte Geräte-Präferenz.
///
/// Das Label dient als Fallback-Schlüssel, weil Geräte-IDs zwischen
/// Sitzungen wechseln können.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DevicePreference {
    pub id: String,
    #[serde(default)]
    pub label: String,
}

// ============================================================================
// PREFERENCES STORE
// ============================================================================

/// Thread-sicherer Store (Mutex um die SQLite-Connection)
pub struct PreferencesStore {
    conn: Mutex<Connection>,
}

impl PreferencesStore {
    /// Öffnet oder erstellt den Store im Benutzer-Datenverzeichnis
    pub fn open() -> Result<Self, StorageError> {
        let db_path = Self::database_path()?;

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening preferences store at {:?}", db_path);
        Self::init(Connection::open(&db_path)?)
    }

    /// In-Memory Store (für Tests und Embedder ohne Persistenz)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    /// Ermittelt den Pfad zur Datenbank-Datei
    fn database_path() -> Result<PathBuf, StorageError> {
        let proj_dirs = directories::ProjectDirs::from("io", "chorus", "chorus").ok_or_else(
            || {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            },
        )?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("preferences.db");
        Ok(path)
    }

    /// Initialisiert Schema und führt ggf. die Legacy-Migration aus
    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS schema_meta (
                version INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        let version: Option<i64> = conn
            .query_row("SELECT version FROM schema_meta LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match version {
            None => {
                // Kein Versionseintrag: entweder frische Datenbank oder
                // Legacy-Format mit nackten Geräte-ID-Strings
                Self::migrate_legacy_values(&conn)?;
                conn.execute(
                    "INSERT INTO schema_meta (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
                tracing::info!("Preferences schema initialized at v{}", SCHEMA_VERSION);
            }
            Some(v) if v < SCHEMA_VERSION => {
                Self::migrate_legacy_values(&conn)?;
                conn.execute("UPDATE schema_meta SET version = ?1", params![SCHEMA_VERSION])?;
                tracing::info!("Preferences schema migrated v{} -> v{}", v, SCHEMA_VERSION);
            }
            Some(_) => {}
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Wickelt nackte Legacy-Strings in das aktuelle Objektformat
    fn migrate_legacy_values(conn: &Connection) -> Result<(), StorageError> {
        for key in [KEY_AUDIO_INPUT, KEY_AUDIO_OUTPUT] {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM preferences WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(raw) = raw else {
                continue;
            };

            if serde_json::from_str::<DevicePreference>(&raw).is_ok() {
                continue;
            }

            // Legacy: der Wert ist die Geräte-ID selbst
            let migrated = DevicePreference {
                id: raw,
                label: String::new(),
            };
            let value = serde_json::to_string(&migrated)
                .map_err(|_| StorageError::CorruptValue(key.to_string()))?;
            conn.execute(
                "UPDATE preferences SET value = ?2, updated_at = ?3 WHERE key = ?1",
                params![key, value, Utc::now().to_rfc3339()],
            )?;
            tracing::info!("Migrated legacy device preference for {}", key);
        }
        Ok(())
    }

    /// Liest eine Geräte-Präferenz
    pub fn preferred_device(&self, key: &str) -> Result<Option<DevicePreference>, StorageError> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM preferences WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|_| StorageError::CorruptValue(key.to_string())),
        }
    }

    /// Speichert eine Geräte-Präferenz
    pub fn set_preferred_device(
        &self,
        key: &str,
        device: &DevicePreference,
    ) -> Result<(), StorageError> {
        let value = serde_json::to_string(device)
            .map_err(|_| StorageError::CorruptValue(key.to_string()))?;

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO preferences (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Entfernt eine Präferenz
    pub fn clear(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM preferences WHERE key = ?1", params![key])?;
        Ok(())
    }

    #[cfg(test)]
    fn schema_version(&self) -> i64 {
        self.conn
            .lock()
            .query_row("SELECT version FROM schema_meta LIMIT 1", [], |row| {
                row.get(0)
            })
            .unwrap()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get_preference() {
        let store = PreferencesStore::open_in_memory().unwrap();

        let pref = DevicePreference {
            id: "dev-42".to_string(),
            label: "USB Microphone".to_string(),
        };
        store.set_preferred_device(KEY_AUDIO_INPUT, &pref).unwrap();

        let loaded = store.preferred_device(KEY_AUDIO_INPUT).unwrap().unwrap();
        assert_eq!(loaded, pref);
        assert!(store.preferred_device(KEY_AUDIO_OUTPUT).unwrap().is_none());
    }

    #[test]
    fn test_overwrite_preference() {
        let store = PreferencesStore::open_in_memory().unwrap();

        let first = DevicePreference {
            id: "a".to_string(),
            label: "A".to_string(),
        };
        let second = DevicePreference {
            id: "b".to_string(),
            label: "B".to_string(),
        };
        store.set_preferred_device(KEY_AUDIO_INPUT, &first).unwrap();
        store
            .set_preferred_device(KEY_AUDIO_INPUT, &second)
            .unwrap();

        let loaded = store.preferred_device(KEY_AUDIO_INPUT).unwrap().unwrap();
        assert_eq!(loaded, second);
    }

    #[test]
    fn test_legacy_bare_string_is_migrated_once() {
        // Legacy-Datenbank: Tabelle ohne Versionseintrag, Wert ist die
        // nackte Geräte-ID
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE preferences (key TEXT PRIMARY KEY, value TEXT NOT NULL, updated_at TEXT NOT NULL)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO preferences (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![KEY_AUDIO_INPUT, "Built-in Microphone", "2020-01-01T00:00:00Z"],
        )
        .unwrap();

        let store = PreferencesStore::init(conn).unwrap();
        assert_eq!(store.schema_version(), SCHEMA_VERSION);

        let pref = store.preferred_device(KEY_AUDIO_INPUT).unwrap().unwrap();
        assert_eq!(pref.id, "Built-in Microphone");
        assert_eq!(pref.label, "");
    }

    #[test]
    fn test_clear_preference() {
        let store = PreferencesStore::open_in_memory().unwrap();
        let pref = DevicePreference {
            id: "x".to_string(),
            label: "X".to_string(),
        };
        store.set_preferred_device(KEY_AUDIO_OUTPUT, &pref).unwrap();
        store.clear(KEY_AUDIO_OUTPUT).unwrap();
        assert!(store.preferred_device(KEY_AUDIO_OUTPUT).unwrap().is_none());
    }
}
