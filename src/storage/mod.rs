//! Storage Module - Persistierte Präferenzen
//!
//! Versionierter SQLite-Key-Value-Store für Geräte-Präferenzen.

pub mod preferences;

pub use preferences::{
    DevicePreference, PreferencesStore, StorageError, KEY_AUDIO_INPUT, KEY_AUDIO_OUTPUT,
};
