//! Persistent storage.
//!
//! ```text
//! ┌───────────────┐  settings, bans   ┌──────────────────────────────┐
//! │ SettingsHandle│ ────────────────► │ ServerStore (RocksDB)        │
//! │ BanRegistry   │                   │  CF "settings": JSON         │
//! └───────────────┘                   │  CF "bans":     bincode      │
//!                                     └──────────────────────────────┘
//! ┌───────────────┐  committed frames ┌──────────────────────────────┐
//! │ Session       │ ────────────────► │ RecordingSink (writer task)  │
//! └───────────────┘                   │  LZ4 + checksum per record   │
//!                                     └──────────────────────────────┘
//! ```

pub mod recording;
pub mod rocks;

pub use recording::{
    expand_pattern, RecordEntry, RecordingError, RecordingReader, RecordingSink,
    DEFAULT_FILE_PATTERN,
};
pub use rocks::{ServerStore, StoreConfig, StoreError};
