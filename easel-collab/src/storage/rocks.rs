//! RocksDB-backed server state: runtime settings and the ban list.
//!
//! Column families:
//! - `settings`: the server's runtime settings (JSON, single key)
//! - `bans`    : ban entries (bincode, keyed by id as 8 bytes big-endian)
//! - `meta`    : counters (`next_ban_id`, u64 big-endian)
//!
//! Sessions themselves are not stored here; a session's history goes to its
//! recording file.

use rocksdb::{
    ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, IteratorMode, Options,
    SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ban::BanEntry;
use crate::config::Settings;

const CF_SETTINGS: &str = "settings";
const CF_BANS: &str = "bans";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_SETTINGS, CF_BANS, CF_META];

const SETTINGS_KEY: &[u8] = b"server";
const NEXT_BAN_ID_KEY: &[u8] = b"next_ban_id";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// fsync every write. Admin mutations are rare, so this defaults to on.
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("easel_data"),
            sync_writes: true,
            max_open_files: 64,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Config for testing: no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
            max_open_files: 16,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rocksdb::Error),

    #[error("missing column family {0}")]
    MissingColumnFamily(&'static str),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// Durable server state.
pub struct ServerStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl ServerStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened server store at {}", config.path.display());

        Ok(Self { db, config })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    // ─── Settings ─────────────────────────────────────────────────────

    pub fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        let cf = self.cf(CF_SETTINGS)?;
        let json = serde_json::to_vec(settings)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.db.put_cf_opt(cf, SETTINGS_KEY, json, &self.write_opts())?;
        Ok(())
    }

    /// Persisted settings, or `None` if never saved.
    pub fn load_settings(&self) -> Result<Option<Settings>, StoreError> {
        let cf = self.cf(CF_SETTINGS)?;
        match self.db.get_cf(cf, SETTINGS_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    // ─── Bans ─────────────────────────────────────────────────────────

    /// Store a ban and advance the id counter past it in one batch.
    pub fn put_ban(&self, entry: &BanEntry) -> Result<(), StoreError> {
        let value = bincode::serde::encode_to_vec(entry, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let next = entry.id.saturating_add(1).max(self.load_next_ban_id()?);

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_BANS)?, entry.id.to_be_bytes(), value);
        batch.put_cf(self.cf(CF_META)?, NEXT_BAN_ID_KEY, next.to_be_bytes());
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    /// Lowest id never handed out, 1 on a fresh store.
    pub fn load_next_ban_id(&self) -> Result<u64, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, NEXT_BAN_ID_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::Deserialization(format!("ban counter is {} bytes", bytes.len()))
                })?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(1),
        }
    }

    pub fn delete_ban(&self, id: u64) -> Result<(), StoreError> {
        let cf = self.cf(CF_BANS)?;
        self.db.delete_cf_opt(cf, id.to_be_bytes(), &self.write_opts())?;
        Ok(())
    }

    /// All stored ban entries in id order.
    pub fn load_bans(&self) -> Result<Vec<BanEntry>, StoreError> {
        let cf = self.cf(CF_BANS)?;
        let mut bans = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let (entry, _): (BanEntry, _) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            bans.push(entry);
        }
        Ok(bans)
    }
}
