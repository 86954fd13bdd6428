//! Address bans, consulted once at admission.
//!
//! A ban covers a single address (`subnet == 0`) or a prefix of `subnet`
//! bits. IPv4-mapped IPv6 addresses are compared as IPv4. Expired entries
//! stay listed but no longer match. Expiration times are UTC.

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::storage::{ServerStore, StoreError};

/// Format of expiration and creation timestamps on the admin surface.
pub const BAN_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum BanError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("subnet prefix {0} is too long for this address family")]
    InvalidSubnet(u8),

    #[error("invalid expiration time {0:?} (expected YYYY-MM-DD HH:MM:SS)")]
    InvalidExpiration(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

mod ban_time {
    use super::BAN_TIME_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format(BAN_TIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, BAN_TIME_FORMAT).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
    pub id: u64,
    #[serde(rename = "ip")]
    pub address: IpAddr,
    pub subnet: u8,
    #[serde(with = "ban_time")]
    pub expires: NaiveDateTime,
    pub comment: String,
    #[serde(with = "ban_time")]
    pub added: NaiveDateTime,
}

impl BanEntry {
    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        self.expires <= now
    }

    /// Whether this entry bans `addr` at time `now`.
    pub fn matches(&self, addr: IpAddr, now: NaiveDateTime) -> bool {
        if self.is_expired(now) {
            return false;
        }
        let banned = self.address.to_canonical();
        let addr = addr.to_canonical();
        if self.subnet == 0 {
            return banned == addr;
        }
        match (banned, addr) {
            (IpAddr::V4(banned), IpAddr::V4(addr)) => {
                let bits = u32::from(self.subnet.min(32));
                let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
                u32::from(banned) & mask == u32::from(addr) & mask
            }
            (IpAddr::V6(banned), IpAddr::V6(addr)) => {
                let bits = u32::from(self.subnet.min(128));
                let mask = u128::MAX.checked_shl(128 - bits).unwrap_or(0);
                u128::from(banned) & mask == u128::from(addr) & mask
            }
            _ => false,
        }
    }
}

/// Parse an expiration time in `YYYY-MM-DD HH:MM:SS` form.
pub fn parse_expiration(raw: &str) -> Result<NaiveDateTime, BanError> {
    NaiveDateTime::parse_from_str(raw.trim(), BAN_TIME_FORMAT)
        .map_err(|_| BanError::InvalidExpiration(raw.to_string()))
}

#[derive(Debug)]
struct BanTable {
    entries: BTreeMap<u64, BanEntry>,
    /// Only ever grows, so a deleted id is never handed out again
    next_id: u64,
}

/// The server-wide ban list.
pub struct BanRegistry {
    table: RwLock<BanTable>,
    store: Option<Arc<ServerStore>>,
}

impl Default for BanRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BanRegistry {
    /// An in-memory ban list.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(BanTable {
                entries: BTreeMap::new(),
                next_id: 1,
            }),
            store: None,
        }
    }

    /// A ban list backed by `store`, loaded from it.
    pub fn with_store(store: Arc<ServerStore>) -> Result<Self, BanError> {
        let entries: BTreeMap<u64, BanEntry> = store
            .load_bans()?
            .into_iter()
            .map(|entry| (entry.id, entry))
            .collect();
        let next_id = entries
            .keys()
            .next_back()
            .map_or(1, |last| last + 1)
            .max(store.load_next_ban_id()?);
        log::info!("Loaded {} ban entries", entries.len());
        Ok(Self {
            table: RwLock::new(BanTable { entries, next_id }),
            store: Some(store),
        })
    }

    /// First active ban covering `addr`, if any.
    pub async fn find(&self, addr: IpAddr) -> Option<BanEntry> {
        let now = Utc::now().naive_utc();
        self.table
            .read()
            .await
            .entries
            .values()
            .find(|entry| entry.matches(addr, now))
            .cloned()
    }

    pub async fn is_banned(&self, addr: IpAddr) -> bool {
        self.find(addr).await.is_some()
    }

    pub async fn add(
        &self,
        address: IpAddr,
        subnet: u8,
        expires: NaiveDateTime,
        comment: impl Into<String>,
    ) -> Result<BanEntry, BanError> {
        let max = if address.to_canonical().is_ipv4() { 32 } else { 128 };
        if subnet > max {
            return Err(BanError::InvalidSubnet(subnet));
        }

        let mut table = self.table.write().await;
        let id = table.next_id;
        let entry = BanEntry {
            id,
            address,
            subnet,
            expires,
            comment: comment.into(),
            added: Utc::now().naive_utc(),
        };
        if let Some(store) = &self.store {
            store.put_ban(&entry)?;
        }
        table.next_id = id + 1;
        table.entries.insert(id, entry.clone());
        log::info!(
            "Banned {address}/{subnet} until {} (id {id})",
            expires.format(BAN_TIME_FORMAT)
        );
        Ok(entry)
    }

    /// Remove a ban. Returns `false` if no entry had that id.
    pub async fn remove(&self, id: u64) -> Result<bool, BanError> {
        let mut table = self.table.write().await;
        if !table.entries.contains_key(&id) {
            return Ok(false);
        }
        if let Some(store) = &self.store {
            store.delete_ban(id)?;
        }
        table.entries.remove(&id);
        log::info!("Removed ban {id}");
        Ok(true)
    }

    pub async fn list(&self) -> Vec<BanEntry> {
        self.table.read().await.entries.values().cloned().collect()
    }
}
