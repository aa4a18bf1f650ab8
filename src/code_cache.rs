// src/code_cache.rs
//! Common code groups and detail codes, loaded once and served from memory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::info;

use crate::cache_stats::{CacheStats, CacheStatsSnapshot, StatsSource};
use crate::error::{RateLimiterError, Result, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeGroup {
    pub codecd: String,
    pub codenm: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Code {
    /// Group the code belongs to
    pub pcodecd: String,
    pub codecd: String,
    pub codenm: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeTable {
    #[serde(default)]
    pub groups: Vec<CodeGroup>,
    #[serde(default)]
    pub codes: Vec<Code>,
}

impl CodeTable {
    pub fn entry_count(&self) -> usize {
        self.groups.len() + self.codes.len()
    }
}

/// Where the code table comes from
#[async_trait]
pub trait CodeLoader: Send + Sync + Debug {
    async fn load(&self) -> Result<CodeTable>;
}

/// A fixed table
#[derive(Debug, Clone, Default)]
pub struct StaticCodeLoader {
    table: CodeTable,
}

impl StaticCodeLoader {
    pub fn new(table: CodeTable) -> Self {
        Self { table }
    }
}

#[async_trait]
impl CodeLoader for StaticCodeLoader {
    async fn load(&self) -> Result<CodeTable> {
        Ok(self.table.clone())
    }
}

/// A JSON file shaped like `{"groups": [...], "codes": [...]}`
#[derive(Debug, Clone)]
pub struct JsonFileCodeLoader {
    path: PathBuf,
}

impl JsonFileCodeLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CodeLoader for JsonFileCodeLoader {
    async fn load(&self) -> Result<CodeTable> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            RateLimiterError::Config(format!(
                "cannot read code table {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            RateLimiterError::Storage(StorageError::Serialization(format!(
                "{}: {}",
                self.path.display(),
                e
            )))
        })
    }
}

/// Owns the in-memory code table.
///
/// The first [`ensure_loaded`](Self::ensure_loaded) loads the table; callers
/// arriving meanwhile wait for that load instead of starting their own.
/// Lookups never load: before the first load they simply find nothing.
#[derive(Debug)]
pub struct CodeCacheService {
    loader: Arc<dyn CodeLoader>,
    table: RwLock<Option<Arc<CodeTable>>>,
    load_lock: tokio::sync::Mutex<()>,
    stats: CacheStats,
}

impl CodeCacheService {
    pub fn new(loader: Arc<dyn CodeLoader>) -> Self {
        Self {
            loader,
            table: RwLock::new(None),
            load_lock: tokio::sync::Mutex::new(()),
            stats: CacheStats::new(),
        }
    }

    /// Loads the table unless it is already loaded
    pub async fn ensure_loaded(&self) -> Result<Arc<CodeTable>> {
        if let Some(table) = self.snapshot() {
            return Ok(table);
        }

        let _loading = self.load_lock.lock().await;
        if let Some(table) = self.snapshot() {
            return Ok(table);
        }
        self.load_now().await
    }

    /// Reloads the table even if one is loaded
    pub async fn refresh(&self) -> Result<Arc<CodeTable>> {
        let _loading = self.load_lock.lock().await;
        self.load_now().await
    }

    /// Drops the table; the next `ensure_loaded` reloads it
    pub fn invalidate(&self) {
        let dropped = self.write_table().take();
        if let Some(table) = dropped {
            self.stats.record_evictions(table.entry_count() as u64);
            info!(entries = table.entry_count(), "Code cache invalidated");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot().is_some()
    }

    pub fn snapshot(&self) -> Option<Arc<CodeTable>> {
        self.read_table().clone()
    }

    /// Name of a code group, or an empty string when unknown
    pub fn code_group_name(&self, codecd: &str) -> String {
        let found = self.snapshot().and_then(|table| {
            table
                .groups
                .iter()
                .find(|group| group.codecd == codecd)
                .map(|group| group.codenm.clone())
        });
        self.count(found).unwrap_or_default()
    }

    /// Name of a detail code within a group, or an empty string when unknown
    pub fn code_name(&self, pcodecd: &str, codecd: &str) -> String {
        let found = self.snapshot().and_then(|table| {
            table
                .codes
                .iter()
                .find(|code| code.pcodecd == pcodecd && code.codecd == codecd)
                .map(|code| code.codenm.clone())
        });
        self.count(found).unwrap_or_default()
    }

    /// Detail codes of one group, in table order
    pub fn codes_in_group(&self, pcodecd: &str) -> Vec<Code> {
        let codes: Vec<Code> = self
            .snapshot()
            .map(|table| {
                table
                    .codes
                    .iter()
                    .filter(|code| code.pcodecd == pcodecd)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if codes.is_empty() {
            self.stats.record_miss();
        } else {
            self.stats.record_hit();
        }
        codes
    }

    pub fn all_codes(&self) -> Vec<Code> {
        self.snapshot()
            .map(|table| table.codes.clone())
            .unwrap_or_default()
    }

    async fn load_now(&self) -> Result<Arc<CodeTable>> {
        let table = Arc::new(self.loader.load().await?);
        info!(
            groups = table.groups.len(),
            codes = table.codes.len(),
            "Code cache loaded"
        );
        *self.write_table() = Some(Arc::clone(&table));
        Ok(table)
    }

    fn count<T>(&self, found: Option<T>) -> Option<T> {
        match found {
            Some(_) => self.stats.record_hit(),
            None => self.stats.record_miss(),
        }
        found
    }

    fn read_table(&self) -> std::sync::RwLockReadGuard<'_, Option<Arc<CodeTable>>> {
        self.table
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_table(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<CodeTable>>> {
        self.table
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StatsSource for CodeCacheService {
    fn estimated_size(&self) -> u64 {
        self.snapshot()
            .map(|table| table.entry_count() as u64)
            .unwrap_or(0)
    }

    fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}
