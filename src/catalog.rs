//! Catalog discovery input
//!
//! The archive retriever is an external collaborator; it hands its results
//! over as a list of [`CatalogEntry`] values, usually a JSON file.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::pipeline::{InvalidItemId, ItemId, ItemRecord};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse catalog {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    InvalidId(#[from] InvalidItemId),
    #[error("catalog lists {0} more than once")]
    Duplicate(ItemId),
}

/// One item as listed by the upstream archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: ItemId,
    pub title: String,
    /// Accepts `YYYY-MM-DD` or RFC 3339
    #[serde(deserialize_with = "date_or_datetime")]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub source_url: Option<String>,
}

impl CatalogEntry {
    pub fn new(id: &str, title: impl Into<String>, date: DateTime<Utc>) -> Result<Self, CatalogError> {
        Ok(Self {
            id: ItemId::new(id)?,
            title: title.into(),
            date,
            source_url: None,
        })
    }

    /// Fresh `discovered` record for this entry at catalog position `sequence`
    pub fn into_record(self, sequence: u64, now: DateTime<Utc>) -> ItemRecord {
        let mut record = ItemRecord::discovered(self.id, self.title, self.date, now);
        record.source_url = self.source_url;
        record.sequence = sequence;
        record
    }
}

fn date_or_datetime<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| serde::de::Error::custom(format!("invalid catalog date '{raw}'")))
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn entries(&self) -> Result<Vec<CatalogEntry>, CatalogError>;
}

/// JSON array of catalog entries on disk
pub struct JsonCatalogFile {
    path: PathBuf,
}

impl JsonCatalogFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl CatalogSource for JsonCatalogFile {
    async fn entries(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|source| CatalogError::Io {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| CatalogError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

/// Fixed in-memory catalog
#[async_trait]
impl CatalogSource for Vec<CatalogEntry> {
    async fn entries(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        Ok(self.clone())
    }
}

/// Sort entries into catalog order and reject duplicate ids
pub fn in_catalog_order(mut entries: Vec<CatalogEntry>) -> Result<Vec<CatalogEntry>, CatalogError> {
    entries.sort_by(|a, b| (a.date, &a.id).cmp(&(b.date, &b.id)));
    let mut seen = std::collections::HashSet::new();
    for entry in &entries {
        if !seen.insert(&entry.id) {
            return Err(CatalogError::Duplicate(entry.id.clone()));
        }
    }
    Ok(entries)
}
