//! Memory provider seam.
//!
//! The core consumes a backend-agnostic `MemoryProvider` (vector store,
//! keyword index, flat files — the backend's business). Query results are
//! treated as an unsorted relevance list up to the requested limit.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::types::Message;

/// Metadata value marking entries written by the background curator.
pub const SOURCE_AUTO_CURATE: &str = "auto-curate";

/// One stored memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string(),
            content: content.into(),
            tags: Vec::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Mark this entry as produced by the auto-curator.
    pub fn curated(mut self) -> Self {
        self.metadata
            .insert("source".to_string(), SOURCE_AUTO_CURATE.to_string());
        self
    }
}

/// Backend-agnostic memory store.
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    async fn store(&self, entry: MemoryEntry) -> anyhow::Result<()>;

    /// Bulk write. The default loops over [`MemoryProvider::store`];
    /// backends with a batch API should override it.
    async fn store_batch(&self, entries: Vec<MemoryEntry>) -> anyhow::Result<()> {
        for entry in entries {
            self.store(entry).await?;
        }
        Ok(())
    }

    /// Top-`limit` entries relevant to `text`, in no particular order.
    async fn query(&self, text: &str, limit: usize) -> anyhow::Result<Vec<MemoryEntry>>;

    async fn delete(&self, id: &str) -> anyhow::Result<()>;

    /// Distill durable facts out of a finished exchange. Returns the number
    /// of entries written.
    async fn curate(&self, messages: &[Message]) -> anyhow::Result<usize>;

    /// Flush any buffered writes.
    async fn sync(&self) -> anyhow::Result<()>;

    fn name(&self) -> &str;

    /// Whether the backend is reachable right now.
    fn is_available(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curated_entry_is_tagged() {
        let entry = MemoryEntry::new("user prefers metric units").curated();
        assert_eq!(
            entry.metadata.get("source").map(String::as_str),
            Some(SOURCE_AUTO_CURATE)
        );
        assert_eq!(entry.id.len(), 26);
    }
}
