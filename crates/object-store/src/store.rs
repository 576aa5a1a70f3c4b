//! The five-operation blob store interface.
//!
//! Everything above this crate talks to storage only through [`BlobStore`]:
//! list, read, write, stat and delete on slash-separated names. There is no
//! compare-and-swap, no transaction and no change notification.

use std::fmt::Debug;
use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// A single entry returned by [`BlobStore::list`] or [`BlobStore::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Last path segment (the file or folder name, not the full path)
    pub name: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub is_dir: bool,
}

/// Narrows a directory listing.
///
/// Hidden names (starting with `.`) are skipped unless `include_hidden` is set,
/// so touch markers and lock folders never show up as data.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    /// Only names strictly greater than this one
    pub after_name: Option<String>,
    /// Only entries modified strictly after this instant
    pub after: Option<DateTime<Utc>>,
    pub only_files: bool,
    pub only_folders: bool,
    pub max_results: Option<usize>,
    pub include_hidden: bool,
}

impl Filter {
    pub fn files() -> Self {
        Self {
            only_files: true,
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_after_name(mut self, name: impl Into<String>) -> Self {
        self.after_name = Some(name.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.include_hidden = true;
        self
    }

    /// Whether an entry passes every criterion except `max_results`.
    pub fn matches(&self, entry: &Entry) -> bool {
        if !self.include_hidden && entry.name.starts_with('.') {
            return false;
        }
        if self.only_files && entry.is_dir {
            return false;
        }
        if self.only_folders && !entry.is_dir {
            return false;
        }
        if let Some(prefix) = &self.prefix {
            if !entry.name.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(suffix) = &self.suffix {
            if !entry.name.ends_with(suffix.as_str()) {
                return false;
            }
        }
        if let Some(after_name) = &self.after_name {
            if entry.name.as_str() <= after_name.as_str() {
                return false;
            }
        }
        if let Some(after) = &self.after {
            if !entry.is_dir && entry.mod_time <= *after {
                return false;
            }
        }
        true
    }

    /// Sort lexicographically, filter, and truncate to `max_results`.
    pub fn apply(&self, mut entries: Vec<Entry>) -> Vec<Entry> {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let matched = entries.into_iter().filter(|e| self.matches(e));
        match self.max_results {
            Some(max) => matched.take(max).collect(),
            None => matched.collect(),
        }
    }
}

/// A passive, shared blob store.
///
/// Implementations must report `BlobStoreError::NotFound` for missing names
/// on `read` and `stat`, and must tolerate deleting a missing name.
#[async_trait]
pub trait BlobStore: Debug + Send + Sync {
    /// A stable identifier for this store, used to key local caches.
    fn id(&self) -> &str;

    /// List the direct children of `dir`, sorted by name.
    async fn list(&self, dir: &str, filter: &Filter) -> Result<Vec<Entry>>;

    /// Read a blob, optionally restricted to a byte range.
    async fn read(&self, name: &str, range: Option<Range<u64>>) -> Result<Bytes>;

    async fn write(&self, name: &str, data: Bytes) -> Result<()>;

    async fn stat(&self, name: &str) -> Result<Entry>;

    async fn delete(&self, name: &str) -> Result<()>;
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(name: &str, is_dir: bool) -> Entry {
        Entry {
            name: name.to_string(),
            size: 0,
            mod_time: Utc::now(),
            is_dir,
        }
    }

    #[test]
    fn test_filter_sorts_and_skips_hidden() {
        let entries = vec![
            entry("b", false),
            entry(".touch", false),
            entry("a", false),
            entry(".lock", true),
        ];
        let names: Vec<_> = Filter::default()
            .apply(entries)
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_filter_criteria() {
        let entries = vec![
            entry("chain-01.lock", false),
            entry("chain-02.lock", false),
            entry("other-01.lock", false),
            entry("sub", true),
        ];

        let filter = Filter::files().with_prefix("chain-");
        assert_eq!(filter.apply(entries.clone()).len(), 2);

        let filter = Filter::files().with_after_name("chain-01.lock");
        let names: Vec<_> = filter.apply(entries.clone()).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["chain-02.lock", "other-01.lock"]);

        let filter = Filter {
            only_folders: true,
            ..Default::default()
        };
        assert_eq!(filter.apply(entries.clone()).len(), 1);

        let filter = Filter {
            suffix: Some(".lock".to_string()),
            max_results: Some(1),
            ..Default::default()
        };
        let names: Vec<_> = filter.apply(entries).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["chain-01.lock"]);
    }
}
