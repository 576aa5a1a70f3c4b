//! Dirty bits: a zero-byte `<dir>/.touch` whose store mtime says when
//! anything under `dir` last changed.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::error::SafeError;
use super::Safe;

pub const TOUCH_FILE: &str = ".touch";

/// What [`Safe::check_touch`] saw, to acknowledge once the caller has read
/// the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TouchCheck {
    pub updated: bool,
    pub stamp: Option<DateTime<Utc>>,
}

fn marker(dir: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), TOUCH_FILE)
}

impl Safe {
    /// Modification time of a directory's marker, `None` when it has none.
    async fn remote_stamp(&self, dir: &str) -> Result<Option<DateTime<Utc>>, SafeError> {
        match self.store.stat(&marker(dir)).await {
            Ok(entry) => Ok(Some(entry.mod_time)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn check_touch(&self, dir: &str) -> Result<TouchCheck, SafeError> {
        let stamp = self.remote_stamp(dir).await?;
        let known = self.cache.touch_stamp(&self.store_id, dir).await?;
        let updated = match (stamp, known) {
            (Some(stamp), Some(known)) => stamp.timestamp_micros() != known.timestamp_micros(),
            _ => true,
        };
        Ok(TouchCheck { updated, stamp })
    }

    /// Record that everything up to `check` has been read.
    pub(crate) async fn acknowledge(&self, dir: &str, check: TouchCheck) -> Result<(), SafeError> {
        if let Some(stamp) = check.stamp {
            self.cache.set_touch_stamp(&self.store_id, dir, stamp).await?;
        }
        Ok(())
    }

    /// True when any of `dirs` changed since this peer last synchronized it.
    pub async fn is_updated(&self, dirs: &[&str]) -> Result<bool, SafeError> {
        for dir in dirs {
            if self.check_touch(dir).await?.updated {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Mark `dirs` as changed for every peer, this one included.
    pub async fn touch(&self, dirs: &[&str]) -> Result<(), SafeError> {
        for dir in dirs {
            self.store.write(&marker(dir), Bytes::new()).await?;
        }
        Ok(())
    }
}
