// SPDX-License-Identifier: Apache-2.0

//! Byte ranges recorded in the worklog and the rules deciding which of two
//! progress reports for the same path wins.
//!
//! Confirmations reach the worklog out of order: an ignored line is
//! confirmed almost immediately while the sink may still be writing an
//! earlier chunk. The rules in [`FileRange::supersedes`] keep the stored
//! range from moving past bytes whose outcome is unknown, while still letting
//! it move forward once writes are confirmed.

use serde::{Deserialize, Serialize};

/// Identity used for paths the worklog has never seen.
pub const UNKNOWN_IDENTITY: i64 = -1;

/// Bytes `[seek_start, seek_end)` of the file with `identity` (inode) were read.
///
/// `confirmed` separates "read and dispatched" from "read and durably
/// written downstream".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRange {
    pub identity: i64,
    pub seek_start: i64,
    pub seek_end: i64,
    pub confirmed: bool,
}

impl FileRange {
    /// Sentinel returned for paths without a worklog entry.
    pub const UNKNOWN: FileRange = FileRange {
        identity: UNKNOWN_IDENTITY,
        seek_start: 0,
        seek_end: 0,
        confirmed: false,
    };

    pub fn new(identity: i64, seek_start: i64, seek_end: i64, confirmed: bool) -> Self {
        debug_assert!(seek_start <= seek_end, "range start past its end");
        Self {
            identity,
            seek_start,
            seek_end,
            confirmed,
        }
    }

    pub fn confirmed(identity: i64, seek_start: i64, seek_end: i64) -> Self {
        Self::new(identity, seek_start, seek_end, true)
    }

    pub fn unconfirmed(identity: i64, seek_start: i64, seek_end: i64) -> Self {
        Self::new(identity, seek_start, seek_end, false)
    }

    pub fn is_unknown(&self) -> bool {
        self.identity == UNKNOWN_IDENTITY
    }

    /// Where reading resumes after a restart. Unconfirmed bytes are read again.
    pub fn resume_offset(&self) -> i64 {
        if self.confirmed {
            self.seek_end
        } else {
            self.seek_start
        }
    }

    /// Smallest range covering both. Confirmed only if both are.
    pub fn union(&self, other: &FileRange) -> FileRange {
        FileRange {
            identity: other.identity,
            seek_start: self.seek_start.min(other.seek_start),
            seek_end: self.seek_end.max(other.seek_end),
            confirmed: self.confirmed && other.confirmed,
        }
    }

    /// Whether `self`, arriving as an update, replaces `current`.
    ///
    /// Rules, first match wins:
    /// 1. a different identity (rotation) always replaces;
    /// 2. an unconfirmed current range is replaced by anything starting at
    ///    or before it;
    /// 3. a confirmed current range is replaced by anything reaching at least
    ///    as far;
    /// 4. an unconfirmed update replaces a confirmed range, or any range it
    ///    ends before;
    /// 5. otherwise the update is stale.
    pub fn supersedes(&self, current: &FileRange) -> bool {
        if self.identity != current.identity {
            return true;
        }
        if !current.confirmed && current.seek_start >= self.seek_start {
            return true;
        }
        if current.confirmed && self.seek_end >= current.seek_end {
            return true;
        }
        !self.confirmed && (current.confirmed || self.seek_end < current.seek_end)
    }
}

impl Default for FileRange {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl std::fmt::Display for FileRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:[{}, {}){}",
            self.identity,
            self.seek_start,
            self.seek_end,
            if self.confirmed { "" } else { "?" }
        )
    }
}
