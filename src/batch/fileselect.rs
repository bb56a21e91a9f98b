// SPDX-License-Identifier: Apache-2.0

//! Choosing the log files of a source directory that may hold records newer
//! than what was already processed.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::servicelog::{InputRecord, LineParser};

/// Time of the first record of `path`.
fn first_record_time(path: &Path, parser: &LineParser) -> Result<DateTime<Utc>> {
    let mut first = String::new();
    BufReader::new(File::open(path)?).read_line(&mut first)?;
    let rec = parser
        .parse_line(first.trim_end_matches(['\r', '\n']), 1)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    Ok(rec.time())
}

fn modified(path: &Path) -> Result<DateTime<Utc>> {
    Ok(DateTime::<Utc>::from(path.metadata()?.modified()?))
}

/// Whether `path` can contain records newer than `min_time`. A file
/// starting before `min_time` still matches when `strict` is off and it was
/// modified after `min_time`.
pub fn file_matches(
    path: &Path,
    min_time: DateTime<Utc>,
    strict: bool,
    parser: &LineParser,
) -> Result<bool> {
    let start = first_record_time(path, parser)?;
    if start >= min_time {
        return Ok(true);
    }
    Ok(!strict && modified(path)? >= min_time)
}

/// Files to process for `src`, ordered by name. A plain file is always
/// returned as is.
pub fn select_files(
    src: &Path,
    min_time: Option<DateTime<Utc>>,
    strict: bool,
    parser: &LineParser,
) -> Result<Vec<PathBuf>> {
    if !src.is_dir() {
        return Ok(vec![src.to_path_buf()]);
    }
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(src)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    candidates.sort();

    let Some(min_time) = min_time else {
        return Ok(candidates);
    };
    let mut ans = Vec::with_capacity(candidates.len());
    for path in candidates {
        match file_matches(&path, min_time, strict, parser) {
            Ok(true) => ans.push(path),
            Ok(false) => debug!(path = ?path, "Log file holds only processed records"),
            Err(e) => warn!(path = ?path, error = %e, "Failed to check log file"),
        }
    }
    Ok(ans)
}
