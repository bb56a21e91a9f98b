// SPDX-License-Identifier: Apache-2.0

//! Reading complete lines from a given offset.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};

/// One newline-terminated line with the byte span `[start, end)` it occupies,
/// terminator included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSpan {
    pub text: String,
    pub start: i64,
    pub end: i64,
}

/// Read at most `max_lines` complete lines starting at `offset`.
///
/// A trailing line without a terminator is not returned, it is still being
/// written. Lines longer than `max_line_size` bytes are cut for parsing but
/// keep their full span.
pub fn read_lines(
    file: &mut File,
    offset: i64,
    max_lines: usize,
    max_line_size: usize,
) -> io::Result<Vec<LineSpan>> {
    file.seek(SeekFrom::Start(offset.max(0) as u64))?;
    let mut reader = BufReader::new(file);
    let mut lines = Vec::new();
    let mut pos = offset.max(0);
    let mut buf = Vec::new();

    while lines.len() < max_lines {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 || buf.last() != Some(&b'\n') {
            break;
        }
        let mut content = &buf[..buf.len() - 1];
        if content.last() == Some(&b'\r') {
            content = &content[..content.len() - 1];
        }
        if content.len() > max_line_size {
            content = &content[..max_line_size];
        }
        lines.push(LineSpan {
            text: String::from_utf8_lossy(content).into_owned(),
            start: pos,
            end: pos + n as i64,
        });
        pos += n as i64;
    }
    Ok(lines)
}
