// SPDX-License-Identifier: Apache-2.0

use std::io::Write;

use crate::error::Result;
use crate::save::Sink;
use crate::servicelog::BoundOutputRecord;

/// Prints every record as a JSON line to stdout. Never reports a failure,
/// a record that cannot be serialized is printed as an error line instead.
#[derive(Debug, Default)]
pub struct DryRunSink;

impl DryRunSink {
    pub fn new() -> Self {
        Self
    }
}

impl Sink for DryRunSink {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    fn write_chunk(&self, chunk: &[BoundOutputRecord]) -> Result<()> {
        let mut out = std::io::stdout().lock();
        for rec in chunk {
            let line = match rec.record.to_json() {
                Ok(json) => json,
                Err(e) => format!("{{\"error\": {:?}}}", e.to_string()),
            };
            let _ = writeln!(out, "{}", line);
        }
        let _ = out.flush();
        Ok(())
    }
}
