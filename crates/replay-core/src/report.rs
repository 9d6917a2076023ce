//! Result report TSV generation.
//!
//! Writes the output record schema for completed test cases:
//! all input fields plus `actual_reply`, `latency_seconds`, `final_status`,
//! `error_detail`, `completed_at`.

use crate::types::ResultRecord;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// TSV header row.
const HEADER: &str = "group_id\tturn_number\tuser_message\texpected_reply\textra_inputs\t\
actual_reply\tlatency_seconds\tfinal_status\terror_detail\tcompleted_at";

/// Sanitize a field value to prevent TSV breakage.
fn sanitize_field(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

fn to_tsv_line(record: &ResultRecord) -> String {
    let extra_inputs = record
        .extra_inputs
        .as_ref()
        .map(|m| serde_json::Value::Object(m.clone()).to_string())
        .unwrap_or_default();

    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{:.3}\t{}\t{}\t{}",
        sanitize_field(&record.group_id),
        record.turn_number,
        sanitize_field(&record.user_message),
        sanitize_field(record.expected_reply.as_deref().unwrap_or("")),
        sanitize_field(&extra_inputs),
        sanitize_field(&record.actual_reply),
        record.latency_seconds,
        record.final_status.as_str(),
        sanitize_field(record.error_detail.as_deref().unwrap_or("")),
        record.completed_at.to_rfc3339(),
    )
}

/// Writer for result report TSV files.
pub struct ReportWriter {
    writer: BufWriter<File>,
}

impl std::fmt::Debug for ReportWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportWriter")
            .field("writer", &"BufWriter<File>")
            .finish()
    }
}

impl ReportWriter {
    /// Create a new report writer, writing the header if the file is new.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        let exists = path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);

        if !exists {
            writeln!(writer, "{HEADER}")?;
        }

        Ok(Self { writer })
    }

    /// Write a single result record.
    pub fn write_record(&mut self, record: &ResultRecord) -> std::io::Result<()> {
        writeln!(self.writer, "{}", to_tsv_line(record))
    }

    /// Flush pending writes.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Write a complete report file in one pass.
pub fn write_report(path: &Path, records: &[ResultRecord]) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "{HEADER}")?;
    for record in records {
        writeln!(writer, "{}", to_tsv_line(record))?;
    }

    writer.flush()
}
