//! Test case file loading.
//!
//! Accepts tabular input as CSV or a JSON array of row objects. Two header
//! naming schemes are equivalent aliases: the Latin scheme
//! (`conversation_id`, `round`, `question`, `expected_answer`, `inputs`) and
//! the localized scheme (`对话ID`, `轮次`, `用户问题`, `期待回复`, `输入参数`).
//! Rows keep their input order; validation happens in the grouper.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaseFileError {
    #[error("failed to read case file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported case file extension: {0}")]
    UnsupportedExtension(String),
}

/// One raw input row, prior to grouping and validation.
///
/// Required fields are kept optional here so a defective row can be carried
/// to the grouper, which invalidates the enclosing group instead of aborting
/// the whole load.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaseRow {
    #[serde(default, alias = "conversation_id", alias = "对话ID")]
    pub group_id: Option<String>,
    #[serde(
        alias = "round",
        alias = "轮次",
        deserialize_with = "de_turn_number",
        default
    )]
    pub turn_number: Option<u32>,
    #[serde(default, alias = "question", alias = "用户问题")]
    pub user_message: Option<String>,
    #[serde(default, alias = "expected_answer", alias = "期待回复")]
    pub expected_reply: Option<String>,
    /// JSON-object-encoded string; decoded by the grouper.
    #[serde(default, alias = "inputs", alias = "输入参数")]
    pub extra_inputs: Option<String>,
}

/// Accept a turn number as an integer or a numeric string; anything else
/// (including a blank cell) loads as None and is caught by required-field
/// validation, so one bad cell does not abort the whole file.
fn de_turn_number<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse::<u32>().ok(),
        _ => None,
    })
}

/// Load rows from a case file, dispatching on extension (.csv or .json).
pub fn load_rows(path: &Path) -> Result<Vec<CaseRow>, CaseFileError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => load_csv(path),
        Some("json") => load_json(path),
        other => Err(CaseFileError::UnsupportedExtension(
            other.unwrap_or("<none>").to_string(),
        )),
    }
}

/// Load rows from a CSV file with a header row.
pub fn load_csv(path: &Path) -> Result<Vec<CaseRow>, CaseFileError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)?;

    let mut rows = Vec::new();
    for result in reader.deserialize::<CaseRow>() {
        rows.push(normalize(result?));
    }
    Ok(rows)
}

/// Load rows from a JSON array of row objects.
pub fn load_json(path: &Path) -> Result<Vec<CaseRow>, CaseFileError> {
    let content = std::fs::read_to_string(path)?;
    let rows: Vec<CaseRow> = serde_json::from_str(&content)?;
    Ok(rows.into_iter().map(normalize).collect())
}

/// Treat whitespace-only values as absent so required-field checks catch them.
fn normalize(mut row: CaseRow) -> CaseRow {
    row.group_id = row.group_id.filter(|s| !s.trim().is_empty());
    row.user_message = row.user_message.filter(|s| !s.trim().is_empty());
    row.expected_reply = row.expected_reply.filter(|s| !s.trim().is_empty());
    row.extra_inputs = row.extra_inputs.filter(|s| !s.trim().is_empty());
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_csv_with_latin_headers() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "cases.csv",
            "conversation_id,round,question,expected_answer\n\
             g1,1,hello,hi there\n\
             g1,2,how are you,\n",
        );

        let rows = load_rows(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].group_id.as_deref(), Some("g1"));
        assert_eq!(rows[0].turn_number, Some(1));
        assert_eq!(rows[0].user_message.as_deref(), Some("hello"));
        assert_eq!(rows[0].expected_reply.as_deref(), Some("hi there"));
        // Empty expected_answer cell becomes None, not "".
        assert_eq!(rows[1].expected_reply, None);
    }

    #[test]
    fn loads_csv_with_localized_headers() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "cases.csv",
            "对话ID,轮次,用户问题,期待回复\n\
             会话A,1,你好,您好\n",
        );

        let rows = load_rows(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group_id.as_deref(), Some("会话A"));
        assert_eq!(rows[0].turn_number, Some(1));
        assert_eq!(rows[0].user_message.as_deref(), Some("你好"));
        assert_eq!(rows[0].expected_reply.as_deref(), Some("您好"));
    }

    #[test]
    fn loads_json_array() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "cases.json",
            r#"[
                {"conversation_id": "g1", "round": 1, "question": "hello",
                 "inputs": "{\"lang\": \"en\"}"}
            ]"#,
        );

        let rows = load_rows(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].extra_inputs.as_deref(), Some("{\"lang\": \"en\"}"));
    }

    #[test]
    fn missing_required_cells_load_as_none() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "cases.csv",
            "conversation_id,round,question\n\
             ,1,orphaned row\n",
        );

        let rows = load_rows(&path).unwrap();
        assert_eq!(rows[0].group_id, None);
        assert_eq!(rows[0].user_message.as_deref(), Some("orphaned row"));
    }

    #[test]
    fn garbage_turn_number_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "cases.csv",
            "conversation_id,round,question\n\
             g1,not-a-number,hello\n",
        );

        let rows = load_rows(&path).unwrap();
        assert_eq!(rows[0].turn_number, None);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "cases.xlsx", "binary");
        let err = load_rows(&path).unwrap_err();
        assert!(matches!(err, CaseFileError::UnsupportedExtension(_)));
    }
}
