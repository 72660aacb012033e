//! Loading rows from JSON and splitting them into aggregate groups.
//!
//! Input is either one JSON array of objects or JSON Lines (one object per
//! line; blank lines are skipped).

use crate::aggregate::AggregateState;
use crate::row::Row;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// Parse rows from a JSON array or JSON Lines text.
pub fn parse_rows(text: &str) -> Result<Vec<Row>, String> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        let values: Vec<Value> = serde_json::from_str(trimmed)
            .map_err(|e| format!("failed to parse JSON array of rows: {e}"))?;
        return values
            .into_iter()
            .enumerate()
            .map(|(i, value)| to_row(value, || format!("element {i}")))
            .collect();
    }

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            let value: Value = serde_json::from_str(line)
                .map_err(|e| format!("line {}: invalid JSON: {e}", i + 1))?;
            to_row(value, || format!("line {}", i + 1))
        })
        .collect()
}

/// Read rows from a file. See [`parse_rows`].
pub fn read_rows(path: impl AsRef<Path>) -> Result<Vec<Row>, String> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read rows file '{}': {e}", path.display()))?;
    parse_rows(&text)
}

fn to_row(value: Value, location: impl FnOnce() -> String) -> Result<Row, String> {
    match Row::from_value(value) {
        Some(row) => Ok(row),
        None => Err(format!("{}: expected a JSON object", location())),
    }
}

/// Split `rows` into groups keyed by the value of `group_by`, in order of
/// first appearance. Rows missing the field group under `null`. Without a
/// key every row lands in a single `null` group.
///
/// Each row is recorded at its input position, so groups finalize in
/// arrival order.
pub fn group_rows(rows: Vec<Row>, group_by: Option<&str>) -> Vec<(Value, AggregateState)> {
    let mut groups: Vec<(Value, AggregateState)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (position, row) in rows.into_iter().enumerate() {
        let key = group_by
            .and_then(|field| row.get(field).cloned())
            .unwrap_or(Value::Null);
        let slot = *index.entry(key.to_string()).or_insert_with(|| {
            groups.push((key, AggregateState::new()));
            groups.len() - 1
        });
        groups[slot].1.update(position as u64, row);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn parses_json_array() {
        let rows = parse_rows(r#"[{"id": 1}, {"id": 2}]"#).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("id"), Some(&json!(2)));
    }

    #[test]
    fn parses_json_lines_skipping_blanks() {
        let rows = parse_rows("{\"id\": 1}\n\n{\"id\": 2}\n").unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn rejects_non_objects_with_location() {
        let err = parse_rows("{\"id\": 1}\n[1, 2]\n").unwrap_err();
        assert!(err.contains("line 2"), "{err}");
        let err = parse_rows("[{\"id\": 1}, 3]").unwrap_err();
        assert!(err.contains("element 1"), "{err}");
        assert!(parse_rows("{not json}").is_err());
    }

    #[test]
    fn reads_rows_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"text\": \"a\"}}").unwrap();
        writeln!(file, "{{\"text\": \"b\"}}").unwrap();
        let rows = read_rows(file.path()).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(read_rows("/nonexistent/rows.jsonl").is_err());
    }

    #[test]
    fn groups_in_first_appearance_order() {
        let rows = parse_rows(
            r#"[{"k": "b", "id": 0}, {"k": "a", "id": 1}, {"k": "b", "id": 2}, {"id": 3}]"#,
        )
        .unwrap();
        let groups = group_rows(rows, Some("k"));
        let keys: Vec<&Value> = groups.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![&json!("b"), &json!("a"), &Value::Null]);

        let (_, b) = groups.into_iter().next().unwrap();
        let ids: Vec<_> = b.into_rows().iter().map(|r| r.get("id").cloned()).collect();
        assert_eq!(ids, vec![Some(json!(0)), Some(json!(2))]);
    }

    #[test]
    fn no_key_means_one_group() {
        let rows = parse_rows("{\"id\": 1}\n{\"id\": 2}").unwrap();
        let groups = group_rows(rows, None);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0, Value::Null);
        assert_eq!(groups[0].1.len(), 2);
    }
}
