//! Row identity: an arena of rows addressed by synthetic integer ids.
//!
//! Every reduction episode labels its input rows once with ids `0..N-1`
//! ([`RowArena::label`]). The id lives beside the row, never inside its
//! payload, so it can't collide with a real field name. Rows synthesized by
//! reduce rounds are appended with fresh ids, keeping every id unique for the
//! life of the episode.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field-name → value payload of a row.
pub type RowFields = serde_json::Map<String, Value>;

/// Name of the single field carried by rows synthesized in reduce rounds.
pub const SUMMARY_FIELD: &str = "summary";

/// Synthetic position id of a row within one episode (`origin_id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RowId(pub usize);

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One logical record participating in a semantic aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    fields: RowFields,
}

impl Row {
    pub fn new(fields: RowFields) -> Self {
        Self { fields }
    }

    /// Build a row from a JSON object. Returns `None` for any other JSON type.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    /// A row holding one synthesized summary value.
    pub fn summary(value: Value) -> Self {
        let mut fields = RowFields::new();
        fields.insert(SUMMARY_FIELD.to_string(), value);
        Self { fields }
    }

    /// Builder-style field insertion.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &RowFields {
        &self.fields
    }

    pub fn into_fields(self) -> RowFields {
        self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl From<RowFields> for Row {
    fn from(fields: RowFields) -> Self {
        Self::new(fields)
    }
}

/// Out-of-band store of every row an episode has seen, addressed by [`RowId`].
///
/// Ids are only ever minted by the arena itself, so lookups by id are
/// infallible for the lifetime of the episode.
#[derive(Debug, Default)]
pub struct RowArena {
    rows: Vec<Row>,
}

impl RowArena {
    /// Label the input rows with ids `0..N-1` in input order.
    pub fn label(rows: Vec<Row>) -> (Self, Vec<RowId>) {
        let ids = (0..rows.len()).map(RowId).collect();
        (Self { rows }, ids)
    }

    /// Append a synthesized row and return its fresh id.
    pub fn push(&mut self, row: Row) -> RowId {
        self.rows.push(row);
        RowId(self.rows.len() - 1)
    }

    pub fn get(&self, id: RowId) -> &Row {
        &self.rows[id.0]
    }

    /// Resolve a sequence of ids to row references, preserving order.
    pub fn resolve(&self, ids: &[RowId]) -> Vec<&Row> {
        ids.iter().map(|id| self.get(*id)).collect()
    }

    /// Move a row out of the arena, leaving an empty row in its slot.
    pub fn take(&mut self, id: RowId) -> Row {
        std::mem::take(&mut self.rows[id.0])
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(name: &str) -> Row {
        Row::default().with("name", name)
    }

    #[test]
    fn label_assigns_input_positions() {
        let (arena, ids) = RowArena::label(vec![row("a"), row("b"), row("c")]);
        assert_eq!(ids, vec![RowId(0), RowId(1), RowId(2)]);
        assert_eq!(arena.get(RowId(1)).get("name"), Some(&json!("b")));
    }

    #[test]
    fn label_does_not_touch_payload() {
        let (arena, ids) = RowArena::label(vec![row("a")]);
        assert_eq!(arena.get(ids[0]).len(), 1);
        assert!(arena.get(ids[0]).get("origin_id").is_none());
    }

    #[test]
    fn pushed_rows_get_fresh_ids() {
        let (mut arena, ids) = RowArena::label(vec![row("a"), row("b")]);
        let s = arena.push(Row::summary(json!("s(a,b)")));
        assert_eq!(s, RowId(2));
        assert!(!ids.contains(&s));
        assert_eq!(arena.get(s).get(SUMMARY_FIELD), Some(&json!("s(a,b)")));
    }

    #[test]
    fn resolve_keeps_requested_order() {
        let (arena, _) = RowArena::label(vec![row("a"), row("b"), row("c")]);
        let names: Vec<_> = arena
            .resolve(&[RowId(2), RowId(0)])
            .iter()
            .map(|r| r.get("name").cloned())
            .collect();
        assert_eq!(names, vec![Some(json!("c")), Some(json!("a"))]);
    }

    #[test]
    fn take_returns_original_content() {
        let original = row("a").with("score", 3);
        let (mut arena, ids) = RowArena::label(vec![original.clone()]);
        assert_eq!(arena.take(ids[0]), original);
    }

    #[test]
    fn from_value_rejects_non_objects() {
        assert!(Row::from_value(json!([1, 2])).is_none());
        assert!(Row::from_value(json!({"a": 1})).is_some());
    }

    #[test]
    fn row_serializes_as_plain_object() {
        let json = serde_json::to_value(row("a")).unwrap();
        assert_eq!(json, json!({"name": "a"}));
    }
}
