//! Host-facing aggregate functions.
//!
//! A host query engine drives one [`AggregateState`] per group: rows are
//! added with [`update`](AggregateState::update), partial states built on
//! different threads are merged with [`combine`](AggregateState::combine),
//! and the state is handed to [`Engine::finalize`](crate::engine::Engine::finalize)
//! once the group is complete.
//!
//! Every row carries its input arrival position. Finalize sees the rows in
//! that order no matter how partial states were merged, so rerank results do
//! not depend on thread scheduling.

use crate::prompt::{PromptKind, Selection};
use crate::row::Row;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// The four semantic aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    /// `llm_reduce`: summarize the group into one value.
    Reduce,
    /// `llm_first`: the most relevant row.
    First,
    /// `llm_last`: the least relevant row.
    Last,
    /// `llm_rerank`: the group's rows, most relevant first.
    Rerank,
}

impl AggregateKind {
    pub fn prompt_kind(self) -> PromptKind {
        match self {
            AggregateKind::Reduce => PromptKind::Reduce,
            AggregateKind::First => PromptKind::Select(Selection::First),
            AggregateKind::Last => PromptKind::Select(Selection::Last),
            AggregateKind::Rerank => PromptKind::Rerank,
        }
    }
}

impl FromStr for AggregateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "llm_reduce" | "reduce" => Ok(AggregateKind::Reduce),
            "llm_first" | "first" => Ok(AggregateKind::First),
            "llm_last" | "last" => Ok(AggregateKind::Last),
            "llm_rerank" | "rerank" => Ok(AggregateKind::Rerank),
            other => Err(format!(
                "unknown aggregate '{other}' (expected llm_reduce, llm_first, llm_last, or llm_rerank)"
            )),
        }
    }
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateKind::Reduce => "llm_reduce",
            AggregateKind::First => "llm_first",
            AggregateKind::Last => "llm_last",
            AggregateKind::Rerank => "llm_rerank",
        };
        f.write_str(name)
    }
}

/// Accumulated rows of one aggregate group.
#[derive(Debug, Clone, Default)]
pub struct AggregateState {
    entries: Vec<(u64, Row)>,
}

impl AggregateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A state holding `rows` at positions `0..N`.
    pub fn from_rows(rows: impl IntoIterator<Item = Row>) -> Self {
        Self {
            entries: rows
                .into_iter()
                .enumerate()
                .map(|(i, row)| (i as u64, row))
                .collect(),
        }
    }

    /// Record `row`, which arrived at input `position`.
    pub fn update(&mut self, position: u64, row: Row) {
        self.entries.push((position, row));
    }

    /// Merge a partial state computed elsewhere.
    pub fn combine(&mut self, other: AggregateState) {
        self.entries.extend(other.entries);
    }

    /// The group's rows in arrival order. Rows sharing a position keep the
    /// order they were recorded in.
    pub fn into_rows(mut self) -> Vec<Row> {
        self.entries.sort_by_key(|(position, _)| *position);
        self.entries.into_iter().map(|(_, row)| row).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The value an aggregate produces for one group.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateOutput {
    /// Empty reduce or select group.
    Null,
    /// A reduce result.
    Value(Value),
    /// A selected input row.
    Row(Row),
    /// A rerank ordering, possibly empty.
    Rows(Vec<Row>),
}

impl AggregateOutput {
    pub fn to_json(&self) -> Value {
        match self {
            AggregateOutput::Null => Value::Null,
            AggregateOutput::Value(value) => value.clone(),
            AggregateOutput::Row(row) => Value::Object(row.fields().clone()),
            AggregateOutput::Rows(rows) => Value::Array(
                rows.iter()
                    .map(|row| Value::Object(row.fields().clone()))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: u64) -> Row {
        Row::default().with("id", id)
    }

    fn ids(rows: &[Row]) -> Vec<u64> {
        rows.iter()
            .map(|r| r.get("id").and_then(Value::as_u64).unwrap())
            .collect()
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            AggregateKind::Reduce,
            AggregateKind::First,
            AggregateKind::Last,
            AggregateKind::Rerank,
        ] {
            assert_eq!(kind.to_string().parse::<AggregateKind>().unwrap(), kind);
        }
        assert_eq!("LLM_FIRST".parse::<AggregateKind>().unwrap(), AggregateKind::First);
        assert!("llm_avg".parse::<AggregateKind>().is_err());
        assert_eq!(
            AggregateKind::Last.prompt_kind(),
            PromptKind::Select(Selection::Last)
        );
    }

    #[test]
    fn combine_order_does_not_change_row_order() {
        let mut even = AggregateState::new();
        let mut odd = AggregateState::new();
        for i in 0..6 {
            if i % 2 == 0 {
                even.update(i, row(i));
            } else {
                odd.update(i, row(i));
            }
        }

        let mut a = even.clone();
        a.combine(odd.clone());
        let mut b = odd;
        b.combine(even);

        assert_eq!(a.len(), 6);
        assert_eq!(ids(&a.into_rows()), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(ids(&b.into_rows()), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn from_rows_keeps_input_order() {
        let state = AggregateState::from_rows([row(7), row(3), row(5)]);
        assert_eq!(ids(&state.into_rows()), vec![7, 3, 5]);
    }

    #[test]
    fn outputs_render_as_json() {
        assert_eq!(AggregateOutput::Null.to_json(), Value::Null);
        assert_eq!(AggregateOutput::Value(json!("s")).to_json(), json!("s"));
        assert_eq!(AggregateOutput::Row(row(1)).to_json(), json!({"id": 1}));
        assert_eq!(
            AggregateOutput::Rows(vec![row(2), row(0)]).to_json(),
            json!([{"id": 2}, {"id": 0}])
        );
        assert_eq!(AggregateOutput::Rows(vec![]).to_json(), json!([]));
    }
}
