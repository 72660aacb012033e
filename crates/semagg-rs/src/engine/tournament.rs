//! Tournament reducer: hierarchical fold for reduce and select.
//!
//! Each round partitions the working set, asks for one item per batch, and
//! the concatenated outputs become the next working set. The fold stops when
//! a round produces exactly one row.

use super::executor::Episode;
use crate::error::{EngineError, Result};
use crate::model::{CompletionItems, OutputType};
use crate::row::{Row, RowArena, RowId};
use serde_json::Value;
use std::ops::Range;

/// Summarize `rows` into one value. A single row is still summarized by one
/// provider call; an empty group yields `None` without a call.
pub(crate) async fn reduce(episode: &mut Episode<'_>, rows: Vec<Row>) -> Result<Option<Value>> {
    if rows.is_empty() {
        return Ok(None);
    }
    let (mut arena, mut working) = RowArena::label(rows);
    loop {
        ensure_progress(episode, working.len())?;
        let outputs = fold_round(episode, &arena, &working, OutputType::String).await?;
        ensure_shrank(episode, working.len(), outputs.len())?;

        let mut values: Vec<Value> = outputs.into_iter().map(|(_, value)| value).collect();
        if values.len() == 1 {
            return Ok(values.pop());
        }
        working = values
            .into_iter()
            .map(|value| arena.push(Row::summary(value)))
            .collect();
    }
}

/// Pick one of `rows`. The returned row is always one of the inputs,
/// unchanged. Zero or one input rows never reach the provider.
pub(crate) async fn select(episode: &mut Episode<'_>, rows: Vec<Row>) -> Result<Option<Row>> {
    let (mut arena, mut working) = RowArena::label(rows);
    while working.len() > 1 {
        ensure_progress(episode, working.len())?;
        let outputs = fold_round(episode, &arena, &working, OutputType::Integer).await?;
        ensure_shrank(episode, working.len(), outputs.len())?;

        working = outputs
            .into_iter()
            .map(|(range, value)| {
                let local = parse_index(&value, range.len())?;
                Ok(working[range.start + local])
            })
            .collect::<Result<Vec<RowId>>>()?;
    }
    Ok(working.first().map(|id| arena.take(*id)))
}

/// One round over `working`, reduced to one value per batch.
async fn fold_round(
    episode: &mut Episode<'_>,
    arena: &RowArena,
    working: &[RowId],
    output_type: OutputType,
) -> Result<Vec<(Range<usize>, Value)>> {
    let rows = arena.resolve(working);
    episode
        .run_round(&rows, output_type)
        .await?
        .into_iter()
        .map(|(range, items)| Ok((range, single_item(items)?)))
        .collect()
}

/// A fold over more than one row needs batches of at least two.
fn ensure_progress(episode: &Episode<'_>, working: usize) -> Result<()> {
    let budget = episode.budget();
    if working > 1 && budget.cap() < 2 {
        return Err(budget.stalled(format!(
            "a cap of {} cannot fold {working} rows",
            budget.cap()
        )));
    }
    Ok(())
}

fn ensure_shrank(episode: &Episode<'_>, inputs: usize, outputs: usize) -> Result<()> {
    if inputs > 1 && outputs >= inputs {
        let budget = episode.budget();
        return Err(EngineError::BudgetExhausted {
            cap: budget.cap(),
            retries: budget.retries(),
            reason: format!("round {} produced {outputs} rows from {inputs}", episode.round()),
        });
    }
    Ok(())
}

/// The one item a reduce or select batch must return.
pub(crate) fn single_item(items: CompletionItems) -> Result<Value> {
    let count = items.items.len();
    let mut values = items.items.into_iter();
    match (values.next(), count) {
        (Some(value), 1) => Ok(value),
        _ => Err(EngineError::protocol(format!(
            "expected exactly 1 item in the response, got {count}"
        ))),
    }
}

/// Parse a batch-local row index. Accepts integers and numeric strings.
pub(crate) fn parse_index(value: &Value, len: usize) -> Result<usize> {
    let index = match value {
        Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<usize>().ok(),
        _ => None,
    };
    match index {
        Some(i) if i < len => Ok(i),
        Some(i) => Err(EngineError::protocol(format!(
            "row index {i} is out of range for a batch of {len}"
        ))),
        None => Err(EngineError::protocol(format!(
            "expected a row index, got {value}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_item_requires_exactly_one() {
        assert_eq!(
            single_item(CompletionItems::new(vec![Value::from("x")])).unwrap(),
            Value::from("x")
        );
        assert!(matches!(
            single_item(CompletionItems::new(vec![])),
            Err(EngineError::ProviderProtocol(_))
        ));
        assert!(matches!(
            single_item(CompletionItems::new(vec![1.into(), 2.into()])),
            Err(EngineError::ProviderProtocol(_))
        ));
    }

    #[test]
    fn index_accepts_numbers_and_numeric_strings() {
        assert_eq!(parse_index(&Value::from(2), 3).unwrap(), 2);
        assert_eq!(parse_index(&Value::from(" 1 "), 3).unwrap(), 1);
    }

    #[test]
    fn index_rejects_out_of_range_and_garbage() {
        for bad in [Value::from(3), Value::from(-1), Value::from("two"), Value::Null] {
            assert!(
                matches!(parse_index(&bad, 3), Err(EngineError::ProviderProtocol(_))),
                "{bad}"
            );
        }
    }
}
