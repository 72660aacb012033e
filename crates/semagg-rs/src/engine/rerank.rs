//! Sliding-window listwise reranker.
//!
//! Rows are read right to left. Each window is the current frontier plus up
//! to `cap` unread rows; the provider returns a full permutation of the
//! window and the top `cap / 2 + 1` become the next frontier. Rows that never
//! survive a cut are dropped from the result.

use super::events::EpisodeEvent;
use super::executor::{Episode, WindowPlan};
use super::tournament::parse_index;
use crate::budget::{BudgetPlanner, BudgetState};
use crate::error::{EngineError, Result};
use crate::row::{Row, RowArena, RowId};
use serde_json::Value;

/// Order `rows` by relevance, most relevant first. Zero or one rows are
/// returned as-is without a provider call.
pub(crate) async fn rerank(episode: &mut Episode<'_>, rows: Vec<Row>) -> Result<Vec<Row>> {
    if rows.len() <= 1 {
        return Ok(rows);
    }
    let (mut arena, ids) = RowArena::label(rows);
    let mut frontier: Vec<RowId> = Vec::new();
    // Exclusive end of the unread prefix.
    let mut cursor = ids.len();

    while cursor > 0 {
        let unread = &ids[..cursor];
        let (window, items) = episode
            .run_window(&arena, |planner, budget| {
                plan_window(planner, budget, &arena, &frontier, unread)
            })
            .await?;

        let order = parse_permutation(&items.items, window.ids.len())?;
        frontier = order
            .into_iter()
            .take(window.keep)
            .map(|i| window.ids[i])
            .collect();
        cursor -= window.consumed;

        episode.emit(&EpisodeEvent::WindowRanked {
            round: episode.round(),
            window: window.ids.len(),
            kept: frontier.len(),
            remaining: cursor,
        });
    }

    Ok(frontier.into_iter().map(|id| arena.take(id)).collect())
}

/// Build the next window: frontier first, then up to `cap` newly read rows
/// in input order. Under the token policy the frontier counts against the
/// context window, so fewer new rows may fit.
///
/// The frontier kept from this window is `cap / 2 + 1` rows, where `cap` is
/// the number of new rows the budget admitted. The last window keeps the
/// full cap's share even when fewer unread rows remain.
fn plan_window(
    planner: &BudgetPlanner<'_>,
    budget: &BudgetState,
    arena: &RowArena,
    frontier: &[RowId],
    unread: &[RowId],
) -> Result<WindowPlan> {
    let mut sequence = frontier.to_vec();
    sequence.extend(unread.iter().rev());
    let fits = planner.packed_len(&arena.resolve(&sequence), frontier.len() + budget.cap())?;
    let consumed = fits.saturating_sub(frontier.len()).min(unread.len());
    if consumed == 0 {
        return Err(budget.stalled(format!(
            "no unread row fits beside a frontier of {} in the context window",
            frontier.len()
        )));
    }

    let cap = if fits < sequence.len() {
        consumed
    } else {
        budget.cap()
    };
    let mut ids = frontier.to_vec();
    ids.extend_from_slice(&unread[unread.len() - consumed..]);
    Ok(WindowPlan {
        keep: cap / 2 + 1,
        ids,
        consumed,
    })
}

/// Parse a ranking that must name every window index exactly once.
pub(crate) fn parse_permutation(items: &[Value], len: usize) -> Result<Vec<usize>> {
    if items.len() != len {
        return Err(EngineError::protocol(format!(
            "ranking has {} entries for a window of {len}",
            items.len()
        )));
    }
    let mut seen = vec![false; len];
    items
        .iter()
        .map(|value| {
            let index = parse_index(value, len)?;
            if std::mem::replace(&mut seen[index], true) {
                return Err(EngineError::protocol(format!(
                    "ranking repeats row index {index}"
                )));
            }
            Ok(index)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetPolicy, CharRatioTokenizer, Tokenizer};
    use crate::prompt::{DefaultTemplates, PromptKind, PromptTemplate, TupleFormat};

    fn planner(tokenizer: &CharRatioTokenizer) -> BudgetPlanner<'_> {
        BudgetPlanner::new(
            BudgetPolicy::Cardinality,
            PromptKind::Rerank,
            "rank",
            0,
            tokenizer,
            &DefaultTemplates,
            TupleFormat::Xml,
        )
        .unwrap()
    }

    fn arena(n: usize) -> (RowArena, Vec<RowId>) {
        RowArena::label((0..n).map(|i| Row::default().with("id", i)).collect())
    }

    #[test]
    fn first_window_takes_the_tail_in_input_order() {
        let (arena, ids) = arena(5);
        let budget = BudgetState::new(3).unwrap();
        let tokenizer = CharRatioTokenizer::default();
        let plan = plan_window(&planner(&tokenizer), &budget, &arena, &[], &ids).unwrap();
        assert_eq!(plan.ids, vec![RowId(2), RowId(3), RowId(4)]);
        assert_eq!(plan.consumed, 3);
        assert_eq!(plan.keep, 2);
    }

    #[test]
    fn later_windows_lead_with_the_frontier() {
        let (arena, ids) = arena(5);
        let budget = BudgetState::new(4).unwrap();
        let frontier = [RowId(4), RowId(2)];
        let tokenizer = CharRatioTokenizer::default();
        let plan =
            plan_window(&planner(&tokenizer), &budget, &arena, &frontier, &ids[..2]).unwrap();
        assert_eq!(plan.ids, vec![RowId(4), RowId(2), RowId(0), RowId(1)]);
        assert_eq!(plan.consumed, 2);
        assert_eq!(plan.keep, 3);
    }

    #[test]
    fn frontier_does_not_count_against_the_cap() {
        let (arena, ids) = arena(5);
        let budget = BudgetState::new(2).unwrap();
        let frontier = [RowId(4), RowId(3)];
        let tokenizer = CharRatioTokenizer::default();
        let plan =
            plan_window(&planner(&tokenizer), &budget, &arena, &frontier, &ids[..3]).unwrap();
        assert_eq!(plan.ids, vec![RowId(4), RowId(3), RowId(1), RowId(2)]);
        assert_eq!(plan.consumed, 2);
        assert_eq!(plan.keep, 2);
    }

    #[test]
    fn cap_of_one_still_makes_progress() {
        let (arena, ids) = arena(5);
        let mut budget = BudgetState::new(2).unwrap();
        budget.shrink(2).unwrap();
        assert_eq!(budget.cap(), 1);
        let frontier = [RowId(4), RowId(3)];
        let tokenizer = CharRatioTokenizer::default();
        let plan =
            plan_window(&planner(&tokenizer), &budget, &arena, &frontier, &ids[..3]).unwrap();
        assert_eq!(plan.ids, vec![RowId(4), RowId(3), RowId(2)]);
        assert_eq!(plan.keep, 1);
    }

    #[test]
    fn frontier_filling_the_context_window_stalls() {
        let (arena, ids) = arena(5);
        let tokenizer = CharRatioTokenizer::new(1.0);
        let kind = PromptKind::Rerank;
        let overhead = tokenizer.estimate_size(&DefaultTemplates.template(kind))
            + tokenizer.estimate_size("rank");
        let row_cost = tokenizer.estimate_size(&DefaultTemplates.render_row(
            0,
            arena.get(ids[0]),
            TupleFormat::Json,
        ));
        let planner = BudgetPlanner::new(
            BudgetPolicy::TokenBudget,
            kind,
            "rank",
            overhead + 2 * row_cost,
            &tokenizer,
            &DefaultTemplates,
            TupleFormat::Json,
        )
        .unwrap();

        let budget = BudgetState::new(5).unwrap();
        let frontier = [RowId(4), RowId(3)];
        let err = plan_window(&planner, &budget, &arena, &frontier, &ids[..3]).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)), "{err}");
    }

    #[test]
    fn permutation_must_be_complete_and_unique() {
        let ok = parse_permutation(&[2.into(), 0.into(), 1.into()], 3).unwrap();
        assert_eq!(ok, vec![2, 0, 1]);
        assert!(parse_permutation(&[2.into(), 0.into()], 3).is_err());
        assert!(parse_permutation(&[2.into(), 2.into(), 1.into()], 3).is_err());
        assert!(parse_permutation(&[3.into(), 0.into(), 1.into()], 3).is_err());
    }
}
