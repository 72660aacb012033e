//! Prompt rendering for aggregate batches.
//!
//! Every outbound call is one prompt assembled from a meta prompt with four
//! slots: the user's query, the serialized tuples of the batch, kind-specific
//! instructions, and the expected response format. Rows are labelled with
//! batch-local indices `0..len-1`; the provider answers in terms of those
//! indices and the engine maps them back to row ids.
//!
//! The [`PromptTemplate`] trait is the seam the engine and the budget planner
//! share: the planner measures [`template()`](PromptTemplate::template),
//! [`render_header()`](PromptTemplate::render_header) and
//! [`render_row()`](PromptTemplate::render_row) to decide how many rows fit,
//! and the engine sends the result of [`render()`](PromptTemplate::render).

use crate::row::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// ── Slots ──────────────────────────────────────────────────────────

const USER_PROMPT_SLOT: &str = "{{USER_PROMPT}}";
const TUPLES_SLOT: &str = "{{TUPLES}}";

const META_PROMPT: &str = "You are a semantic analysis engine running inside a SQL database. \
Read every tuple in the table below and answer the user prompt.\n\n\
User Prompt:\n\n- {{USER_PROMPT}}\n\n\
Tuples Table:\n\n{{TUPLES}}\n\n\
Instructions:\n\n{{INSTRUCTIONS}}\n\n\
Expected Response Format:\n\n{{RESPONSE_FORMAT}}";

const AGGREGATE_INSTRUCTIONS: &str = "- Evaluate the attributes of each tuple that matter for the user prompt.\n\
- Combine your evaluations of all tuples into one answer for the whole table.\n\
- Refer to tuples only by their row index.\n\
- Reply strictly in the expected response format.";

const REDUCE_FORMAT: &str =
    "Return one coherent output that synthesizes the most relevant information from all tuples.";

const SELECT_FORMAT: &str = "Identify the {{RELEVANCE}} relevant tuple for the user prompt. \
Return only the row index of that single tuple.";

const RERANK_FORMAT: &str = "Rank every tuple in descending order of relevance to the user prompt. \
Return the row index of each tuple, most relevant first, using every index exactly once.";

// ── Kinds and formats ──────────────────────────────────────────────

/// Which end of the relevance order a select aggregate returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selection {
    /// The most relevant row (`llm_first`).
    First,
    /// The least relevant row (`llm_last`).
    Last,
}

impl Selection {
    fn relevance(self) -> &'static str {
        match self {
            Selection::First => "most",
            Selection::Last => "least",
        }
    }
}

/// The kind of request a prompt is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    Reduce,
    Select(Selection),
    Rerank,
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptKind::Reduce => write!(f, "reduce"),
            PromptKind::Select(Selection::First) => write!(f, "select-first"),
            PromptKind::Select(Selection::Last) => write!(f, "select-last"),
            PromptKind::Rerank => write!(f, "rerank"),
        }
    }
}

/// Serialization used for the tuples table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TupleFormat {
    #[default]
    Xml,
    Markdown,
    Json,
}

impl FromStr for TupleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xml" => Ok(TupleFormat::Xml),
            "markdown" | "md" => Ok(TupleFormat::Markdown),
            "json" => Ok(TupleFormat::Json),
            other => Err(format!(
                "unknown tuple format '{other}' (expected xml, markdown, or json)"
            )),
        }
    }
}

impl fmt::Display for TupleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TupleFormat::Xml => write!(f, "xml"),
            TupleFormat::Markdown => write!(f, "markdown"),
            TupleFormat::Json => write!(f, "json"),
        }
    }
}

// ── Template trait ─────────────────────────────────────────────────

/// Renders batch prompts. Implementations must be deterministic: the budget
/// planner sizes batches from the same pieces that [`render`](Self::render)
/// concatenates.
pub trait PromptTemplate: Send + Sync {
    /// The fixed text of a prompt of this kind, with the user-prompt and
    /// tuples slots still open.
    fn template(&self, kind: PromptKind) -> String;

    /// One-time table header, derived from the first row of the batch.
    fn render_header(&self, first: &Row, format: TupleFormat) -> String;

    /// One row of the table, labelled with its batch-local index.
    fn render_row(&self, index: usize, row: &Row, format: TupleFormat) -> String;

    /// Render a complete prompt for `rows`.
    fn render(&self, kind: PromptKind, rows: &[&Row], user_query: &str, format: TupleFormat) -> String {
        let mut tuples = rows
            .first()
            .map(|r| self.render_header(r, format))
            .unwrap_or_default();
        for (index, row) in rows.iter().enumerate() {
            tuples.push_str(&self.render_row(index, row, format));
        }
        fill_slots(
            &self.template(kind),
            &[(USER_PROMPT_SLOT, user_query), (TUPLES_SLOT, tuples.trim_end())],
        )
    }
}

/// The built-in meta prompt and tuple serializers.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTemplates;

impl PromptTemplate for DefaultTemplates {
    fn template(&self, kind: PromptKind) -> String {
        let response_format = match kind {
            PromptKind::Reduce => REDUCE_FORMAT.to_string(),
            PromptKind::Select(selection) => {
                SELECT_FORMAT.replace("{{RELEVANCE}}", selection.relevance())
            }
            PromptKind::Rerank => RERANK_FORMAT.to_string(),
        };
        META_PROMPT
            .replace("{{INSTRUCTIONS}}", AGGREGATE_INSTRUCTIONS)
            .replace("{{RESPONSE_FORMAT}}", &response_format)
    }

    fn render_header(&self, first: &Row, format: TupleFormat) -> String {
        let names = first.fields().keys();
        match format {
            TupleFormat::Xml => {
                let mut out = String::from("<header><col>row_index</col>");
                for name in names {
                    out.push_str(&format!("<col>{}</col>", escape_xml(name)));
                }
                out.push_str("</header>\n");
                out
            }
            TupleFormat::Markdown => {
                let mut cols = vec!["row_index".to_string()];
                cols.extend(names.map(|n| escape_markdown(n)));
                let rule = vec!["---"; cols.len()].join(" | ");
                format!("| {} |\n| {rule} |\n", cols.join(" | "))
            }
            TupleFormat::Json => String::new(),
        }
    }

    fn render_row(&self, index: usize, row: &Row, format: TupleFormat) -> String {
        match format {
            TupleFormat::Xml => {
                let mut out = format!("<tuple><col>{index}</col>");
                for value in row.fields().values() {
                    out.push_str(&format!("<col>{}</col>", escape_xml(&plain_text(value))));
                }
                out.push_str("</tuple>\n");
                out
            }
            TupleFormat::Markdown => {
                let mut cells = vec![index.to_string()];
                cells.extend(row.fields().values().map(|v| escape_markdown(&plain_text(v))));
                format!("| {} |\n", cells.join(" | "))
            }
            TupleFormat::Json => {
                let mut obj = serde_json::Map::new();
                obj.insert("row_index".into(), Value::from(index));
                for (k, v) in row.fields() {
                    obj.insert(k.clone(), v.clone());
                }
                format!("{}\n", Value::Object(obj))
            }
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Replace slot markers in a single left-to-right pass, so slot-like text in
/// a substituted value is never expanded.
fn fill_slots(template: &str, slots: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    'outer: while let Some(start) = rest.find("{{") {
        let (head, tail) = rest.split_at(start);
        out.push_str(head);
        for (slot, value) in slots {
            if let Some(after) = tail.strip_prefix(*slot) {
                out.push_str(value);
                rest = after;
                continue 'outer;
            }
        }
        out.push_str("{{");
        rest = tail.strip_prefix("{{").unwrap_or_default();
    }
    out.push_str(rest);
    out
}

fn plain_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_markdown(s: &str) -> String {
    s.replace('|', "\\|").replace('\n', " ")
}
