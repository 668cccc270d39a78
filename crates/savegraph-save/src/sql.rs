//! SQL text helpers shared by the planner, resolver and dissociation code.
//!
//! Identifiers are ANSI-quoted; all values are bound as `$n` parameters.

use savegraph_core::{RowKey, Value, quote_ident};

/// Accumulates bound parameters and hands out their placeholders.
#[derive(Debug, Default)]
pub(crate) struct Params {
    values: Vec<Value>,
}

impl Params {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Bind one value and return its placeholder.
    pub(crate) fn push(&mut self, value: Value) -> String {
        self.values.push(value);
        format!("${}", self.values.len())
    }

    /// Bind several values and return `$a, $b, ...`.
    pub(crate) fn list(&mut self, values: impl IntoIterator<Item = Value>) -> String {
        values
            .into_iter()
            .map(|v| self.push(v))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub(crate) fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// `"a", "b", "c"`
pub(crate) fn column_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Membership predicate over key tuples.
///
/// Single-column keys render as `"c" IN ($1, $2)`; composite keys as
/// `("a", "b") IN (($1, $2), ($3, $4))`.
pub(crate) fn key_in(columns: &[&str], keys: &[RowKey], params: &mut Params) -> String {
    if let [column] = columns {
        let list = params.list(keys.iter().filter_map(|k| k.values().first().cloned()));
        return format!("{} IN ({})", quote_ident(column), list);
    }
    let tuples = keys
        .iter()
        .map(|k| format!("({})", params.list(k.values().iter().cloned())))
        .collect::<Vec<_>>()
        .join(", ");
    format!("({}) IN ({})", column_list(columns), tuples)
}

/// `SELECT <columns> FROM "table" WHERE <predicate>`
pub(crate) fn select(table: &str, columns: &[&str], predicate: &str) -> String {
    format!(
        "SELECT {} FROM {} WHERE {}",
        column_list(columns),
        quote_ident(table),
        predicate
    )
}
