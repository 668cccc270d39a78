//! Affected-row accounting and the save result.

use savegraph_core::Node;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// A table touched by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum AffectedTable {
    /// An entity table.
    Table(&'static str),
    /// A join table.
    JoinTable(&'static str),
}

impl AffectedTable {
    /// The table name.
    pub fn name(&self) -> &'static str {
        match self {
            AffectedTable::Table(name) | AffectedTable::JoinTable(name) => name,
        }
    }
}

impl fmt::Display for AffectedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AffectedTable::Table(name) => write!(f, "{name}"),
            AffectedTable::JoinTable(name) => write!(f, "{name} (join)"),
        }
    }
}

/// Affected-row counts per table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AffectedRows {
    #[serde(serialize_with = "serialize_counts")]
    counts: BTreeMap<AffectedTable, usize>,
}

// JSON object keys must be strings, so counts go out as `[table, count]` pairs.
fn serialize_counts<S: Serializer>(
    counts: &BTreeMap<AffectedTable, usize>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(counts.iter())
}

impl AffectedRows {
    /// Create an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `count` rows for `table`. Zero counts are not recorded.
    pub fn add(&mut self, table: AffectedTable, count: usize) {
        if count > 0 {
            *self.counts.entry(table).or_insert(0) += count;
        }
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: &AffectedRows) {
        for (table, count) in &other.counts {
            self.add(*table, *count);
        }
    }

    /// Rows affected in an entity table.
    pub fn table(&self, name: &str) -> usize {
        self.count_where(|t| matches!(t, AffectedTable::Table(n) if *n == name))
    }

    /// Rows affected in a join table.
    pub fn join_table(&self, name: &str) -> usize {
        self.count_where(|t| matches!(t, AffectedTable::JoinTable(n) if *n == name))
    }

    fn count_where(&self, pred: impl Fn(&AffectedTable) -> bool) -> usize {
        self.counts
            .iter()
            .filter(|(table, _)| pred(table))
            .map(|(_, count)| *count)
            .sum()
    }

    /// Sum over all tables.
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Whether nothing was affected.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Iterate over `(table, count)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (AffectedTable, usize)> + '_ {
        self.counts.iter().map(|(t, c)| (*t, *c))
    }
}

/// Outcome of a successful save command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveResult {
    /// The input graph, untouched.
    pub original: Node,
    /// Structural copy of the input with assigned ids and versions.
    pub modified: Node,
    /// Rows affected per table.
    pub affected: AffectedRows,
}

impl SaveResult {
    /// Total rows affected.
    pub fn total_affected(&self) -> usize {
        self.affected.total()
    }
}

/// Outcome of a successful batch save.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSaveResult {
    /// The input roots, untouched.
    pub original: Vec<Node>,
    /// Echo copies of the roots, in input order.
    pub modified: Vec<Node>,
    /// Rows affected per table.
    pub affected: AffectedRows,
}

/// Outcome of a successful delete command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteResult {
    /// Rows affected per table, including cascades.
    pub affected: AffectedRows,
}
