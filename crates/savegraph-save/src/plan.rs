//! Statement planning and batching.
//!
//! Operations queued while walking a graph are flushed in this order:
//! - link table deletes, then foreign key clears
//! - DELETE child-first (to respect FK constraints)
//! - INSERT parent-first (to respect FK constraints)
//! - UPDATE any order (no circular FK assumed)
//! - link table inserts
//!
//! Consecutive operations of the same table and statement shape are merged
//! into multi-row INSERTs, IN-list DELETEs, or one executor batch of UPDATEs,
//! each limited to `max_rows` rows.

use crate::result::{AffectedRows, AffectedTable};
use crate::sql::{Params, column_list, key_in};
use asupersync::{Cx, Outcome};
use savegraph_core::{
    Catalog, Connection, Error, RowKey, SavePath, SaveError, StatementKind, Value, quote_ident,
};
use std::collections::HashMap;

/// A pending entity-table operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    /// Insert a new row.
    Insert {
        /// Position of the node in its sibling batch.
        index: usize,
        /// Table name.
        table: &'static str,
        /// Column names.
        columns: Vec<&'static str>,
        /// Values to insert.
        values: Vec<Value>,
        /// Database-generated column to read back.
        returning: Option<&'static str>,
    },
    /// Update an existing row.
    Update {
        /// Position of the node in its sibling batch.
        index: usize,
        /// Table name.
        table: &'static str,
        /// Primary key column.
        pk_column: &'static str,
        /// Primary key value.
        pk_value: Value,
        /// Columns to update (only changed ones).
        set_columns: Vec<&'static str>,
        /// New values for changed columns.
        set_values: Vec<Value>,
        /// Version column incremented by this update.
        bump_version: Option<&'static str>,
        /// Expected current version (optimistic predicate).
        expected_version: Option<Value>,
    },
    /// Set a foreign key column to NULL.
    ClearForeignKey {
        /// Table name.
        table: &'static str,
        /// Primary key column.
        pk_column: &'static str,
        /// Primary key value.
        pk_value: Value,
        /// Foreign key column to clear.
        column: &'static str,
    },
    /// Delete an existing row.
    Delete {
        /// Table name.
        table: &'static str,
        /// Primary key column.
        pk_column: &'static str,
        /// Primary key value.
        pk_value: Value,
        /// Cascade depth at which the row was reached.
        depth: usize,
    },
}

impl PendingOp {
    /// Get the table name for this operation.
    pub fn table(&self) -> &'static str {
        match self {
            PendingOp::Insert { table, .. }
            | PendingOp::Update { table, .. }
            | PendingOp::ClearForeignKey { table, .. }
            | PendingOp::Delete { table, .. } => table,
        }
    }
}

/// A pending link table operation (for many-to-many associations).
#[derive(Debug, Clone, PartialEq)]
pub enum LinkTableOp {
    /// Insert a link.
    Link {
        table: &'static str,
        local_column: &'static str,
        local_value: Value,
        remote_column: &'static str,
        remote_value: Value,
    },
    /// Delete one link.
    Unlink {
        table: &'static str,
        local_column: &'static str,
        local_value: Value,
        remote_column: &'static str,
        remote_value: Value,
    },
    /// Delete every link whose `column` holds `value`.
    UnlinkAll {
        table: &'static str,
        column: &'static str,
        value: Value,
    },
}

impl LinkTableOp {
    /// Get the table name.
    pub fn table(&self) -> &'static str {
        match self {
            LinkTableOp::Link { table, .. }
            | LinkTableOp::Unlink { table, .. }
            | LinkTableOp::UnlinkAll { table, .. } => table,
        }
    }

    /// Check if this is a link (insert) operation.
    pub fn is_link(&self) -> bool {
        matches!(self, LinkTableOp::Link { .. })
    }
}

/// Orders operations into a [`FlushPlan`].
///
/// Uses table foreign key relationships to determine correct ordering:
/// - Parents must be inserted before children
/// - Children must be deleted before parents
#[derive(Debug, Default)]
pub struct FlushOrderer {
    /// Table -> tables it depends on (has FK to).
    dependencies: HashMap<&'static str, Vec<&'static str>>,
}

impl FlushOrderer {
    /// Create a new flush orderer.
    pub fn new() -> Self {
        Self::default()
    }

    /// An orderer knowing every table dependency in the catalog.
    pub fn from_catalog(catalog: &Catalog) -> Self {
        let mut orderer = Self::new();
        for (table, depends_on) in catalog.table_dependencies() {
            orderer.register_table(table, depends_on);
        }
        orderer
    }

    /// Register a table's dependencies directly.
    pub fn register_table(&mut self, table: &'static str, depends_on: Vec<&'static str>) {
        self.dependencies.insert(table, depends_on);
    }

    /// Get the dependency count for a table.
    fn dependency_count(&self, table: &str) -> usize {
        self.dependencies.get(table).map_or(0, Vec::len)
    }

    /// Order operations into a flush plan.
    ///
    /// - Deletes: deepest cascade level first, then more dependencies first
    /// - Inserts: parent-first (fewer dependencies = insert first)
    /// - Updates and clears: queue order
    pub fn order(&self, ops: Vec<PendingOp>, links: Vec<LinkTableOp>) -> FlushPlan {
        let mut plan = FlushPlan::default();

        for op in ops {
            match op {
                PendingOp::Delete { .. } => plan.deletes.push(op),
                PendingOp::Insert { .. } => plan.inserts.push(op),
                PendingOp::Update { .. } => plan.updates.push(op),
                PendingOp::ClearForeignKey { .. } => plan.clears.push(op),
            }
        }
        for op in links {
            if op.is_link() {
                plan.links.push(op);
            } else {
                plan.unlinks.push(op);
            }
        }

        // Sort deletes: children first (deeper, or more deps = delete first)
        plan.deletes.sort_by(|a, b| {
            let depth = |op: &PendingOp| match op {
                PendingOp::Delete { depth, .. } => *depth,
                _ => 0,
            };
            depth(b).cmp(&depth(a)).then_with(|| {
                self.dependency_count(b.table())
                    .cmp(&self.dependency_count(a.table()))
            })
        });

        // Sort inserts: parents first (fewer deps = insert first)
        plan.inserts.sort_by(|a, b| {
            let a_deps = self.dependency_count(a.table());
            let b_deps = self.dependency_count(b.table());
            a_deps.cmp(&b_deps)
        });

        plan
    }
}

/// A plan for executing flush operations.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// Link deletes.
    pub unlinks: Vec<LinkTableOp>,
    /// Foreign key clears.
    pub clears: Vec<PendingOp>,
    /// Delete operations (ordered child-first).
    pub deletes: Vec<PendingOp>,
    /// Insert operations (ordered parent-first).
    pub inserts: Vec<PendingOp>,
    /// Update operations (any order).
    pub updates: Vec<PendingOp>,
    /// Link inserts.
    pub links: Vec<LinkTableOp>,
}

/// What a flush did.
#[derive(Debug, Default)]
pub struct FlushResult {
    /// Rows affected per table.
    pub affected: AffectedRows,
    /// `(index, value)` of each database-generated column read back.
    pub generated: Vec<(usize, Value)>,
    /// `(index, rows affected)` of each UPDATE.
    pub updated: Vec<(usize, u64)>,
}

pub(crate) fn statement_failed(
    path: &SavePath,
    table: &'static str,
    statement: StatementKind,
    source: Error,
) -> Error {
    Error::Save(SaveError::StatementExecutionFailed {
        path: path.clone(),
        table,
        statement,
        source: Box::new(source),
    })
}

macro_rules! try_statement {
    ($e:expr, $path:expr, $table:expr, $kind:expr) => {
        match $e {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => return Outcome::Err(statement_failed($path, $table, $kind, e)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    };
}

/// Split `items` into runs of consecutive elements sharing a shape key.
fn runs_by<'a, T, K: PartialEq>(items: &'a [T], key: impl Fn(&T) -> K) -> Vec<&'a [T]> {
    let mut runs = Vec::new();
    let mut start = 0;
    for i in 1..=items.len() {
        if i == items.len() || key(&items[i]) != key(&items[start]) {
            if start < i {
                runs.push(&items[start..i]);
            }
            start = i;
        }
    }
    runs
}

fn count(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

impl FlushPlan {
    /// Check if the plan has any operations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of operations in the plan.
    pub fn len(&self) -> usize {
        self.unlinks.len()
            + self.clears.len()
            + self.deletes.len()
            + self.inserts.len()
            + self.updates.len()
            + self.links.len()
    }

    /// Execute the flush plan against the database.
    ///
    /// Executor failures become [`SaveError::StatementExecutionFailed`]
    /// tagged with `path`. Version checks on the returned UPDATE counts are
    /// left to the caller.
    #[tracing::instrument(level = "debug", skip(self, cx, conn, path), fields(path = %path))]
    pub async fn execute<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        path: &SavePath,
        max_rows: usize,
    ) -> Outcome<FlushResult, Error> {
        let max_rows = max_rows.max(1);
        let mut result = FlushResult::default();
        if self.is_empty() {
            return Outcome::Ok(result);
        }

        tracing::debug!(
            unlinks = self.unlinks.len(),
            clears = self.clears.len(),
            deletes = self.deletes.len(),
            inserts = self.inserts.len(),
            updates = self.updates.len(),
            links = self.links.len(),
            "Executing flush plan"
        );

        // 1. Link deletes (batched by table and shape)
        for run in runs_by(&self.unlinks, |op| match op {
            LinkTableOp::Unlink {
                table,
                local_column,
                remote_column,
                ..
            } => (*table, *local_column, Some(*remote_column)),
            LinkTableOp::UnlinkAll { table, column, .. } => (*table, *column, None),
            LinkTableOp::Link { table, .. } => (*table, "", None),
        }) {
            for chunk in run.chunks(max_rows) {
                let n = try_statement!(
                    Self::execute_unlink_batch(cx, conn, chunk).await,
                    path,
                    chunk[0].table(),
                    StatementKind::Delete
                );
                result.affected.add(AffectedTable::JoinTable(chunk[0].table()), n);
            }
        }

        // 2. Foreign key clears (batched by table and column)
        for run in runs_by(&self.clears, |op| match op {
            PendingOp::ClearForeignKey { table, column, .. } => (*table, *column),
            other => (other.table(), ""),
        }) {
            for chunk in run.chunks(max_rows) {
                let n = try_statement!(
                    Self::execute_clear_batch(cx, conn, chunk).await,
                    path,
                    chunk[0].table(),
                    StatementKind::Update
                );
                result.affected.add(AffectedTable::Table(chunk[0].table()), n);
            }
        }

        // 3. Deletes (batched by table)
        for run in runs_by(&self.deletes, PendingOp::table) {
            for chunk in run.chunks(max_rows) {
                let n = try_statement!(
                    Self::execute_delete_batch(cx, conn, chunk).await,
                    path,
                    chunk[0].table(),
                    StatementKind::Delete
                );
                result.affected.add(AffectedTable::Table(chunk[0].table()), n);
            }
        }

        // 4. Inserts (batched by table and column list)
        for run in runs_by(&self.inserts, |op| match op {
            PendingOp::Insert {
                table,
                columns,
                returning,
                ..
            } => (*table, columns.clone(), *returning),
            other => (other.table(), Vec::new(), None),
        }) {
            // DEFAULT VALUES inserts exactly one row per statement
            let rows_per_statement = match &run[0] {
                PendingOp::Insert { columns, .. } if columns.is_empty() => 1,
                _ => max_rows,
            };
            for chunk in run.chunks(rows_per_statement) {
                let n = try_statement!(
                    Self::execute_insert_batch(cx, conn, chunk, &mut result.generated).await,
                    path,
                    chunk[0].table(),
                    StatementKind::Insert
                );
                result.affected.add(AffectedTable::Table(chunk[0].table()), n);
            }
        }

        // 5. Updates (one executor batch per statement shape)
        for run in runs_by(&self.updates, Self::update_shape) {
            for chunk in run.chunks(max_rows) {
                let counts = try_statement!(
                    Self::execute_update_batch(cx, conn, chunk).await,
                    path,
                    chunk[0].table(),
                    StatementKind::Update
                );
                for (op, n) in chunk.iter().zip(counts) {
                    if let PendingOp::Update { index, .. } = op {
                        result.updated.push((*index, n));
                    }
                    result.affected.add(AffectedTable::Table(op.table()), count(n));
                }
            }
        }

        // 6. Link inserts (batched by table)
        for run in runs_by(&self.links, LinkTableOp::table) {
            for chunk in run.chunks(max_rows) {
                let n = try_statement!(
                    Self::execute_link_batch(cx, conn, chunk).await,
                    path,
                    chunk[0].table(),
                    StatementKind::Insert
                );
                result.affected.add(AffectedTable::JoinTable(chunk[0].table()), n);
            }
        }

        Outcome::Ok(result)
    }

    fn update_shape(op: &PendingOp) -> (&'static str, Vec<&'static str>, bool, bool) {
        match op {
            PendingOp::Update {
                table,
                set_columns,
                bump_version,
                expected_version,
                ..
            } => (
                *table,
                set_columns.clone(),
                bump_version.is_some(),
                expected_version.is_some(),
            ),
            other => (other.table(), Vec::new(), false, false),
        }
    }

    /// Execute a batch of insert operations.
    #[tracing::instrument(level = "debug", skip(cx, conn, ops, generated))]
    async fn execute_insert_batch<C: Connection>(
        cx: &Cx,
        conn: &C,
        ops: &[PendingOp],
        generated: &mut Vec<(usize, Value)>,
    ) -> Outcome<usize, Error> {
        let Some(PendingOp::Insert {
            table,
            columns,
            returning,
            ..
        }) = ops.first()
        else {
            return Outcome::Ok(0);
        };

        tracing::debug!(table = *table, count = ops.len(), "Executing insert batch");

        // INSERT INTO table ("col1", "col2") VALUES ($1, $2), ($3, $4), ...
        let mut params = Params::new();
        let tuples: Vec<String> = ops
            .iter()
            .filter_map(|op| match op {
                PendingOp::Insert { values, .. } => {
                    Some(format!("({})", params.list(values.iter().cloned())))
                }
                _ => None,
            })
            .collect();

        let mut sql = if columns.is_empty() {
            if ops.len() > 1 {
                return Outcome::Err(Error::Custom(format!(
                    "DEFAULT VALUES insert on \"{}\" cannot carry {} rows",
                    table,
                    ops.len()
                )));
            }
            format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES {}",
                quote_ident(table),
                column_list(columns),
                tuples.join(", ")
            )
        };

        let Some(returning) = returning else {
            tracing::trace!(sql = %sql, "Executing INSERT");
            return conn
                .execute(cx, &sql, &params.into_values())
                .await
                .map(count);
        };

        sql.push_str(&format!(" RETURNING {}", quote_ident(returning)));
        tracing::trace!(sql = %sql, "Executing INSERT ... RETURNING");
        let rows = match conn.query(cx, &sql, &params.into_values()).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if rows.len() != ops.len() {
            return Outcome::Err(Error::Custom(format!(
                "INSERT ... RETURNING on \"{}\" yielded {} rows for {} values",
                table,
                rows.len(),
                ops.len()
            )));
        }

        // Rows come back in VALUES order.
        for (op, row) in ops.iter().zip(&rows) {
            if let PendingOp::Insert { index, .. } = op {
                let value = row
                    .get_by_name(returning)
                    .or_else(|| row.get(0))
                    .cloned()
                    .unwrap_or(Value::Null);
                generated.push((*index, value));
            }
        }
        Outcome::Ok(rows.len())
    }

    /// Execute a batch of same-shape update operations.
    #[tracing::instrument(level = "debug", skip(cx, conn, ops))]
    async fn execute_update_batch<C: Connection>(
        cx: &Cx,
        conn: &C,
        ops: &[PendingOp],
    ) -> Outcome<Vec<u64>, Error> {
        let statements: Vec<(String, Vec<Value>)> =
            ops.iter().filter_map(Self::render_update).collect();
        let Some((first_sql, first_params)) = statements.first() else {
            return Outcome::Ok(Vec::new());
        };

        tracing::debug!(
            table = ops[0].table(),
            count = statements.len(),
            "Executing update batch"
        );
        tracing::trace!(sql = %first_sql, "Executing UPDATE");

        if statements.len() == 1 {
            return conn
                .execute(cx, first_sql, first_params)
                .await
                .map(|n| vec![n]);
        }
        conn.batch(cx, &statements).await
    }

    // UPDATE table SET col1 = $1, "version" = "version" + 1 WHERE pk = $2 AND "version" = $3
    fn render_update(op: &PendingOp) -> Option<(String, Vec<Value>)> {
        let PendingOp::Update {
            table,
            pk_column,
            pk_value,
            set_columns,
            set_values,
            bump_version,
            expected_version,
            ..
        } = op
        else {
            return None;
        };

        let mut params = Params::new();
        let mut assignments: Vec<String> = set_columns
            .iter()
            .zip(set_values)
            .map(|(col, value)| format!("{} = {}", quote_ident(col), params.push(value.clone())))
            .collect();
        if let Some(version) = bump_version {
            let version = quote_ident(version);
            assignments.push(format!("{version} = {version} + 1"));
        }
        if assignments.is_empty() {
            return None;
        }

        let mut sql = format!(
            "UPDATE {} SET {} WHERE {} = {}",
            quote_ident(table),
            assignments.join(", "),
            quote_ident(pk_column),
            params.push(pk_value.clone())
        );
        if let (Some(version_column), Some(expected)) = (bump_version, expected_version) {
            sql.push_str(&format!(
                " AND {} = {}",
                quote_ident(version_column),
                params.push(expected.clone())
            ));
        }
        Some((sql, params.into_values()))
    }

    /// Execute a batch of delete operations.
    #[tracing::instrument(level = "debug", skip(cx, conn, ops))]
    async fn execute_delete_batch<C: Connection>(
        cx: &Cx,
        conn: &C,
        ops: &[PendingOp],
    ) -> Outcome<usize, Error> {
        let Some(PendingOp::Delete {
            table, pk_column, ..
        }) = ops.first()
        else {
            return Outcome::Ok(0);
        };

        tracing::debug!(table = *table, count = ops.len(), "Executing delete batch");

        // DELETE FROM table WHERE pk IN ($1, $2, $3, ...)
        let mut params = Params::new();
        let list = params.list(ops.iter().filter_map(|op| match op {
            PendingOp::Delete { pk_value, .. } => Some(pk_value.clone()),
            _ => None,
        }));
        let sql = format!(
            "DELETE FROM {} WHERE {} IN ({})",
            quote_ident(table),
            quote_ident(pk_column),
            list
        );
        tracing::trace!(sql = %sql, "Executing DELETE");
        conn.execute(cx, &sql, &params.into_values()).await.map(count)
    }

    /// Execute a batch of foreign key clears.
    #[tracing::instrument(level = "debug", skip(cx, conn, ops))]
    async fn execute_clear_batch<C: Connection>(
        cx: &Cx,
        conn: &C,
        ops: &[PendingOp],
    ) -> Outcome<usize, Error> {
        let Some(PendingOp::ClearForeignKey {
            table,
            pk_column,
            column,
            ..
        }) = ops.first()
        else {
            return Outcome::Ok(0);
        };

        tracing::debug!(table = *table, column = *column, count = ops.len(), "Clearing foreign keys");

        // UPDATE table SET fk = NULL WHERE pk IN ($1, $2, ...)
        let mut params = Params::new();
        let list = params.list(ops.iter().filter_map(|op| match op {
            PendingOp::ClearForeignKey { pk_value, .. } => Some(pk_value.clone()),
            _ => None,
        }));
        let sql = format!(
            "UPDATE {} SET {} = NULL WHERE {} IN ({})",
            quote_ident(table),
            quote_ident(column),
            quote_ident(pk_column),
            list
        );
        tracing::trace!(sql = %sql, "Executing SET NULL");
        conn.execute(cx, &sql, &params.into_values()).await.map(count)
    }

    /// Execute a batch of link inserts.
    #[tracing::instrument(level = "debug", skip(cx, conn, ops))]
    async fn execute_link_batch<C: Connection>(
        cx: &Cx,
        conn: &C,
        ops: &[LinkTableOp],
    ) -> Outcome<usize, Error> {
        let Some(LinkTableOp::Link {
            table,
            local_column,
            remote_column,
            ..
        }) = ops.first()
        else {
            return Outcome::Ok(0);
        };

        tracing::debug!(table = *table, count = ops.len(), "Executing link inserts");

        let mut params = Params::new();
        let tuples: Vec<String> = ops
            .iter()
            .filter_map(|op| match op {
                LinkTableOp::Link {
                    local_value,
                    remote_value,
                    ..
                } => Some(format!(
                    "({})",
                    params.list([local_value.clone(), remote_value.clone()])
                )),
                _ => None,
            })
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote_ident(table),
            column_list(&[*local_column, *remote_column]),
            tuples.join(", ")
        );
        tracing::trace!(sql = %sql, "Executing link INSERT");
        conn.execute(cx, &sql, &params.into_values()).await.map(count)
    }

    /// Execute a batch of link deletes.
    #[tracing::instrument(level = "debug", skip(cx, conn, ops))]
    async fn execute_unlink_batch<C: Connection>(
        cx: &Cx,
        conn: &C,
        ops: &[LinkTableOp],
    ) -> Outcome<usize, Error> {
        let mut params = Params::new();
        let sql = match ops.first() {
            Some(LinkTableOp::Unlink {
                table,
                local_column,
                remote_column,
                ..
            }) => {
                // DELETE FROM link WHERE ("a", "b") IN (($1, $2), ...)
                let keys: Vec<RowKey> = ops
                    .iter()
                    .filter_map(|op| match op {
                        LinkTableOp::Unlink {
                            local_value,
                            remote_value,
                            ..
                        } => Some(RowKey::new(vec![local_value.clone(), remote_value.clone()])),
                        _ => None,
                    })
                    .collect();
                format!(
                    "DELETE FROM {} WHERE {}",
                    quote_ident(table),
                    key_in(&[*local_column, *remote_column], &keys, &mut params)
                )
            }
            Some(LinkTableOp::UnlinkAll { table, column, .. }) => {
                // DELETE FROM link WHERE "a" IN ($1, ...)
                let list = params.list(ops.iter().filter_map(|op| match op {
                    LinkTableOp::UnlinkAll { value, .. } => Some(value.clone()),
                    _ => None,
                }));
                format!(
                    "DELETE FROM {} WHERE {} IN ({})",
                    quote_ident(table),
                    quote_ident(column),
                    list
                )
            }
            _ => return Outcome::Ok(0),
        };

        tracing::debug!(table = ops[0].table(), count = ops.len(), "Executing link deletes");
        tracing::trace!(sql = %sql, "Executing link DELETE");
        conn.execute(cx, &sql, &params.into_values()).await.map(count)
    }
}
