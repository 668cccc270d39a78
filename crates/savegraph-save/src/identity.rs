//! Identity resolution.
//!
//! Every node in a sibling batch is looked up either by primary key or by
//! its complete business key. Lookups of the same kind are merged into one
//! `IN` SELECT per batch (chunked to the configured row limit), which also
//! fetches the columns the batch is about to write so unchanged rows can be
//! left alone.

use crate::lock::ConcurrencyGuard;
use crate::sql::{Params, key_in, select};
use asupersync::{Cx, Outcome};
use savegraph_core::{
    Connection, EntityInfo, Error, Node, Row, RowKey, SaveError, SavePath, Value,
};
use std::collections::HashMap;

/// How a node identifies its row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Lookup {
    /// Primary key supplied.
    Id(RowKey),
    /// Complete business key supplied, no primary key.
    Key(RowKey),
    /// Neither.
    Absent,
}

impl Lookup {
    /// Classify `node`. The primary key wins when both keys are present.
    pub(crate) fn of(node: &Node, entity: &EntityInfo, key_props: &[&'static str]) -> Self {
        if let Some(id) = node.non_null(entity.id().name) {
            return Lookup::Id(RowKey::single(id.clone()));
        }
        if key_props.is_empty() {
            return Lookup::Absent;
        }
        let values: Option<Vec<Value>> = key_props
            .iter()
            .map(|prop| node.scalar(prop).cloned())
            .collect();
        values.map_or(Lookup::Absent, |v| Lookup::Key(RowKey::new(v)))
    }
}

/// Rows found for a batch, indexed both ways.
#[derive(Debug, Default)]
pub(crate) struct Existing {
    by_id: HashMap<RowKey, Row>,
    by_key: HashMap<RowKey, Row>,
}

impl Existing {
    pub(crate) fn get(&self, lookup: &Lookup) -> Option<&Row> {
        match lookup {
            Lookup::Id(id) => self.by_id.get(id),
            Lookup::Key(key) => self.by_key.get(key),
            Lookup::Absent => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len() + self.by_key.len()
    }
}

/// Batched existence checks for one entity.
pub(crate) struct IdentityResolver<'a> {
    entity: &'a EntityInfo,
    key_columns: Vec<&'static str>,
    guard: ConcurrencyGuard,
    max_rows: usize,
}

impl<'a> IdentityResolver<'a> {
    pub(crate) fn new(
        entity: &'a EntityInfo,
        key_props: &[&'static str],
        guard: ConcurrencyGuard,
        max_rows: usize,
    ) -> Self {
        let key_columns = key_props
            .iter()
            .filter_map(|prop| entity.find_field(prop).map(|f| f.column_name))
            .collect();
        Self {
            entity,
            key_columns,
            guard,
            max_rows: max_rows.max(1),
        }
    }

    /// Columns to fetch: primary key, business key, version, then `extra`.
    fn fetch_columns(&self, extra: &[&'static str]) -> Vec<&'static str> {
        let mut columns = vec![self.entity.id().column_name];
        let version = self.entity.version().map(|f| f.column_name);
        for column in self
            .key_columns
            .iter()
            .copied()
            .chain(version)
            .chain(extra.iter().copied())
        {
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        columns
    }

    /// Look every lookup up, issuing at most one SELECT per kind and chunk.
    ///
    /// Keys containing NULL never match and are not sent.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = self.entity.name, path = %path))]
    pub(crate) async fn resolve<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        lookups: &[Lookup],
        extra_columns: &[&'static str],
        path: &SavePath,
    ) -> Outcome<Existing, Error> {
        let mut ids = Vec::new();
        let mut keys = Vec::new();
        for lookup in lookups {
            match lookup {
                Lookup::Id(id) if !ids.contains(id) => ids.push(id.clone()),
                Lookup::Key(key) if !key.has_null() && !keys.contains(key) => {
                    keys.push(key.clone());
                }
                _ => {}
            }
        }

        let columns = self.fetch_columns(extra_columns);
        let id_column = [self.entity.id().column_name];
        let mut existing = Existing::default();

        for chunk in ids.chunks(self.max_rows) {
            let rows = try_select!(
                self.fetch(cx, conn, &columns, &id_column, chunk).await,
                path,
                self.entity.table
            );
            for row in rows {
                let id = self.row_key(&row, &id_column);
                existing.by_id.insert(id, row);
            }
        }

        if !self.key_columns.is_empty() {
            for chunk in keys.chunks(self.max_rows) {
                let rows = try_select!(
                    self.fetch(cx, conn, &columns, &self.key_columns, chunk).await,
                    path,
                    self.entity.table
                );
                for row in rows {
                    let key = self.row_key(&row, &self.key_columns);
                    if existing.by_key.contains_key(&key) {
                        return Outcome::Err(Error::Save(SaveError::AmbiguousKey {
                            path: path.clone(),
                            entity: self.entity.name,
                            key,
                        }));
                    }
                    existing.by_key.insert(key, row);
                }
            }
        }

        tracing::debug!(
            ids = ids.len(),
            keys = keys.len(),
            found = existing.len(),
            "Resolved identities"
        );
        Outcome::Ok(existing)
    }

    async fn fetch<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        columns: &[&'static str],
        by: &[&'static str],
        keys: &[RowKey],
    ) -> Outcome<Vec<Row>, Error> {
        let mut params = Params::new();
        let predicate = key_in(by, keys, &mut params);
        let mut sql = select(self.entity.table, columns, &predicate);
        self.guard.annotate_select(&mut sql);
        tracing::trace!(sql = %sql, "Executing identity SELECT");
        conn.query(cx, &sql, &params.into_values()).await
    }

    fn row_key(&self, row: &Row, columns: &[&'static str]) -> RowKey {
        RowKey::new(
            columns
                .iter()
                .map(|c| row.get_by_name(c).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }
}
