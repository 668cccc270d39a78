//! Dissociation and cascading delete.
//!
//! Rows that lost their parent are handled by the action configured for the
//! foreign key pointing at the parent:
//! - `NONE`: the command fails with `DissociationNotAllowed`
//! - `SET_NULL`: the foreign key column is cleared
//! - `DELETE`: the rows are deleted, after their own back references have
//!   been dealt with the same way one level deeper
//!
//! Join-table rows referencing a deleted row are always removed.

use crate::engine::{SaveFuture, Saver};
use crate::plan::{LinkTableOp, PendingOp};
use crate::sql::{Params, select};
use asupersync::Outcome;
use savegraph_core::{
    AssociationInfo, BackReference, Connection, DissociateAction, EntityInfo, Error, RowKey,
    SaveError, SavePath, Value, quote_ident,
};
use std::collections::HashSet;

/// Operations collected by a cascading delete.
#[derive(Debug, Default)]
struct Cascade {
    ops: Vec<PendingOp>,
    links: Vec<LinkTableOp>,
    visited: HashSet<(&'static str, RowKey)>,
}

impl<'a, C: Connection> Saver<'a, C> {
    /// Ids of `entity` rows whose `column` holds one of `values`, minus
    /// the ids in `exclude`.
    ///
    /// Each statement binds at most `max_batch_rows` values. The NOT IN list
    /// is rendered only when it leaves room for parents; otherwise it is
    /// applied to the fetched ids.
    async fn select_ids(
        &self,
        entity: &EntityInfo,
        column: &'static str,
        values: &[Value],
        exclude: &[Value],
        path: &SavePath,
    ) -> Outcome<Vec<Value>, Error> {
        let id_column = entity.id().column_name;
        let max_rows = self.settings.max_batch_rows();
        let inline_exclude = !exclude.is_empty() && exclude.len() < max_rows;
        let (parents_per_statement, excluded) = if inline_exclude {
            (max_rows - exclude.len(), HashSet::new())
        } else {
            let excluded: HashSet<RowKey> = exclude.iter().cloned().map(RowKey::single).collect();
            (max_rows, excluded)
        };

        let mut ids = Vec::new();
        for chunk in values.chunks(parents_per_statement) {
            let mut params = Params::new();
            let mut predicate = format!(
                "{} IN ({})",
                quote_ident(column),
                params.list(chunk.iter().cloned())
            );
            if inline_exclude {
                predicate.push_str(&format!(
                    " AND {} NOT IN ({})",
                    quote_ident(id_column),
                    params.list(exclude.iter().cloned())
                ));
            }
            let sql = select(entity.table, &[id_column], &predicate);
            tracing::trace!(sql = %sql, "Selecting linked rows");
            let rows = try_select!(
                self.conn.query(self.cx, &sql, &params.into_values()).await,
                path,
                entity.table
            );
            ids.extend(
                rows.iter()
                    .filter_map(|row| row.get_by_name(id_column).or_else(|| row.get(0)))
                    .filter(|id| !id.is_null())
                    .filter(|id| !excluded.contains(&RowKey::single((*id).clone())))
                    .cloned(),
            );
        }
        Outcome::Ok(ids)
    }

    /// Children of `parents` through `fk_column` that are not in `retained`.
    pub(crate) async fn find_orphans(
        &self,
        child_entity: &EntityInfo,
        fk_column: &'static str,
        parents: &[Value],
        retained: &[Value],
        path: &SavePath,
    ) -> Outcome<Vec<Value>, Error> {
        let orphans = try_outcome!(
            self.select_ids(child_entity, fk_column, parents, retained, path)
                .await
        );
        tracing::debug!(
            entity = child_entity.name,
            parents = parents.len(),
            retained = retained.len(),
            orphans = orphans.len(),
            "Found orphans"
        );
        Outcome::Ok(orphans)
    }

    /// Apply the dissociate action of `foreign_key` to orphaned rows.
    pub(crate) async fn dissociate(
        &mut self,
        child_entity: &'a EntityInfo,
        foreign_key: &'a AssociationInfo,
        ids: Vec<Value>,
        path: &SavePath,
    ) -> Outcome<(), Error> {
        if ids.is_empty() {
            return Outcome::Ok(());
        }
        let Some(column) = foreign_key.foreign_key_column() else {
            return Outcome::Ok(());
        };
        match self.settings.dissociate_action(child_entity, foreign_key) {
            DissociateAction::None => Outcome::Err(Error::Save(SaveError::DissociationNotAllowed {
                path: path.clone(),
                entity: child_entity.name,
                association: foreign_key.name,
                ids,
            })),
            DissociateAction::SetNull => {
                let ops = ids
                    .into_iter()
                    .map(|id| PendingOp::ClearForeignKey {
                        table: child_entity.table,
                        pk_column: child_entity.id().column_name,
                        pk_value: id,
                        column,
                    })
                    .collect();
                self.flush(ops, Vec::new(), path).await.map(|_| ())
            }
            DissociateAction::Delete => self.delete_rows(child_entity, ids, path).await,
        }
    }

    /// Delete rows of `entity` by id, cascading through back references.
    #[tracing::instrument(level = "debug", skip(self, entity, ids, path), fields(entity = entity.name, path = %path))]
    pub(crate) async fn delete_rows(
        &mut self,
        entity: &'a EntityInfo,
        ids: Vec<Value>,
        path: &SavePath,
    ) -> Outcome<(), Error> {
        let mut cascade = Cascade::default();
        try_outcome!(self.collect_cascade(entity, ids, 0, path, &mut cascade).await);
        tracing::debug!(
            rows = cascade.ops.len(),
            links = cascade.links.len(),
            "Collected cascade"
        );
        self.flush(cascade.ops, cascade.links, path)
            .await
            .map(|_| ())
    }

    fn collect_cascade<'f>(
        &'f self,
        entity: &'a EntityInfo,
        ids: Vec<Value>,
        depth: usize,
        path: &'f SavePath,
        cascade: &'f mut Cascade,
    ) -> SaveFuture<'f, ()> {
        Box::pin(async move {
            let ids: Vec<Value> = ids
                .into_iter()
                .filter(|id| {
                    cascade
                        .visited
                        .insert((entity.name, RowKey::single(id.clone())))
                })
                .collect();
            if ids.is_empty() {
                return Outcome::Ok(());
            }

            let catalog = self.catalog;
            for back_reference in catalog.back_references(entity.name) {
                match back_reference {
                    BackReference::ForeignKey { owner, association } => {
                        let Some(column) = association.foreign_key_column() else {
                            continue;
                        };
                        let found = try_outcome!(
                            self.select_ids(owner, column, &ids, &[], path).await
                        );
                        let linked: Vec<Value> = found
                            .into_iter()
                            .filter(|id| {
                                !cascade
                                    .visited
                                    .contains(&(owner.name, RowKey::single(id.clone())))
                            })
                            .collect();
                        if linked.is_empty() {
                            continue;
                        }
                        let child_path = path.child(association.name);
                        match self.settings.dissociate_action(owner, association) {
                            DissociateAction::None => {
                                return Outcome::Err(Error::Save(
                                    SaveError::DissociationNotAllowed {
                                        path: child_path,
                                        entity: owner.name,
                                        association: association.name,
                                        ids: linked,
                                    },
                                ));
                            }
                            DissociateAction::SetNull => {
                                cascade.ops.extend(linked.into_iter().map(|id| {
                                    PendingOp::ClearForeignKey {
                                        table: owner.table,
                                        pk_column: owner.id().column_name,
                                        pk_value: id,
                                        column,
                                    }
                                }));
                            }
                            DissociateAction::Delete => {
                                try_outcome!(
                                    self.collect_cascade(
                                        owner,
                                        linked,
                                        depth + 1,
                                        &child_path,
                                        cascade,
                                    )
                                    .await
                                );
                            }
                        }
                    }
                    BackReference::JoinTable { link, column } => {
                        cascade
                            .links
                            .extend(ids.iter().map(|id| LinkTableOp::UnlinkAll {
                                table: link.table_name,
                                column,
                                value: id.clone(),
                            }));
                    }
                }
            }

            cascade.ops.extend(ids.into_iter().map(|id| PendingOp::Delete {
                table: entity.table,
                pk_column: entity.id().column_name,
                pk_value: id,
                depth,
            }));
            Outcome::Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{SaveConfig, SaveOptions, Settings};
    use crate::result::AffectedRows;
    use crate::testing::{MockConnection, err, ok, row, run};
    use asupersync::Cx;
    use savegraph_core::{Catalog, FieldInfo, LinkTableInfo, SaveErrorKind};

    fn catalog(store_action: Option<DissociateAction>) -> Catalog {
        let mut store_fk = AssociationInfo::many_to_one("store", "BookStore", "store_id").nullable(true);
        if let Some(action) = store_action {
            store_fk = store_fk.on_dissociate(action);
        }
        Catalog::builder()
            .entity(
                EntityInfo::new("BookStore", "book_store")
                    .field(FieldInfo::new("id", "id").primary_key(true))
                    .association(AssociationInfo::one_to_many("books", "Book", "store")),
            )
            .entity(
                EntityInfo::new("Book", "book")
                    .field(FieldInfo::new("id", "id").primary_key(true))
                    .association(store_fk)
                    .association(AssociationInfo::many_to_many(
                        "authors",
                        "Author",
                        LinkTableInfo::new("book_author_mapping", "book_id", "author_id"),
                    )),
            )
            .entity(EntityInfo::new("Author", "author").field(FieldInfo::new("id", "id").primary_key(true)))
            .entity(
                EntityInfo::new("Chapter", "chapter")
                    .field(FieldInfo::new("id", "id").primary_key(true))
                    .association(
                        AssociationInfo::many_to_one("book", "Book", "book_id")
                            .on_dissociate(DissociateAction::Delete),
                    ),
            )
            .build()
            .unwrap()
    }

    fn ids(values: &[i64]) -> Vec<Value> {
        values.iter().map(|v| Value::BigInt(*v)).collect()
    }

    fn id_rows(values: &[i64]) -> Vec<savegraph_core::Row> {
        values
            .iter()
            .map(|v| row(&[("id", Value::BigInt(*v))]))
            .collect()
    }

    /// Delete `roots` of `entity` and return the affected rows.
    fn delete(
        catalog: &Catalog,
        conn: &MockConnection,
        entity: &'static str,
        roots: Vec<Value>,
    ) -> Outcome<AffectedRows, Error> {
        let config = SaveConfig::default();
        let options = SaveOptions::new();
        let info = catalog.entity(entity).unwrap();
        run(async move {
            let cx = Cx::for_testing();
            let mut saver = Saver::new(&cx, conn, catalog, Settings::new(&config, &options));
            try_outcome!(saver.delete_rows(info, roots, &SavePath::root(entity)).await);
            Outcome::Ok(saver.into_affected())
        })
    }

    #[test]
    fn test_find_orphans_sql() {
        let catalog = catalog(None);
        let book = catalog.entity("Book").unwrap();
        let conn = MockConnection::new().on_query("FROM \"book\"", |_| id_rows(&[12]));
        let log = conn.log();
        let config = SaveConfig::default();
        let options = SaveOptions::new();
        let orphans = ok(run(async {
            let cx = Cx::for_testing();
            let saver = Saver::new(&cx, &conn, &catalog, Settings::new(&config, &options));
            let path = SavePath::root("BookStore").child("books");
            let first = try_outcome!(
                saver
                    .find_orphans(book, "store_id", &ids(&[1]), &ids(&[10, 11]), &path)
                    .await
            );
            let second = try_outcome!(saver.find_orphans(book, "store_id", &ids(&[1]), &[], &path).await);
            Outcome::Ok((first, second))
        }));
        assert_eq!(orphans.0, ids(&[12]));
        assert_eq!(orphans.1, ids(&[12]));
        assert_eq!(
            log.sqls(),
            vec![
                "SELECT \"id\" FROM \"book\" WHERE \"store_id\" IN ($1) AND \"id\" NOT IN ($2, $3)"
                    .to_string(),
                "SELECT \"id\" FROM \"book\" WHERE \"store_id\" IN ($1)".to_string(),
            ]
        );
    }

    #[test]
    fn test_orphan_scan_respects_batch_limit() {
        let catalog = catalog(None);
        let book = catalog.entity("Book").unwrap();
        let conn = MockConnection::new().on_query("FROM \"book\"", |_| id_rows(&[10, 12, 13]));
        let log = conn.log();
        let config = SaveConfig::default().max_batch_rows(2);
        let options = SaveOptions::new();
        let path = SavePath::root("BookStore").child("books");

        let (long_retained, short_retained) = ok(run(async {
            let cx = Cx::for_testing();
            let saver = Saver::new(&cx, &conn, &catalog, Settings::new(&config, &options));
            // more retained ids than one statement may bind
            let first = try_outcome!(
                saver
                    .find_orphans(book, "store_id", &ids(&[1]), &ids(&[10, 11, 12]), &path)
                    .await
            );
            let second = try_outcome!(
                saver
                    .find_orphans(book, "store_id", &ids(&[1, 2, 3]), &ids(&[10]), &path)
                    .await
            );
            Outcome::Ok((first, second))
        }));

        assert_eq!(long_retained, ids(&[13]));
        assert_eq!(short_retained.len(), 9);
        let statements = log.statements();
        assert_eq!(
            statements[0].0,
            "SELECT \"id\" FROM \"book\" WHERE \"store_id\" IN ($1)"
        );
        for (sql, _) in &statements[1..] {
            assert_eq!(
                sql,
                "SELECT \"id\" FROM \"book\" WHERE \"store_id\" IN ($1) AND \"id\" NOT IN ($2)"
            );
        }
        assert_eq!(statements.len(), 4);
        assert!(statements.iter().all(|(_, params)| params.len() <= 2));
    }

    #[test]
    fn test_dissociate_actions() {
        let config = SaveConfig::default();
        let path = SavePath::root("BookStore").child("books");

        // NONE refuses without touching the rows
        let catalog = catalog(None);
        let conn = MockConnection::new();
        let log = conn.log();
        let error = err(run(async {
            let cx = Cx::for_testing();
            let options = SaveOptions::new();
            let book = catalog.entity("Book").unwrap();
            let store = book.find_association("store").unwrap();
            let mut saver = Saver::new(&cx, &conn, &catalog, Settings::new(&config, &options));
            saver.dissociate(book, store, ids(&[10]), &path).await
        }));
        assert_eq!(error.save_error_kind(), Some(SaveErrorKind::DissociationNotAllowed));
        assert_eq!(error.as_save_error().unwrap().path(), &path);
        assert!(log.sqls().is_empty());

        // SET_NULL clears the column
        let catalog_set_null = self::catalog(Some(DissociateAction::SetNull));
        let conn = MockConnection::new();
        let log = conn.log();
        let affected = ok(run(async {
            let cx = Cx::for_testing();
            let options = SaveOptions::new();
            let book = catalog_set_null.entity("Book").unwrap();
            let store = book.find_association("store").unwrap();
            let mut saver =
                Saver::new(&cx, &conn, &catalog_set_null, Settings::new(&config, &options));
            try_outcome!(saver.dissociate(book, store, ids(&[10, 11]), &path).await);
            Outcome::Ok(saver.into_affected())
        }));
        assert_eq!(affected.table("book"), 2);
        assert_eq!(
            log.sqls(),
            vec!["UPDATE \"book\" SET \"store_id\" = NULL WHERE \"id\" IN ($1, $2)".to_string()]
        );
    }

    #[test]
    fn test_delete_cascades_children_first() {
        let catalog = catalog(Some(DissociateAction::Delete));
        let conn = MockConnection::new()
            .on_query("FROM \"book\" WHERE \"store_id\"", |_| id_rows(&[10, 11]))
            .on_query("FROM \"chapter\" WHERE \"book_id\"", |_| id_rows(&[100]));
        let log = conn.log();
        let affected = ok(delete(&catalog, &conn, "BookStore", ids(&[1])));

        let sqls = log.sqls();
        assert_eq!(
            sqls,
            vec![
                "SELECT \"id\" FROM \"book\" WHERE \"store_id\" IN ($1)".to_string(),
                "SELECT \"id\" FROM \"chapter\" WHERE \"book_id\" IN ($1, $2)".to_string(),
                "DELETE FROM \"book_author_mapping\" WHERE \"book_id\" IN ($1, $2)".to_string(),
                "DELETE FROM \"chapter\" WHERE \"id\" IN ($1)".to_string(),
                "DELETE FROM \"book\" WHERE \"id\" IN ($1, $2)".to_string(),
                "DELETE FROM \"book_store\" WHERE \"id\" IN ($1)".to_string(),
            ]
        );
        assert_eq!(affected.table("book"), 2);
        assert_eq!(affected.table("chapter"), 1);
        assert_eq!(affected.table("book_store"), 1);
        assert_eq!(affected.join_table("book_author_mapping"), 2);
    }

    #[test]
    fn test_delete_blocked_by_none_action() {
        let catalog = catalog(None);
        let conn = MockConnection::new().on_query("FROM \"book\"", |_| id_rows(&[10]));
        let log = conn.log();
        let error = err(delete(&catalog, &conn, "BookStore", ids(&[1])));
        match error {
            Error::Save(SaveError::DissociationNotAllowed {
                entity,
                association,
                ids: blocked,
                path,
            }) => {
                assert_eq!(entity, "Book");
                assert_eq!(association, "store");
                assert_eq!(blocked, ids(&[10]));
                assert_eq!(path.to_string(), "BookStore.store");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(log.count_prefix("DELETE"), 0);
    }

    #[test]
    fn test_self_referencing_delete_terminates() {
        let catalog = Catalog::builder()
            .entity(
                EntityInfo::new("Category", "category")
                    .field(FieldInfo::new("id", "id").primary_key(true))
                    .association(
                        AssociationInfo::many_to_one("parent", "Category", "parent_id")
                            .nullable(true)
                            .on_dissociate(DissociateAction::Delete),
                    ),
            )
            .build()
            .unwrap();
        // 1 <- 2 <- 1 would loop without the visited set
        let conn = MockConnection::new().on_query("FROM \"category\"", |params| {
            if params == [Value::BigInt(1)] {
                id_rows(&[2])
            } else {
                id_rows(&[1])
            }
        });
        let log = conn.log();
        let affected = ok(delete(&catalog, &conn, "Category", ids(&[1])));
        assert_eq!(affected.table("category"), 2);
        let statements = log.statements();
        let (sql, params) = statements.last().unwrap();
        assert_eq!(sql, "DELETE FROM \"category\" WHERE \"id\" IN ($1, $2)");
        assert_eq!(params, &ids(&[2, 1]));
    }
}
